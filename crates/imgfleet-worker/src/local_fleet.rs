//! In-process fleet for standalone mode.
//!
//! Each "instance" is a [`WorkerLoop`] running as a tokio task. Terminating
//! one flips its shutdown channel; it finishes any claimed job and then
//! drops out of the listing.

use std::collections::BTreeMap;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use imgfleet_core::{WorkerId, epoch_millis};
use imgfleet_gateway::{FleetGateway, FleetInstance, GatewayError, GatewayFuture, InstanceState};

use crate::worker_loop::{WorkerContext, WorkerLoop};

struct Member {
    launched_at: u64,
    state: InstanceState,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    members: BTreeMap<WorkerId, Member>,
}

impl Inner {
    /// Forget workers whose task has ended.
    fn prune(&mut self) {
        self.members.retain(|worker_id, member| {
            let alive = !member.handle.is_finished();
            if !alive {
                debug!(%worker_id, "local worker exited");
            }
            alive
        });
    }
}

pub struct LocalFleet {
    ctx: WorkerContext,
    inner: Mutex<Inner>,
}

impl LocalFleet {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Stop every worker and wait for in-flight jobs to settle.
    pub async fn shutdown(&self) {
        let members = std::mem::take(&mut self.inner.lock().await.members);
        info!(workers = members.len(), "stopping local fleet");
        for member in members.values() {
            let _ = member.shutdown.send(true);
        }
        for (worker_id, member) in members {
            if let Err(e) = member.handle.await {
                error!(%worker_id, error = %e, "local worker task failed");
            }
        }
    }
}

impl FleetGateway for LocalFleet {
    fn launch<'a>(&'a self, count: u32, image: &'a str) -> GatewayFuture<'a, Vec<WorkerId>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                inner.next_id += 1;
                let worker_id = WorkerId::new(format!("local-{:04}", inner.next_id));
                let worker = WorkerLoop::new(worker_id.clone(), self.ctx.clone());
                let (shutdown, rx) = watch::channel(false);
                let task_id = worker_id.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = worker.run(rx).await {
                        error!(worker_id = %task_id, error = %format!("{e:#}"), "worker exited");
                    }
                });
                inner.members.insert(
                    worker_id.clone(),
                    Member {
                        launched_at: epoch_millis(),
                        state: InstanceState::Running,
                        shutdown,
                        handle,
                    },
                );
                ids.push(worker_id);
            }
            info!(image, started = ids.len(), "local workers launched");
            Ok(ids)
        })
    }

    fn terminate<'a>(&'a self, worker_id: &'a WorkerId) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let member = inner
                .members
                .get_mut(worker_id)
                .ok_or_else(|| GatewayError::UnknownInstance(worker_id.to_string()))?;
            member.state = InstanceState::ShuttingDown;
            let _ = member.shutdown.send(true);
            debug!(%worker_id, "local worker terminating");
            Ok(())
        })
    }

    fn list(&self) -> GatewayFuture<'_, Vec<FleetInstance>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.prune();
            Ok(inner
                .members
                .iter()
                .map(|(worker_id, member)| FleetInstance {
                    worker_id: worker_id.clone(),
                    launched_at: member.launched_at,
                    state: member.state,
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use imgfleet_core::config::FleetConfig;
    use imgfleet_core::protocol::encode_message;
    use imgfleet_core::{DispatchMessage, JobId, Operation};
    use imgfleet_gateway::{ArtifactStore, MemoryArtifactStore, MemoryQueue, QueueGateway};
    use imgfleet_health::HeartbeatRegistry;
    use imgfleet_state::{JobState, JobTracker, StateStore, TrackerPolicy};

    use crate::processor::{ProcessFuture, Processor};

    struct Echo;

    impl Processor for Echo {
        fn process<'a>(&'a self, _operation: &'a Operation, input: Bytes) -> ProcessFuture<'a> {
            Box::pin(async move { Ok(input) })
        }
    }

    struct Setup {
        fleet: LocalFleet,
        tracker: JobTracker,
        queue: Arc<MemoryQueue>,
        artifacts: Arc<MemoryArtifactStore>,
    }

    fn setup() -> Setup {
        let mut config = FleetConfig::default();
        config.worker.heartbeat_interval = Duration::from_secs(1);
        let tracker = JobTracker::new(
            StateStore::open_in_memory().unwrap(),
            TrackerPolicy::from(&config.tracker),
        );
        let queue = Arc::new(MemoryQueue::new("jobs", Duration::from_secs(30)));
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let ctx = WorkerContext::new(
            &config,
            tracker.clone(),
            queue.clone(),
            artifacts.clone(),
            Arc::new(Echo),
        );
        Setup {
            fleet: LocalFleet::new(ctx),
            tracker,
            queue,
            artifacts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn launched_workers_register_and_process_jobs() {
        let s = setup();
        let ids = s.fleet.launch(2, "local").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let input = s
            .artifacts
            .put("inputs", Bytes::from_static(b"img"))
            .await
            .unwrap();
        let job_id = JobId::new("job-1");
        s.tracker
            .create(job_id.clone(), input.clone(), Operation::default())
            .unwrap();
        let message = DispatchMessage::new(job_id.clone(), Operation::default(), input);
        s.queue
            .enqueue(Bytes::from(encode_message(&message).unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(s.tracker.get(&job_id).unwrap().state, JobState::Done);
        let registry = HeartbeatRegistry::new(s.tracker.store().clone());
        assert_eq!(registry.list().unwrap().len(), 2);
        let listing = s.fleet.list().await.unwrap();
        assert!(listing.iter().all(|i| i.state == InstanceState::Running));

        s.fleet.shutdown().await;
        assert!(s.fleet.list().await.unwrap().is_empty());
        assert!(registry.list().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_worker_leaves_the_listing() {
        let s = setup();
        let ids = s.fleet.launch(2, "local").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        s.fleet.terminate(&ids[0]).await.unwrap();
        let listing = s.fleet.list().await.unwrap();
        let victim = listing.iter().find(|i| i.worker_id == ids[0]);
        // Either still draining or already gone.
        assert!(victim.is_none_or(|i| i.state == InstanceState::ShuttingDown));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let listing = s.fleet.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].worker_id, ids[1]);

        s.fleet.shutdown().await;
    }

    #[tokio::test]
    async fn terminating_unknown_worker_fails() {
        let s = setup();
        let err = s
            .fleet
            .terminate(&WorkerId::new("local-9999"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownInstance(_)));
    }
}
