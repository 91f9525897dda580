//! Fleet gateway: the compute-instance provisioning API.
//!
//! The listing is the scaling controller's ground truth. Launch and
//! terminate commands may fail or be slow to take effect, so callers never
//! assume a command succeeded until the listing reflects it.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::{debug, info};

use imgfleet_core::{WorkerId, epoch_millis};

use crate::GatewayFuture;
use crate::error::GatewayError;
use crate::faults::Faults;

/// Provider-reported lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
}

/// One entry of the fleet listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetInstance {
    pub worker_id: WorkerId,
    /// Unix millis.
    pub launched_at: u64,
    pub state: InstanceState,
}

pub trait FleetGateway: Send + Sync {
    /// Launch `count` instances of `image`. Returns the ids actually started,
    /// which may be fewer than requested.
    fn launch<'a>(&'a self, count: u32, image: &'a str) -> GatewayFuture<'a, Vec<WorkerId>>;

    fn terminate<'a>(&'a self, worker_id: &'a WorkerId) -> GatewayFuture<'a, ()>;

    fn list(&self) -> GatewayFuture<'_, Vec<FleetInstance>>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    instances: BTreeMap<WorkerId, FleetInstance>,
    /// Cap on instances started per launch call (capacity shortage).
    launch_capacity: Option<u32>,
    launched_total: u64,
    terminated: Vec<WorkerId>,
}

/// Scriptable in-memory fleet.
///
/// Launched instances start `Pending`; terminated ones linger as
/// `ShuttingDown` until [`MemoryFleet::settle`] is called, mimicking a
/// provider whose state changes lag the commands.
#[derive(Default)]
pub struct MemoryFleet {
    inner: Mutex<Inner>,
    faults: Faults,
    launch_faults: Faults,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Make the next `count` launch calls fail, leaving other calls alone.
    pub fn fail_next_launches(&self, count: u32) {
        self.launch_faults.arm(count);
    }

    /// Limit how many instances a single launch call can start.
    pub async fn set_launch_capacity(&self, capacity: Option<u32>) {
        self.inner.lock().await.launch_capacity = capacity;
    }

    /// Add a running instance directly, as if launched earlier.
    pub async fn insert_running(&self, worker_id: WorkerId, launched_at: u64) {
        let mut inner = self.inner.lock().await;
        inner.instances.insert(
            worker_id.clone(),
            FleetInstance {
                worker_id,
                launched_at,
                state: InstanceState::Running,
            },
        );
    }

    /// Drop an instance without a terminate command (a crashed host).
    pub async fn vanish(&self, worker_id: &WorkerId) -> bool {
        self.inner.lock().await.instances.remove(worker_id).is_some()
    }

    /// Apply pending provider transitions: `Pending → Running`, and remove
    /// instances that were `ShuttingDown`.
    pub async fn settle(&self) {
        let mut inner = self.inner.lock().await;
        inner
            .instances
            .retain(|_, i| i.state != InstanceState::ShuttingDown);
        for instance in inner.instances.values_mut() {
            instance.state = InstanceState::Running;
        }
    }

    /// Total instances started since creation.
    pub async fn launched_total(&self) -> u64 {
        self.inner.lock().await.launched_total
    }

    /// Ids passed to successful terminate calls, in order.
    pub async fn terminated(&self) -> Vec<WorkerId> {
        self.inner.lock().await.terminated.clone()
    }
}

impl FleetGateway for MemoryFleet {
    fn launch<'a>(&'a self, count: u32, image: &'a str) -> GatewayFuture<'a, Vec<WorkerId>> {
        Box::pin(async move {
            self.faults.check("fleet")?;
            self.launch_faults.check("fleet")?;
            let mut inner = self.inner.lock().await;
            let allowed = inner.launch_capacity.map_or(count, |cap| count.min(cap));
            let now = epoch_millis();
            let mut ids = Vec::with_capacity(allowed as usize);
            for _ in 0..allowed {
                inner.next_id += 1;
                let worker_id = WorkerId::new(format!("i-{:08x}", inner.next_id));
                inner.instances.insert(
                    worker_id.clone(),
                    FleetInstance {
                        worker_id: worker_id.clone(),
                        launched_at: now,
                        state: InstanceState::Pending,
                    },
                );
                ids.push(worker_id);
            }
            inner.launched_total += ids.len() as u64;
            info!(image, requested = count, started = ids.len(), "instances launched");
            Ok(ids)
        })
    }

    fn terminate<'a>(&'a self, worker_id: &'a WorkerId) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check("fleet")?;
            let mut inner = self.inner.lock().await;
            let instance = inner
                .instances
                .get_mut(worker_id)
                .ok_or_else(|| GatewayError::UnknownInstance(worker_id.to_string()))?;
            instance.state = InstanceState::ShuttingDown;
            inner.terminated.push(worker_id.clone());
            debug!(%worker_id, "instance terminating");
            Ok(())
        })
    }

    fn list(&self) -> GatewayFuture<'_, Vec<FleetInstance>> {
        Box::pin(async move {
            self.faults.check("fleet")?;
            Ok(self.inner.lock().await.instances.values().cloned().collect())
        })
    }
}
