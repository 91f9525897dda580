//! Queue gateway.
//!
//! Semantics follow a hosted message queue with a visibility timeout:
//! a polled message is hidden for `visibility_timeout` and becomes
//! deliverable again unless it is acknowledged first. Each delivery carries
//! its own receipt; once a message has been redelivered, receipts from
//! earlier deliveries are rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::GatewayFuture;
use crate::error::GatewayError;
use crate::faults::Faults;

/// Handle for acknowledging or re-timing one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: Receipt,
    pub body: Bytes,
    /// 1 on first delivery, incremented on each redelivery.
    pub receive_count: u32,
}

/// Depth figures consumed by the scaling controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Unacknowledged messages, visible or in flight.
    pub backlog: u64,
    pub visible: u64,
    pub in_flight: u64,
    /// Age of the oldest unacknowledged message.
    pub oldest_age: Duration,
}

pub trait QueueGateway: Send + Sync {
    /// Append a message. Returns its message id.
    fn enqueue(&self, body: Bytes) -> GatewayFuture<'_, String>;

    /// Wait up to `wait` for a deliverable message.
    fn poll(&self, wait: Duration) -> GatewayFuture<'_, Option<Delivery>>;

    /// Delete a delivered message for good.
    fn acknowledge<'a>(&'a self, receipt: &'a Receipt) -> GatewayFuture<'a, ()>;

    /// Hide an in-flight message for `timeout` from now. Zero releases it
    /// for immediate redelivery.
    fn extend_visibility<'a>(
        &'a self,
        receipt: &'a Receipt,
        timeout: Duration,
    ) -> GatewayFuture<'a, ()>;

    fn stats(&self) -> GatewayFuture<'_, QueueStats>;
}

struct Entry {
    message_id: String,
    body: Bytes,
    enqueued_at: Instant,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<Receipt>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Keyed by enqueue sequence so delivery is roughly FIFO.
    entries: BTreeMap<u64, Entry>,
}

impl Inner {
    fn deliver(&mut self, now: Instant, visibility_timeout: Duration) -> Option<Delivery> {
        let entry = self.entries.values_mut().find(|e| e.visible_at <= now)?;
        let receipt = Receipt(uuid::Uuid::new_v4().simple().to_string());
        entry.receipt = Some(receipt.clone());
        entry.receive_count += 1;
        entry.visible_at = now + visibility_timeout;
        Some(Delivery {
            message_id: entry.message_id.clone(),
            receipt,
            body: entry.body.clone(),
            receive_count: entry.receive_count,
        })
    }

    fn seq_for(&self, receipt: &Receipt) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, e)| e.receipt.as_ref() == Some(receipt))
            .map(|(seq, _)| *seq)
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.visible_at).min()
    }
}

/// In-process queue with visibility-timeout redelivery.
pub struct MemoryQueue {
    name: String,
    visibility_timeout: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
    faults: Faults,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            faults: Faults::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the next `count` calls fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Number of unacknowledged messages.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl QueueGateway for MemoryQueue {
    fn enqueue(&self, body: Bytes) -> GatewayFuture<'_, String> {
        Box::pin(async move {
            self.faults.check("queue")?;
            let message_id = uuid::Uuid::new_v4().to_string();
            {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.entries.insert(
                    seq,
                    Entry {
                        message_id: message_id.clone(),
                        body,
                        enqueued_at: now,
                        visible_at: now,
                        receive_count: 0,
                        receipt: None,
                    },
                );
            }
            self.notify.notify_waiters();
            trace!(queue = %self.name, %message_id, "message enqueued");
            Ok(message_id)
        })
    }

    fn poll(&self, wait: Duration) -> GatewayFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            self.faults.check("queue")?;
            let deadline = Instant::now() + wait;
            loop {
                // Register for wake-ups before inspecting the queue so an
                // enqueue racing with this check is not missed.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let next_visible = {
                    let mut inner = self.inner.lock().await;
                    if let Some(delivery) = inner.deliver(Instant::now(), self.visibility_timeout)
                    {
                        debug!(
                            queue = %self.name,
                            message_id = %delivery.message_id,
                            receive_count = delivery.receive_count,
                            "message delivered"
                        );
                        return Ok(Some(delivery));
                    }
                    inner.next_visible_at()
                };

                if Instant::now() >= deadline {
                    return Ok(None);
                }
                let wake = next_visible.map_or(deadline, |t| t.min(deadline));
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(wake) => {}
                }
            }
        })
    }

    fn acknowledge<'a>(&'a self, receipt: &'a Receipt) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check("queue")?;
            let mut inner = self.inner.lock().await;
            let seq = inner
                .seq_for(receipt)
                .ok_or_else(|| GatewayError::InvalidReceipt(receipt.to_string()))?;
            if let Some(entry) = inner.entries.remove(&seq) {
                debug!(queue = %self.name, message_id = %entry.message_id, "message acknowledged");
            }
            Ok(())
        })
    }

    fn extend_visibility<'a>(
        &'a self,
        receipt: &'a Receipt,
        timeout: Duration,
    ) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check("queue")?;
            {
                let mut inner = self.inner.lock().await;
                let seq = inner
                    .seq_for(receipt)
                    .ok_or_else(|| GatewayError::InvalidReceipt(receipt.to_string()))?;
                if let Some(entry) = inner.entries.get_mut(&seq) {
                    entry.visible_at = Instant::now() + timeout;
                }
            }
            if timeout.is_zero() {
                self.notify.notify_waiters();
            }
            Ok(())
        })
    }

    fn stats(&self) -> GatewayFuture<'_, QueueStats> {
        Box::pin(async move {
            self.faults.check("queue")?;
            let inner = self.inner.lock().await;
            let now = Instant::now();
            let visible = inner.entries.values().filter(|e| e.visible_at <= now).count() as u64;
            let backlog = inner.entries.len() as u64;
            let oldest_age = inner
                .entries
                .values()
                .map(|e| now.saturating_duration_since(e.enqueued_at))
                .max()
                .unwrap_or_default();
            Ok(QueueStats {
                backlog,
                visible,
                in_flight: backlog - visible,
                oldest_age,
            })
        })
    }
}
