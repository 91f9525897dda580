//! imgfleet-gateway: seams to the external collaborators.
//!
//! The durable queue, the blob store and the compute-instance API are
//! reached only through the traits in this crate:
//!
//! - [`QueueGateway`]: at-least-once delivery with a visibility timeout
//! - [`ArtifactStore`]: immutable, digest-addressed blobs
//! - [`FleetGateway`]: launch, terminate and list worker instances
//!
//! Each trait ships with an in-process backend used by standalone mode and
//! tests. Calls that fail with [`GatewayError::Unavailable`] are retried by
//! callers through [`retry::with_backoff`].

use std::future::Future;
use std::pin::Pin;

pub mod artifact;
pub mod error;
mod faults;
pub mod fleet;
pub mod queue;
pub mod retry;

pub use artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use error::{GatewayError, GatewayResult};
pub use fleet::{FleetGateway, FleetInstance, InstanceState, MemoryFleet};
pub use queue::{Delivery, MemoryQueue, QueueGateway, QueueStats, Receipt};
pub use retry::RetryPolicy;

/// Boxed future returned by every gateway call.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;
