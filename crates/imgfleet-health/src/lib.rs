//! imgfleet-health: worker liveness for the scaling controller.
//!
//! Workers self-register and heartbeat into the state store through the
//! [`HeartbeatRegistry`]. The controller never trusts a worker to report its
//! own failure: [`classify`] infers each instance's health from the fleet
//! listing and the age of its last heartbeat.
//!
//! ```text
//! launched ──► Starting ──register──► Healthy ──missed heartbeats──► Unresponsive
//!                 │                                                      │
//!                 └──── no registration within unresponsive_after ───────┘
//! fleet reports shutting-down ──► Terminating
//! ```

pub mod classify;
pub mod registry;

pub use classify::{HealthPolicy, WorkerView, classify, observe};
pub use registry::{Heartbeat, HeartbeatRegistry};
