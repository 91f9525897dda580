//! imgfleet-autoscale: backlog-driven sizing of the worker pool.
//!
//! The controller is level-triggered: every tick recomputes the plan from
//! the queue depth and the live fleet listing, so a launch or terminate
//! command that failed is simply reissued by a later tick.
//!
//! # Scaling Algorithm
//!
//! ```text
//! desired = clamp(ceil(backlog / jobs_per_worker_target), min_pool, max_pool)
//! if oldest_age > latency_threshold:
//!     desired = min(desired + 1, max_pool)
//!
//! capacity = healthy + starting
//! if desired > capacity:
//!     launch min(desired - capacity, max_in_flight_launches - starting)
//! if desired < capacity and cooldown since last scale-up has passed:
//!     terminate capacity - desired, preferring starting, then idle,
//!     then busy workers whose job exceeded hard_staleness_timeout
//! always terminate unresponsive workers
//! ```

pub mod controller;
pub mod policy;
pub mod scaler;

pub use controller::{ScalingController, TickReport};
pub use policy::ScalingPolicy;
pub use scaler::{Autoscaler, Observation, ScalePlan};
