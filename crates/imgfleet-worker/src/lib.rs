//! imgfleet-worker: the per-instance job loop.
//!
//! A worker polls the job queue, claims the job through the tracker, runs
//! the [`Processor`] on the input artifact, stores the output, completes
//! the job and only then acknowledges the message. One job is in flight
//! per worker; throughput comes from running more workers.
//!
//! [`LocalFleet`] runs workers as tokio tasks so a single process can host
//! the whole system. When a results queue is wired in, workers also publish
//! a completion notice and [`ResultCollector`] drains them.

pub mod local_fleet;
pub mod processor;
pub mod results;
pub mod worker_loop;

pub use local_fleet::LocalFleet;
pub use processor::{CommandProcessor, ProcessFuture, ProcessingError, Processor};
pub use results::{Collected, ResultCollector};
pub use worker_loop::{OUTPUT_NAMESPACE, StepOutcome, WorkerContext, WorkerLoop};
