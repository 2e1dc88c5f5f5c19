//! Long-running harvester: periodic triggers, wake-ups and stuck sweeps.

mod dispatcher;
mod registry;

pub use dispatcher::{DispatchIntervals, Dispatcher};
pub use registry::{WorkerGuard, WorkerRegistry};
