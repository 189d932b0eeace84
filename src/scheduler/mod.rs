//! Process scheduling: worker pool, resource ledger and the scheduler itself.

pub mod pool;
pub mod process_scheduler;
pub mod resources;

pub use pool::{WorkerPool, WorkerSlot};
pub use process_scheduler::*;
pub use resources::{ResourceGrant, ResourceLedger, Resources};
