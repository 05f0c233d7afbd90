//! Scheduling fabric: the three counting semaphores that shape all
//! parallelism in the run.
//!
//! - **scan slots** cap simultaneous stat/read operations
//! - **delete slots** cap simultaneous unlink/rmdir operations
//! - **subdir slots** cap concurrent directory walks - the dominant control
//!   for memory on deep trees, since unbounded recursion produces an
//!   exponential pending-task set
//!
//! Stat tolerates far more concurrency than unlink on EFS-class filesystems,
//! which is why the first two are tuned independently. There is no other
//! queue between producers and consumers; a task that cannot get a slot
//! simply waits.

use crate::config::PurgeConfig;
use tokio::sync::Semaphore;

/// The run's semaphore set. Owned by the coordinator, shared with every
/// worker for its lifetime.
#[derive(Debug)]
pub struct Fabric {
    pub scan_slots: Semaphore,
    pub delete_slots: Semaphore,
    pub subdir_slots: Semaphore,
}

impl Fabric {
    pub fn new(config: &PurgeConfig) -> Self {
        Self {
            scan_slots: Semaphore::new(config.scan_slots),
            delete_slots: Semaphore::new(config.delete_slots),
            subdir_slots: Semaphore::new(config.subdir_slots),
        }
    }
}
