//! Execution layer: everything that pays for external work.
//!
//! Three pieces cooperate here. [`memory::JobScheduler`] decides *when* a
//! job may run, pricing each one at a memory budget against live system
//! headroom. [`process::CommandRunner`] runs one external command under a
//! scheduler permit and maps its outcome onto [`crate::error::BuildError`].
//! [`cache::AsyncCache`] makes sure each distinct piece of work is paid for
//! at most once, no matter how many build nodes await it concurrently.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod memory;
pub mod process;

pub use cache::AsyncCache;
pub use memory::{JobScheduler, MemoryProbe, Permit, SystemMemoryProbe};
pub use process::CommandRunner;

/// Lock that shrugs off poisoning: the guarded state stays consistent
/// because every mutation completes before its guard drops.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
