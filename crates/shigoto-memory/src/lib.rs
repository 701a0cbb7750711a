//! In-process implementations of the shigoto backend contracts.
//!
//! Mutex-guarded maps and deques behind cheaply cloneable handles, for tests
//! and single-process embedders. None of these operations can actually fail,
//! so every contract is implemented with `Infallible` as its error type.
//!
//! Not a substitute for a real transport: nothing here survives a restart,
//! and the queue is visible to one process only.

mod cache;
mod queue;
mod store;

pub use cache::MemoryCache;
pub use queue::MemoryQueue;
pub use store::MemoryStore;

/// Locking helper shared by the drivers. A poisoned mutex only means another
/// test thread panicked mid-operation; the data is still structurally sound,
/// so take the guard back instead of propagating the panic.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
