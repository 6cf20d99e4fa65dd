//! Domain model module declarations.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod command;
pub mod task;

/// Acquire a std mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in the engine is a plain field update, so a
/// poisoned lock never leaves the protected data half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
