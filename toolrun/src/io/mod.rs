//! Side-effecting parts of the execution core: processes, language servers,
//! configuration, and the tools the executor dispatches to.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod events;
pub mod lsp;
pub mod lsp_codec;
pub mod plan_file;
pub mod process;
pub mod pty;
pub mod tools;

/// Lock a registry mutex; a panic elsewhere must not wedge every later caller.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
