//! Execution core of a coding-assistant backend.
//!
//! A planner proposes tool operations; the executor runs them, classifies
//! each raw result into a uniform outcome, and tracks repeated failures of
//! the same operation so the loop cannot retry forever. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, fix-cycle
//!   tracking, iteration budget). No I/O.
//! - **[`io`]**: Side-effecting operations (PTY tasks, language-server
//!   sessions, subprocesses, config, tools).
//!
//! [`executor`] and [`looping`] coordinate the two to implement `toolrun run`.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod planner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
