//! Completion strategies for tests that return pending work.
//!
//! A test body may return a [`PendingTest`](crate::fixture::PendingTest)
//! instead of completing inline. The executor hands that future to a
//! [`CompletionStrategy`] and treats whatever the strategy returns as the
//! outcome of the test body. The default strategy blocks the worker thread
//! until the future settles; fixtures that need a message pump (or want to
//! observe the future without driving it) register their own.

use crate::error::TestFailure;
use crate::fixture::PendingTest;

/// A pluggable way to wait for a pending test to settle.
///
/// `process` is called synchronously from the executor after the test body
/// returned pending work. It should not return until the work is considered
/// complete, and must surface the work's failure if it failed.
///
/// Resolved once per execution from the fixture chain (most-derived level
/// wins); never cached across executions.
pub trait CompletionStrategy: Send + Sync {
    /// Drives the pending test to completion.
    ///
    /// # Errors
    ///
    /// Returns the failure raised by the pending work, if any.
    fn process(&self, pending: PendingTest) -> Result<(), TestFailure>;
}

/// The default strategy: block the current thread until the future settles.
///
/// Runs the future on a fresh current-thread tokio runtime so timers and
/// I/O inside the test body work without any ambient runtime.
#[derive(Debug, Default)]
pub struct TaskWaitStrategy;

impl CompletionStrategy for TaskWaitStrategy {
    fn process(&self, pending: PendingTest) -> Result<(), TestFailure> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| TestFailure::error(format!("failed to build runtime: {error}")))?;
        runtime.block_on(pending)
    }
}
