//! Error types for the isolation harness.
//!
//! Two families of failures exist and they never mix:
//!
//! - [`OrchestrationError`]: fatal setup errors raised in the origin process
//!   *before or around* the isolated execution (bad descriptor, spawn
//!   failure, lost control connection). These are never test failures.
//! - [`TestFailure`]: the failure captured *inside* the isolated context
//!   (setup, test body, or teardown raised). It is a plain serializable
//!   value because it crosses the process boundary on the wire.

use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Classification of a captured test failure.
///
/// The trigger uses this to print the right diagnostic banner before
/// rethrowing: assertion-style failures and unexpected errors get different
/// banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An assertion macro fired (`assert!`, `assert_eq!`, explicit
    /// [`TestFailure::assertion`]).
    Assertion,
    /// Any other error or panic raised during execution.
    Error,
}

/// A failure captured inside the isolated context.
///
/// Panics are unwrapped to their payload message before capture; callers
/// only ever see the underlying cause, never the unwind wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Whether this was an assertion failure or an unexpected error.
    pub kind: FailureKind,
    /// Human-readable description of the failure.
    pub message: String,
}

impl TestFailure {
    /// Creates an assertion-style failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Assertion,
            message: message.into(),
        }
    }

    /// Creates an unexpected-error failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    /// Converts a panic payload into a captured failure.
    ///
    /// Payloads produced by the standard assertion macros start with
    /// `assertion` and are classified as [`FailureKind::Assertion`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };

        let kind = if message.starts_with("assertion") {
            FailureKind::Assertion
        } else {
            FailureKind::Error
        };

        Self { kind, message }
    }

    /// Returns `true` for assertion-style failures.
    #[must_use]
    pub const fn is_assertion(&self) -> bool {
        matches!(self.kind, FailureKind::Assertion)
    }
}

impl std::fmt::Display for TestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::Assertion => write!(f, "assertion failed: {}", self.message),
            FailureKind::Error => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TestFailure {}

/// Errors raised while registering fixtures or their methods.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A fixture with the same name is already registered.
    #[error("fixture `{name}` is already registered")]
    DuplicateFixture {
        /// The conflicting fixture name.
        name: String,
    },

    /// A lifecycle method or test with the same name already exists on the
    /// fixture level.
    #[error("fixture `{fixture}` already declares a method named `{name}`")]
    DuplicateMethod {
        /// The fixture being built.
        fixture: String,
        /// The conflicting method name.
        name: String,
    },
}

/// Fatal errors raised by the orchestrator in the origin process.
///
/// Every variant here aborts the orchestration before or around the remote
/// execution; none of them represents a failing test.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The descriptor named a fixture that is not in the registry.
    #[error("unknown fixture `{name}`")]
    UnknownFixture {
        /// The missing fixture name.
        name: String,
    },

    /// The descriptor named a test that is not registered on the fixture
    /// chain.
    #[error("fixture `{fixture}` has no test named `{name}`")]
    UnknownTest {
        /// The fixture that was searched.
        fixture: String,
        /// The missing test name.
        name: String,
    },

    /// A required descriptor field was empty.
    #[error("invalid test descriptor: {reason}")]
    InvalidDescriptor {
        /// Why the descriptor was rejected.
        reason: String,
    },

    /// The method argument list does not match the test's declared arity.
    #[error("test `{test}` takes {expected} argument(s) but {actual} were supplied")]
    ArgumentCountMismatch {
        /// The qualified test name.
        test: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },

    /// No level of the fixture chain provides a constructor, so the isolated
    /// context cannot instantiate it.
    #[error("fixture `{fixture}` has no constructor and cannot be built in the isolated context")]
    NotConstructible {
        /// The fixture that lacks a constructor.
        fixture: String,
    },

    /// The worker process could not be spawned.
    #[error("failed to spawn isolated worker: {0}")]
    SpawnFailed(String),

    /// The worker connected but failed the handshake.
    #[error("worker handshake failed: {reason}")]
    HandshakeFailed {
        /// Why the handshake was rejected.
        reason: String,
    },

    /// The control connection was lost before the worker reported a result.
    ///
    /// This is the transport-fatal path: the isolated context crashed or
    /// exited without completing. The child's exit code is attached when it
    /// could be collected.
    #[error("worker exited without reporting a result (exit code {code:?})")]
    WorkerConnectionLost {
        /// Exit code of the worker, when known.
        code: Option<i32>,
    },

    /// Protocol-level failure on the control connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Filesystem or socket I/O failure while setting up the context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
