//! The public entry point: triggering isolated executions from host tests.
//!
//! A host test builds its [`TestDescriptor`], names itself with
//! [`host_test_path!`](crate::host_test_path), and calls
//! [`Runner::run_isolated`]. In the origin process that orchestrates a
//! worker; in the worker process the same call executes the test and exits.
//!
//! This module also owns the ambient per-process state: the
//! in-isolated-context latch, the error banner toggle, and whichever
//! data-store backing is current (the origin's real map, or the worker's
//! proxy once installed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::context::ContextFactory;
use crate::envelope::TestDescriptor;
use crate::error::{OrchestrationError, TestFailure};
use crate::fixture::FixtureRegistry;
use crate::orchestrator::Orchestrator;
use crate::resolver::ResolveHelper;
use crate::store::{DataStore, KeyValueStore, Store};

/// Set once when this process starts executing as an isolated worker and
/// never reset; the worker process does not outlive its test.
static IN_TEST_DOMAIN: AtomicBool = AtomicBool::new(false);

/// Whether failures reported from the isolated context get a banner on
/// stderr. Enabled by default.
static ERROR_BANNERS: AtomicBool = AtomicBool::new(true);

/// The ambient data-store backing: created lazily in the origin, replaced
/// by the proxy in the worker.
static STORE: Mutex<Option<Arc<dyn KeyValueStore>>> = Mutex::new(None);

/// Whether this process is an isolated worker executing a test.
#[must_use]
pub fn is_in_test_domain() -> bool {
    IN_TEST_DOMAIN.load(Ordering::Relaxed)
}

pub(crate) fn mark_in_test_domain() {
    IN_TEST_DOMAIN.store(true, Ordering::Relaxed);
}

/// Enables or disables the stderr banner printed for failures that crossed
/// the isolation boundary.
pub fn set_error_banners(enabled: bool) {
    ERROR_BANNERS.store(enabled, Ordering::Relaxed);
}

/// Whether failure banners are currently enabled.
#[must_use]
pub fn error_banners_enabled() -> bool {
    ERROR_BANNERS.load(Ordering::Relaxed)
}

/// The shared data store for the current context.
///
/// In the origin this is the process-wide map, created on first use; in the
/// worker it is a live proxy to the origin's map.
#[must_use]
pub fn data_store() -> Store {
    Store::new(ambient_backing())
}

pub(crate) fn ambient_backing() -> Arc<dyn KeyValueStore> {
    let mut slot = STORE.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(DataStore::new())))
}

pub(crate) fn store_attached() -> bool {
    STORE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

pub(crate) fn install_worker_store(backing: Arc<dyn KeyValueStore>) {
    let mut slot = STORE.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(backing);
}

/// Converts the type name of a host test's marker function into the
/// libtest path of that test. Used by [`host_test_path!`](crate::host_test_path).
///
/// The type name carries the crate name and the trailing marker segment;
/// libtest names carry neither.
#[must_use]
pub fn host_path_from(raw: &str) -> String {
    let raw = raw.strip_suffix("::__here").unwrap_or(raw);
    match raw.split_once("::") {
        Some((_, rest)) => rest.to_string(),
        None => raw.to_string(),
    }
}

/// The libtest path of the enclosing test function.
///
/// Expand this inside the host test itself; the result feeds
/// [`TestDescriptor::new`].
#[macro_export]
macro_rules! host_test_path {
    () => {{
        fn __here() {}
        $crate::runner::host_path_from(::std::any::type_name_of_val(&__here))
    }};
}

/// What [`Runner::run_isolated`] reports when the test did not pass.
#[derive(Debug, Error)]
pub enum RunError {
    /// The isolation infrastructure failed before or around the test.
    #[error("isolated execution could not run: {0}")]
    Setup(#[from] OrchestrationError),

    /// The test executed and failed; the failure crossed the boundary.
    #[error("{0}")]
    Test(TestFailure),
}

/// Runs registered tests in isolated contexts.
pub struct Runner {
    orchestrator: Orchestrator,
}

impl Runner {
    /// Creates a runner over a registry, isolating with one fresh process
    /// per test.
    #[must_use]
    pub fn new(registry: Arc<FixtureRegistry>) -> Self {
        Self {
            orchestrator: Orchestrator::new(registry),
        }
    }

    /// Creates a runner with a custom context factory.
    #[must_use]
    pub fn with_factory(registry: Arc<FixtureRegistry>, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            orchestrator: Orchestrator::with_factory(registry, factory),
        }
    }

    /// The origin-side module resolution helper, for registering modules
    /// and search directories before running.
    #[must_use]
    pub fn resolver(&self) -> &Arc<ResolveHelper> {
        self.orchestrator.resolver()
    }

    /// Runs the descriptor in isolation and returns the captured failure,
    /// if any.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only; a failing test is an `Ok(Some(_))`.
    pub fn run(
        &self,
        descriptor: &TestDescriptor,
    ) -> Result<Option<TestFailure>, OrchestrationError> {
        self.orchestrator.run(descriptor)
    }

    /// Runs the descriptor in isolation and turns any failure into an
    /// error, printing the stderr banner when enabled.
    ///
    /// This is the call host tests usually end with: `?` or `unwrap()` on
    /// the result makes the host test fail exactly when the isolated test
    /// did.
    ///
    /// # Errors
    ///
    /// [`RunError::Test`] when the isolated test failed, [`RunError::Setup`]
    /// when it could not be run at all.
    pub fn run_isolated(&self, descriptor: &TestDescriptor) -> Result<(), RunError> {
        match self.orchestrator.run(descriptor)? {
            None => Ok(()),
            Some(failure) => {
                if error_banners_enabled() {
                    print_banner(&failure);
                }
                Err(RunError::Test(failure))
            }
        }
    }
}

fn print_banner(failure: &TestFailure) {
    let headline = if failure.is_assertion() {
        "Assertion failed in the isolated context"
    } else {
        "Error raised in the isolated context"
    };
    eprintln!();
    eprintln!("{:=<72}", "");
    eprintln!("= {headline}");
    eprintln!("= {}", failure.message);
    eprintln!("{:=<72}", "");
}
