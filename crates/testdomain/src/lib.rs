//! # testdomain
//!
//! Run a single test inside an isolated OS process, with full
//! setup/teardown ordering across a fixture inheritance chain, and get the
//! failure back as if it had happened locally.
//!
//! The harness re-executes the current test binary, filtered to exactly
//! the host test that triggered it, and hands the child an execution
//! envelope over a per-orchestration Unix domain socket. The child builds
//! the same fixture registry (it runs the same registration code), executes
//! the named test with its setup/teardown chain, and reports the first
//! captured failure back to the origin.
//!
//! ## Core Concepts
//!
//! - **Fixture**: a declared level of test state with a constructor,
//!   lifecycle methods, and tests; levels chain via single inheritance
//! - **Envelope**: the transportable description of one execution (names,
//!   arguments, method order, configuration)
//! - **Orchestrator**: the origin side; spawns the worker and serves its
//!   request/reply exchange
//! - **Worker**: the isolated side; executes the envelope and exits
//! - **Data store**: a string-keyed map in the origin, reachable live from
//!   the worker through a socket-backed proxy
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testdomain::{
//!     Fixture, FixtureRegistry, Instance, Runner, TestDescriptor, TestOutcome,
//! };
//!
//! fn registry() -> Arc<FixtureRegistry> {
//!     let fixture = Fixture::builder("Counter")
//!         .constructor(|_| Ok(Box::new(0u32) as Instance))
//!         .setup("reset", |instance| {
//!             *instance.downcast_mut::<u32>().unwrap() = 0;
//!             Ok(())
//!         })
//!         .test("starts_at_zero", |instance, _| {
//!             assert_eq!(*instance.downcast_ref::<u32>().unwrap(), 0);
//!             TestOutcome::passed()
//!         })
//!         .build()
//!         .unwrap();
//!     let mut registry = FixtureRegistry::new();
//!     registry.register(fixture).unwrap();
//!     Arc::new(registry)
//! }
//!
//! #[test]
//! fn counter_starts_at_zero() {
//!     let runner = Runner::new(registry());
//!     let descriptor =
//!         TestDescriptor::new("Counter", "starts_at_zero", testdomain::host_test_path!());
//!     runner.run_isolated(&descriptor).unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`fixture`]: fixture registration tables and the inheritance chain
//! - [`metadata`]: setup/teardown collection and ordering
//! - [`envelope`]: descriptor validation and the execution envelope
//! - [`orchestrator`]: origin-side orchestration and the serve loop
//! - [`worker`]: worker-side execution and the origin bridges
//! - [`context`]: isolated contexts and the [`context::ContextFactory`] seam
//! - [`protocol`]: the framed control protocol between the two sides
//! - [`store`]: the shared data store crossing the boundary
//! - [`resolver`]: the module resolution bridge
//! - [`strategy`]: completion strategies for async test bodies
//! - [`runner`]: the public trigger facade and ambient process state

pub mod context;
pub mod envelope;
pub mod error;
mod executor;
pub mod fixture;
pub mod metadata;
pub mod orchestrator;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod store;
pub mod strategy;
pub mod worker;

pub use context::{ContextFactory, IsolatedContext, PerTestProcessFactory, WorkerSpec};
pub use envelope::{TestDescriptor, TestEnvelope};
pub use error::{FailureKind, OrchestrationError, RegistryError, TestFailure};
pub use fixture::{Fixture, FixtureBuilder, FixtureRegistry, Instance, TestOutcome};
pub use orchestrator::Orchestrator;
pub use resolver::{ModuleResolver, ResolveHelper};
pub use runner::{
    data_store, is_in_test_domain, set_error_banners, RunError, Runner,
};
pub use store::{KeyValueStore, RemoteHandle, RemoteObject, Store, StoreError};
pub use strategy::{CompletionStrategy, TaskWaitStrategy};
