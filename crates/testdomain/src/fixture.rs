//! Fixture registration tables.
//!
//! The harness does no runtime introspection: test authors declare fixtures,
//! their lifecycle methods, and their tests through [`FixtureBuilder`], and
//! register the result in a [`FixtureRegistry`]. Because the worker process
//! re-executes the same binary, rebuilding the registry there yields the
//! same tables, so only *names* ever cross the isolation boundary; callables
//! are looked up again on the worker side.
//!
//! Fixtures form single-inheritance chains via [`FixtureBuilder::inherit`];
//! the metadata extractor walks the chain to compute setup/teardown order.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, TestFailure};
use crate::strategy::CompletionStrategy;

/// The state object a fixture constructor produces and lifecycle methods
/// mutate. One instance is created per isolated execution.
pub type Instance = Box<dyn Any + Send>;

/// A registered setup or teardown body.
pub type LifecycleFn = Arc<dyn Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync>;

/// A registered fixture constructor; receives the fixture construction
/// arguments from the envelope.
pub type ConstructorFn =
    Arc<dyn Fn(&[serde_json::Value]) -> Result<Instance, TestFailure> + Send + Sync>;

/// A registered test body; receives the instance and the method arguments.
pub type TestFn = Arc<dyn Fn(&mut Instance, &[serde_json::Value]) -> TestOutcome + Send + Sync>;

/// Work a test body returned without completing inline.
pub type PendingTest = Pin<Box<dyn Future<Output = Result<(), TestFailure>> + Send>>;

/// What a test body produced when invoked.
pub enum TestOutcome {
    /// The body ran to completion inline.
    Completed(Result<(), TestFailure>),
    /// The body returned pending work for a completion strategy to await.
    Pending(PendingTest),
}

impl TestOutcome {
    /// Shorthand for an inline pass.
    #[must_use]
    pub fn passed() -> Self {
        Self::Completed(Ok(()))
    }

    /// Shorthand for an inline failure.
    #[must_use]
    pub fn failed(failure: TestFailure) -> Self {
        Self::Completed(Err(failure))
    }
}

/// The role a lifecycle method plays around a test.
///
/// Each registered method carries exactly one kind and takes no arguments
/// beyond the instance, which is what makes it eligible for the
/// setup/teardown chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Runs once per isolated execution; the computed setup sequence
    /// places these after all per-test [`MethodKind::Setup`] methods.
    OneTimeSetup,
    /// Runs before the test body.
    Setup,
    /// Runs after the test body.
    Teardown,
    /// Runs once per isolated execution; the computed teardown sequence
    /// places these before all per-test [`MethodKind::Teardown`] methods.
    OneTimeTeardown,
}

/// A named setup/teardown body declared on one fixture level.
pub struct LifecycleMethod {
    /// Method name, unique within its fixture level.
    pub name: String,
    /// Which chain the method belongs to.
    pub kind: MethodKind,
    pub(crate) body: LifecycleFn,
}

/// A named test body declared on one fixture level.
pub struct TestMethod {
    /// Test name, unique within its fixture level.
    pub name: String,
    /// Number of method arguments the body expects.
    pub arity: usize,
    pub(crate) body: TestFn,
}

/// One level of a fixture inheritance chain.
pub struct Fixture {
    name: String,
    parent: Option<Arc<Fixture>>,
    constructor: Option<ConstructorFn>,
    methods: Vec<LifecycleMethod>,
    tests: Vec<TestMethod>,
    strategy: Option<Arc<dyn CompletionStrategy>>,
}

impl Fixture {
    /// Starts building a fixture level with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> FixtureBuilder {
        FixtureBuilder {
            name: name.into(),
            parent: None,
            constructor: None,
            methods: Vec::new(),
            tests: Vec::new(),
            strategy: None,
        }
    }

    /// The fixture's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates the inheritance chain, most-derived level first.
    pub fn chain(&self) -> impl Iterator<Item = &Fixture> {
        std::iter::successors(Some(self), |level| level.parent.as_deref())
    }

    /// Lifecycle methods declared on this level, in registration order.
    #[must_use]
    pub fn methods(&self) -> &[LifecycleMethod] {
        &self.methods
    }

    /// Finds a test by name, searching the chain most-derived-first.
    #[must_use]
    pub fn find_test(&self, name: &str) -> Option<&TestMethod> {
        self.chain()
            .find_map(|level| level.tests.iter().find(|test| test.name == name))
    }

    /// Finds a lifecycle body by its qualified `Fixture::method` name.
    #[must_use]
    pub fn find_lifecycle(&self, qualified: &str) -> Option<&LifecycleMethod> {
        let (fixture, method) = qualified.split_once("::")?;
        self.chain()
            .filter(|level| level.name == fixture)
            .find_map(|level| level.methods.iter().find(|m| m.name == method))
    }

    /// The constructor used to instantiate this fixture: the first one
    /// declared walking the chain from the most-derived level upward.
    #[must_use]
    pub fn constructor(&self) -> Option<&ConstructorFn> {
        self.chain().find_map(|level| level.constructor.as_ref())
    }

    /// The completion strategy for async tests: the first one declared
    /// walking the chain from the most-derived level upward, if any.
    #[must_use]
    pub fn completion_strategy(&self) -> Option<Arc<dyn CompletionStrategy>> {
        self.chain().find_map(|level| level.strategy.clone())
    }
}

/// Builder for one fixture level.
pub struct FixtureBuilder {
    name: String,
    parent: Option<Arc<Fixture>>,
    constructor: Option<ConstructorFn>,
    methods: Vec<LifecycleMethod>,
    tests: Vec<TestMethod>,
    strategy: Option<Arc<dyn CompletionStrategy>>,
}

impl FixtureBuilder {
    /// Declares the parent level this fixture derives from.
    #[must_use]
    pub fn inherit(mut self, parent: &Arc<Fixture>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    /// Declares the constructor for the fixture state.
    #[must_use]
    pub fn constructor<F>(mut self, body: F) -> Self
    where
        F: Fn(&[serde_json::Value]) -> Result<Instance, TestFailure> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(body));
        self
    }

    /// Declares a one-time setup method on this level.
    #[must_use]
    pub fn one_time_setup<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.lifecycle(name, MethodKind::OneTimeSetup, body)
    }

    /// Declares a per-test setup method on this level.
    #[must_use]
    pub fn setup<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.lifecycle(name, MethodKind::Setup, body)
    }

    /// Declares a per-test teardown method on this level.
    #[must_use]
    pub fn teardown<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.lifecycle(name, MethodKind::Teardown, body)
    }

    /// Declares a one-time teardown method on this level.
    #[must_use]
    pub fn one_time_teardown<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.lifecycle(name, MethodKind::OneTimeTeardown, body)
    }

    /// Declares a test body that takes no method arguments.
    #[must_use]
    pub fn test<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Instance, &[serde_json::Value]) -> TestOutcome + Send + Sync + 'static,
    {
        self.tests.push(TestMethod {
            name: name.into(),
            arity: 0,
            body: Arc::new(body),
        });
        self
    }

    /// Declares a test body with a fixed number of method arguments.
    #[must_use]
    pub fn test_with_args<F>(mut self, name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&mut Instance, &[serde_json::Value]) -> TestOutcome + Send + Sync + 'static,
    {
        self.tests.push(TestMethod {
            name: name.into(),
            arity,
            body: Arc::new(body),
        });
        self
    }

    /// Declares the completion strategy this fixture provides for its async
    /// tests.
    #[must_use]
    pub fn completion_strategy(mut self, strategy: Arc<dyn CompletionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Finishes the level, validating name uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateMethod`] if two methods or tests on
    /// this level share a name.
    pub fn build(self) -> Result<Arc<Fixture>, RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for name in self
            .methods
            .iter()
            .map(|m| m.name.as_str())
            .chain(self.tests.iter().map(|t| t.name.as_str()))
        {
            if !seen.insert(name) {
                return Err(RegistryError::DuplicateMethod {
                    fixture: self.name,
                    name: name.to_string(),
                });
            }
        }

        Ok(Arc::new(Fixture {
            name: self.name,
            parent: self.parent,
            constructor: self.constructor,
            methods: self.methods,
            tests: self.tests,
            strategy: self.strategy,
        }))
    }

    fn lifecycle<F>(mut self, name: impl Into<String>, kind: MethodKind, body: F) -> Self
    where
        F: Fn(&mut Instance) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.methods.push(LifecycleMethod {
            name: name.into(),
            kind,
            body: Arc::new(body),
        });
        self
    }
}

/// All fixtures known to one runner.
///
/// The registry must be built identically in the origin and worker
/// processes; re-running the same registration code guarantees that.
#[derive(Default)]
pub struct FixtureRegistry {
    fixtures: HashMap<String, Arc<Fixture>>,
}

impl FixtureRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture (and implicitly its ancestors, which stay
    /// reachable through the chain).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateFixture`] if the name is taken.
    pub fn register(&mut self, fixture: Arc<Fixture>) -> Result<(), RegistryError> {
        if self.fixtures.contains_key(fixture.name()) {
            return Err(RegistryError::DuplicateFixture {
                name: fixture.name().to_string(),
            });
        }
        self.fixtures.insert(fixture.name().to_string(), fixture);
        Ok(())
    }

    /// Looks up a fixture by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Fixture>> {
        self.fixtures.get(name)
    }
}
