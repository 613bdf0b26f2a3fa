//! Executes one test, with its setup/teardown chain, against a fixture
//! instance.
//!
//! This is the code that runs *inside* the isolated worker (and also backs
//! the inline fallback when no isolation is wanted). Its ordering contract:
//!
//! 1. construct the instance from the fixture arguments;
//! 2. run the setup methods in envelope order, capturing the first failure
//!    and skipping the test body if one fails;
//! 3. invoke the test body; a pending result is handed to the fixture's
//!    completion strategy;
//! 4. run *every* teardown method regardless of earlier failures, retaining
//!    only the first teardown failure.
//!
//! Teardown always runs once the instance was constructed, even when setup
//! or the test body failed. Panics anywhere in the chain are unwound to
//! their payload message before capture, so callers only ever see the
//! underlying cause.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::envelope::TestEnvelope;
use crate::error::TestFailure;
use crate::fixture::{Fixture, FixtureRegistry, Instance, LifecycleMethod, TestOutcome};
use crate::runner;
use crate::strategy::{CompletionStrategy, TaskWaitStrategy};

/// Runs the envelope against the registry and returns the first captured
/// failure, or `None` on success.
///
/// `set_latch` marks the process as being inside an isolated context; the
/// latch is never reset because the worker process is discarded right
/// after.
pub(crate) fn execute(
    registry: &FixtureRegistry,
    envelope: &TestEnvelope,
    set_latch: bool,
) -> Option<TestFailure> {
    if set_latch {
        runner::mark_in_test_domain();
    }

    let Some(fixture) = registry.get(&envelope.fixture) else {
        return Some(TestFailure::error(format!(
            "fixture `{}` is not registered in the executing context",
            envelope.fixture
        )));
    };

    let Some(constructor) = fixture.constructor().cloned() else {
        return Some(TestFailure::error(format!(
            "fixture `{}` has no constructor in the executing context",
            envelope.fixture
        )));
    };

    let mut instance = match catch_unwind(AssertUnwindSafe(|| {
        constructor(&envelope.fixture_arguments)
    })) {
        Ok(Ok(instance)) => instance,
        Ok(Err(failure)) => return Some(failure),
        Err(payload) => return Some(TestFailure::from_panic(payload)),
    };

    let mut failure = run_setup_chain(fixture, envelope, &mut instance);

    if failure.is_none() {
        failure = run_test_body(fixture, envelope, &mut instance);
    }

    // Teardown always runs once the instance exists; one failing teardown
    // does not stop the rest, and only the first teardown failure is kept.
    let mut teardown_failure = None;
    for name in &envelope.methods.teardown_methods {
        if let Err(captured) = invoke_lifecycle(fixture, name, &mut instance) {
            debug!(method = name.as_str(), "teardown method failed");
            teardown_failure.get_or_insert(captured);
        }
    }

    failure.or(teardown_failure)
}

fn run_setup_chain(
    fixture: &Fixture,
    envelope: &TestEnvelope,
    instance: &mut Instance,
) -> Option<TestFailure> {
    for name in &envelope.methods.setup_methods {
        if let Err(captured) = invoke_lifecycle(fixture, name, instance) {
            debug!(method = name.as_str(), "setup method failed; skipping test body");
            return Some(captured);
        }
    }
    None
}

fn run_test_body(
    fixture: &Fixture,
    envelope: &TestEnvelope,
    instance: &mut Instance,
) -> Option<TestFailure> {
    let Some(test) = fixture.find_test(&envelope.test) else {
        return Some(TestFailure::error(format!(
            "test `{}::{}` is not registered in the executing context",
            envelope.fixture, envelope.test
        )));
    };

    let body = Arc::clone(&test.body);
    let outcome = match catch_unwind(AssertUnwindSafe(|| body(instance, &envelope.arguments))) {
        Ok(outcome) => outcome,
        Err(payload) => return Some(TestFailure::from_panic(payload)),
    };

    match outcome {
        TestOutcome::Completed(result) => result.err(),
        TestOutcome::Pending(pending) => {
            // Resolved per execution, never cached: the most-derived level
            // providing a strategy wins, else block until settled.
            let strategy = fixture
                .completion_strategy()
                .unwrap_or_else(|| Arc::new(TaskWaitStrategy) as Arc<dyn CompletionStrategy>);
            match catch_unwind(AssertUnwindSafe(|| strategy.process(pending))) {
                Ok(result) => result.err(),
                Err(payload) => Some(TestFailure::from_panic(payload)),
            }
        }
    }
}

fn invoke_lifecycle(
    fixture: &Fixture,
    qualified: &str,
    instance: &mut Instance,
) -> Result<(), TestFailure> {
    let Some(method) = fixture.find_lifecycle(qualified) else {
        return Err(TestFailure::error(format!(
            "lifecycle method `{qualified}` is not registered in the executing context"
        )));
    };
    invoke_captured(method, instance)
}

fn invoke_captured(method: &LifecycleMethod, instance: &mut Instance) -> Result<(), TestFailure> {
    let body = Arc::clone(&method.body);
    match catch_unwind(AssertUnwindSafe(|| body(instance))) {
        Ok(result) => result,
        Err(payload) => Err(TestFailure::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{TestDescriptor, TestEnvelope};
    use crate::fixture::Fixture;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    fn envelope_for(registry: &FixtureRegistry, fixture: &str, test: &str) -> TestEnvelope {
        let descriptor = TestDescriptor::new(fixture, test, "unit::test");
        TestEnvelope::build(registry, &descriptor, false).unwrap()
    }

    fn chain_registry(log: &Log, failing_test: bool) -> FixtureRegistry {
        let (s_base, t_base) = (log.clone(), log.clone());
        let base = Fixture::builder("Base")
            .constructor(|_| Ok(Box::new(()) as Instance))
            .setup("setup", move |_| {
                record(&s_base, "base_setup");
                Ok(())
            })
            .teardown("teardown", move |_| {
                record(&t_base, "base_teardown");
                Ok(())
            })
            .build()
            .unwrap();

        let (s_derived, t_derived, body) = (log.clone(), log.clone(), log.clone());
        let derived = Fixture::builder("Derived")
            .inherit(&base)
            .setup("setup", move |_| {
                record(&s_derived, "derived_setup");
                Ok(())
            })
            .teardown("teardown", move |_| {
                record(&t_derived, "derived_teardown");
                Ok(())
            })
            .test("body", move |_, _| {
                record(&body, "test");
                if failing_test {
                    TestOutcome::failed(TestFailure::assertion("forced"))
                } else {
                    TestOutcome::passed()
                }
            })
            .build()
            .unwrap();

        let mut registry = FixtureRegistry::new();
        registry.register(base).unwrap();
        registry.register(derived).unwrap();
        registry
    }

    #[test]
    fn onion_ordering_wraps_the_test_body() {
        let log: Log = Arc::default();
        let registry = chain_registry(&log, false);
        let envelope = envelope_for(&registry, "Derived", "body");

        assert!(execute(&registry, &envelope, false).is_none());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "base_setup",
                "derived_setup",
                "test",
                "derived_teardown",
                "base_teardown"
            ]
        );
    }

    #[test]
    fn teardown_runs_when_the_test_body_fails() {
        let log: Log = Arc::default();
        let registry = chain_registry(&log, true);
        let envelope = envelope_for(&registry, "Derived", "body");

        let failure = execute(&registry, &envelope, false).unwrap();
        assert!(failure.is_assertion());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "base_setup",
                "derived_setup",
                "test",
                "derived_teardown",
                "base_teardown"
            ]
        );
    }

    #[test]
    fn setup_failure_skips_the_test_body_but_not_teardown() {
        let log: Log = Arc::default();
        let teardown_log = log.clone();
        let body_log = log.clone();
        let fixture = Fixture::builder("SetupBreaks")
            .constructor(|_| Ok(Box::new(()) as Instance))
            .setup("broken", |_| Err(TestFailure::error("setup broke")))
            .teardown("cleanup", move |_| {
                record(&teardown_log, "teardown");
                Ok(())
            })
            .test("body", move |_, _| {
                record(&body_log, "test");
                TestOutcome::passed()
            })
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        let envelope = envelope_for(&registry, "SetupBreaks", "body");

        let failure = execute(&registry, &envelope, false).unwrap();
        assert_eq!(failure.message, "setup broke");
        assert_eq!(*log.lock().unwrap(), vec!["teardown"]);
    }

    #[test]
    fn every_teardown_runs_and_the_first_failure_wins() {
        let log: Log = Arc::default();
        let (first, second) = (log.clone(), log.clone());
        let fixture = Fixture::builder("TeardownPair")
            .constructor(|_| Ok(Box::new(()) as Instance))
            .teardown("first", move |_| {
                record(&first, "first");
                Err(TestFailure::error("first teardown"))
            })
            .teardown("second", move |_| {
                record(&second, "second");
                Err(TestFailure::error("second teardown"))
            })
            .test("body", |_, _| TestOutcome::passed())
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        let envelope = envelope_for(&registry, "TeardownPair", "body");

        let failure = execute(&registry, &envelope, false).unwrap();
        assert_eq!(failure.message, "first teardown");
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_test_bodies_are_captured_not_propagated() {
        let fixture = Fixture::builder("Panics")
            .constructor(|_| Ok(Box::new(()) as Instance))
            .test("body", |_, _| panic!("kaboom"))
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        let envelope = envelope_for(&registry, "Panics", "body");

        let failure = execute(&registry, &envelope, false).unwrap();
        assert_eq!(failure.message, "kaboom");
    }

    #[test]
    fn constructor_failure_skips_everything_including_teardown() {
        let log: Log = Arc::default();
        let teardown_log = log.clone();
        let fixture = Fixture::builder("NoBuild")
            .constructor(|_| Err(TestFailure::error("cannot build")))
            .teardown("cleanup", move |_| {
                record(&teardown_log, "teardown");
                Ok(())
            })
            .test("body", |_, _| TestOutcome::passed())
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        let envelope = envelope_for(&registry, "NoBuild", "body");

        let failure = execute(&registry, &envelope, false).unwrap();
        assert_eq!(failure.message, "cannot build");
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn fixture_arguments_reach_the_constructor() {
        let fixture = Fixture::builder("PairArgs")
            .constructor(|args| {
                let pair: (i64, String) = serde_json::from_value(serde_json::json!(args))
                    .map_err(|e| TestFailure::error(e.to_string()))?;
                Ok(Box::new(pair) as Instance)
            })
            .test("body", |instance, _| {
                let pair = instance.downcast_ref::<(i64, String)>().unwrap();
                if pair == &(1, "ABC".to_string()) {
                    TestOutcome::passed()
                } else {
                    TestOutcome::failed(TestFailure::assertion(format!("{pair:?}")))
                }
            })
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();

        let descriptor = TestDescriptor::new("PairArgs", "body", "unit::test")
            .with_fixture_arguments(vec![serde_json::json!(1), serde_json::json!("ABC")]);
        let envelope = TestEnvelope::build(&registry, &descriptor, false).unwrap();

        assert!(execute(&registry, &envelope, false).is_none());
    }
}
