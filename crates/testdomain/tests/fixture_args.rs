//! Parameterized fixtures and tests: construction arguments and method
//! arguments both travel in the envelope and are applied in the worker.

use std::sync::Arc;

use testdomain::{
    host_test_path, Fixture, FixtureRegistry, Instance, Runner, TestDescriptor, TestFailure,
    TestOutcome,
};

fn registry() -> Arc<FixtureRegistry> {
    let fixture = Fixture::builder("Parameterized")
        .constructor(|args| {
            let pair: (i64, String) = serde_json::from_value(serde_json::json!(args))
                .map_err(|e| TestFailure::error(format!("bad fixture arguments: {e}")))?;
            Ok(Box::new(pair) as Instance)
        })
        .test_with_args("matches_expectation", 2, |instance, args| {
            let pair = instance.downcast_ref::<(i64, String)>().unwrap();
            let expected_number = args[0].as_i64().unwrap();
            let expected_text = args[1].as_str().unwrap();
            if pair.0 == expected_number && pair.1 == expected_text {
                TestOutcome::passed()
            } else {
                TestOutcome::failed(TestFailure::assertion(format!(
                    "constructed {pair:?}, expected ({expected_number}, {expected_text:?})"
                )))
            }
        })
        .build()
        .unwrap();

    let mut registry = FixtureRegistry::new();
    registry.register(fixture).unwrap();
    Arc::new(registry)
}

fn run_case(host_path: &str, number: i64, text: &str) {
    let runner = Runner::new(registry());
    let descriptor = TestDescriptor::new("Parameterized", "matches_expectation", host_path)
        .with_fixture_arguments(vec![serde_json::json!(number), serde_json::json!(text)])
        .with_arguments(vec![serde_json::json!(number), serde_json::json!(text)]);
    runner.run_isolated(&descriptor).unwrap();
}

#[test]
fn first_argument_pair_reaches_the_worker() {
    run_case(&host_test_path!(), 1, "ABC");
}

#[test]
fn second_argument_pair_reaches_the_worker() {
    run_case(&host_test_path!(), 4, "DEF");
}

#[test]
fn argument_count_mismatch_fails_before_spawning() {
    let runner = Runner::new(registry());
    let descriptor = TestDescriptor::new("Parameterized", "matches_expectation", host_test_path!())
        .with_arguments(vec![serde_json::json!(1)]);

    match runner.run_isolated(&descriptor) {
        Err(testdomain::RunError::Setup(
            testdomain::OrchestrationError::ArgumentCountMismatch {
                expected, actual, ..
            },
        )) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 1);
        }
        other => panic!("expected an arity error, got {other:?}"),
    }
}
