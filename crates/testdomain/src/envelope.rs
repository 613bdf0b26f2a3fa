//! The execution envelope: everything one isolated execution needs.
//!
//! Built once per orchestration in the origin process and sent to the
//! worker over the control connection after the handshake. Immutable after
//! construction; the worker resolves the names it carries against its own
//! fixture registry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;
use crate::fixture::FixtureRegistry;
use crate::metadata::{self, SetupTeardown};

/// A pending test supplied by the trigger mechanism.
///
/// `host_path` is the libtest name of the host test function that is
/// currently running (see [`host_test_path!`](crate::host_test_path)); the
/// worker child is spawned by re-executing the test binary filtered to
/// exactly that test.
#[derive(Debug, Clone)]
pub struct TestDescriptor {
    /// Name of the registered fixture to instantiate.
    pub fixture: String,
    /// Name of the registered test to invoke.
    pub test: String,
    /// Libtest path of the enclosing host test function.
    pub host_path: String,
    /// Arguments for the test body.
    pub arguments: Vec<serde_json::Value>,
    /// Arguments for the fixture constructor.
    pub fixture_arguments: Vec<serde_json::Value>,
}

impl TestDescriptor {
    /// Creates a descriptor with no arguments.
    #[must_use]
    pub fn new(
        fixture: impl Into<String>,
        test: impl Into<String>,
        host_path: impl Into<String>,
    ) -> Self {
        Self {
            fixture: fixture.into(),
            test: test.into(),
            host_path: host_path.into(),
            arguments: Vec::new(),
            fixture_arguments: Vec::new(),
        }
    }

    /// Sets the test body arguments.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Vec<serde_json::Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Sets the fixture construction arguments.
    #[must_use]
    pub fn with_fixture_arguments(mut self, arguments: Vec<serde_json::Value>) -> Self {
        self.fixture_arguments = arguments;
        self
    }
}

/// The transportable description of one test invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEnvelope {
    /// Fixture to instantiate in the worker.
    pub fixture: String,
    /// Test to invoke on the instance.
    pub test: String,
    /// Arguments for the test body.
    pub arguments: Vec<serde_json::Value>,
    /// Arguments for the fixture constructor.
    pub fixture_arguments: Vec<serde_json::Value>,
    /// Ordered setup/teardown method names.
    pub methods: SetupTeardown,
    /// Configuration overlay found next to the test binary, if any.
    pub config_file: Option<PathBuf>,
    /// Directory containing the test binary; the worker's module base path.
    pub module_dir: PathBuf,
    /// Whether the origin had a data store attached when the envelope was
    /// built. The worker installs its proxy store either way; this records
    /// the lazily-created-or-not state at capture time.
    pub data_store_attached: bool,
}

impl TestEnvelope {
    /// Builds the envelope for a descriptor, validating it against the
    /// registry.
    ///
    /// Validation failures here are fatal configuration errors: they abort
    /// before any isolated context exists.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError`] for unknown fixtures or tests,
    /// argument arity mismatches, missing constructors, or an
    /// undeterminable module directory.
    pub fn build(
        registry: &FixtureRegistry,
        descriptor: &TestDescriptor,
        data_store_attached: bool,
    ) -> Result<Self, OrchestrationError> {
        if descriptor.fixture.is_empty() || descriptor.test.is_empty() {
            return Err(OrchestrationError::InvalidDescriptor {
                reason: "fixture and test names must be non-empty".to_string(),
            });
        }
        if descriptor.host_path.is_empty() {
            return Err(OrchestrationError::InvalidDescriptor {
                reason: "host test path must be non-empty".to_string(),
            });
        }

        let fixture =
            registry
                .get(&descriptor.fixture)
                .ok_or_else(|| OrchestrationError::UnknownFixture {
                    name: descriptor.fixture.clone(),
                })?;

        let test = fixture.find_test(&descriptor.test).ok_or_else(|| {
            OrchestrationError::UnknownTest {
                fixture: descriptor.fixture.clone(),
                name: descriptor.test.clone(),
            }
        })?;

        if test.arity != descriptor.arguments.len() {
            return Err(OrchestrationError::ArgumentCountMismatch {
                test: format!("{}::{}", descriptor.fixture, descriptor.test),
                expected: test.arity,
                actual: descriptor.arguments.len(),
            });
        }

        if fixture.constructor().is_none() {
            return Err(OrchestrationError::NotConstructible {
                fixture: descriptor.fixture.clone(),
            });
        }

        let exe = std::env::current_exe()?;
        let module_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| OrchestrationError::InvalidDescriptor {
                reason: "test binary has no parent directory".to_string(),
            })?;

        Ok(Self {
            fixture: descriptor.fixture.clone(),
            test: descriptor.test.clone(),
            arguments: descriptor.arguments.clone(),
            fixture_arguments: descriptor.fixture_arguments.clone(),
            methods: metadata::setup_teardown_for(fixture).as_ref().clone(),
            config_file: find_config_file(&exe),
            module_dir,
            data_store_attached,
        })
    }
}

/// Probes for a configuration overlay adjacent to the binary:
/// `<binary-path>.config`, used only if the file exists.
#[must_use]
pub(crate) fn find_config_file(exe: &Path) -> Option<PathBuf> {
    let mut candidate = exe.as_os_str().to_owned();
    candidate.push(".config");
    let candidate = PathBuf::from(candidate);
    candidate.is_file().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, TestOutcome};

    fn registry_with_test() -> FixtureRegistry {
        let fixture = Fixture::builder("F")
            .constructor(|_| Ok(Box::new(()) as crate::fixture::Instance))
            .test("t", |_, _| TestOutcome::passed())
            .test_with_args("pair", 2, |_, _| TestOutcome::passed())
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        registry
    }

    #[test]
    fn unknown_fixture_is_a_configuration_error() {
        let registry = registry_with_test();
        let descriptor = TestDescriptor::new("Missing", "t", "some::test");
        assert!(matches!(
            TestEnvelope::build(&registry, &descriptor, false),
            Err(OrchestrationError::UnknownFixture { .. })
        ));
    }

    #[test]
    fn argument_arity_is_validated_up_front() {
        let registry = registry_with_test();
        let descriptor = TestDescriptor::new("F", "pair", "some::test")
            .with_arguments(vec![serde_json::json!(1)]);
        assert!(matches!(
            TestEnvelope::build(&registry, &descriptor, false),
            Err(OrchestrationError::ArgumentCountMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn fixtures_without_constructors_are_rejected() {
        let fixture = Fixture::builder("NoCtor")
            .test("t", |_, _| TestOutcome::passed())
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();

        let descriptor = TestDescriptor::new("NoCtor", "t", "some::test");
        assert!(matches!(
            TestEnvelope::build(&registry, &descriptor, false),
            Err(OrchestrationError::NotConstructible { .. })
        ));
    }

    #[test]
    fn config_probe_requires_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("suite-bin");
        assert_eq!(find_config_file(&exe), None);

        let config = dir.path().join("suite-bin.config");
        std::fs::write(&config, "answer = 42\n").unwrap();
        assert_eq!(find_config_file(&exe), Some(config));
    }

    #[test]
    fn valid_descriptor_builds_an_envelope() {
        let registry = registry_with_test();
        let descriptor = TestDescriptor::new("F", "t", "some::test");
        let envelope = TestEnvelope::build(&registry, &descriptor, true).unwrap();
        assert_eq!(envelope.fixture, "F");
        assert!(envelope.data_store_attached);
        assert!(envelope.module_dir.is_dir());
    }
}
