//! Setup/teardown method collection and ordering.
//!
//! Given a fixture, this module computes the exact sequences of lifecycle
//! methods to run around a test, in the canonical "onion" order: base-level
//! setup wraps derived-level setup wraps the test wraps derived-level
//! teardown wraps base-level teardown.
//!
//! Collection walks the inheritance chain most-derived level first. The
//! setup list concatenates one-time-setup methods then per-test setup
//! methods and reverses the whole list; the teardown list concatenates
//! one-time-teardown then per-test teardown methods and is left in natural
//! order. Results are cached for the process lifetime, keyed by the chain's
//! lifecycle shape rather than the bare fixture name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fixture::{Fixture, MethodKind};

/// The ordered setup and teardown method lists for one fixture.
///
/// Methods are identified by their qualified `Fixture::method` names so the
/// lists can cross the isolation boundary; the worker resolves the names
/// against its own registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTeardown {
    /// Methods to run before the test, in execution order.
    pub setup_methods: Vec<String>,
    /// Methods to run after the test, in execution order.
    pub teardown_methods: Vec<String>,
}

/// Collects the qualified names of all lifecycle methods of the given kind,
/// walking the chain from the most-derived level upward.
///
/// Absence of matching methods yields an empty list, never an error.
#[must_use]
pub fn collect_methods(fixture: &Fixture, kind: MethodKind) -> Vec<String> {
    let mut found = Vec::new();
    for level in fixture.chain() {
        for method in level.methods() {
            if method.kind == kind {
                found.push(format!("{}::{}", level.name(), method.name));
            }
        }
    }
    found
}

/// Returns the setup/teardown lists for the fixture, computing them on
/// first use and caching them for the process lifetime.
///
/// The cache is keyed by the chain's full lifecycle fingerprint, so two
/// fixtures that merely share a name never observe each other's lists. The
/// insert is insert-if-absent: under concurrent first access the first
/// computed entry wins and both callers observe identical lists.
#[must_use]
pub fn setup_teardown_for(fixture: &Fixture) -> Arc<SetupTeardown> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<SetupTeardown>>>> = OnceLock::new();

    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    Arc::clone(
        cache
            .entry(cache_key(fixture))
            .or_insert_with(|| {
                debug!(fixture = fixture.name(), "collecting setup/teardown methods");
                Arc::new(compute(fixture))
            }),
    )
}

/// Identity of a fixture for caching purposes: every level's name plus its
/// lifecycle methods and their kinds, in chain order.
fn cache_key(fixture: &Fixture) -> String {
    use std::fmt::Write as _;

    let mut key = fixture.name().to_string();
    for level in fixture.chain() {
        for method in level.methods() {
            let _ = write!(key, "\n{}::{} {:?}", level.name(), method.name, method.kind);
        }
    }
    key
}

fn compute(fixture: &Fixture) -> SetupTeardown {
    let mut setup_methods = collect_methods(fixture, MethodKind::OneTimeSetup);
    setup_methods.extend(collect_methods(fixture, MethodKind::Setup));
    // Collected most-derived first; execution wants base-first.
    setup_methods.reverse();

    let mut teardown_methods = collect_methods(fixture, MethodKind::OneTimeTeardown);
    teardown_methods.extend(collect_methods(fixture, MethodKind::Teardown));

    SetupTeardown {
        setup_methods,
        teardown_methods,
    }
}
