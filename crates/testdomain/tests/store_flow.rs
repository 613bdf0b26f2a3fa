//! Data-store traffic across the isolation boundary: plain values by copy,
//! live references by forwarded calls, rejected remote writes, and the
//! module resolution bridge.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use testdomain::{
    data_store, host_test_path, Fixture, FixtureRegistry, Instance, RemoteObject, Runner,
    StoreError, TestDescriptor, TestOutcome,
};

struct Counter(AtomicI64);

impl RemoteObject for Counter {
    fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, String> {
        match method {
            "add" => {
                let n: i64 = serde_json::from_value(args).map_err(|e| e.to_string())?;
                Ok(serde_json::json!(self.0.fetch_add(n, Ordering::SeqCst) + n))
            }
            "value" => Ok(serde_json::json!(self.0.load(Ordering::SeqCst))),
            other => Err(format!("counter has no method `{other}`")),
        }
    }
}

struct Inert;

impl RemoteObject for Inert {
    fn call(&self, _method: &str, _args: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(serde_json::Value::Null)
    }
}

fn registry() -> Arc<FixtureRegistry> {
    let fixture = Fixture::builder("StoreUser")
        .constructor(|_| Ok(Box::new(()) as Instance))
        .test("round_trips_values", |_, _| {
            let store = data_store();
            let seed: i64 = store.get("seed").unwrap();
            assert_eq!(seed, 5);
            store.set("reply", seed + 1).unwrap();
            TestOutcome::passed()
        })
        .test("drives_the_remote_counter", |_, _| {
            let handle = data_store().remote("counter").unwrap();
            assert_eq!(
                handle.call("add", serde_json::json!(2)).unwrap(),
                serde_json::json!(2)
            );
            assert_eq!(
                handle.call("add", serde_json::json!(2)).unwrap(),
                serde_json::json!(4)
            );
            TestOutcome::passed()
        })
        .test("cannot_store_live_references", |_, _| {
            let result = data_store().set_remote("smuggled", Arc::new(Inert));
            assert!(matches!(
                result,
                Err(StoreError::RemoteWriteFromIsolatedContext)
            ));
            TestOutcome::passed()
        })
        .test("resolves_modules_through_the_bridge", |_, _| {
            let resolved = testdomain::worker::resolve_module("aux-module.bin");
            assert_eq!(
                resolved,
                Some(std::path::PathBuf::from("/opt/aux/aux-module.bin"))
            );
            // Memoized: same answer without a second round trip.
            assert_eq!(
                testdomain::worker::resolve_module("aux-module.bin"),
                Some(std::path::PathBuf::from("/opt/aux/aux-module.bin"))
            );
            assert_eq!(testdomain::worker::resolve_module("no-such-module"), None);
            TestOutcome::passed()
        })
        .build()
        .unwrap();

    let mut registry = FixtureRegistry::new();
    registry.register(fixture).unwrap();
    Arc::new(registry)
}

#[test]
fn worker_reads_and_writes_reach_the_origin_store() {
    data_store().set("seed", 5i64).unwrap();

    let runner = Runner::new(registry());
    let descriptor = TestDescriptor::new("StoreUser", "round_trips_values", host_test_path!());
    runner.run_isolated(&descriptor).unwrap();

    assert_eq!(data_store().get::<i64>("reply").unwrap(), 6);
}

#[test]
fn remote_calls_from_the_worker_mutate_the_origin_object() {
    let counter = Arc::new(Counter(AtomicI64::new(0)));
    data_store()
        .set_remote("counter", Arc::clone(&counter) as Arc<dyn RemoteObject>)
        .unwrap();

    let runner = Runner::new(registry());
    let descriptor =
        TestDescriptor::new("StoreUser", "drives_the_remote_counter", host_test_path!());
    runner.run_isolated(&descriptor).unwrap();

    assert_eq!(counter.0.load(Ordering::SeqCst), 4);
}

#[test]
fn live_reference_writes_from_the_worker_are_rejected() {
    let runner = Runner::new(registry());
    let descriptor =
        TestDescriptor::new("StoreUser", "cannot_store_live_references", host_test_path!());
    runner.run_isolated(&descriptor).unwrap();

    assert!(data_store().try_get::<i64>("smuggled").unwrap().is_none());
}

#[test]
fn registered_modules_resolve_across_the_boundary() {
    let runner = Runner::new(registry());
    runner
        .resolver()
        .register_module("aux-module.bin", "/opt/aux/aux-module.bin");

    let descriptor = TestDescriptor::new(
        "StoreUser",
        "resolves_modules_through_the_bridge",
        host_test_path!(),
    );
    runner.run_isolated(&descriptor).unwrap();
}
