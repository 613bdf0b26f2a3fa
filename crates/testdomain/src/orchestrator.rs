//! Origin-side orchestration of one isolated test execution.
//!
//! For each triggered test the orchestrator validates the descriptor into
//! an envelope, binds a fresh control socket, asks the context factory for
//! a worker, and then serves the worker's request/reply exchange until the
//! worker reports completion. The context is retired unconditionally
//! afterwards, and a worker that dies mid-exchange is surfaced with its
//! exit code instead of a hang.
//!
//! The same entry point also covers the two in-worker cases: when the
//! calling process *is* the worker for this descriptor it hands off to the
//! worker loop and never returns, and when it is a worker spawned for a
//! different descriptor the test runs inline without further isolation.

use std::io;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextFactory, IsolatedContext, PerTestProcessFactory, WorkerSpec};
use crate::envelope::{TestDescriptor, TestEnvelope};
use crate::error::{OrchestrationError, TestFailure};
use crate::fixture::FixtureRegistry;
use crate::protocol::{Connection, OriginReply, ProtocolError, WireEntry, WorkerRequest};
use crate::resolver::ResolveHelper;
use crate::runner;
use crate::store::{StoreEntry, StoreError};
use crate::worker::{self, WorkerInvocation};

/// How often the accept loop checks whether the worker died before
/// connecting.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// How long to wait for a crashed worker's exit status before giving up on
/// attributing a code to the lost connection.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(2);

/// Drives isolated executions against one fixture registry.
pub struct Orchestrator {
    registry: Arc<FixtureRegistry>,
    factory: Arc<dyn ContextFactory>,
    resolver: Arc<ResolveHelper>,
}

impl Orchestrator {
    /// Creates an orchestrator with the default per-test process factory.
    #[must_use]
    pub fn new(registry: Arc<FixtureRegistry>) -> Self {
        Self::with_factory(registry, Arc::new(PerTestProcessFactory::new()))
    }

    /// Creates an orchestrator with a custom context factory.
    #[must_use]
    pub fn with_factory(registry: Arc<FixtureRegistry>, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            registry,
            factory,
            resolver: Arc::new(ResolveHelper::new()),
        }
    }

    /// The origin-side half of the module resolution bridge.
    #[must_use]
    pub fn resolver(&self) -> &Arc<ResolveHelper> {
        &self.resolver
    }

    /// Runs the descriptor in an isolated context and returns the captured
    /// failure, or `None` when the test passed.
    ///
    /// Inside a worker process this either hands off to the worker loop
    /// (and does not return) or, for a descriptor the worker was not
    /// spawned for, runs the test inline.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError`] for invalid descriptors and for
    /// infrastructure failures: spawn errors, handshake rejection, or a
    /// worker lost mid-exchange. Test failures are not errors; they travel
    /// in the `Ok` value.
    pub fn run(&self, descriptor: &TestDescriptor) -> Result<Option<TestFailure>, OrchestrationError> {
        if let Some(invocation) = WorkerInvocation::from_env() {
            if invocation.matches(descriptor) {
                worker::run_and_exit(&self.registry, &invocation);
            }
            // A different descriptor inside a worker: no nested isolation,
            // the test runs in the context we already have.
            debug!(
                fixture = descriptor.fixture.as_str(),
                test = descriptor.test.as_str(),
                "descriptor does not match this worker; running inline"
            );
            let envelope =
                TestEnvelope::build(&self.registry, descriptor, runner::store_attached())?;
            return Ok(worker::execute_inline(&self.registry, &envelope));
        }

        self.orchestrate(descriptor)
    }

    fn orchestrate(
        &self,
        descriptor: &TestDescriptor,
    ) -> Result<Option<TestFailure>, OrchestrationError> {
        let envelope = TestEnvelope::build(&self.registry, descriptor, runner::store_attached())?;
        self.seed_resolver(&envelope);

        let socket_path = std::env::temp_dir().join(format!("testdomain-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)?;
        // Owns the bound socket file from here on; every exit path below,
        // early error or normal completion, unlinks it on drop.
        let _socket_guard = SocketGuard::new(socket_path.clone());
        listener.set_nonblocking(true)?;

        let spec = WorkerSpec {
            host_path: descriptor.host_path.clone(),
            socket_path: socket_path.clone(),
            token: Uuid::new_v4().to_string(),
            fixture: descriptor.fixture.clone(),
            test: descriptor.test.clone(),
            module_dir: envelope.module_dir.clone(),
        };

        info!(
            fixture = spec.fixture.as_str(),
            test = spec.test.as_str(),
            socket = %socket_path.display(),
            "starting isolated context"
        );
        let mut context = self.factory.context_for(&envelope, &spec)?;

        let outcome = self.exchange(&listener, &mut context, &envelope, &spec.token);

        // A lost connection usually means the worker died; give it a moment
        // to be reapable so the failure carries an exit code.
        let exit_code = if matches!(
            outcome,
            Err(OrchestrationError::Protocol(ProtocolError::Disconnected))
        ) {
            wait_for_exit(&mut context, EXIT_STATUS_GRACE)
        } else {
            None
        };

        self.factory.mark_finished(context);

        match outcome {
            Err(OrchestrationError::Protocol(ProtocolError::Disconnected)) => {
                warn!(code = ?exit_code, "worker lost mid-exchange");
                Err(OrchestrationError::WorkerConnectionLost { code: exit_code })
            }
            other => other,
        }
    }

    /// Registers what the origin already knows so the worker's resolution
    /// requests can be answered: the test binary itself by name, and its
    /// directory as a probe root.
    fn seed_resolver(&self, envelope: &TestEnvelope) {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(name) = exe.file_name() {
                self.resolver
                    .register_module(name.to_string_lossy().into_owned(), exe.clone());
            }
        }
        self.resolver.add_search_dir(&envelope.module_dir);
    }

    fn exchange(
        &self,
        listener: &UnixListener,
        context: &mut IsolatedContext,
        envelope: &TestEnvelope,
        token: &str,
    ) -> Result<Option<TestFailure>, OrchestrationError> {
        let mut connection = accept_worker(listener, context)?;

        match connection.recv::<WorkerRequest>()? {
            WorkerRequest::Hello {
                token: presented,
                pid,
            } => {
                if presented != token {
                    connection.send(&OriginReply::Denied {
                        reason: "handshake token mismatch".to_string(),
                    })?;
                    return Err(OrchestrationError::HandshakeFailed {
                        reason: format!("worker pid {pid} presented a stale token"),
                    });
                }
                debug!(pid, "worker handshake accepted");
            }
            other => {
                return Err(OrchestrationError::Protocol(ProtocolError::Unexpected {
                    context: format!("waiting for hello, got {other:?}"),
                }));
            }
        }

        connection.send(&OriginReply::Envelope {
            envelope: envelope.clone(),
        })?;

        loop {
            let reply = match connection.recv::<WorkerRequest>()? {
                WorkerRequest::Hello { pid, .. } => {
                    return Err(OrchestrationError::Protocol(ProtocolError::Unexpected {
                        context: format!("repeated hello from worker pid {pid}"),
                    }));
                }
                WorkerRequest::ResolveModule { name } => OriginReply::Resolved {
                    path: self.resolver.resolve(&name),
                },
                WorkerRequest::StoreGet { key } => serve_store_get(&key),
                WorkerRequest::StoreSet { key, value } => serve_store_set(&key, value),
                WorkerRequest::RemoteCall { key, method, args } => OriginReply::RemoteResult {
                    result: serve_remote_call(&key, &method, args),
                },
                WorkerRequest::Completed { failure } => {
                    connection.send(&OriginReply::Ack)?;
                    info!(failed = failure.is_some(), "worker completed");
                    return Ok(failure);
                }
            };
            connection.send(&reply)?;
        }
    }
}

/// Unlinks the bound control socket when the orchestration scope ends,
/// whichever way it ends.
struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Waits for the worker to connect, watching for it to die first so a
/// crash during startup surfaces instead of blocking forever.
fn accept_worker(
    listener: &UnixListener,
    context: &mut IsolatedContext,
) -> Result<Connection, OrchestrationError> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(ProtocolError::Io)?;
                return Ok(Connection::new(stream));
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                if let Some(status) = context.try_status()? {
                    return Err(OrchestrationError::WorkerConnectionLost {
                        code: status.code(),
                    });
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn wait_for_exit(context: &mut IsolatedContext, grace: Duration) -> Option<i32> {
    let deadline = Instant::now() + grace;
    loop {
        match context.try_status() {
            Ok(Some(status)) => return status.code(),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(ACCEPT_POLL),
            Ok(None) | Err(_) => return None,
        }
    }
}

fn serve_store_get(key: &str) -> OriginReply {
    match runner::ambient_backing().entry(key) {
        Ok(entry) => OriginReply::Entry {
            entry: entry.map(|entry| match entry {
                StoreEntry::Value(value) => WireEntry::Value { value },
                StoreEntry::Remote(_) => WireEntry::Remote,
            }),
        },
        Err(error) => OriginReply::Denied {
            reason: error.to_string(),
        },
    }
}

fn serve_store_set(key: &str, value: serde_json::Value) -> OriginReply {
    match runner::ambient_backing().set_value(key, value) {
        Ok(()) => OriginReply::Ack,
        Err(error) => OriginReply::Denied {
            reason: error.to_string(),
        },
    }
}

fn serve_remote_call(
    key: &str,
    method: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let store = crate::store::Store::new(runner::ambient_backing());
    let handle = store.remote(key).map_err(|error| error.to_string())?;
    match handle.call(method, args) {
        Ok(value) => Ok(value),
        Err(StoreError::RemoteCall { message }) => Err(message),
        Err(error) => Err(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, Instance, TestOutcome};
    use std::os::unix::net::UnixStream;

    fn registry() -> Arc<FixtureRegistry> {
        let fixture = Fixture::builder("F")
            .constructor(|_| Ok(Box::new(()) as Instance))
            .test("t", |_, _| TestOutcome::passed())
            .build()
            .unwrap();
        let mut registry = FixtureRegistry::new();
        registry.register(fixture).unwrap();
        Arc::new(registry)
    }

    /// A factory whose "context" is an in-test thread driving the worker
    /// half of the protocol over the real socket.
    struct ScriptedWorker {
        script: fn(Connection, String),
    }

    impl ContextFactory for ScriptedWorker {
        fn context_for(
            &self,
            _envelope: &TestEnvelope,
            spec: &WorkerSpec,
        ) -> Result<IsolatedContext, OrchestrationError> {
            let socket = spec.socket_path.clone();
            let token = spec.token.clone();
            let script = self.script;
            std::thread::spawn(move || {
                let stream = UnixStream::connect(socket).unwrap();
                script(Connection::new(stream), token);
            });
            // A real process still backs the context so liveness probing
            // has something to watch; `true` outlives the exchange.
            IsolatedContext::spawn({
                let mut command = std::process::Command::new("sleep");
                command.arg("5");
                command
            })
        }
    }

    fn orchestrate_with(script: fn(Connection, String)) -> Result<Option<TestFailure>, OrchestrationError> {
        let orchestrator =
            Orchestrator::with_factory(registry(), Arc::new(ScriptedWorker { script }));
        let descriptor = TestDescriptor::new("F", "t", "suite::host");
        orchestrator.run(&descriptor)
    }

    #[test]
    fn completed_failure_travels_back_to_the_origin() {
        let result = orchestrate_with(|mut connection, token| {
            connection
                .send(&WorkerRequest::Hello { token, pid: 1 })
                .unwrap();
            let OriginReply::Envelope { envelope } = connection.recv().unwrap() else {
                panic!("expected envelope");
            };
            assert_eq!(envelope.fixture, "F");
            connection
                .send(&WorkerRequest::Completed {
                    failure: Some(TestFailure::assertion("scripted")),
                })
                .unwrap();
            let OriginReply::Ack = connection.recv().unwrap() else {
                panic!("expected ack");
            };
        });

        let failure = result.unwrap().unwrap();
        assert_eq!(failure.message, "scripted");
    }

    #[test]
    fn stale_tokens_are_denied() {
        let result = orchestrate_with(|mut connection, _token| {
            connection
                .send(&WorkerRequest::Hello {
                    token: "stale".to_string(),
                    pid: 1,
                })
                .unwrap();
            let OriginReply::Denied { .. } = connection.recv::<OriginReply>().unwrap() else {
                panic!("expected denial");
            };
        });

        assert!(matches!(
            result,
            Err(OrchestrationError::HandshakeFailed { .. })
        ));
    }

    #[test]
    fn store_requests_are_served_against_the_origin_store() {
        let result = orchestrate_with(|mut connection, token| {
            connection
                .send(&WorkerRequest::Hello { token, pid: 1 })
                .unwrap();
            let OriginReply::Envelope { .. } = connection.recv().unwrap() else {
                panic!("expected envelope");
            };

            connection
                .send(&WorkerRequest::StoreSet {
                    key: "orch_roundtrip".to_string(),
                    value: serde_json::json!("from worker"),
                })
                .unwrap();
            let OriginReply::Ack = connection.recv().unwrap() else {
                panic!("expected ack");
            };

            connection
                .send(&WorkerRequest::StoreGet {
                    key: "orch_roundtrip".to_string(),
                })
                .unwrap();
            let OriginReply::Entry {
                entry: Some(WireEntry::Value { value }),
            } = connection.recv().unwrap()
            else {
                panic!("expected the stored value");
            };
            assert_eq!(value, serde_json::json!("from worker"));

            connection
                .send(&WorkerRequest::Completed { failure: None })
                .unwrap();
            let OriginReply::Ack = connection.recv().unwrap() else {
                panic!("expected ack");
            };
        });

        assert!(result.unwrap().is_none());
        assert_eq!(
            runner::data_store()
                .get::<String>("orch_roundtrip")
                .unwrap(),
            "from worker"
        );
    }

    #[test]
    fn the_socket_file_is_unlinked_when_its_guard_drops() {
        let path = std::env::temp_dir().join(format!("testdomain-guard-{}.sock", Uuid::new_v4()));
        std::fs::write(&path, b"").unwrap();

        drop(SocketGuard::new(path.clone()));
        assert!(!path.exists());
    }

    #[test]
    fn the_socket_file_is_removed_when_the_context_cannot_be_created() {
        struct NeverSpawns {
            socket: std::sync::Mutex<Option<PathBuf>>,
        }

        impl ContextFactory for NeverSpawns {
            fn context_for(
                &self,
                _envelope: &TestEnvelope,
                spec: &WorkerSpec,
            ) -> Result<IsolatedContext, OrchestrationError> {
                *self.socket.lock().unwrap() = Some(spec.socket_path.clone());
                Err(OrchestrationError::SpawnFailed("scripted refusal".to_string()))
            }
        }

        let factory = Arc::new(NeverSpawns {
            socket: std::sync::Mutex::new(None),
        });
        let orchestrator =
            Orchestrator::with_factory(registry(), Arc::clone(&factory) as Arc<dyn ContextFactory>);
        let descriptor = TestDescriptor::new("F", "t", "suite::host");

        assert!(matches!(
            orchestrator.run(&descriptor),
            Err(OrchestrationError::SpawnFailed(_))
        ));
        let socket = factory.socket.lock().unwrap().clone().unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn a_worker_that_hangs_up_is_reported_with_its_exit_state() {
        let result = orchestrate_with(|mut connection, token| {
            connection
                .send(&WorkerRequest::Hello { token, pid: 1 })
                .unwrap();
            let OriginReply::Envelope { .. } = connection.recv().unwrap() else {
                panic!("expected envelope");
            };
            // Dropping the connection mid-exchange simulates a crash.
        });

        assert!(matches!(
            result,
            Err(OrchestrationError::WorkerConnectionLost { .. })
        ));
    }
}
