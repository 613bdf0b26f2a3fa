//! Worker-process side of an orchestration.
//!
//! The origin spawns the worker by re-executing the current test binary
//! filtered to the same host test, with the orchestration's socket path and
//! token in the environment. When the re-executed host test reaches its
//! [`Runner::run`](crate::runner::Runner::run) call, the runner detects
//! those variables, and instead of orchestrating again it connects back,
//! executes the envelope it is handed, reports the outcome, and exits the
//! process without returning.
//!
//! While the test runs, this module also provides the worker's ambient
//! bridges to the origin: the proxied data store, the memoizing module
//! resolver, and the configuration overlay read from the envelope.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, error, info};

use crate::envelope::TestDescriptor;
use crate::error::TestFailure;
use crate::executor;
use crate::fixture::FixtureRegistry;
use crate::protocol::{Connection, OriginReply, ProtocolError, WireEntry, WorkerRequest};
use crate::resolver::ModuleResolver;
use crate::runner;
use crate::store::{KeyValueStore, RemoteHandle, RemoteObject, StoreEntry, StoreError};

/// Environment variable carrying the control socket path.
pub(crate) const ENV_SOCKET: &str = "TESTDOMAIN_SOCKET";
/// Environment variable carrying the handshake token.
pub(crate) const ENV_TOKEN: &str = "TESTDOMAIN_TOKEN";
/// Environment variable naming the fixture the worker was spawned for.
pub(crate) const ENV_FIXTURE: &str = "TESTDOMAIN_FIXTURE";
/// Environment variable naming the test the worker was spawned for.
pub(crate) const ENV_TEST: &str = "TESTDOMAIN_TEST";

/// Process exit status for a worker that could not complete its exchange
/// with the origin. Distinct from test failure, which is reported in-band.
const EXIT_EXCHANGE_FAILED: u8 = 70;

/// The spawn parameters a worker process reads from its environment.
#[derive(Debug, Clone)]
pub(crate) struct WorkerInvocation {
    socket: PathBuf,
    token: String,
    fixture: String,
    test: String,
}

impl WorkerInvocation {
    /// Reads the invocation from the environment, or `None` when this
    /// process is an origin (no orchestration variables present).
    pub(crate) fn from_env() -> Option<Self> {
        let socket = std::env::var_os(ENV_SOCKET)?;
        let token = std::env::var(ENV_TOKEN).ok()?;
        let fixture = std::env::var(ENV_FIXTURE).ok()?;
        let test = std::env::var(ENV_TEST).ok()?;
        Some(Self {
            socket: PathBuf::from(socket),
            token,
            fixture,
            test,
        })
    }

    /// Whether this invocation targets the given descriptor.
    ///
    /// A host test function can trigger several orchestrations; only the
    /// one the worker was spawned for runs against the origin, the others
    /// run inline inside the worker.
    pub(crate) fn matches(&self, descriptor: &TestDescriptor) -> bool {
        self.fixture == descriptor.fixture && self.test == descriptor.test
    }
}

/// The worker's single connection back to the origin.
///
/// The exchange is strictly sequential; the mutex serializes the rare case
/// of test code touching the store from more than one thread.
pub struct WorkerLink {
    connection: Mutex<Connection>,
}

impl WorkerLink {
    fn connect(socket: &Path) -> Result<Self, ProtocolError> {
        let stream = std::os::unix::net::UnixStream::connect(socket)?;
        Ok(Self {
            connection: Mutex::new(Connection::new(stream)),
        })
    }

    /// Sends one request and waits for its reply. `Denied` replies become
    /// errors here so call sites only match the replies they expect.
    pub(crate) fn request(&self, request: &WorkerRequest) -> Result<OriginReply, ProtocolError> {
        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connection.send(request)?;
        match connection.recv::<OriginReply>()? {
            OriginReply::Denied { reason } => Err(ProtocolError::Denied { reason }),
            reply => Ok(reply),
        }
    }

    /// Forwards a method call on a live-reference store entry to the origin.
    pub(crate) fn remote_call(
        &self,
        key: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let reply = self.request(&WorkerRequest::RemoteCall {
            key: key.to_string(),
            method: method.to_string(),
            args,
        })?;
        match reply {
            OriginReply::RemoteResult { result } => {
                result.map_err(|message| StoreError::RemoteCall { message })
            }
            other => Err(StoreError::Transport(ProtocolError::Unexpected {
                context: format!("waiting for remote_result, got {other:?}"),
            })),
        }
    }
}

/// The worker's view of the origin data store: every operation crosses the
/// control connection, so reads and writes observe the origin's map live.
struct ProxyStore {
    link: Arc<WorkerLink>,
}

impl KeyValueStore for ProxyStore {
    fn entry(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let reply = self.link.request(&WorkerRequest::StoreGet {
            key: key.to_string(),
        })?;
        match reply {
            OriginReply::Entry { entry } => Ok(entry.map(|entry| match entry {
                WireEntry::Value { value } => StoreEntry::Value(value),
                WireEntry::Remote => StoreEntry::Remote(RemoteHandle::proxied(
                    key.to_string(),
                    Arc::clone(&self.link),
                )),
            })),
            other => Err(StoreError::Transport(ProtocolError::Unexpected {
                context: format!("waiting for entry, got {other:?}"),
            })),
        }
    }

    fn set_value(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let reply = self.link.request(&WorkerRequest::StoreSet {
            key: key.to_string(),
            value,
        })?;
        match reply {
            OriginReply::Ack => Ok(()),
            other => Err(StoreError::Transport(ProtocolError::Unexpected {
                context: format!("waiting for ack, got {other:?}"),
            })),
        }
    }

    fn set_remote(&self, _key: &str, _object: Arc<dyn RemoteObject>) -> Result<(), StoreError> {
        // A live reference stored from a process that is about to be
        // discarded would dangle the moment the worker exits.
        Err(StoreError::RemoteWriteFromIsolatedContext)
    }
}

/// Ambient worker state installed before the test executes.
struct WorkerContext {
    resolver: ModuleResolver,
    config_path: Option<PathBuf>,
    config: Option<toml::Table>,
}

static CONTEXT: OnceLock<WorkerContext> = OnceLock::new();

/// The configuration overlay found next to the test binary, parsed as TOML.
///
/// `None` outside the isolated context, or when no `<binary>.config` file
/// exists.
#[must_use]
pub fn config_overlay() -> Option<&'static toml::Table> {
    CONTEXT.get().and_then(|context| context.config.as_ref())
}

/// Path of the configuration overlay file, if one was found.
#[must_use]
pub fn config_path() -> Option<&'static Path> {
    CONTEXT
        .get()
        .and_then(|context| context.config_path.as_deref())
}

/// Resolves a module by name through the origin bridge.
///
/// Only meaningful inside the isolated context; returns `None` (a true
/// unknown) in the origin, where the caller already has direct access to
/// the [`ResolveHelper`](crate::resolver::ResolveHelper).
#[must_use]
pub fn resolve_module(name: &str) -> Option<PathBuf> {
    CONTEXT.get().and_then(|context| context.resolver.resolve(name))
}

/// Runs the worker side of the orchestration and exits the process.
///
/// Exit status 0 means the exchange completed, whatever the test outcome:
/// the outcome itself travels in-band in the `Completed` message. A
/// non-zero status means the exchange itself broke, which the origin
/// surfaces as a lost worker.
pub(crate) fn run_and_exit(registry: &FixtureRegistry, invocation: &WorkerInvocation) -> ! {
    match run(registry, invocation) {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            error!(%error, "worker exchange failed");
            std::process::exit(i32::from(EXIT_EXCHANGE_FAILED))
        }
    }
}

fn run(registry: &FixtureRegistry, invocation: &WorkerInvocation) -> Result<(), ProtocolError> {
    let link = Arc::new(WorkerLink::connect(&invocation.socket)?);
    info!(socket = %invocation.socket.display(), "worker connected to origin");

    let envelope = match link.request(&WorkerRequest::Hello {
        token: invocation.token.clone(),
        pid: std::process::id(),
    })? {
        OriginReply::Envelope { envelope } => envelope,
        other => {
            return Err(ProtocolError::Unexpected {
                context: format!("waiting for envelope, got {other:?}"),
            });
        }
    };
    debug!(
        fixture = envelope.fixture.as_str(),
        test = envelope.test.as_str(),
        "envelope received"
    );

    let resolver_link = Arc::clone(&link);
    let context = WorkerContext {
        resolver: ModuleResolver::new(Box::new(move |name| {
            match resolver_link.request(&WorkerRequest::ResolveModule {
                name: name.to_string(),
            }) {
                Ok(OriginReply::Resolved { path }) => path,
                Ok(_) | Err(_) => None,
            }
        })),
        config_path: envelope.config_file.clone(),
        config: envelope
            .config_file
            .as_deref()
            .and_then(read_config_overlay),
    };
    // First install wins; a worker only ever runs one envelope.
    let _ = CONTEXT.set(context);

    runner::install_worker_store(Arc::new(ProxyStore {
        link: Arc::clone(&link),
    }));

    let failure = executor::execute(registry, &envelope, true);

    let reply = link.request(&WorkerRequest::Completed { failure })?;
    match reply {
        OriginReply::Ack => Ok(()),
        other => Err(ProtocolError::Unexpected {
            context: format!("waiting for completion ack, got {other:?}"),
        }),
    }
}

fn read_config_overlay(path: &Path) -> Option<toml::Table> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            error!(path = %path.display(), %error, "configuration overlay unreadable");
            return None;
        }
    };
    match raw.parse::<toml::Table>() {
        Ok(table) => Some(table),
        Err(error) => {
            error!(path = %path.display(), %error, "configuration overlay unparseable");
            None
        }
    }
}

/// Reports a failure for a descriptor the worker was *not* spawned for.
/// Used by the runner's inline fallback path; kept here so the executor
/// call sites stay together.
pub(crate) fn execute_inline(
    registry: &FixtureRegistry,
    envelope: &crate::envelope::TestEnvelope,
) -> Option<TestFailure> {
    executor::execute(registry, envelope, false)
}
