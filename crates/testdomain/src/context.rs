//! Isolated execution contexts and the factory that produces them.
//!
//! The default isolation primitive is a real OS process: the current test
//! binary is re-executed, filtered to exactly the host test that is
//! running, with the orchestration's socket path and token in the
//! environment. The re-executed binary reaches the same runner call, sees
//! the variables, and becomes the worker.
//!
//! [`ContextFactory`] is the customization seam: the default
//! [`PerTestProcessFactory`] covers the common case and supports seeding
//! extra environment variables into the context; anything beyond that is a
//! custom factory, typically built on [`WorkerSpec::command`] and
//! [`IsolatedContext::spawn`].

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::envelope::TestEnvelope;
use crate::error::OrchestrationError;
use crate::worker::{ENV_FIXTURE, ENV_SOCKET, ENV_TEST, ENV_TOKEN};

/// Everything needed to spawn one worker process.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Libtest path of the host test to re-execute.
    pub host_path: String,
    /// Path of the orchestration's control socket.
    pub socket_path: PathBuf,
    /// One-time handshake token for this orchestration.
    pub token: String,
    /// Fixture the worker is spawned for.
    pub fixture: String,
    /// Test the worker is spawned for.
    pub test: String,
    /// Working directory for the worker: the test binary's directory.
    pub module_dir: PathBuf,
}

impl WorkerSpec {
    /// Builds the worker command: the current binary re-executed with the
    /// libtest filter for the host test, the orchestration environment
    /// set, and stdio wired for forwarding.
    ///
    /// `--nocapture` keeps the worker's libtest harness from swallowing
    /// the output this side forwards.
    ///
    /// # Errors
    ///
    /// Fails only if the current executable path cannot be determined.
    pub fn command(&self) -> Result<Command, OrchestrationError> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command
            .arg(&self.host_path)
            .arg("--exact")
            .arg("--nocapture")
            .current_dir(&self.module_dir)
            .env(ENV_SOCKET, &self.socket_path)
            .env(ENV_TOKEN, &self.token)
            .env(ENV_FIXTURE, &self.fixture)
            .env(ENV_TEST, &self.test)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

/// A running isolated context and its output forwarders.
pub struct IsolatedContext {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl IsolatedContext {
    /// Spawns the command and starts forwarding its stdout and stderr to
    /// this process's own streams.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError::SpawnFailed`] if the process cannot be
    /// started.
    pub fn spawn(mut command: Command) -> Result<Self, OrchestrationError> {
        let mut child = command
            .spawn()
            .map_err(|error| OrchestrationError::SpawnFailed(error.to_string()))?;
        debug!(pid = child.id(), "isolated context spawned");

        let mut pumps = Vec::with_capacity(2);
        if let Some(mut stdout) = child.stdout.take() {
            pumps.push(std::thread::spawn(move || {
                let _ = io::copy(&mut stdout, &mut io::stdout());
            }));
        }
        if let Some(mut stderr) = child.stderr.take() {
            pumps.push(std::thread::spawn(move || {
                let _ = io::copy(&mut stderr, &mut io::stderr());
            }));
        }

        Ok(Self { child, pumps })
    }

    /// OS process id of the context.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness probe: the exit status if the context has
    /// terminated.
    ///
    /// # Errors
    ///
    /// Propagates the underlying wait failure.
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Tears the context down: terminates the process if still running,
    /// reaps it, and drains the output forwarders.
    pub fn shutdown(mut self) {
        if let Err(error) = self.child.kill() {
            // Already exited is the normal case here.
            if error.kind() != io::ErrorKind::InvalidInput {
                debug!(%error, "terminating isolated context");
            }
        }
        if let Err(error) = self.child.wait() {
            warn!(%error, "reaping isolated context");
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
    }
}

/// Produces and retires isolated contexts for the orchestrator.
///
/// One context is created per orchestrated test and retired when the
/// exchange ends, whatever the outcome.
pub trait ContextFactory: Send + Sync {
    /// Creates the context that will execute the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError::SpawnFailed`] (or an I/O error) when
    /// the context cannot be brought up.
    fn context_for(
        &self,
        envelope: &TestEnvelope,
        spec: &WorkerSpec,
    ) -> Result<IsolatedContext, OrchestrationError>;

    /// Retires a context once its orchestration is over.
    fn mark_finished(&self, context: IsolatedContext) {
        context.shutdown();
    }
}

/// The default factory: one fresh worker process per orchestrated test.
#[derive(Default)]
pub struct PerTestProcessFactory {
    env: Vec<(OsString, OsString)>,
    configure: Option<Box<dyn Fn(&mut Command) + Send + Sync>>,
}

impl PerTestProcessFactory {
    /// Creates a factory with no extra environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an extra environment variable into every context this factory
    /// produces.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Installs a hook that adjusts the worker command before it is
    /// spawned (resource limits, sandboxing wrappers, and the like). The
    /// hook runs after the environment seeding.
    #[must_use]
    pub fn with_configure<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut Command) + Send + Sync + 'static,
    {
        self.configure = Some(Box::new(configure));
        self
    }
}

impl ContextFactory for PerTestProcessFactory {
    fn context_for(
        &self,
        _envelope: &TestEnvelope,
        spec: &WorkerSpec,
    ) -> Result<IsolatedContext, OrchestrationError> {
        let mut command = spec.command()?;
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(configure) = &self.configure {
            configure(&mut command);
        }
        IsolatedContext::spawn(command)
    }
}
