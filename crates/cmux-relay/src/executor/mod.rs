//! Remote execution backends.
//!
//! The bridge only sees [`RemoteExecutor`]: something that can run a command
//! against a named target with its standard streams wired to a terminal
//! session, and optionally run short probes for shell discovery.

mod docker;
mod local;

pub use docker::{DockerExecutor, DockerProbe};
pub use local::{LocalProbe, LocalPtyExecutor};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::session::TerminalIo;

/// Environment handed to interactive commands.
pub const TERM_ENV: [(&str, &str); 2] = [("TERM", "xterm-256color"), ("COLORTERM", "truecolor")];

/// Read size used by the stdin pumps.
pub(crate) const INPUT_BUFFER_SIZE: usize = 4096;

/// The remote side a session attaches to: a container name or id for the
/// Docker backend, ignored by the local backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecTarget {
    pub name: String,
}

impl ExecTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What a short-lived probe command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Exited(i64),
    TimedOut,
    Failed(String),
}

/// Runs a probe command to completion and reports how it exited.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run_probe(&self, argv: &[String], timeout: Duration) -> ProbeOutcome;
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Short backend name used in logs and `/health`.
    fn name(&self) -> &'static str;

    /// Run `command` on `target` and relay its streams through `io` until the
    /// command exits. A non-zero exit is reported as [`ExecError::Exited`].
    async fn stream(
        &self,
        target: &ExecTarget,
        command: &[String],
        io: Arc<dyn TerminalIo>,
    ) -> Result<(), ExecError>;

    /// Probe capability for `target`, if the backend has one.
    fn prober(&self, target: &ExecTarget) -> Option<Arc<dyn ProbeRunner>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Docker,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => f.write_str("docker"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

/// Build the executor selected on the command line.
pub async fn connect(kind: BackendKind) -> anyhow::Result<Arc<dyn RemoteExecutor>> {
    match kind {
        BackendKind::Docker => Ok(Arc::new(DockerExecutor::connect().await?)),
        BackendKind::Local => Ok(Arc::new(LocalPtyExecutor::new())),
    }
}

/// Split a candidate command string into argv.
pub fn command_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
