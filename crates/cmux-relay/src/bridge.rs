//! Bridge controller: one per terminal connection.
//!
//! Drives a session through
//! `Setup -> Probing -> Attempting(i) -> Active -> Closing -> Closed`:
//! starts the keepalive, resolves candidate shells, then hands the session to
//! the executor one candidate at a time until one runs. Whatever happens, the
//! session is closed exactly once on the way out.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use tracing::{debug, info, warn};

use crate::attempt::AttemptIo;
use crate::config::BridgeConfig;
use crate::diagnostics::{self, FailureContext};
use crate::error::{ErrorKind, ExecError};
use crate::executor::{command_argv, ExecTarget, RemoteExecutor};
use crate::resize::TerminalSize;
use crate::session::{TerminalIo, TerminalSession};
use crate::shell::{Resolution, ShellResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Setup,
    Probing,
    Attempting(usize),
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// A command ran interactively and ended.
    Completed,
    /// Nothing could be started, or the active command failed. The user was
    /// shown a diagnostic.
    Failed(ErrorKind),
    /// The client went away while a command was running.
    Disconnected,
    /// Keepalive failure or an external cancellation.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BridgeReport {
    pub session_id: String,
    pub attempted: Vec<String>,
    pub active_command: Option<String>,
    pub outcome: BridgeOutcome,
    pub transitions: Vec<BridgeState>,
    /// Client frames dropped as protocol errors.
    pub protocol_errors: u64,
}

/// Parameters of one terminal request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: ExecTarget,
    pub preferred_shell: Option<String>,
    pub initial_size: Option<TerminalSize>,
}

impl SessionRequest {
    pub fn new(target: ExecTarget) -> Self {
        Self {
            target,
            preferred_shell: None,
            initial_size: None,
        }
    }
}

/// Per-run bookkeeping, kept outside the attempt future so it survives
/// cancellation.
struct Run {
    id: String,
    state: BridgeState,
    transitions: Vec<BridgeState>,
    attempted: Vec<String>,
    active_command: Option<String>,
    resolution: Resolution,
    failures: Vec<ErrorKind>,
    last_error: Option<ExecError>,
}

impl Run {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: BridgeState::Setup,
            transitions: vec![BridgeState::Setup],
            attempted: Vec::new(),
            active_command: None,
            resolution: Resolution::default(),
            failures: Vec::new(),
            last_error: None,
        }
    }

    fn enter(&mut self, state: BridgeState) {
        debug!("[bridge:{}] {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.transitions.push(state);
    }
}

pub struct BridgeController {
    executor: Arc<dyn RemoteExecutor>,
    resolver: ShellResolver,
    config: BridgeConfig,
}

impl BridgeController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: BridgeConfig) -> Self {
        Self {
            resolver: ShellResolver::new(config.resolver.clone()),
            executor,
            config,
        }
    }

    /// Name of the executor backend sessions are relayed to.
    pub fn backend(&self) -> &'static str {
        self.executor.name()
    }

    /// Wrap an upgraded socket in a session and run it to completion.
    pub async fn serve_socket(&self, socket: WebSocket, request: SessionRequest) -> BridgeReport {
        let session = TerminalSession::from_socket(socket, self.config.keepalive);
        self.run(session, request).await
    }

    pub async fn run(&self, session: Arc<TerminalSession>, request: SessionRequest) -> BridgeReport {
        let mut run = Run::new(session.id());
        info!(
            "[bridge:{}] terminal requested for {} via {}",
            run.id,
            request.target,
            self.executor.name()
        );

        if let Some(size) = request.initial_size {
            session.resize_queue().send(size);
        }

        let keepalive = tokio::spawn({
            let session = session.clone();
            async move { session.keepalive().await }
        });

        let cancel = session.cancellation();
        let outcome = tokio::select! {
            outcome = self.attempt_all(&session, &request, &mut run) => outcome,
            _ = cancel.cancelled() => BridgeOutcome::Cancelled,
        };
        if outcome == BridgeOutcome::Cancelled {
            info!("[bridge:{}] cancelled during {:?}", run.id, run.state);
        }

        run.enter(BridgeState::Closing);
        if let BridgeOutcome::Failed(kind) = outcome {
            self.report_failure(&session, &request, &run, kind).await;
        }
        if let Err(e) = session.close().await {
            warn!("[bridge:{}] close failed: {}", run.id, e);
        }
        keepalive.abort();
        run.enter(BridgeState::Closed);

        info!(
            "[bridge:{}] finished: {:?} after {} attempt(s)",
            run.id,
            outcome,
            run.attempted.len()
        );
        BridgeReport {
            session_id: run.id,
            attempted: run.attempted,
            active_command: run.active_command,
            outcome,
            transitions: run.transitions,
            protocol_errors: session.protocol_errors(),
        }
    }

    async fn attempt_all(
        &self,
        session: &Arc<TerminalSession>,
        request: &SessionRequest,
        run: &mut Run,
    ) -> BridgeOutcome {
        run.enter(BridgeState::Probing);
        let prober = self.executor.prober(&request.target);
        run.resolution = self
            .resolver
            .resolve(request.preferred_shell.as_deref(), prober.as_deref())
            .await;

        let candidates = run.resolution.candidates.clone();
        for (index, command) in candidates.iter().enumerate() {
            run.enter(BridgeState::Attempting(index));
            run.attempted.push(command.clone());
            info!("[bridge:{}] attempting {:?}", run.id, command);

            let attempt = Arc::new(AttemptIo::new(session.clone()));
            let io: Arc<dyn TerminalIo> = attempt.clone();
            let argv = command_argv(command);
            let stream = self.executor.stream(&request.target, &argv, io);
            tokio::pin!(stream);
            let grace = tokio::time::sleep(self.config.start_grace);
            tokio::pin!(grace);

            let result = loop {
                tokio::select! {
                    result = &mut stream => break result,
                    _ = attempt.started(), if !attempt.is_committed() => {
                        self.activate(&attempt, run, command).await;
                    }
                    _ = &mut grace, if !attempt.is_committed() => {
                        self.activate(&attempt, run, command).await;
                    }
                }
            };

            let err = match result {
                Ok(()) => {
                    if !attempt.is_committed() {
                        self.activate(&attempt, run, command).await;
                    }
                    return BridgeOutcome::Completed;
                }
                Err(err) => err,
            };
            let kind = err.kind();

            // A started command owns the session: its exit status is just how
            // the shell finished.
            if attempt.is_committed() {
                return match (&err, kind) {
                    (ExecError::Exited { code }, _) => {
                        debug!("[bridge:{}] {} exited with {}", run.id, command, code);
                        BridgeOutcome::Completed
                    }
                    (_, ErrorKind::TransportClosed) => BridgeOutcome::Disconnected,
                    _ => {
                        warn!("[bridge:{}] {} failed: {}", run.id, command, err);
                        run.last_error = Some(err);
                        BridgeOutcome::Failed(kind)
                    }
                };
            }

            if attempt.client_gone() {
                info!("[bridge:{}] client went away while starting {}", run.id, command);
                return BridgeOutcome::Disconnected;
            }

            match kind {
                kind if kind.is_candidate_failure() => {
                    let replayed = attempt.rewind();
                    debug!(
                        "[bridge:{}] {} unusable ({}): {} ({} input bytes kept)",
                        run.id, command, kind, err, replayed
                    );
                    run.failures.push(kind);
                    run.last_error = Some(err);
                }
                ErrorKind::TransportClosed => {
                    info!("[bridge:{}] client went away: {}", run.id, err);
                    return BridgeOutcome::Disconnected;
                }
                _ => {
                    warn!("[bridge:{}] giving up on {}: {}", run.id, request.target, err);
                    run.last_error = Some(err);
                    return BridgeOutcome::Failed(kind);
                }
            }
        }

        BridgeOutcome::Failed(exhausted_kind(&run.failures))
    }

    async fn activate(&self, attempt: &AttemptIo, run: &mut Run, command: &str) {
        if let Err(e) = attempt.commit().await {
            debug!("[bridge:{}] could not flush start output: {}", run.id, e);
        }
        run.enter(BridgeState::Active);
        run.active_command = Some(command.to_string());
    }

    async fn report_failure(
        &self,
        session: &TerminalSession,
        request: &SessionRequest,
        run: &Run,
        kind: ErrorKind,
    ) {
        let detail = run.last_error.as_ref().map(ToString::to_string);
        let ctx = FailureContext {
            target: &request.target,
            attempted: &run.attempted,
            profile: &run.resolution.profile,
            probed: run.resolution.probed,
            detail: detail.as_deref(),
        };
        if let Some(message) = diagnostics::render(kind, &ctx) {
            if let Err(e) = session.write(message.as_bytes()).await {
                debug!("[bridge:{}] could not deliver diagnostic: {}", run.id, e);
            }
        }
    }
}

/// Every candidate failed. Only an all-missing list is reported as command
/// not found; otherwise the most actionable failure seen wins.
fn exhausted_kind(failures: &[ErrorKind]) -> ErrorKind {
    if failures.iter().all(|k| *k == ErrorKind::CommandNotFound) {
        ErrorKind::CommandNotFound
    } else if failures.contains(&ErrorKind::PermissionDenied) {
        ErrorKind::PermissionDenied
    } else if failures.contains(&ErrorKind::Timeout) {
        ErrorKind::Timeout
    } else {
        ErrorKind::Failed
    }
}
