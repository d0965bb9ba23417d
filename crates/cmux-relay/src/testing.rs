//! In-memory stand-ins for unit tests: a WebSocket pair and a scripted
//! probe runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;

use crate::config::KeepaliveConfig;
use crate::executor::{ProbeOutcome, ProbeRunner};
use crate::session::TerminalSession;

/// Browser side of an in-memory session.
pub struct ClientEnd {
    tx: mpsc::UnboundedSender<Result<WsMessage, axum::Error>>,
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

impl ClientEnd {
    pub fn send(&self, message: WsMessage) {
        let _ = self.tx.unbounded_send(Ok(message));
    }

    pub fn send_text(&self, text: &str) {
        self.send(WsMessage::Text(text.to_string()));
    }

    /// Simulate the browser going away without a close frame.
    pub fn hang_up(&self) {
        self.tx.close_channel();
    }

    pub async fn recv(&mut self) -> Option<WsMessage> {
        tokio::time::timeout(Duration::from_secs(2), self.rx.next())
            .await
            .ok()
            .flatten()
    }

    /// Collect everything the server sent until it closed the socket.
    pub async fn drain(&mut self) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(200), self.rx.next()).await
        {
            frames.push(frame);
        }
        frames
    }
}

pub fn session_pair(keepalive: KeepaliveConfig) -> (Arc<TerminalSession>, ClientEnd) {
    let (client_tx, server_rx) = mpsc::unbounded::<Result<WsMessage, axum::Error>>();
    let (server_tx, client_rx) = mpsc::unbounded::<WsMessage>();
    let sink = server_tx.sink_map_err(|e| axum::Error::new(e));
    let session = TerminalSession::new(sink, server_rx, keepalive);
    (
        session,
        ClientEnd {
            tx: client_tx,
            rx: client_rx,
        },
    )
}

#[derive(Debug, Clone)]
enum Script {
    Exit(i64),
    Stall,
}

/// Probe runner answering from a table keyed by the joined argv. Unscripted
/// commands exit 127 unless configured otherwise.
pub struct ScriptedProbe {
    scripts: HashMap<String, Script>,
    fallback: ProbeOutcome,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            fallback: ProbeOutcome::Exited(127),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn exits(mut self, command: &str, code: i64) -> Self {
        self.scripts.insert(command.to_string(), Script::Exit(code));
        self
    }

    pub fn stalls(mut self, command: &str) -> Self {
        self.scripts.insert(command.to_string(), Script::Stall);
        self
    }

    pub fn default_exit(mut self, code: i64) -> Self {
        self.fallback = ProbeOutcome::Exited(code);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fallback = ProbeOutcome::Failed("exec failed".to_string());
        self
    }

    /// Every probe run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProbeRunner for ScriptedProbe {
    async fn run_probe(&self, argv: &[String], _timeout: Duration) -> ProbeOutcome {
        let command = argv.join(" ");
        self.calls.lock().push(command.clone());
        match self.scripts.get(&command) {
            Some(Script::Exit(code)) => ProbeOutcome::Exited(*code),
            Some(Script::Stall) => {
                std::future::pending::<()>().await;
                ProbeOutcome::TimedOut
            }
            None => self.fallback.clone(),
        }
    }
}
