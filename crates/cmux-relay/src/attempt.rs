//! The session as seen by one candidate command.
//!
//! A candidate is provisional until it is confirmed started, either by the
//! executor or by surviving the start grace window. Until then its output is
//! held back and the input it consumed is recorded, so a candidate that turns
//! out to be missing leaves no trace in the terminal and hands the user's
//! keystrokes to the next candidate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::SessionError;
use crate::resize::TerminalSize;
use crate::session::{ReadOutcome, TerminalIo, TerminalSession};

pub(crate) struct AttemptIo {
    session: Arc<TerminalSession>,
    committed: AtomicBool,
    started: AtomicBool,
    started_signal: Notify,
    client_gone: AtomicBool,
    held_output: Mutex<Vec<u8>>,
    consumed: parking_lot::Mutex<Vec<u8>>,
    last_size: parking_lot::Mutex<Option<TerminalSize>>,
}

impl AttemptIo {
    pub(crate) fn new(session: Arc<TerminalSession>) -> Self {
        Self {
            session,
            committed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            started_signal: Notify::new(),
            client_gone: AtomicBool::new(false),
            held_output: Mutex::new(Vec::new()),
            consumed: parking_lot::Mutex::new(Vec::new()),
            last_size: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// The browser went away while this candidate was reading.
    pub(crate) fn client_gone(&self) -> bool {
        self.client_gone.load(Ordering::Acquire)
    }

    /// Resolves once the executor reported the command as running.
    pub(crate) async fn started(&self) {
        loop {
            let notified = self.started_signal.notified();
            if self.started.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Make the candidate the session's command: release held output and
    /// pass everything from now on straight through.
    pub(crate) async fn commit(&self) -> Result<(), SessionError> {
        let mut held = self.held_output.lock().await;
        if self.committed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.consumed.lock().clear();
        let output = std::mem::take(&mut *held);
        self.session.write(&output).await.map(|_| ())
    }

    /// Give back what a failed candidate took from the session. Held output
    /// is dropped with the attempt. Returns the number of input bytes
    /// replayed.
    pub(crate) fn rewind(&self) -> usize {
        let consumed = std::mem::take(&mut *self.consumed.lock());
        self.session.unread(&consumed);
        if let Some(size) = *self.last_size.lock() {
            self.session.resize_queue().restore(size);
        }
        consumed.len()
    }

    fn remember_size(&self, size: Option<TerminalSize>) -> Option<TerminalSize> {
        if size.is_some() {
            *self.last_size.lock() = size;
        }
        size
    }
}

#[async_trait]
impl TerminalIo for AttemptIo {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, SessionError> {
        let outcome = self.session.read(buf).await?;
        match outcome {
            ReadOutcome::Data(n) if !self.is_committed() => {
                self.consumed.lock().extend_from_slice(&buf[..n]);
            }
            ReadOutcome::Eof(_) => self.client_gone.store(true, Ordering::Release),
            _ => {}
        }
        Ok(outcome)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        let mut held = self.held_output.lock().await;
        if !self.is_committed() {
            held.extend_from_slice(data);
            return Ok(data.len());
        }
        self.session.write(data).await
    }

    fn next_size(&self) -> Option<TerminalSize> {
        self.remember_size(self.session.next_size())
    }

    async fn size_changed(&self) -> Option<TerminalSize> {
        let size = self.session.resize_queue().recv().await;
        self.remember_size(size)
    }

    fn command_started(&self) {
        self.started.store(true, Ordering::Release);
        self.started_signal.notify_one();
    }
}
