//! Terminal session adapter.
//!
//! Wraps one browser WebSocket and exposes it to a remote executor as a
//! duplex byte channel: `read` yields keyboard input, `write` carries command
//! output, resize requests land in a side queue. The socket is shared by the
//! read path, the write path (output and pings) and the close path; reads and
//! writes take the shared side of a read-write lock while `close` takes the
//! exclusive side.

use std::borrow::Cow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KeepaliveConfig;
use crate::error::{ErrorKind, SessionError};
use crate::liveness::{LivenessMonitor, Pinger, StopReason};
use crate::protocol::{self, Message};
use crate::resize::{ResizeQueue, TerminalSize};

/// Byte handed to the remote side when the browser goes away (Ctrl-D).
pub const END_OF_TRANSMISSION: u8 = 0x04;

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = axum::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<WsMessage, axum::Error>> + Send>>;

/// Result of a single `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Keyboard input was copied into the buffer.
    Data(usize),
    /// A resize request was queued. Nothing was read; call again.
    Resized,
    /// The browser disconnected. The buffer holds the end-of-transmission
    /// byte so the remote shell sees Ctrl-D.
    Eof(usize),
}

/// The duplex channel a remote executor streams through.
#[async_trait]
pub trait TerminalIo: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, SessionError>;
    async fn write(&self, data: &[u8]) -> Result<usize, SessionError>;
    /// Latest pending terminal size, without waiting.
    fn next_size(&self) -> Option<TerminalSize>;
    /// Wait for the next terminal size. `None` once the session is closed.
    async fn size_changed(&self) -> Option<TerminalSize>;
    /// Called by an executor once the remote command is known to be running.
    fn command_started(&self) {}
}

struct Outbound {
    sink: FrameSink,
    // Trailing bytes of a UTF-8 sequence split across writes.
    carry: Vec<u8>,
}

struct Transport {
    outbound: Mutex<Outbound>,
    inbound: Mutex<FrameStream>,
}

pub struct TerminalSession {
    id: String,
    transport: RwLock<Transport>,
    resize: ResizeQueue,
    liveness: LivenessMonitor,
    cancel: CancellationToken,
    closed: AtomicBool,
    pending_input: parking_lot::Mutex<Vec<u8>>,
    input_bytes: AtomicU64,
    protocol_errors: AtomicU64,
}

impl TerminalSession {
    pub fn new<S, R>(sink: S, stream: R, keepalive: KeepaliveConfig) -> Arc<Self>
    where
        S: Sink<WsMessage, Error = axum::Error> + Send + 'static,
        R: Stream<Item = Result<WsMessage, axum::Error>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        Arc::new(Self {
            id,
            transport: RwLock::new(Transport {
                outbound: Mutex::new(Outbound {
                    sink: Box::pin(sink),
                    carry: Vec::new(),
                }),
                inbound: Mutex::new(Box::pin(stream)),
            }),
            resize: ResizeQueue::new(),
            liveness: LivenessMonitor::new(keepalive),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            pending_input: parking_lot::Mutex::new(Vec::new()),
            input_bytes: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        })
    }

    pub fn from_socket(socket: WebSocket, keepalive: KeepaliveConfig) -> Arc<Self> {
        let (sink, stream) = socket.split();
        Self::new(sink, stream, keepalive)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn resize_queue(&self) -> &ResizeQueue {
        &self.resize
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total keyboard input handed to the executor so far.
    pub fn input_bytes(&self) -> u64 {
        self.input_bytes.load(Ordering::Relaxed)
    }

    /// Client frames that broke the protocol and were dropped.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Put input back in front of anything not yet read, so the next `read`
    /// returns it again.
    pub fn unread(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut pending = self.pending_input.lock();
        pending.splice(0..0, data.iter().copied());
    }

    fn is_done(&self) -> bool {
        self.is_closed() || self.cancel.is_cancelled()
    }

    /// Run the keepalive loop for this session until it stops.
    pub async fn keepalive(&self) -> StopReason {
        let reason = self.liveness.run(self, &self.cancel).await;
        debug!("[term-ws:{}] keepalive stopped: {:?}", self.id, reason);
        reason
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, SessionError> {
        if self.is_done() {
            return Err(SessionError::Closed);
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }
        if let Some(n) = self.drain_pending(buf) {
            return Ok(ReadOutcome::Data(n));
        }

        let transport = self.transport.read().await;
        let mut inbound = transport.inbound.lock().await;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Closed),
                frame = inbound.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("[term-ws:{}] receive error: {}", self.id, e);
                    return Ok(self.end_of_input(buf));
                }
                None => return Ok(self.end_of_input(buf)),
            };

            match frame {
                WsMessage::Text(text) => match protocol::decode(&text) {
                    Message::Stdin { data } => {
                        if data.is_empty() {
                            continue;
                        }
                        return Ok(self.deliver(buf, data.into_bytes()));
                    }
                    message @ Message::Resize { .. } => {
                        if let Some(size) = message.size() {
                            if self.resize.send(size) {
                                debug!("[term-ws:{}] resize {}", self.id, size);
                            }
                        }
                        return Ok(ReadOutcome::Resized);
                    }
                    Message::Stdout { .. } => {
                        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "[term-ws:{}] {}: client sent a stdout frame, ignoring",
                            self.id,
                            ErrorKind::ProtocolError
                        );
                    }
                    Message::Unknown => {
                        warn!("[term-ws:{}] unknown op, ignoring: {}", self.id, text);
                    }
                },
                WsMessage::Binary(data) => {
                    if !data.is_empty() {
                        return Ok(self.deliver(buf, data));
                    }
                }
                WsMessage::Pong(_) => self.liveness.record_pong(),
                WsMessage::Ping(_) => {}
                WsMessage::Close(reason) => {
                    info!("[term-ws:{}] client sent close frame: {:?}", self.id, reason);
                    return Ok(self.end_of_input(buf));
                }
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.is_done() {
            return Err(SessionError::Closed);
        }

        let transport = self.transport.read().await;
        if self.is_done() {
            return Err(SessionError::Closed);
        }
        let mut outbound = transport.outbound.lock().await;

        outbound.carry.extend_from_slice(data);
        let valid_up_to = protocol::utf8_boundary(&outbound.carry);
        if valid_up_to == 0 {
            return Ok(data.len());
        }
        let chunk: Vec<u8> = outbound.carry.drain(..valid_up_to).collect();
        let frame = protocol::encode(&String::from_utf8_lossy(&chunk))?;

        tokio::select! {
            sent = outbound.sink.send(WsMessage::Text(frame)) => sent?,
            _ = self.cancel.cancelled() => return Err(SessionError::Closed),
        }
        Ok(data.len())
    }

    pub fn next_size(&self) -> Option<TerminalSize> {
        self.resize.next()
    }

    /// Tear the session down. Only the first call has any effect.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // Release any read or write parked on the socket before taking the
        // exclusive lock.
        self.cancel.cancel();
        let transport = self.transport.write().await;
        self.resize.close();

        let mut outbound = transport.outbound.lock().await;
        let close = WsMessage::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        }));
        match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, outbound.sink.send(close)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[term-ws:{}] failed to send close frame: {}", self.id, e),
            Err(_) => warn!("[term-ws:{}] timed out sending close frame", self.id),
        }
        if let Ok(Err(e)) = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, outbound.sink.close()).await
        {
            debug!("[term-ws:{}] socket close error: {}", self.id, e);
        }

        info!(
            "[term-ws:{}] session closed (input: {} bytes)",
            self.id,
            self.input_bytes()
        );
        Ok(())
    }

    fn drain_pending(&self, buf: &mut [u8]) -> Option<usize> {
        let mut pending = self.pending_input.lock();
        if pending.is_empty() {
            return None;
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        Some(n)
    }

    fn deliver(&self, buf: &mut [u8], data: Vec<u8>) -> ReadOutcome {
        self.input_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.pending_input.lock().extend_from_slice(&data[n..]);
        }
        ReadOutcome::Data(n)
    }

    fn end_of_input(&self, buf: &mut [u8]) -> ReadOutcome {
        buf[0] = END_OF_TRANSMISSION;
        ReadOutcome::Eof(1)
    }
}

#[async_trait]
impl TerminalIo for TerminalSession {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, SessionError> {
        TerminalSession::read(self, buf).await
    }

    async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        TerminalSession::write(self, data).await
    }

    fn next_size(&self) -> Option<TerminalSize> {
        TerminalSession::next_size(self)
    }

    async fn size_changed(&self) -> Option<TerminalSize> {
        self.resize.recv().await
    }
}

#[async_trait]
impl Pinger for TerminalSession {
    async fn ping(&self) -> Result<(), SessionError> {
        if self.is_done() {
            return Err(SessionError::Closed);
        }
        let transport = self.transport.read().await;
        let mut outbound = transport.outbound.lock().await;
        tokio::select! {
            sent = outbound.sink.send(WsMessage::Ping(Vec::new())) => sent?,
            _ = self.cancel.cancelled() => return Err(SessionError::Closed),
        }
        Ok(())
    }
}
