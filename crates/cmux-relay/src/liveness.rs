//! Ping/pong keepalive for terminal WebSockets.
//!
//! The monitor pings the peer every `ping_period` and tracks a read deadline
//! that every pong pushes `pong_wait` into the future. Missing the deadline or
//! failing to send a ping cancels the owning session. This is the only way a
//! half-open browser connection is noticed.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KeepaliveConfig;
use crate::error::SessionError;

/// Anything that can put a ping frame on the wire.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PingFailed,
    PongTimeout,
    /// The session was cancelled by someone else.
    Cancelled,
}

pub struct LivenessMonitor {
    config: KeepaliveConfig,
    deadline: Mutex<Instant>,
    state: Mutex<MonitorState>,
}

impl LivenessMonitor {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + config.pong_wait),
            config,
            state: Mutex::new(MonitorState::Idle),
        }
    }

    pub fn config(&self) -> KeepaliveConfig {
        self.config
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Any proof of life from the peer extends the read deadline.
    pub fn record_pong(&self) {
        *self.deadline.lock() = Instant::now() + self.config.pong_wait;
    }

    /// Run until the peer goes silent, a ping fails, or `cancel` fires.
    /// A monitor runs at most once; later calls return immediately.
    pub async fn run<P>(&self, pinger: &P, cancel: &CancellationToken) -> StopReason
    where
        P: Pinger + ?Sized,
    {
        {
            let mut state = self.state.lock();
            if *state != MonitorState::Idle {
                return StopReason::Cancelled;
            }
            *state = MonitorState::Running;
        }
        self.record_pong();

        let mut ticker = tokio::time::interval(self.config.ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        let reason = loop {
            let deadline = self.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.config.pong_wait, pinger.ping()).await {
                        Ok(Ok(())) => debug!("[liveness] ping sent"),
                        Ok(Err(e)) => {
                            warn!("[liveness] ping failed: {}", e);
                            break StopReason::PingFailed;
                        }
                        Err(_) => {
                            warn!("[liveness] ping write timed out");
                            break StopReason::PingFailed;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // A pong may have moved the deadline while we slept.
                    if Instant::now() >= self.deadline() {
                        warn!(
                            "[liveness] no pong within {:?}, peer considered dead",
                            self.config.pong_wait
                        );
                        break StopReason::PongTimeout;
                    }
                }
            }
        };

        *self.state.lock() = MonitorState::Stopped;
        if reason != StopReason::Cancelled {
            cancel.cancel();
        }
        reason
    }
}
