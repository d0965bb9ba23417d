use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub const DEFAULT_ROWS: u16 = 25;
pub const DEFAULT_COLS: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            width: cols,
            height: rows,
        }
    }

    pub fn cols(&self) -> u16 {
        self.width
    }

    pub fn rows(&self) -> u16 {
        self.height
    }

    /// Both dimensions zero means the client sent no usable size.
    pub fn is_empty(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Replace any zero dimension with the default terminal size.
    pub fn normalized(self) -> Self {
        Self {
            width: if self.width == 0 {
                DEFAULT_COLS
            } else {
                self.width
            },
            height: if self.height == 0 {
                DEFAULT_ROWS
            } else {
                self.height
            },
        }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<TerminalSize>,
    closed: bool,
}

/// Single-slot mailbox for terminal size changes.
///
/// Only the most recent size matters, so a send overwrites anything the
/// consumer has not taken yet. There is one consumer per queue: the executor
/// driving the remote side.
#[derive(Default)]
pub struct ResizeQueue {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl ResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a new size. Returns false when the size was discarded (empty
    /// size or closed queue).
    pub fn send(&self, size: TerminalSize) -> bool {
        if size.is_empty() {
            return false;
        }
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return false;
            }
            slot.pending = Some(size.normalized());
        }
        self.notify.notify_one();
        true
    }

    /// Put back a size that was taken but never applied. A newer pending
    /// size wins.
    pub fn restore(&self, size: TerminalSize) {
        {
            let mut slot = self.slot.lock();
            if slot.closed || slot.pending.is_some() {
                return;
            }
            slot.pending = Some(size);
        }
        self.notify.notify_one();
    }

    /// Take the pending size without waiting.
    pub fn next(&self) -> Option<TerminalSize> {
        self.slot.lock().pending.take()
    }

    /// Wait for the next size. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<TerminalSize> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slot = self.slot.lock();
                if let Some(size) = slot.pending.take() {
                    return Some(size);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue and drop any pending size. Safe to call repeatedly.
    pub fn close(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.pending = None;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}
