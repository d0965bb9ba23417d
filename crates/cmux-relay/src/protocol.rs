//! Wire protocol between the browser terminal and the relay.
//!
//! Frames are JSON text messages tagged by `op`:
//!
//! ```text
//! {"op":"stdin","data":"ls\n"}
//! {"op":"resize","row_size":40,"col_size":120}
//! {"op":"stdout","data":"total 0\r\n"}
//! ```
//!
//! Decoding is tolerant: anything that is not a well-formed frame is treated
//! as raw keyboard input, so naive clients that write plain text still work.

use serde::{Deserialize, Serialize};

use crate::resize::TerminalSize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Message {
    Stdin {
        #[serde(default)]
        data: String,
    },
    Resize {
        #[serde(rename = "row_size", default)]
        rows: u16,
        #[serde(rename = "col_size", default)]
        cols: u16,
    },
    Stdout {
        #[serde(default)]
        data: String,
    },
    /// Any `op` this relay does not understand. Logged and ignored.
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn op(&self) -> &'static str {
        match self {
            Message::Stdin { .. } => "stdin",
            Message::Resize { .. } => "resize",
            Message::Stdout { .. } => "stdout",
            Message::Unknown => "unknown",
        }
    }

    /// Terminal size carried by a `resize` frame.
    pub fn size(&self) -> Option<TerminalSize> {
        match self {
            Message::Resize { rows, cols } => Some(TerminalSize {
                width: *cols,
                height: *rows,
            }),
            _ => None,
        }
    }
}

/// Decode one text frame. Never fails: malformed frames become `Stdin`
/// carrying the raw text.
pub fn decode(raw: &str) -> Message {
    match serde_json::from_str::<Message>(raw) {
        Ok(message) => message,
        Err(_) => Message::Stdin {
            data: raw.to_string(),
        },
    }
}

/// Encode terminal output as a `stdout` frame.
pub fn encode(data: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Message::Stdout {
        data: data.to_string(),
    })
}

/// Find the last valid UTF-8 boundary in a byte slice.
/// Returns the number of bytes that form complete UTF-8 characters.
/// Any trailing incomplete sequence is not included.
pub fn utf8_boundary(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }

    let err = match std::str::from_utf8(bytes) {
        Ok(_) => return bytes.len(),
        Err(err) => err,
    };

    // Invalid bytes in the middle are not ours to hold back; only a truncated
    // sequence at the very end is carried over to the next chunk.
    match err.error_len() {
        None => err.valid_up_to(),
        Some(_) => bytes.len(),
    }
}
