//! Line echo protocol.
//!
//! Wire format is newline-terminated text:
//!
//! ```text
//! Client:  a\n          Server:  a\n
//! Client:  b\n          Server:  b\n
//! Client:  quit\n       Server:  <closes connection>
//! ```
//!
//! The server echoes every line byte-for-byte (terminator included) until it
//! receives the `quit` sentinel. The client sends one line at a time and
//! checks the echo before sending the next one; when it runs out of lines it
//! half-closes its side and waits for the server to finish.
//!
//! Everything here is synchronous. `connection` drives these state machines
//! over a real transport.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use crate::error::EchoError;

/// Line that asks the server to close the connection.
pub const QUIT: &[u8] = b"quit";

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 4 * 1024;

/// What the connection driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the peer.
    Send(Bytes),
    /// Shut down the write direction, keep reading until the peer closes.
    HalfClose,
    /// Close the connection cleanly.
    Close,
}

/// Reassembles newline-terminated lines from arbitrary read chunks.
///
/// Partial reads are buffered until the terminator shows up; a read holding
/// several lines yields them one by one.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Buffer used as the read target.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Split off the next complete line, terminator included.
    pub fn next_line(&mut self) -> Option<Bytes> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        Some(self.buf.split_to(end + 1).freeze())
    }

    /// Take whatever is left once the peer stopped sending.
    ///
    /// An unterminated trailing fragment still counts as a line.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a trailing `\n` (and `\r` before it) for the sentinel check.
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Server rule: echo the line unchanged, unless it is the sentinel.
pub fn server_reply(line: Bytes) -> Action {
    if trim_line(&line) == QUIT {
        Action::Close
    } else {
        Action::Send(line)
    }
}

/// Client half of the protocol.
///
/// Holds the lines still to send and the line awaiting its echo.
#[derive(Debug)]
pub struct ClientSession {
    pending: VecDeque<Bytes>,
    last_sent: Option<Bytes>,
}

impl ClientSession {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pending = lines
            .into_iter()
            .map(|line| {
                let mut encoded = Vec::with_capacity(line.as_ref().len() + 1);
                encoded.extend_from_slice(line.as_ref().as_bytes());
                encoded.push(b'\n');
                Bytes::from(encoded)
            })
            .collect();

        Self {
            pending,
            last_sent: None,
        }
    }

    /// First action once the connection is up.
    pub fn start(&mut self) -> Action {
        self.send_next()
    }

    /// Validate an echoed line and decide what to send next.
    ///
    /// The echo must match the sent line byte for byte, terminator included,
    /// so an unterminated fragment left at end-of-stream never matches.
    pub fn on_line(&mut self, line: &[u8]) -> Result<Action, EchoError> {
        if self.last_sent.as_deref() != Some(line) {
            return Err(EchoError::ProtocolViolation {
                expected: self.last_sent.as_deref().unwrap_or_default().to_vec(),
                received: line.to_vec(),
            });
        }
        Ok(self.send_next())
    }

    fn send_next(&mut self) -> Action {
        match self.pending.pop_front() {
            Some(line) => {
                self.last_sent = Some(line.clone());
                Action::Send(line)
            }
            None => {
                self.last_sent = None;
                Action::HalfClose
            }
        }
    }
}
