//! Control protocol between the origin process and the isolated worker.
//!
//! Each orchestration owns one Unix domain socket. The worker connects,
//! performs a token handshake, receives its execution envelope, and then
//! drives a strictly sequential request/reply exchange until it reports
//! completion:
//!
//! ```text
//! worker                         origin
//!   | -- Hello { token } --------> |
//!   | <------- Envelope { .. } --- |
//!   | -- ResolveModule { name } -> |
//!   | <------- Resolved { path } - |
//!   | -- StoreSet { key, value }-> |
//!   | <------- Ack --------------- |
//!   | -- Completed { failure } --> |
//!   | <------- Ack --------------- |
//! ```
//!
//! # Wire Format
//!
//! Messages are length-prefixed JSON frames:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! The frame length is validated before allocation.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::TestEnvelope;
use crate::error::TestFailure;

/// Maximum frame size in bytes (16 MiB).
///
/// Frames are capped to prevent a corrupted length prefix from triggering an
/// unbounded allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Requests sent by the isolated worker to the origin process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Handshake: the first message on every connection.
    Hello {
        /// Token proving this worker was spawned for this orchestration.
        token: String,
        /// OS process id of the worker.
        pid: u32,
    },

    /// Ask the origin to locate a loadable module by name.
    ResolveModule {
        /// Module name to locate.
        name: String,
    },

    /// Read a data-store entry.
    StoreGet {
        /// Key to read.
        key: String,
    },

    /// Write a plain value into the data store.
    StoreSet {
        /// Key to write.
        key: String,
        /// JSON value to store.
        value: serde_json::Value,
    },

    /// Invoke a method on a live-reference store entry in the origin.
    RemoteCall {
        /// Key of the remote entry.
        key: String,
        /// Method name to invoke.
        method: String,
        /// JSON arguments for the call.
        args: serde_json::Value,
    },

    /// Final message: the captured failure, or `None` on success.
    Completed {
        /// The first captured failure, if any.
        failure: Option<TestFailure>,
    },
}

/// A data-store entry as it appears on the wire.
///
/// Plain values cross by copy; live references cross as an opaque marker and
/// are accessed through [`WorkerRequest::RemoteCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEntry {
    /// A plain JSON value, copied across the boundary.
    Value {
        /// The stored value.
        value: serde_json::Value,
    },
    /// A live reference that stays in the origin; calls are forwarded.
    Remote,
}

/// Replies sent by the origin process to the isolated worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OriginReply {
    /// Handshake accepted; here is everything needed to run the test.
    Envelope {
        /// The execution envelope for this orchestration.
        envelope: TestEnvelope,
    },

    /// Result of a module resolution request.
    Resolved {
        /// On-disk location of the module, or `None` if truly unknown.
        path: Option<PathBuf>,
    },

    /// Result of a store read.
    Entry {
        /// The entry, or `None` if the key is absent.
        entry: Option<WireEntry>,
    },

    /// Generic acknowledgement for writes and completion.
    Ack,

    /// Result of a remote call: the returned value or an error message.
    RemoteResult {
        /// `Ok(value)` from the remote object, or `Err(message)`.
        result: Result<serde_json::Value, String>,
    },

    /// The request was refused (bad token, unsupported operation).
    Denied {
        /// Why the request was refused.
        reason: String,
    },
}

/// Protocol errors on the control connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`]; detected before allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The peer closed the connection mid-exchange.
    #[error("control connection closed by peer")]
    Disconnected,

    /// The peer sent a message that does not fit the current exchange.
    #[error("unexpected message: {context}")]
    Unexpected {
        /// What was being waited for when the message arrived.
        context: String,
    },

    /// The origin refused a request.
    #[error("request denied: {reason}")]
    Denied {
        /// Refusal reason reported by the origin.
        reason: String,
    },

    /// I/O failure on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Frames a payload for transport: 4-byte big-endian length prefix + bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // frames are capped well below 4 GiB
pub fn frame_message(message: &[u8]) -> Vec<u8> {
    let len = message.len() as u32;
    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Parses a frame length prefix, if a complete prefix is present.
#[must_use]
pub fn parse_frame_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    Some(len as usize)
}

/// A framed, blocking message connection over a Unix stream.
///
/// Used on both sides of the boundary; the exchange is strictly sequential
/// so no read/write interleaving is required.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    /// Wraps an accepted or connected stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Sends one framed message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the socket write fails.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.stream.write_all(&frame_message(&payload))?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receives one framed message, blocking until it arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Disconnected`] on a clean close before a
    /// complete frame, and [`ProtocolError::FrameTooLarge`] before
    /// allocating an oversized payload.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let mut prefix = [0u8; 4];
        read_exact_or_disconnect(&mut self.stream, &mut prefix)?;

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        read_exact_or_disconnect(&mut self.stream, &mut payload)?;

        Ok(serde_json::from_slice(&payload)?)
    }
}

fn read_exact_or_disconnect(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
    stream.read_exact(buf).map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Disconnected
        } else {
            ProtocolError::Io(error)
        }
    })
}
