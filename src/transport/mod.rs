//! Transport layer abstraction for the routing-mesh messaging service.
//!
//! The mesh routes each message by its integer message type; replies travel
//! back to the originating endpoint over a reserved return path. This module
//! defines the buffer/summary/envelope data model and the `Transport` trait
//! consumed by the ingestion loop and the send primitives.
//!
//! Implementations:
//! - `channel`: in-process loopback mesh for standalone mode and tests
//! - `mock`: scripted mock for unit tests

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

pub mod channel;
pub mod mock;

pub use channel::{ChannelNetwork, ChannelTransport};
pub use mock::MockTransport;

/// Fixed length of the transaction-id field carried in every message.
pub const MAX_XID: usize = 32;
/// Size of the managed-entity-id field. One byte is reserved, so the longest
/// usable meid is `MAX_MEID - 1` bytes.
pub const MAX_MEID: usize = 32;

/// Errors raised by transport construction and buffer manipulation.
///
/// Protocol-level outcomes (retry, timeout, terminal send failures) are not
/// errors; they are reported through [`TransportStatus`] so that callers can
/// apply their own escalation policy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport initialization failed")]
    InitFailed,

    #[error("buffer allocation returned an unusable buffer")]
    BadBufferAllocation,

    #[error("meid length {len} exceeds the {max}-byte field")]
    MeidSizeOutOfRange { len: usize, max: usize },
}

/// Outcome of a transport send/receive/return-to-sender call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    /// Operation completed.
    Ok,
    /// Transient failure; the caller should retry.
    Retry,
    /// Nothing arrived within the timeout. Not an error on receive.
    Timeout,
    /// Terminal failure with a transport-specific code.
    Err(i32),
}

impl TransportStatus {
    /// Static state-to-name table used in message summaries.
    pub fn name(self) -> &'static str {
        match self {
            TransportStatus::Ok => "OK",
            TransportStatus::Retry => "RETRY",
            TransportStatus::Timeout => "TIMEOUT",
            TransportStatus::Err(_) => "ERROR",
        }
    }

    /// Numeric state carried in summaries; 0 means OK.
    pub fn code(self) -> i32 {
        match self {
            TransportStatus::Ok => 0,
            TransportStatus::Retry => 10,
            TransportStatus::Timeout => 12,
            TransportStatus::Err(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransportStatus::Ok
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An owned message buffer.
///
/// Mirrors the mesh transport's buffer layout: a payload with a separate
/// allocated capacity, a message type, a subscription id (-1 when unset), a
/// fixed-length transaction id, a bounded managed-entity id, and the source
/// endpoint the message arrived from.
#[derive(Clone, Debug)]
pub struct MsgBuf {
    payload: Vec<u8>,
    capacity: usize,
    mtype: i32,
    sub_id: i32,
    xaction: [u8; MAX_XID],
    meid: Vec<u8>,
    src: String,
    /// State of the last transport operation on this buffer.
    pub state: TransportStatus,
    /// Transport-level errno from the last operation.
    pub errno: i32,
}

impl MsgBuf {
    /// Allocate a buffer with room for `size` payload bytes.
    pub fn new(size: usize) -> Self {
        Self {
            payload: Vec::with_capacity(size),
            capacity: size,
            mtype: 0,
            sub_id: -1,
            xaction: [0u8; MAX_XID],
            meid: Vec::new(),
            src: String::new(),
            state: TransportStatus::Ok,
            errno: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Used payload length, not the allocated capacity.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes available without reallocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the payload, transparently growing the buffer when the existing
    /// capacity is too small. Message type and subscription id survive the
    /// reallocation.
    pub fn set_payload(&mut self, bytes: &[u8]) {
        if bytes.len() > self.capacity {
            self.capacity = bytes.len();
        }
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
    }

    pub fn mtype(&self) -> i32 {
        self.mtype
    }

    pub fn set_mtype(&mut self, mtype: i32) {
        self.mtype = mtype;
    }

    pub fn sub_id(&self) -> i32 {
        self.sub_id
    }

    pub fn set_sub_id(&mut self, sub_id: i32) {
        self.sub_id = sub_id;
    }

    pub fn xaction(&self) -> &[u8; MAX_XID] {
        &self.xaction
    }

    /// Copy `tid` into the fixed-length transaction-id field, truncating or
    /// zero-padding to exactly [`MAX_XID`] bytes.
    pub fn set_xaction(&mut self, tid: &[u8]) {
        self.xaction = [0u8; MAX_XID];
        let n = tid.len().min(MAX_XID);
        self.xaction[..n].copy_from_slice(&tid[..n]);
    }

    /// Generate a fresh transaction id. A v4 UUID in simple form is exactly
    /// [`MAX_XID`] hex characters, filling the field with no padding.
    pub fn generate_xaction(&mut self) {
        let tid = Uuid::new_v4().simple().to_string();
        self.set_xaction(tid.as_bytes());
    }

    pub fn meid(&self) -> &[u8] {
        &self.meid
    }

    /// Set the managed-entity id, returning the number of bytes copied.
    pub fn set_meid(&mut self, meid: &[u8]) -> Result<usize, TransportError> {
        if meid.len() >= MAX_MEID {
            return Err(TransportError::MeidSizeOutOfRange {
                len: meid.len(),
                max: MAX_MEID,
            });
        }
        self.meid = meid.to_vec();
        Ok(meid.len())
    }

    /// Source endpoint (`host:port`) the message arrived from.
    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn set_src(&mut self, src: &str) {
        self.src = src.to_string();
    }

    /// Status string derived from the buffer state.
    pub fn status(&self) -> &'static str {
        self.state.name()
    }
}

/// Immutable snapshot of a received buffer, taken at receive time.
#[derive(Clone, Debug)]
pub struct MessageSummary {
    /// Payload bytes; present only when the receive state was OK.
    pub payload: Option<Bytes>,
    pub payload_length: usize,
    pub mtype: i32,
    pub sub_id: i32,
    pub xaction: Bytes,
    /// Numeric state; 0 is OK.
    pub state: i32,
    /// Status name derived from the state.
    pub status: &'static str,
    pub meid: Bytes,
    /// Source endpoint the message arrived from.
    pub source: String,
    /// Transport-level errno.
    pub errno: i32,
}

impl MessageSummary {
    pub fn of(buf: &MsgBuf) -> Self {
        let payload = if buf.state.is_ok() {
            Some(Bytes::copy_from_slice(buf.payload()))
        } else {
            None
        };
        Self {
            payload,
            payload_length: buf.len(),
            mtype: buf.mtype(),
            sub_id: buf.sub_id(),
            xaction: Bytes::copy_from_slice(buf.xaction()),
            state: buf.state.code(),
            status: buf.state.name(),
            meid: Bytes::copy_from_slice(buf.meid()),
            source: buf.src().to_string(),
            errno: buf.errno,
        }
    }
}

/// A received message's raw buffer.
///
/// Exclusively owned by whichever component currently holds it; the handler a
/// message is dispatched to is the ultimate owner and releases it, either
/// explicitly via [`Envelope::release`] or by dropping. Return-to-sender
/// borrows the buffer without consuming the envelope, since callers may reuse
/// it for multiple successive replies.
#[derive(Debug)]
pub struct Envelope {
    buf: MsgBuf,
}

impl Envelope {
    pub fn new(buf: MsgBuf) -> Self {
        Self { buf }
    }

    pub fn buf(&self) -> &MsgBuf {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut MsgBuf {
        &mut self.buf
    }

    /// Explicitly release the underlying buffer.
    pub fn release(self) {}

    pub fn into_buf(self) -> MsgBuf {
        self.buf
    }
}

/// Handle to the routing-mesh messaging service.
///
/// One context is bound to one listen endpoint. Construction failures are
/// fatal ([`TransportError::InitFailed`]); protocol-level outcomes are
/// reported as [`TransportStatus`] values on the buffer and as return values.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the mesh has a routing table installed and can send.
    fn ready(&self) -> bool;

    /// Allocate a message buffer with the given payload capacity.
    fn alloc(&self, size: usize) -> Result<MsgBuf, TransportError>;

    /// Send the buffer according to the mesh routing table. The buffer's
    /// `state` is updated to the returned status.
    async fn send(&self, buf: &mut MsgBuf) -> TransportStatus;

    /// Wait up to `timeout_ms` for a message. A timeout of zero polls without
    /// blocking. The returned buffer carries the receive state; `Timeout`
    /// means nothing arrived and is not an error.
    async fn receive(&self, timeout_ms: u64) -> MsgBuf;

    /// Send the buffer back to the endpoint it was received from.
    async fn return_to_sender(&self, buf: &mut MsgBuf) -> TransportStatus;

    /// Close the listen endpoint. Must not be called while a receive might
    /// still be in flight; the ingestion loop enforces this ordering.
    async fn close(&self);
}
