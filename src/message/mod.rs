//! Veld Client and Server Protocol
//!
//! # Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a
//! message identifies the message type, and the next four bytes specify the
//! length of the rest of the message (this length count includes itself,
//! but not the message-type byte). The remaining contents of the message
//! are determined by the message type.
//!
//! ```text
//! | u8 |        i32        | body
//! |----|-------------------|-----
//! | 50 | 00 | 00 | 00 | 0E |  ..
//!
//! Message Type -> length -> body
//! ```
//!
//! All multi-byte integers are big-endian. Byte strings are `i32` length
//! prefixed; strings are length prefixed validated utf8; uuids are raw 16
//! bytes; counts are `u16`.

pub mod client;
pub mod server;

pub use server::ServerMessage;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{
    common::ByteStr,
    error::{Error, Result},
    ext::UsizeExt,
};

/// A protocol version as negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The newest protocol version this server speaks.
pub const CURRENT_PROTOCOL: ProtocolVersion = ProtocolVersion::new(3, 0);

/// The oldest protocol version this server speaks.
pub const MIN_PROTOCOL: ProtocolVersion = ProtocolVersion::new(0, 13);

/// The oldest dump format this server can restore.
pub const DUMP_VER_MIN: ProtocolVersion = ProtocolVersion::new(0, 7);

/// Generic header slot carrying the 8-byte big-endian capability mask.
pub const HEADER_ALLOW_CAPABILITIES: u16 = 0xFF04;

/// Dump request header: `\x01` means include secrets in the dump.
pub const HEADER_DUMP_SECRETS: u16 = 0xFF10;

// Dump header and data block attribute keys.
pub const DUMP_HEADER_BLOCK_TYPE: u16 = 101;
pub const DUMP_HEADER_SERVER_TIME: u16 = 102;
pub const DUMP_HEADER_SERVER_VER: u16 = 103;
pub const DUMP_HEADER_SERVER_CATALOG_VERSION: u16 = 104;
pub const DUMP_HEADER_BLOCK_ID: u16 = 110;
pub const DUMP_HEADER_BLOCK_NUM: u16 = 111;
pub const DUMP_HEADER_BLOCK_DATA: u16 = 112;

pub const DUMP_BLOCK_TYPE_INFO: &[u8] = b"I";
pub const DUMP_BLOCK_TYPE_DATA: &[u8] = b"D";

const HEADER_LEN: usize = 5;

/// A fully received message, detached from the read buffer.
///
/// All readers are checked: reading past the body or leaving trailing bytes
/// behind is a [`BinaryProtocolError`][Error::binary_protocol], never a
/// panic, since the body comes from an untrusted peer.
#[derive(Debug)]
pub struct Frame {
    mtype: u8,
    body: Bytes,
}

impl Frame {
    pub fn new(mtype: u8, body: Bytes) -> Self {
        Self { mtype, body }
    }

    pub fn mtype(&self) -> u8 {
        self.mtype
    }

    pub fn remaining(&self) -> usize {
        self.body.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.body.len() < n {
            return Err(Error::binary_protocol("message underflow"));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.body.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.body.get_u16())
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.body.get_i16())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.body.get_i32())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.body.get_i64())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.body.get_u64())
    }

    pub fn get_uuid(&mut self) -> Result<Uuid> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.body.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Read an `i32` length prefixed byte string.
    pub fn get_len_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(Error::binary_protocol("negative byte string length"));
        }
        let len = len as usize;
        self.need(len)?;
        Ok(self.body.split_to(len))
    }

    /// Read an `i32` length prefixed utf8 string.
    pub fn get_len_str(&mut self) -> Result<ByteStr> {
        let bytes = self.get_len_bytes()?;
        ByteStr::from_utf8(bytes).map_err(|_| Error::binary_protocol("invalid utf8 in message"))
    }

    /// Take the rest of the body.
    pub fn get_rest(&mut self) -> Bytes {
        self.body.split_to(self.body.len())
    }

    /// Assert the whole body has been consumed.
    pub fn finish(&mut self) -> Result<()> {
        if !self.body.is_empty() {
            return Err(Error::binary_protocol(format!(
                "message contains {} unread bytes",
                self.body.len(),
            )));
        }
        Ok(())
    }
}

/// Incoming frame buffer.
///
/// Bytes read from the transport are appended with [`buf_mut`][1] and
/// complete messages are taken out with [`take_message`][2], which never
/// blocks: it returns `None` until the whole body has arrived.
///
/// [1]: MessageBuf::buf_mut
/// [2]: MessageBuf::take_message
#[derive(Debug, Default)]
pub struct MessageBuf {
    buf: BytesMut,
}

impl MessageBuf {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(1024) }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Feed raw bytes into the buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to take one complete message out of the buffer.
    pub fn take_message(&mut self) -> Result<Option<Frame>> {
        let Some(mut header) = self.buf.get(..HEADER_LEN) else {
            return Ok(None);
        };

        let mtype = header.get_u8();
        let len = header.get_i32();
        if len < 4 {
            return Err(Error::binary_protocol("message length field too small"));
        }
        let len = len as usize;

        if self.buf.len() - 1/*mtype*/ < len {
            self.buf.reserve(1 + len);
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len - 4).freeze();
        Ok(Some(Frame::new(mtype, body)))
    }
}

/// Write a server message to `buf`.
///
/// The length field is reserved up front and backfilled once the body is
/// encoded, so messages of unpredictable size need no size pre-pass.
pub fn write<M: ServerMessage>(msg: &M, buf: &mut BytesMut) {
    let offset = buf.len();
    buf.put_u8(M::MSGTYPE);
    // reserve 4 bytes for length
    buf.put_i32(0);

    msg.encode(buf);

    let len = (buf.len() - offset - 1).to_i32();
    let mut length_buf = &mut buf[offset + 1..offset + HEADER_LEN];
    length_buf.put_i32(len);
}

/// Read a `u16`-counted list of `(u16 key, len-pfx bytes)` headers.
pub fn read_headers(frame: &mut Frame) -> Result<Vec<(u16, Bytes)>> {
    let count = frame.get_u16()?;
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = frame.get_u16()?;
        let value = frame.get_len_bytes()?;
        headers.push((key, value));
    }
    Ok(headers)
}

/// Read and discard a `u16`-counted list of `(str, str)` annotations.
pub fn skip_annotations(frame: &mut Frame) -> Result<()> {
    let count = frame.get_u16()?;
    for _ in 0..count {
        frame.get_len_str()?;
        frame.get_len_str()?;
    }
    Ok(())
}
