//! Server messages.
//!
//! All struct fields here mirror the actual message sent to the client.
//! Messages are encoded into the connection's write buffer with
//! [`write`][super::write], which backfills the length field.
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::{
    compiler::{DumpBlockDesc, DumpTypeInfo},
    ext::{BufMutExt, UsizeExt},
};

/// A type which can be encoded into a server message.
pub trait ServerMessage {
    /// message type
    const MSGTYPE: u8;

    /// write the main body of the message
    fn encode(&self, buf: &mut BytesMut);
}

/// Offered protocol version is out of range; this is the version the server
/// picked instead. Negotiation does not fail the connection.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    pub version: ProtocolVersion,
}

impl ServerMessage for NegotiateProtocolVersion {
    const MSGTYPE: u8 = b'v';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version.major);
        buf.put_u16(self.version.minor);
        // Number of protocol extensions; none are defined.
        buf.put_u16(0);
    }
}

/// Authentication request / result.
#[derive(Debug)]
pub enum Authentication<'a> {
    /// Specifies that the authentication was successful.
    Ok,
    /// The body is a list of SASL authentication mechanisms, in the
    /// server's order of preference.
    SaslMethods(&'a [&'a str]),
    /// Opaque SASL challenge.
    SaslContinue(&'a [u8]),
    /// Opaque SASL final verifier.
    SaslFinal(&'a [u8]),
}

impl ServerMessage for Authentication<'_> {
    const MSGTYPE: u8 = b'R';

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Ok => buf.put_i32(0),
            Self::SaslMethods(methods) => {
                buf.put_i32(10);
                buf.put_i32(methods.len().to_i32());
                for method in *methods {
                    buf.put_len_str(method);
                }
            }
            Self::SaslContinue(data) => {
                buf.put_i32(11);
                buf.put_len_bytes(data);
            }
            Self::SaslFinal(data) => {
                buf.put_i32(12);
                buf.put_len_bytes(data);
            }
        }
    }
}

/// Session key data. The payload is reserved; clients must not parse it.
#[derive(Debug)]
pub struct BackendKeyData;

impl BackendKeyData {
    pub const RESERVED_LEN: usize = 32;
}

impl ServerMessage for BackendKeyData {
    const MSGTYPE: u8 = b'K';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_bytes(0, Self::RESERVED_LEN);
    }
}

/// Describes the shape of the session state.
#[derive(Debug)]
pub struct StateDataDescription<'a> {
    pub typedesc_id: Uuid,
    pub typedesc: &'a [u8],
}

impl ServerMessage for StateDataDescription<'_> {
    const MSGTYPE: u8 = b's';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_uuid(self.typedesc_id);
        buf.put_len_bytes(self.typedesc);
    }
}

/// A run-time server status report.
#[derive(Debug)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

impl ServerMessage for ParameterStatus<'_> {
    const MSGTYPE: u8 = b'S';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_len_str(self.name);
        buf.put_len_bytes(self.value);
    }
}

/// Reply to Parse; also re-sent when the compiled type ids disagree with
/// the ones the client expected.
#[derive(Debug)]
pub struct CommandDataDescription<'a> {
    pub capabilities: u64,
    pub result_cardinality: u8,
    pub in_type_id: Uuid,
    pub in_type_data: &'a [u8],
    pub out_type_id: Uuid,
    pub out_type_data: &'a [u8],
}

impl ServerMessage for CommandDataDescription<'_> {
    const MSGTYPE: u8 = b'T';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotations
        buf.put_i64(self.capabilities as i64);
        buf.put_u8(self.result_cardinality);
        buf.put_uuid(self.in_type_id);
        buf.put_len_bytes(self.in_type_data);
        buf.put_uuid(self.out_type_id);
        buf.put_len_bytes(self.out_type_data);
    }
}

/// A batch of encoded output data elements.
#[derive(Debug)]
pub struct Data<'a> {
    pub chunks: &'a [bytes::Bytes],
}

impl ServerMessage for Data<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.chunks.len().to_u16());
        for chunk in self.chunks {
            buf.put_len_bytes(chunk);
        }
    }
}

/// A command completed normally.
#[derive(Debug)]
pub struct CommandComplete<'a> {
    pub capabilities: u64,
    pub status: &'a [u8],
    pub state_tid: Uuid,
    pub state_data: &'a [u8],
}

impl ServerMessage for CommandComplete<'_> {
    const MSGTYPE: u8 = b'C';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotations
        buf.put_i64(self.capabilities as i64);
        buf.put_len_bytes(self.status);
        buf.put_uuid(self.state_tid);
        buf.put_len_bytes(self.state_data);
    }
}

pub const TX_STATUS_IDLE: u8 = b'I';
pub const TX_STATUS_IN_TX: u8 = b'T';
pub const TX_STATUS_IN_TX_ERROR: u8 = b'E';

/// Sent whenever the server is ready for a new command cycle.
///
/// The status derives from the view, not the backend: a compile-time error
/// can desync the two.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: u8,
}

impl ServerMessage for ReadyForQuery {
    const MSGTYPE: u8 = b'Z';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotations
        buf.put_u8(self.status);
    }
}

/// An error frame.
#[derive(Debug)]
pub struct ErrorResponse<'a> {
    pub severity: u8,
    pub code: u32,
    pub message: &'a str,
    pub fields: &'a [(u16, String)],
}

impl ServerMessage for ErrorResponse<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.severity);
        buf.put_i32(self.code as i32);
        buf.put_len_str(self.message);
        buf.put_u16(self.fields.len().to_u16());
        for (key, value) in self.fields {
            buf.put_u16(*key);
            buf.put_len_str(value);
        }
    }
}

pub const LOG_SEVERITY_NOTICE: u8 = 60;
pub const LOG_SEVERITY_WARNING: u8 = 80;

/// A server log message the client should display.
#[derive(Debug)]
pub struct LogMessage<'a> {
    pub severity: u8,
    pub code: u32,
    pub text: &'a str,
}

impl ServerMessage for LogMessage<'_> {
    const MSGTYPE: u8 = b'L';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.severity);
        buf.put_i32(self.code as i32);
        buf.put_len_str(self.text);
        buf.put_u16(0); // annotations
    }
}

/// The dump preamble: schema DDL and the block table of contents.
#[derive(Debug)]
pub struct DumpHeader<'a> {
    pub server_version: &'a str,
    pub catalog_version: i64,
    pub server_time: i64,
    pub protocol_version: ProtocolVersion,
    pub schema_ddl: &'a str,
    pub types: &'a [DumpTypeInfo],
    pub blocks: &'a [DumpBlockDesc],
}

impl ServerMessage for DumpHeader<'_> {
    const MSGTYPE: u8 = b'@';

    fn encode(&self, buf: &mut BytesMut) {
        use super::{
            DUMP_BLOCK_TYPE_INFO, DUMP_HEADER_BLOCK_TYPE, DUMP_HEADER_SERVER_CATALOG_VERSION,
            DUMP_HEADER_SERVER_TIME, DUMP_HEADER_SERVER_VER,
        };

        buf.put_u16(4);
        buf.put_u16(DUMP_HEADER_BLOCK_TYPE);
        buf.put_len_bytes(DUMP_BLOCK_TYPE_INFO);
        buf.put_u16(DUMP_HEADER_SERVER_VER);
        buf.put_len_str(self.server_version);
        // The catalog version is a length-prefixed raw i64, not a decimal
        // string; dump files in the wild depend on this exact layout.
        buf.put_u16(DUMP_HEADER_SERVER_CATALOG_VERSION);
        buf.put_i32(8);
        buf.put_i64(self.catalog_version);
        buf.put_u16(DUMP_HEADER_SERVER_TIME);
        buf.put_len_str(&self.server_time.to_string());

        buf.put_u16(self.protocol_version.major);
        buf.put_u16(self.protocol_version.minor);
        buf.put_len_str(self.schema_ddl);

        buf.put_i32(self.types.len().to_i32());
        for ty in self.types {
            buf.put_len_str(&ty.type_name);
            buf.put_len_str(&ty.type_desc);
            buf.put_uuid(ty.type_id);
        }

        buf.put_i32(self.blocks.len().to_i32());
        for block in self.blocks {
            buf.put_uuid(block.schema_object_id);
            buf.put_len_bytes(&block.type_desc);
            buf.put_u16(block.schema_deps.len().to_u16());
            for dep in &block.schema_deps {
                buf.put_uuid(*dep);
            }
        }
    }
}

/// One streamed dump data block.
#[derive(Debug)]
pub struct DumpBlock<'a> {
    pub block_id: Uuid,
    pub block_num: u64,
    pub data: &'a [u8],
}

impl ServerMessage for DumpBlock<'_> {
    const MSGTYPE: u8 = b'=';

    fn encode(&self, buf: &mut BytesMut) {
        use super::{
            DUMP_BLOCK_TYPE_DATA, DUMP_HEADER_BLOCK_DATA, DUMP_HEADER_BLOCK_ID,
            DUMP_HEADER_BLOCK_NUM, DUMP_HEADER_BLOCK_TYPE,
        };

        buf.put_u16(4);
        buf.put_u16(DUMP_HEADER_BLOCK_TYPE);
        buf.put_len_bytes(DUMP_BLOCK_TYPE_DATA);
        buf.put_u16(DUMP_HEADER_BLOCK_ID);
        buf.put_i32(16);
        buf.put_uuid(self.block_id);
        buf.put_u16(DUMP_HEADER_BLOCK_NUM);
        buf.put_len_str(&self.block_num.to_string());
        buf.put_u16(DUMP_HEADER_BLOCK_DATA);
        buf.put_len_bytes(self.data);
    }
}

/// Restore is ready to ingest data blocks.
#[derive(Debug)]
pub struct RestoreReady {
    pub jobs: i16,
}

impl ServerMessage for RestoreReady {
    const MSGTYPE: u8 = b'+';

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0); // annotations
        buf.put_i16(self.jobs);
    }
}
