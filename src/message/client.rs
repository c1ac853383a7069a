//! Client messages.
//!
//! Everything the engine accepts from the peer, decoded from a [`Frame`].
//! Each message carries its `MSGTYPE` constant; the dispatcher owns the
//! exhaustive match over them.
use bytes::Bytes;
use uuid::Uuid;

use super::{Frame, ProtocolVersion, skip_annotations};
use crate::{
    common::ByteStr,
    error::{Error, Result},
    query::{OutputFormat, QueryRequest},
};

/// The very first message on a stream transport.
#[derive(Debug)]
pub struct ClientHandshake {
    pub version: ProtocolVersion,
    pub params: Vec<(ByteStr, ByteStr)>,
}

impl ClientHandshake {
    pub const MSGTYPE: u8 = b'V';

    pub fn decode(frame: &mut Frame) -> Result<Self> {
        let major = frame.get_u16()?;
        let minor = frame.get_u16()?;

        let nparams = frame.get_u16()?;
        let mut params = Vec::with_capacity(nparams as usize);
        for _ in 0..nparams {
            let key = frame.get_len_str()?;
            let value = frame.get_len_str()?;
            params.push((key, value));
        }

        // Number of protocol extensions; none are defined.
        let reserved = frame.get_u16()?;
        if reserved != 0 {
            return Err(Error::binary_protocol("unexpected protocol extensions"));
        }
        frame.finish()?;

        Ok(Self { version: ProtocolVersion::new(major, minor), params })
    }
}

/// SASL mechanism selection plus the client-first message.
#[derive(Debug)]
pub struct SaslInitialResponse {
    pub method: ByteStr,
    pub data: Bytes,
}

impl SaslInitialResponse {
    pub const MSGTYPE: u8 = b'p';

    pub fn decode(frame: &mut Frame) -> Result<Self> {
        let method = frame.get_len_str()?;
        let data = frame.get_len_bytes()?;
        frame.finish()?;
        if data.is_empty() {
            return Err(Error::binary_protocol("empty SASL client-first payload"));
        }
        Ok(Self { method, data })
    }
}

/// The SASL client-final message.
#[derive(Debug)]
pub struct SaslResponse {
    pub data: Bytes,
}

impl SaslResponse {
    pub const MSGTYPE: u8 = b'r';

    pub fn decode(frame: &mut Frame) -> Result<Self> {
        let data = frame.get_len_bytes()?;
        frame.finish()?;
        Ok(Self { data })
    }
}

pub const MSGTYPE_PARSE: u8 = b'P';
pub const MSGTYPE_EXECUTE: u8 = b'O';
pub const MSGTYPE_SYNC: u8 = b'S';
pub const MSGTYPE_FLUSH: u8 = b'H';
pub const MSGTYPE_TERMINATE: u8 = b'X';
pub const MSGTYPE_DUMP: u8 = b'>';
pub const MSGTYPE_RESTORE: u8 = b'<';
pub const MSGTYPE_RESTORE_BLOCK: u8 = b'=';
pub const MSGTYPE_RESTORE_EOF: u8 = b'.';

/// Legacy message types from protocol generations this server refuses.
pub const LEGACY_MSGTYPES: [u8; 3] = [b'D', b'E', b'Q'];

/// The shared body of Parse and Execute.
#[derive(Debug)]
pub struct ParseExecuteRequest {
    pub request: QueryRequest,
    pub compilation_flags: u64,
    pub state_tid: Uuid,
    pub state_data: Bytes,
}

/// `compilation_flags` bits.
pub mod compilation_flags {
    pub const INJECT_OUTPUT_TYPE_IDS: u64 = 1 << 0;
    pub const INJECT_OUTPUT_TYPE_NAMES: u64 = 1 << 1;
    pub const INJECT_OUTPUT_OBJECT_IDS: u64 = 1 << 2;
}

impl ParseExecuteRequest {
    pub fn decode(frame: &mut Frame, protocol_version: ProtocolVersion) -> Result<Self> {
        // Leading annotations are ignored.
        skip_annotations(frame)?;

        let allow_capabilities = frame.get_u64()?;
        let flags = frame.get_u64()?;
        let implicit_limit = frame.get_i64()?;
        if implicit_limit < 0 {
            return Err(Error::binary_protocol("implicit limit cannot be negative"));
        }

        let output_format = OutputFormat::from_u8(frame.get_u8()?)?;
        let expect_one = match frame.get_u8()? {
            b'o' => true,
            b'm' => false,
            other => {
                return Err(Error::binary_protocol(format!(
                    "unknown expected cardinality {other:#04x}",
                )));
            }
        };

        let source = frame.get_len_str()?;
        if source.trim().is_empty() {
            return Err(Error::binary_protocol("empty query"));
        }

        let state_tid = frame.get_uuid()?;
        let state_data = frame.get_len_bytes()?;

        use compilation_flags::*;
        let request = QueryRequest {
            source,
            protocol_version,
            output_format,
            expect_one,
            implicit_limit: implicit_limit as u64,
            inline_typeids: flags & INJECT_OUTPUT_TYPE_IDS != 0,
            inline_typenames: flags & INJECT_OUTPUT_TYPE_NAMES != 0,
            inline_objectids: flags & INJECT_OUTPUT_OBJECT_IDS != 0,
            allow_capabilities,
        };

        Ok(Self { request, compilation_flags: flags, state_tid, state_data })
    }
}

/// The Execute-only tail after [`ParseExecuteRequest`].
#[derive(Debug)]
pub struct ExecuteTail {
    pub in_type_id: Uuid,
    pub out_type_id: Uuid,
    pub bind_args: Bytes,
}

impl ExecuteTail {
    pub fn decode(frame: &mut Frame) -> Result<Self> {
        let in_type_id = frame.get_uuid()?;
        let out_type_id = frame.get_uuid()?;
        let bind_args = frame.get_len_bytes()?;
        frame.finish()?;
        Ok(Self { in_type_id, out_type_id, bind_args })
    }
}

/// One restore data block, as received from the client.
#[derive(Debug)]
pub struct RestoreBlock {
    pub block_id: Uuid,
    pub block_num: u64,
    pub data: Bytes,
}

impl RestoreBlock {
    pub const MSGTYPE: u8 = MSGTYPE_RESTORE_BLOCK;

    pub fn decode(frame: &mut Frame) -> Result<Self> {
        use crate::message::{
            DUMP_HEADER_BLOCK_DATA, DUMP_HEADER_BLOCK_ID, DUMP_HEADER_BLOCK_NUM,
            DUMP_HEADER_BLOCK_TYPE, read_headers,
        };

        let headers = read_headers(frame)?;
        frame.finish()?;

        let mut block_type = None;
        let mut block_id = None;
        let mut block_num = None;
        let mut data = None;
        for (key, value) in headers {
            match key {
                DUMP_HEADER_BLOCK_TYPE => block_type = Some(value),
                DUMP_HEADER_BLOCK_ID => {
                    block_id = Uuid::from_slice(&value).ok();
                }
                DUMP_HEADER_BLOCK_NUM => {
                    block_num = std::str::from_utf8(&value)
                        .ok()
                        .and_then(|num| num.parse::<u64>().ok());
                }
                DUMP_HEADER_BLOCK_DATA => data = Some(value),
                _ => {}
            }
        }

        let (Some(_), Some(block_id), Some(block_num), Some(data)) =
            (block_type, block_id, block_num, data)
        else {
            return Err(Error::protocol("incomplete data block"));
        };
        Ok(Self { block_id, block_num, data })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ext::BufMutExt, message::CURRENT_PROTOCOL};
    use bytes::{BufMut, BytesMut};

    fn handshake_frame(major: u16, minor: u16, params: &[(&str, &str)], reserved: u16) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u16(major);
        buf.put_u16(minor);
        buf.put_u16(params.len() as u16);
        for (k, v) in params {
            buf.put_len_str(k);
            buf.put_len_str(v);
        }
        buf.put_u16(reserved);
        Frame::new(ClientHandshake::MSGTYPE, buf.freeze())
    }

    #[test]
    fn handshake_decodes_params() {
        let mut frame =
            handshake_frame(1, 0, &[("user", "edgedb"), ("database", "main")], 0);
        let hs = ClientHandshake::decode(&mut frame).unwrap();
        assert_eq!(hs.version, ProtocolVersion::new(1, 0));
        assert_eq!(hs.params.len(), 2);
        assert_eq!(hs.params[0].0, *"user");
        assert_eq!(hs.params[1].1, *"main");
    }

    #[test]
    fn handshake_rejects_reserved_field() {
        let mut frame = handshake_frame(1, 0, &[], 1);
        let err = ClientHandshake::decode(&mut frame).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::BINARY_PROTOCOL);
    }

    fn parse_body(
        limit: i64,
        format: u8,
        cardinality: u8,
        query: &str,
    ) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u16(0); // annotations
        buf.put_u64(crate::query::capability::ALL);
        buf.put_u64(0); // compilation flags
        buf.put_i64(limit);
        buf.put_u8(format);
        buf.put_u8(cardinality);
        buf.put_len_str(query);
        buf.put_uuid(Uuid::nil());
        buf.put_len_bytes(b"");
        Frame::new(MSGTYPE_PARSE, buf.freeze())
    }

    #[test]
    fn parse_request_roundtrip() {
        let mut frame = parse_body(0, b'b', b'm', "select 1");
        let req = ParseExecuteRequest::decode(&mut frame, CURRENT_PROTOCOL).unwrap();
        frame.finish().unwrap();
        assert_eq!(req.request.source, *"select 1");
        assert_eq!(req.request.output_format, OutputFormat::Binary);
        assert!(!req.request.expect_one);
        assert_eq!(req.request.implicit_limit, 0);
    }

    #[test]
    fn negative_implicit_limit_is_rejected() {
        let mut frame = parse_body(-1, b'b', b'm', "select 1");
        let err = ParseExecuteRequest::decode(&mut frame, CURRENT_PROTOCOL).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::BINARY_PROTOCOL);
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        let mut frame = parse_body(0, b'x', b'm', "select 1");
        assert!(ParseExecuteRequest::decode(&mut frame, CURRENT_PROTOCOL).is_err());
    }

    #[test]
    fn empty_query_is_rejected() {
        let mut frame = parse_body(0, b'b', b'm', "  ");
        let err = ParseExecuteRequest::decode(&mut frame, CURRENT_PROTOCOL).unwrap_err();
        assert!(err.to_message().contains("empty query"));
    }

    #[test]
    fn restore_block_requires_all_four_headers() {
        use crate::message::{
            DUMP_HEADER_BLOCK_DATA, DUMP_HEADER_BLOCK_ID, DUMP_HEADER_BLOCK_NUM,
            DUMP_HEADER_BLOCK_TYPE,
        };

        let id = Uuid::from_u128(9);
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_u16(DUMP_HEADER_BLOCK_TYPE);
        buf.put_len_bytes(b"D");
        buf.put_u16(DUMP_HEADER_BLOCK_ID);
        buf.put_i32(16);
        buf.put_uuid(id);
        buf.put_u16(DUMP_HEADER_BLOCK_NUM);
        buf.put_len_bytes(b"2");
        buf.put_u16(DUMP_HEADER_BLOCK_DATA);
        buf.put_len_bytes(b"payload");
        let mut frame = Frame::new(RestoreBlock::MSGTYPE, buf.freeze());
        let block = RestoreBlock::decode(&mut frame).unwrap();
        assert_eq!(block.block_id, id);
        assert_eq!(block.block_num, 2);
        assert_eq!(block.data.as_ref(), b"payload");

        // Drop the data header: incomplete.
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_u16(DUMP_HEADER_BLOCK_TYPE);
        buf.put_len_bytes(b"D");
        buf.put_u16(DUMP_HEADER_BLOCK_ID);
        buf.put_i32(16);
        buf.put_uuid(id);
        let mut frame = Frame::new(RestoreBlock::MSGTYPE, buf.freeze());
        let err = RestoreBlock::decode(&mut frame).unwrap_err();
        assert!(err.to_message().contains("incomplete data block"));
    }

    #[test]
    fn empty_sasl_initial_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_len_str("SCRAM-SHA-256");
        buf.put_len_bytes(b"");
        let mut frame = Frame::new(SaslInitialResponse::MSGTYPE, buf.freeze());
        assert!(SaslInitialResponse::decode(&mut frame).is_err());
    }
}
