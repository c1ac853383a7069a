//! Compiled query data model.
//!
//! [`QueryRequest`] is the fingerprint of a parse/execute request and the
//! compiled-query cache key. [`CompiledQuery`] is what the compiler pool
//! returns: an ordered group of [`QueryUnit`]s plus extracted bind-arg
//! metadata.
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{
    common::ByteStr,
    error::{Error, Result},
    ext::UsizeExt,
    message::ProtocolVersion,
};

/// Capability flags gating classes of side effects.
pub mod capability {
    pub const MODIFICATIONS: u64 = 1 << 0;
    pub const SESSION_CONFIG: u64 = 1 << 1;
    pub const TRANSACTION: u64 = 1 << 2;
    pub const DDL: u64 = 1 << 3;
    pub const PERSISTENT_CONFIG: u64 = 1 << 4;

    pub const ALL: u64 = !0;
    pub const NONE: u64 = 0;
    pub const WRITE: u64 = MODIFICATIONS | DDL | PERSISTENT_CONFIG;

    /// Human titles for error messages, in bit order.
    pub fn title(bit: u64) -> &'static str {
        match bit {
            MODIFICATIONS => "data modification queries",
            SESSION_CONFIG => "session configuration queries",
            TRANSACTION => "transaction control commands",
            DDL => "DDL commands",
            PERSISTENT_CONFIG => "configuration commands",
            _ => "queries with unknown capabilities",
        }
    }

    /// The lowest capability bit required but not allowed, if any.
    pub fn first_disabled(required: u64, allowed: u64) -> Option<u64> {
        let extra = required & !allowed;
        if extra == 0 {
            return None;
        }
        Some(1 << extra.trailing_zeros())
    }
}

/// Result cardinality, as the single byte sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    Many = 0x6d,
    AtLeastOne = 0x4d,
}

impl Cardinality {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Requested output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

impl OutputFormat {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            b'b' => Ok(Self::Binary),
            b'j' => Ok(Self::Json),
            b'J' => Ok(Self::JsonElements),
            b'n' => Ok(Self::None),
            other => Err(Error::binary_protocol(format!(
                "unknown output format {other:#04x}",
            ))),
        }
    }
}

/// The fingerprint of a parse/execute request.
///
/// Equality and hash are defined over all fields; the hash doubles as the
/// key of the single-slot "last anonymous compiled" fast cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryRequest {
    pub source: ByteStr,
    pub protocol_version: ProtocolVersion,
    pub output_format: OutputFormat,
    pub expect_one: bool,
    /// 0 = unlimited.
    pub implicit_limit: u64,
    pub inline_typeids: bool,
    pub inline_typenames: bool,
    pub inline_objectids: bool,
    pub allow_capabilities: u64,
}

impl QueryRequest {
    /// Fingerprint for a protocol-internal utility statement.
    pub fn utility(source: impl Into<ByteStr>, protocol_version: ProtocolVersion) -> Self {
        Self {
            source: source.into(),
            protocol_version,
            output_format: OutputFormat::None,
            expect_one: false,
            implicit_limit: 0,
            inline_typeids: false,
            inline_typenames: false,
            inline_objectids: false,
            allow_capabilities: capability::ALL,
        }
    }

    pub fn cache_key(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Side-effect signal bits returned by view callbacks.
pub mod side_effect {
    pub const SCHEMA_CHANGES: u64 = 1 << 0;
    pub const GLOBAL_SCHEMA_CHANGES: u64 = 1 << 1;
    pub const DATABASE_CONFIG_CHANGES: u64 = 1 << 2;
    pub const INSTANCE_CONFIG_CHANGES: u64 = 1 << 3;
}

/// Scope of a configuration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigScope {
    Instance,
    Database,
    Session,
}

/// A single configuration operation, as produced by the compiler or read
/// back from the backend as `0x01`-prefixed JSON.
#[derive(Debug, Clone)]
pub struct ConfigOp {
    pub scope: ConfigScope,
    pub payload: serde_json::Value,
}

impl ConfigOp {
    /// Decode one readback row: `0x01` followed by a JSON operation.
    pub fn from_readback_row(row: &[u8]) -> Result<Self> {
        match row.split_first() {
            Some((0x01, json)) => Self::from_json_slice(json),
            _ => Err(Error::internal("backend returned non-config readback data")),
        }
    }

    fn from_json_slice(json: &[u8]) -> Result<Self> {
        let payload: serde_json::Value = serde_json::from_slice(json)
            .map_err(|e| Error::internal(format!("malformed config op: {e}")))?;
        let scope = payload
            .get("scope")
            .and_then(|s| {
                serde_json::from_value::<ConfigScope>(s.clone()).ok()
            })
            .unwrap_or(ConfigScope::Session);
        Ok(Self { scope, payload })
    }
}

/// The compiler's atomic execution step.
#[derive(Debug, Clone, Default)]
pub struct QueryUnit {
    /// The backend SQL statement(s).
    pub sql: Vec<ByteStr>,
    /// Command status tag, e.g. `SELECT`.
    pub status: Bytes,
    pub cardinality: Option<Cardinality>,
    pub capabilities: u64,
    pub cacheable: bool,
    /// Prepared-statement name; set when the unit may be executed as a
    /// persistent prepared statement.
    pub sql_hash: Option<Bytes>,

    // Transactional role flags.
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_declare: bool,
    pub tx_savepoint_rollback: bool,
    pub tx_abort_migration: bool,
    pub sp_name: Option<String>,

    pub ddl_stmt_id: Option<String>,
    pub needs_readback: bool,
    pub is_explain: bool,

    pub create_db: Option<String>,
    pub drop_db: Option<String>,
    pub create_db_template: Option<String>,

    pub system_config: bool,
    pub backend_config: bool,
    pub database_config: bool,
    /// Statically-compiled config ops, used when the unit produces none at
    /// runtime.
    pub config_ops: Vec<ConfigOp>,
}

impl QueryUnit {
    /// Whether this unit forms a pipeline batch boundary in a script.
    pub fn is_batch_boundary(&self) -> bool {
        self.ddl_stmt_id.is_some() || self.needs_readback
    }
}

/// An ordered, non-empty group of query units with its type descriptors.
#[derive(Debug, Clone)]
pub struct QueryUnitGroup {
    pub units: Vec<QueryUnit>,
    pub cardinality: Cardinality,
    pub capabilities: u64,
    pub in_type_id: Uuid,
    pub in_type_data: Bytes,
    pub out_type_id: Uuid,
    pub out_type_data: Bytes,
}

impl QueryUnitGroup {
    /// A group executes as a script when it has several units or any unit
    /// the server itself must read back.
    pub fn needs_script(&self) -> bool {
        self.units.len() > 1 || self.units.iter().any(|u| u.needs_readback)
    }

    pub fn cacheable(&self) -> bool {
        self.units.iter().all(|u| u.cacheable)
    }
}

/// Output of the compiler for one [`QueryRequest`].
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub group: std::sync::Arc<QueryUnitGroup>,
    /// Index of the first injected (non-client) bind argument.
    pub first_extra: Option<usize>,
    pub extra_counts: Vec<usize>,
    pub extra_blobs: Vec<Bytes>,
}

/// Reshape client bind-arg bytes into the backend's binary bind format.
///
/// The client sends `i32 nargs`, then per argument `i32 reserved, i32 len,
/// data` (`len == -1` is NULL). The backend wants `u16 nparams` followed by
/// `i32 len, data` per parameter, with any compiler-injected extra blobs
/// appended after `first_extra`.
pub fn recode_bind_args(compiled: &CompiledQuery, args: &Bytes) -> Result<Bytes> {
    let mut src = args.clone();
    if src.remaining() < 4 {
        return Err(Error::binary_protocol("bind arguments underflow"));
    }
    let nargs = src.get_i32();
    if nargs < 0 {
        return Err(Error::binary_protocol("negative bind argument count"));
    }
    let nargs = nargs as usize;

    let nextra: usize = compiled.extra_counts.iter().sum();
    let mut out = BytesMut::with_capacity(args.len() + 2);
    out.put_u16((nargs + nextra).to_u16());

    for _ in 0..nargs {
        if src.remaining() < 8 {
            return Err(Error::binary_protocol("bind arguments underflow"));
        }
        src.advance(4); // reserved
        let len = src.get_i32();
        out.put_i32(len);
        if len > 0 {
            let len = len as usize;
            if src.remaining() < len {
                return Err(Error::binary_protocol("bind arguments underflow"));
            }
            out.put(src.copy_to_bytes(len));
        }
    }
    if src.has_remaining() {
        return Err(Error::binary_protocol("trailing bytes in bind arguments"));
    }

    if compiled.first_extra.is_some() {
        for blob in &compiled.extra_blobs {
            out.put_slice(blob);
        }
    }

    Ok(out.freeze())
}
