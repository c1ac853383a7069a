//! The compiler pool seam.
//!
//! The compiler is an RPC collaborator: it takes source text plus schema
//! snapshots and returns compiled [`CompiledQuery`] groups and dump/restore
//! descriptors. The engine never inspects query text itself.
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::{
    error::{BackendError, Error, Result},
    message::ProtocolVersion,
    query::{CompiledQuery, QueryRequest, QueryUnit},
};

/// One named type in the dump preamble.
#[derive(Debug, Clone)]
pub struct DumpTypeInfo {
    pub type_name: String,
    pub type_desc: String,
    pub type_id: Uuid,
}

/// One dumpable data block.
#[derive(Debug, Clone)]
pub struct DumpBlockDesc {
    pub schema_object_id: Uuid,
    pub type_desc: Bytes,
    pub schema_deps: Vec<Uuid>,
}

/// The compiler's description of a database dump.
#[derive(Debug, Clone)]
pub struct DumpDescriptor {
    pub schema_ddl: String,
    /// Statements to run at dump time; any scalar result is appended to
    /// `schema_ddl`.
    pub dynamic_ddl: Vec<String>,
    pub types: Vec<DumpTypeInfo>,
    pub blocks: Vec<DumpBlockDesc>,
}

/// Inputs for [`Compiler::describe_dump`].
#[derive(Debug)]
pub struct DumpArgs {
    pub protocol_version: ProtocolVersion,
    pub user_schema_json: Bytes,
    pub global_schema_json: Bytes,
    pub db_config_json: Bytes,
    pub include_secrets: bool,
}

/// A tree of descriptors naming schema type ids whose backend
/// representation must be re-resolved in the destination database.
#[derive(Debug, Clone, Default)]
pub struct DataMendingDesc {
    pub schema_type_id: Option<Uuid>,
    pub needs_mending: bool,
    pub elements: Vec<DataMendingDesc>,
}

/// One restorable data block.
#[derive(Debug, Clone)]
pub struct RestoreBlockDesc {
    pub schema_object_id: Uuid,
    pub data_mending: DataMendingDesc,
}

/// The compiler's plan for replaying a dump.
#[derive(Debug, Clone)]
pub struct RestoreDescriptor {
    /// Schema DDL replay units, in order.
    pub units: Vec<QueryUnit>,
    pub blocks: Vec<RestoreBlockDesc>,
    /// Tables whose triggers are disabled for the duration of the load.
    pub tables: Vec<String>,
}

/// Inputs for [`Compiler::describe_restore`], parsed out of the dump
/// header the client sent.
#[derive(Debug)]
pub struct RestoreArgs<'a> {
    pub protocol_version: ProtocolVersion,
    pub server_version: Option<&'a str>,
    pub catalog_version: Option<i64>,
    pub schema_ddl: &'a str,
    pub types: &'a [DumpTypeInfo],
    pub blocks: &'a [DumpBlockDesc],
}

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile one request against the database's current schema.
    async fn compile(&self, dbname: &str, request: &QueryRequest) -> Result<CompiledQuery>;

    async fn describe_dump(&self, dbname: &str, args: DumpArgs) -> Result<DumpDescriptor>;

    async fn describe_restore(
        &self,
        dbname: &str,
        args: RestoreArgs<'_>,
    ) -> Result<RestoreDescriptor>;

    /// Post-process raw EXPLAIN output into the client-facing analysis.
    async fn analyze_explain_output(&self, rows: Vec<Bytes>) -> Result<Bytes>;

    /// Render a backend error with schema awareness; called when the static
    /// mapping yields `SchemaRequired`.
    async fn interpret_backend_error(&self, dbname: &str, err: &BackendError) -> Error;
}

/// Enforce the single-unit contract of utility statements.
pub fn single_unit(compiled: &CompiledQuery) -> Result<&QueryUnit> {
    match compiled.group.units.as_slice() {
        [unit] => Ok(unit),
        units => Err(Error::internal(format!(
            "utility statement compiled into {} units",
            units.len(),
        ))),
    }
}
