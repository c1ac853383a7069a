//! The backend connection seam.
//!
//! A [`BackendConn`] is an opaque pipelined channel to one PostgreSQL-family
//! backend session. The engine acquires one from the tenant for the span of
//! an execute, dump or restore, and releases it in `finally` position; it
//! never holds two at once.
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    common::ByteStr,
    compiler::{DumpBlockDesc, RestoreBlockDesc},
    error::Result,
    query::QueryUnit,
};

/// How a pipelined send is terminated.
///
/// `Sync` closes the implicit transaction and yields a ready-for-query on
/// the backend; `Flush` only forces the responses out, keeping the implicit
/// transaction open for the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    Sync,
    Flush,
}

/// One parse/bind/execute round against the backend.
#[derive(Debug)]
pub struct ExecuteParams<'a> {
    pub sqls: &'a [ByteStr],
    /// Recoded bind arguments; `None` when the statement takes none.
    pub bind_args: Option<Bytes>,
    /// Serialized session state to apply first; `None` elides the state
    /// roundtrip because the backend already holds it.
    pub state: Option<Bytes>,
    pub use_prep_stmt: bool,
    /// When set the server consumes result rows itself instead of
    /// forwarding them to the client.
    pub read_data: bool,
    pub end: PipelineEnd,
}

/// Result of one execute round.
#[derive(Debug, Default)]
pub struct ExecuteOutput {
    /// Raw data rows; already client-encoded unless `read_data` was set.
    pub rows: Vec<Bytes>,
    /// Command status tag of the last statement.
    pub status: Bytes,
    /// Notices raised by the backend; forwarded to the client as log
    /// messages.
    pub notices: Vec<Bytes>,
}

/// What to introspect as JSON for the dump preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Introspection {
    UserSchema,
    GlobalSchema,
    DbConfig,
}

/// One chunk produced by the dump data pump.
#[derive(Debug)]
pub struct DumpChunk {
    /// Index into the descriptor's block list.
    pub block_idx: usize,
    pub block_num: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait BackendConn: Send {
    /// Run one or more SQL statements, discarding output.
    async fn sql_execute(&mut self, sql: &str) -> Result<()>;

    /// Run a single statement and return the first column of the first row.
    async fn sql_fetch_val(&mut self, sql: &str) -> Result<Bytes>;

    /// Run a single statement and return the first column of every row.
    async fn sql_fetch_col(&mut self, sql: &str) -> Result<Vec<Bytes>>;

    /// Pipelined extended-protocol execution.
    async fn parse_execute(&mut self, params: ExecuteParams<'_>) -> Result<ExecuteOutput>;

    /// Run a DDL unit; may return new backend type ids for freshly created
    /// schema types.
    async fn run_ddl(
        &mut self,
        unit: &QueryUnit,
        state: Option<Bytes>,
    ) -> Result<Option<Vec<(Uuid, u32)>>>;

    /// Issue a Sync to close a pipeline left open by a `Flush`-terminated
    /// batch.
    async fn sync(&mut self) -> Result<()>;

    /// Force the pipeline into a known error state; used when a script is
    /// abandoned halfway.
    async fn force_error(&mut self);

    /// Walk the dump blocks, pushing chunks into `sink`. Returns once every
    /// block is fully produced; dropping the receiver aborts the walk.
    async fn dump(
        &mut self,
        blocks: Vec<DumpBlockDesc>,
        sink: mpsc::Sender<DumpChunk>,
    ) -> Result<()>;

    /// Ingest one restore data block, rewriting embedded type ids through
    /// `type_id_map`.
    async fn restore(
        &mut self,
        block: &RestoreBlockDesc,
        data: Bytes,
        type_id_map: &[(Uuid, u32)],
    ) -> Result<()>;

    /// Introspection helpers for the dump preamble.
    async fn introspect_json(&mut self, target: Introspection) -> Result<Bytes>;

    fn in_tx(&self) -> bool;

    /// The session state this backend currently holds, if known.
    fn last_state(&self) -> Option<Bytes>;
    fn set_last_state(&mut self, state: Bytes);
}
