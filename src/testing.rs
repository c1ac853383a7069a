//! Mock collaborators and a wire-level test client.
//!
//! The mocks record every call so tests can assert on ordering and
//! arguments; state lives behind `Arc<Mutex<..>>` so a test keeps a handle
//! while the connection owns the boxed trait object.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{io::DuplexStream, sync::mpsc};
use uuid::Uuid;

use crate::{
    backend::{BackendConn, DumpChunk, ExecuteParams, ExecuteOutput, Introspection, PipelineEnd},
    compiler::{
        Compiler, DumpArgs, DumpBlockDesc, DumpDescriptor, RestoreArgs, RestoreBlockDesc,
        RestoreDescriptor,
    },
    error::{BackendError, Error, Result},
    ext::BufMutExt,
    message::{Frame, MessageBuf, ProtocolVersion},
    query::{
        Cardinality, CompiledQuery, ConfigOp, QueryRequest, QueryUnit, QueryUnitGroup, capability,
    },
    tenant::{AuthMethod, JwtKey, Readiness, ScramVerifier, Tenant},
    view::{ConnectionView, QueryCache, StateDescriptor},
};

pub const IN_TID: Uuid = Uuid::from_u128(0x11);
pub const OUT_TID: Uuid = Uuid::from_u128(0x22);
pub const STATE_TID: Uuid = Uuid::from_u128(0x51);

pub fn compiled_one(unit: QueryUnit) -> CompiledQuery {
    compiled_group(vec![unit])
}

pub fn compiled_group(units: Vec<QueryUnit>) -> CompiledQuery {
    let capabilities = units.iter().fold(0, |acc, u| acc | u.capabilities);
    CompiledQuery {
        group: Arc::new(QueryUnitGroup {
            units,
            cardinality: Cardinality::Many,
            capabilities,
            in_type_id: IN_TID,
            in_type_data: Bytes::from_static(b"in-desc"),
            out_type_id: OUT_TID,
            out_type_data: Bytes::from_static(b"out-desc"),
        }),
        first_extra: None,
        extra_counts: vec![],
        extra_blobs: vec![],
    }
}

pub fn plain_unit(sql: &str, status: &'static [u8]) -> QueryUnit {
    QueryUnit {
        sql: vec![sql.into()],
        status: Bytes::from_static(status),
        cardinality: Some(Cardinality::Many),
        cacheable: true,
        ..Default::default()
    }
}

// The compiler mock.

#[derive(Default)]
pub struct MockCompiler {
    pub compiled: Mutex<HashMap<String, CompiledQuery>>,
    pub compile_count: AtomicUsize,
    pub dump_desc: Mutex<Option<DumpDescriptor>>,
    pub restore_desc: Mutex<Option<RestoreDescriptor>>,
}

impl MockCompiler {
    pub fn with_query(self, source: &str, compiled: CompiledQuery) -> Self {
        self.compiled.lock().unwrap().insert(source.to_owned(), compiled);
        self
    }

    pub fn compiles(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Compiler for MockCompiler {
    async fn compile(&self, _dbname: &str, request: &QueryRequest) -> Result<CompiledQuery> {
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        if let Some(hit) = self.compiled.lock().unwrap().get(request.source.as_str()) {
            return Ok(hit.clone());
        }

        let source = request.source.as_str();
        let mut unit = plain_unit(source, b"SELECT");
        if source == "COMMIT" {
            unit.tx_commit = true;
            unit.status = Bytes::from_static(b"COMMIT");
        } else if source.starts_with("ROLLBACK") {
            unit.tx_rollback = true;
            unit.status = Bytes::from_static(b"ROLLBACK");
        } else if source.starts_with("START TRANSACTION") {
            unit.capabilities = capability::TRANSACTION;
            unit.status = Bytes::from_static(b"START TRANSACTION");
        }
        Ok(compiled_one(unit))
    }

    async fn describe_dump(&self, _dbname: &str, _args: DumpArgs) -> Result<DumpDescriptor> {
        self.dump_desc
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("no dump descriptor configured"))
    }

    async fn describe_restore(
        &self,
        _dbname: &str,
        _args: RestoreArgs<'_>,
    ) -> Result<RestoreDescriptor> {
        self.restore_desc
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("no restore descriptor configured"))
    }

    async fn analyze_explain_output(&self, _rows: Vec<Bytes>) -> Result<Bytes> {
        Ok(Bytes::from_static(b"{\"analysis\":true}"))
    }

    async fn interpret_backend_error(&self, _dbname: &str, err: &BackendError) -> Error {
        Error::query(format!("interpreted: {}", err.message))
    }
}

// The backend mock.

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    SqlExecute(String),
    FetchVal(String),
    FetchCol(String),
    ParseExecute { sqls: Vec<String>, with_state: bool, read_data: bool, end: PipelineEnd },
    RunDdl(String),
    Sync,
    ForceError,
    Dump,
    Restore(Uuid),
    Introspect(String),
}

#[derive(Default)]
pub struct MockBackendState {
    pub calls: Vec<BackendCall>,
    pub in_tx: bool,
    pub last_state: Option<Bytes>,
    /// Rows returned by `parse_execute`, keyed by the first sql text.
    pub rows: HashMap<String, Vec<Bytes>>,
    /// Notices raised by `parse_execute`, keyed by the first sql text.
    pub notices: HashMap<String, Vec<Bytes>>,
    /// Values returned by `sql_fetch_val` / `sql_fetch_col`.
    pub values: HashMap<String, Vec<Bytes>>,
    /// Data chunks produced per dump block index.
    pub dump_data: Vec<Vec<Bytes>>,
    /// Recorded restore calls: block id, data, mend map.
    pub restored: Vec<(Uuid, Bytes, Vec<(Uuid, u32)>)>,
    /// When set, the next `parse_execute`/`sql_execute` fails with it.
    pub fail_next: Option<BackendError>,
}

pub struct MockBackend(pub Arc<Mutex<MockBackendState>>);

impl MockBackendState {
    fn take_failure(&mut self) -> Option<Error> {
        self.fail_next.take().map(Into::into)
    }
}

#[async_trait]
impl BackendConn for MockBackend {
    async fn sql_execute(&mut self, sql: &str) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(BackendCall::SqlExecute(sql.to_owned()));
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        if sql.starts_with("START TRANSACTION") {
            state.in_tx = true;
        }
        if sql == "COMMIT" || sql == "ROLLBACK" {
            state.in_tx = false;
        }
        Ok(())
    }

    async fn sql_fetch_val(&mut self, sql: &str) -> Result<Bytes> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(BackendCall::FetchVal(sql.to_owned()));
        Ok(state.values.get(sql).and_then(|rows| rows.first().cloned()).unwrap_or_default())
    }

    async fn sql_fetch_col(&mut self, sql: &str) -> Result<Vec<Bytes>> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(BackendCall::FetchCol(sql.to_owned()));
        Ok(state.values.get(sql).cloned().unwrap_or_default())
    }

    async fn parse_execute(&mut self, params: ExecuteParams<'_>) -> Result<ExecuteOutput> {
        let mut state = self.0.lock().unwrap();
        let sqls: Vec<String> = params.sqls.iter().map(|sql| sql.to_string()).collect();
        state.calls.push(BackendCall::ParseExecute {
            sqls: sqls.clone(),
            with_state: params.state.is_some(),
            read_data: params.read_data,
            end: params.end,
        });
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        if let Some(first) = sqls.first()
            && first.starts_with("START TRANSACTION")
        {
            state.in_tx = true;
        }
        let rows = sqls
            .first()
            .and_then(|sql| state.rows.get(sql).cloned())
            .unwrap_or_default();
        let notices = sqls
            .first()
            .and_then(|sql| state.notices.get(sql).cloned())
            .unwrap_or_default();
        Ok(ExecuteOutput { rows, notices, status: Bytes::new() })
    }

    async fn run_ddl(
        &mut self,
        unit: &QueryUnit,
        _state: Option<Bytes>,
    ) -> Result<Option<Vec<(Uuid, u32)>>> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(BackendCall::RunDdl(
            unit.ddl_stmt_id.clone().unwrap_or_default(),
        ));
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        Ok(None)
    }

    async fn sync(&mut self) -> Result<()> {
        self.0.lock().unwrap().calls.push(BackendCall::Sync);
        Ok(())
    }

    async fn force_error(&mut self) {
        self.0.lock().unwrap().calls.push(BackendCall::ForceError);
    }

    async fn dump(
        &mut self,
        blocks: Vec<DumpBlockDesc>,
        sink: mpsc::Sender<DumpChunk>,
    ) -> Result<()> {
        let chunks: Vec<DumpChunk> = {
            let mut state = self.0.lock().unwrap();
            state.calls.push(BackendCall::Dump);
            blocks
                .iter()
                .enumerate()
                .flat_map(|(block_idx, _)| {
                    let data = state
                        .dump_data
                        .get(block_idx)
                        .cloned()
                        .unwrap_or_else(|| vec![Bytes::from_static(b"DATA")]);
                    data.into_iter().enumerate().map(move |(num, data)| DumpChunk {
                        block_idx,
                        block_num: num as u64,
                        data,
                    })
                })
                .collect()
        };
        for chunk in chunks {
            if sink.send(chunk).await.is_err() {
                return Err(Error::aborted());
            }
        }
        Ok(())
    }

    async fn restore(
        &mut self,
        block: &RestoreBlockDesc,
        data: Bytes,
        type_id_map: &[(Uuid, u32)],
    ) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(BackendCall::Restore(block.schema_object_id));
        state.restored.push((block.schema_object_id, data, type_id_map.to_vec()));
        Ok(())
    }

    async fn introspect_json(&mut self, target: Introspection) -> Result<Bytes> {
        self.0
            .lock()
            .unwrap()
            .calls
            .push(BackendCall::Introspect(format!("{target:?}")));
        Ok(Bytes::from_static(b"{}"))
    }

    fn in_tx(&self) -> bool {
        self.0.lock().unwrap().in_tx
    }

    fn last_state(&self) -> Option<Bytes> {
        self.0.lock().unwrap().last_state.clone()
    }

    fn set_last_state(&mut self, state: Bytes) {
        self.0.lock().unwrap().last_state = Some(state);
    }
}

// The view mock.

pub struct MockViewState {
    pub in_tx: bool,
    pub tx_error: bool,
    pub implicit_tx: bool,
    pub state_desc_id: Uuid,
    pub state: Bytes,
    pub cache: QueryCache,
    pub applied_ops: Vec<ConfigOp>,
    pub signalled_effects: Vec<u64>,
    pub savepoint_rollbacks: Vec<String>,
    pub aborts: usize,
    pub type_map: HashMap<Uuid, u32>,
    /// Effects returned by the next `on_success` calls, in order.
    pub next_effects: Vec<u64>,
    /// Effects returned by `commit_implicit_tx`.
    pub commit_effects: u64,
}

impl Default for MockViewState {
    fn default() -> Self {
        Self {
            in_tx: false,
            tx_error: false,
            implicit_tx: false,
            state_desc_id: STATE_TID,
            state: Bytes::from_static(b"state-v1"),
            cache: QueryCache::new(),
            applied_ops: Vec::new(),
            signalled_effects: Vec::new(),
            savepoint_rollbacks: Vec::new(),
            aborts: 0,
            type_map: HashMap::new(),
            next_effects: Vec::new(),
            commit_effects: 0,
        }
    }
}

pub struct MockView {
    pub user: String,
    pub dbname: String,
    pub state: Arc<Mutex<MockViewState>>,
}

impl ConnectionView for MockView {
    fn user(&self) -> &str {
        &self.user
    }

    fn dbname(&self) -> &str {
        &self.dbname
    }

    fn in_tx(&self) -> bool {
        self.state.lock().unwrap().in_tx
    }

    fn in_tx_error(&self) -> bool {
        self.state.lock().unwrap().tx_error
    }

    fn tx_error(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.in_tx {
            state.tx_error = true;
        }
    }

    fn clear_tx_error(&mut self) {
        self.state.lock().unwrap().tx_error = false;
    }

    fn abort_tx(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.in_tx = false;
        state.tx_error = false;
        state.implicit_tx = false;
        state.aborts += 1;
    }

    fn declare_savepoint(&mut self, _name: &str) {}

    fn rollback_to_savepoint(&mut self, name: &str) {
        self.state.lock().unwrap().savepoint_rollbacks.push(name.to_owned());
    }

    fn start(&mut self, unit: &QueryUnit) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if unit.sql.iter().any(|sql| sql.starts_with("START TRANSACTION")) {
            state.in_tx = true;
        }
        Ok(())
    }

    fn start_implicit(&mut self, _unit: &QueryUnit) {
        let mut state = self.state.lock().unwrap();
        if !state.in_tx {
            state.in_tx = true;
            state.implicit_tx = true;
        }
    }

    fn on_success(&mut self, unit: &QueryUnit, _new_types: Option<&[(Uuid, u32)]>) -> u64 {
        let mut state = self.state.lock().unwrap();
        if unit.tx_commit || unit.tx_rollback {
            state.in_tx = false;
        }
        if state.next_effects.is_empty() { 0 } else { state.next_effects.remove(0) }
    }

    fn on_error(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.in_tx {
            state.tx_error = true;
        }
    }

    fn commit_implicit_tx(&mut self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.in_tx = false;
        state.implicit_tx = false;
        state.commit_effects
    }

    fn signal_side_effects(&mut self, effects: u64) {
        self.state.lock().unwrap().signalled_effects.push(effects);
    }

    fn serialize_state(&self) -> Bytes {
        self.state.lock().unwrap().state.clone()
    }

    fn state_descriptor(&self) -> StateDescriptor {
        let state = self.state.lock().unwrap();
        StateDescriptor {
            type_id: state.state_desc_id,
            typedesc: Bytes::from_static(b"state-desc"),
        }
    }

    fn decode_state(&mut self, type_id: Uuid, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if type_id == Uuid::nil() {
            return Ok(());
        }
        if type_id != state.state_desc_id {
            return Err(crate::error::ErrorKind::StateMismatch(
                "Cannot decode state: type mismatch".into(),
            )
            .into());
        }
        state.state = Bytes::copy_from_slice(data);
        Ok(())
    }

    fn reload_state_serializer(&mut self) -> Result<()> {
        Ok(())
    }

    fn lookup_compiled(&mut self, request: &QueryRequest) -> Option<CompiledQuery> {
        self.state.lock().unwrap().cache.get(request)
    }

    fn cache_compiled(&mut self, request: QueryRequest, compiled: &CompiledQuery) {
        self.state.lock().unwrap().cache.insert(request, compiled.clone());
    }

    fn apply_config_ops(&mut self, ops: &[ConfigOp]) -> Result<()> {
        self.state.lock().unwrap().applied_ops.extend(ops.iter().cloned());
        Ok(())
    }

    fn resolve_backend_type_id(&self, schema_type_id: Uuid) -> Result<u32> {
        self.state
            .lock()
            .unwrap()
            .type_map
            .get(&schema_type_id)
            .copied()
            .ok_or_else(|| Error::internal("unknown schema type id"))
    }
}

// The tenant mock.

pub struct MockTenant {
    pub readiness: Mutex<Readiness>,
    pub auth: Vec<AuthMethod>,
    pub scram_user: Option<(String, ScramVerifier)>,
    pub compiler: Arc<MockCompiler>,
    pub backend: Arc<Mutex<MockBackendState>>,
    pub view_state: Arc<Mutex<MockViewState>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub system_ops: Mutex<Vec<ConfigOp>>,
    pub introspections: AtomicUsize,
}

impl MockTenant {
    pub fn trusting() -> Arc<Self> {
        Self::with_compiler(MockCompiler::default())
    }

    pub fn with_compiler(compiler: MockCompiler) -> Arc<Self> {
        Arc::new(Self {
            readiness: Mutex::new(Readiness::Ready),
            auth: vec![AuthMethod::Trust],
            scram_user: None,
            compiler: Arc::new(compiler),
            backend: Arc::new(Mutex::new(MockBackendState::default())),
            view_state: Arc::new(Mutex::new(MockViewState::default())),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            system_ops: Mutex::new(Vec::new()),
            introspections: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Tenant for MockTenant {
    fn readiness(&self) -> Readiness {
        *self.readiness.lock().unwrap()
    }

    fn instance_name(&self) -> &str {
        "test-instance"
    }

    fn server_version(&self) -> &str {
        "3.0-mock"
    }

    fn catalog_version(&self) -> i64 {
        4242
    }

    fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth.clone()
    }

    fn scram_verifier(&self, user: &str) -> Option<ScramVerifier> {
        self.scram_user
            .as_ref()
            .filter(|(name, _)| name == user)
            .map(|(_, verifier)| verifier.clone())
    }

    fn jwt_key(&self) -> Option<&JwtKey> {
        None
    }

    fn check_jwt_claims(&self, _claims: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn database_accepts_connections(&self, dbname: &str) -> bool {
        dbname != "closed_db"
    }

    async fn new_view(&self, dbname: &str, user: &str) -> Result<Box<dyn ConnectionView>> {
        Ok(Box::new(MockView {
            user: user.to_owned(),
            dbname: dbname.to_owned(),
            state: self.view_state.clone(),
        }))
    }

    async fn acquire_backend(&self, _dbname: &str) -> Result<Box<dyn BackendConn>> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockBackend(self.backend.clone())))
    }

    async fn release_backend(&self, _conn: Box<dyn BackendConn>) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn compiler(&self) -> Arc<dyn Compiler> {
        self.compiler.clone()
    }

    fn suggested_pool_concurrency(&self) -> usize {
        4
    }

    fn system_config_json(&self) -> Bytes {
        Bytes::from_static(b"{}")
    }

    fn dev_pgaddr(&self) -> Option<String> {
        None
    }

    async fn before_system_config(&self, _unit: &QueryUnit) -> Result<()> {
        Ok(())
    }

    async fn apply_system_config(&self, ops: &[ConfigOp]) -> Result<()> {
        self.system_ops.lock().unwrap().extend(ops.iter().cloned());
        Ok(())
    }

    async fn on_before_create_db_from_template(&self, _template: &str) -> Result<()> {
        Ok(())
    }

    async fn on_before_drop_db(&self, _dbname: &str) -> Result<()> {
        Ok(())
    }

    async fn introspect_db(&self, _dbname: &str) {
        self.introspections.fetch_add(1, Ordering::Relaxed);
    }
}

// The wire-level client.

pub struct TestClient {
    io: DuplexStream,
    incoming: MessageBuf,
}

impl TestClient {
    pub fn new(io: DuplexStream) -> Self {
        Self { io, incoming: MessageBuf::new() }
    }

    pub async fn send_raw(&mut self, mtype: u8, body: BytesMut) {
        use crate::ext::UsizeExt;
        use tokio::io::AsyncWriteExt;

        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(mtype);
        buf.put_i32((body.len() + 4).to_i32());
        buf.put(body);
        self.io.write_all(&buf).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn read_frame(&mut self) -> Frame {
        use tokio::io::AsyncReadExt;

        loop {
            if let Some(frame) = self.incoming.take_message().unwrap() {
                return frame;
            }
            let n = self.io.read_buf(self.incoming.buf_mut()).await.unwrap();
            assert!(n > 0, "server closed the stream mid-read");
        }
    }

    pub async fn handshake(&mut self, version: ProtocolVersion, params: &[(&str, &str)]) {
        let mut body = BytesMut::new();
        body.put_u16(version.major);
        body.put_u16(version.minor);
        body.put_u16(params.len() as u16);
        for (key, value) in params {
            body.put_len_str(key);
            body.put_len_str(value);
        }
        body.put_u16(0);
        self.send_raw(b'V', body).await;
    }

    /// Read through the post-auth sequence; returns the mtypes seen up to
    /// and including ReadyForQuery.
    pub async fn read_until_ready(&mut self) -> Vec<u8> {
        let mut seen = Vec::new();
        loop {
            let frame = self.read_frame().await;
            seen.push(frame.mtype());
            if frame.mtype() == b'Z' {
                return seen;
            }
            assert_ne!(frame.mtype(), b'E', "unexpected error frame");
        }
    }

    /// Full trust-auth connect: handshake plus the startup sequence.
    pub async fn connect(&mut self) {
        self.handshake(crate::message::CURRENT_PROTOCOL, &[
            ("user", "admin"),
            ("database", "main"),
        ])
        .await;
        let seen = self.read_until_ready().await;
        assert_eq!(seen, vec![b'R', b'K', b's', b'S', b'S', b'Z']);
    }

    fn parse_execute_body(query: &str, state_tid: Uuid) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(0); // annotations
        body.put_u64(capability::ALL);
        body.put_u64(0); // compilation flags
        body.put_i64(0); // implicit limit
        body.put_u8(b'b');
        body.put_u8(b'm');
        body.put_len_str(query);
        body.put_uuid(state_tid);
        body.put_len_bytes(b"");
        body
    }

    pub async fn send_parse(&mut self, query: &str) {
        let body = Self::parse_execute_body(query, Uuid::nil());
        self.send_raw(b'P', body).await;
    }

    pub async fn send_execute(&mut self, query: &str, in_tid: Uuid, out_tid: Uuid) {
        self.send_execute_caps(query, in_tid, out_tid, capability::ALL).await;
    }

    pub async fn send_execute_caps(
        &mut self,
        query: &str,
        in_tid: Uuid,
        out_tid: Uuid,
        allow_capabilities: u64,
    ) {
        let mut body = BytesMut::new();
        body.put_u16(0);
        body.put_u64(allow_capabilities);
        body.put_u64(0);
        body.put_i64(0);
        body.put_u8(b'b');
        body.put_u8(b'm');
        body.put_len_str(query);
        body.put_uuid(Uuid::nil());
        body.put_len_bytes(b"");
        body.put_uuid(in_tid);
        body.put_uuid(out_tid);
        // Zero client arguments.
        let mut args = BytesMut::new();
        args.put_i32(0);
        body.put_len_bytes(&args);
        self.send_raw(b'O', body).await;
    }

    pub async fn send_sync(&mut self) {
        self.send_raw(b'S', BytesMut::new()).await;
    }

    pub async fn send_terminate(&mut self) {
        self.send_raw(b'X', BytesMut::new()).await;
    }

    /// Read frames until CommandComplete; returns (mtypes, status).
    pub async fn read_until_complete(&mut self) -> (Vec<u8>, Bytes) {
        let mut seen = Vec::new();
        loop {
            let mut frame = self.read_frame().await;
            seen.push(frame.mtype());
            match frame.mtype() {
                b'C' => {
                    frame.get_u16().unwrap();
                    frame.get_i64().unwrap();
                    let status = frame.get_len_bytes().unwrap();
                    return (seen, status);
                }
                b'E' => panic!("unexpected error frame: {:?}", frame.get_rest()),
                _ => {}
            }
        }
    }

    /// Read one frame and expect it to be an error; returns its code.
    pub async fn expect_error(&mut self) -> u32 {
        loop {
            let mut frame = self.read_frame().await;
            match frame.mtype() {
                b'E' => {
                    frame.get_u8().unwrap();
                    return frame.get_i32().unwrap() as u32;
                }
                b'T' | b's' => continue,
                other => panic!("expected error frame, got {:?}", other as char),
            }
        }
    }
}

/// Spawn a served connection over an in-memory duplex.
pub fn spawn_conn(
    tenant: Arc<MockTenant>,
) -> (TestClient, tokio::task::JoinHandle<Result<()>>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let conn = crate::Connection::new(server_io, tenant);
    let handle = tokio::spawn(conn.serve());
    (TestClient::new(client_io), handle)
}
