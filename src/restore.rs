//! The restore engine.
//!
//! Restore replays the dump's schema DDL inside one serializable
//! transaction, suspends triggers on the affected tables, ingests streamed
//! data blocks (mending embedded type ids per block), and commits. Any
//! failure rolls the whole load back.
use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::{
    backend::BackendConn,
    common::ByteStr,
    compiler::{
        DataMendingDesc, DumpBlockDesc, DumpTypeInfo, RestoreArgs, single_unit,
    },
    connection::Connection,
    error::{Error, Result},
    message::{
        CURRENT_PROTOCOL, DUMP_HEADER_SERVER_CATALOG_VERSION, DUMP_HEADER_SERVER_VER,
        DUMP_VER_MIN, Frame, ProtocolVersion, client, read_headers,
        server::{CommandComplete, RestoreReady},
    },
    query::{ConfigScope, QueryRequest, side_effect},
};

const RESTORE_TX_SQL: &str = "START TRANSACTION ISOLATION SERIALIZABLE";
const RESTORE_TIMEOUT_SQL: &str = "SET LOCAL idle_in_transaction_session_timeout = 0;\
     SET LOCAL statement_timeout = 0;";

/// The dump preamble as parsed back out of a restore request.
struct RestoreHeader {
    server_version: Option<String>,
    catalog_version: Option<i64>,
    protocol_version: ProtocolVersion,
    schema_ddl: ByteStr,
    types: Vec<DumpTypeInfo>,
    blocks: Vec<DumpBlockDesc>,
}

impl RestoreHeader {
    fn decode(frame: &mut Frame) -> Result<Self> {
        let mut server_version = None;
        let mut catalog_version = None;
        for (key, value) in read_headers(frame)? {
            match key {
                DUMP_HEADER_SERVER_VER => {
                    server_version = std::str::from_utf8(&value).ok().map(str::to_owned);
                }
                DUMP_HEADER_SERVER_CATALOG_VERSION => {
                    // Written as a length-prefixed raw i64; see the dump
                    // header writer.
                    if value.len() == 8 {
                        catalog_version =
                            Some(i64::from_be_bytes(value[..].try_into().expect("len checked")));
                    }
                }
                _ => {}
            }
        }

        let major = frame.get_u16()?;
        let minor = frame.get_u16()?;
        let protocol_version = ProtocolVersion::new(major, minor);
        if protocol_version < DUMP_VER_MIN || protocol_version > CURRENT_PROTOCOL {
            return Err(Error::protocol(format!(
                "unsupported dump version {protocol_version}",
            )));
        }

        let schema_ddl = frame.get_len_str()?;

        let ntypes = frame.get_i32()?;
        if ntypes < 0 {
            return Err(Error::binary_protocol("negative type count in dump header"));
        }
        let mut types = Vec::with_capacity(ntypes.min(1024) as usize);
        for _ in 0..ntypes {
            types.push(DumpTypeInfo {
                type_name: frame.get_len_str()?.to_string(),
                type_desc: frame.get_len_str()?.to_string(),
                type_id: frame.get_uuid()?,
            });
        }

        let nblocks = frame.get_i32()?;
        if nblocks < 0 {
            return Err(Error::binary_protocol("negative block count in dump header"));
        }
        let mut blocks = Vec::with_capacity(nblocks.min(1024) as usize);
        for _ in 0..nblocks {
            let schema_object_id = frame.get_uuid()?;
            let type_desc = frame.get_len_bytes()?;
            // Dependency ids are recorded by dump but not needed to load.
            let ndeps = frame.get_u16()?;
            for _ in 0..ndeps {
                frame.get_uuid()?;
            }
            blocks.push(DumpBlockDesc { schema_object_id, type_desc, schema_deps: Vec::new() });
        }
        frame.finish()?;

        Ok(Self {
            server_version,
            catalog_version,
            protocol_version,
            schema_ddl,
            types,
            blocks,
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub(crate) async fn handle_restore(&mut self, frame: &mut Frame) -> Result<()> {
        let headers = read_headers(frame)?;
        if !headers.is_empty() {
            return Err(Error::binary_protocol("RESTORE request headers are not supported"));
        }
        // Parallel-load hint; restore is single-job.
        let _jobs = frame.get_i16()?;

        let header = RestoreHeader::decode(frame)?;

        if self.view().in_tx() {
            return Err(Error::protocol(
                "RESTORE must not be executed while in transaction",
            ));
        }
        self.view_mut().reload_state_serializer()?;

        self.check_cancelled()?;
        let mut backend = self.tenant.acquire_backend(self.dbname()).await?;
        self.in_dump_restore = true;

        let res = self.restore_inner(backend.as_mut(), &header).await;
        if res.is_err() {
            let _ = backend.sql_execute("ROLLBACK").await;
            self.view_mut().abort_tx();
        }

        self.in_dump_restore = false;
        self.tenant.release_backend(backend).await;
        res
    }

    async fn restore_inner(
        &mut self,
        backend: &mut dyn BackendConn,
        header: &RestoreHeader,
    ) -> Result<()> {
        self.view_mut().decode_state(Uuid::nil(), b"")?;

        self.utility_stmt(backend, RESTORE_TX_SQL).await?;
        backend.sql_execute(RESTORE_TIMEOUT_SQL).await?;

        let desc = self
            .compiler
            .describe_restore(
                self.dbname(),
                RestoreArgs {
                    protocol_version: header.protocol_version,
                    server_version: header.server_version.as_deref(),
                    catalog_version: header.catalog_version,
                    schema_ddl: &header.schema_ddl,
                    types: &header.types,
                    blocks: &header.blocks,
                },
            )
            .await?;

        // Schema replay.
        for unit in &desc.units {
            if unit.config_ops.iter().any(|op| op.scope == ConfigScope::Instance) {
                return Err(Error::protocol(
                    "CONFIGURE INSTANCE cannot be executed in dump restore",
                ));
            }
            self.view_mut().start(unit)?;

            let mut res = Ok(());
            if unit.ddl_stmt_id.is_some() {
                res = backend.run_ddl(unit, None).await.map(|_| ());
            } else {
                for sql in &unit.sql {
                    res = backend.sql_execute(sql).await;
                    if res.is_err() {
                        break;
                    }
                }
            }
            match res {
                Ok(()) => {
                    // Effects are deferred to the transaction commit.
                    let _ = self.view_mut().on_success(unit, None);
                }
                Err(err) => {
                    self.view_mut().on_error();
                    return Err(err);
                }
            }
        }

        if !desc.tables.is_empty() {
            backend.sql_execute(&trigger_stmt(&desc.tables, "DISABLE")).await?;
        }

        self.stream.send(&RestoreReady { jobs: 1 });
        self.stream.flush().await?;

        let blocks: HashMap<Uuid, _> =
            desc.blocks.iter().map(|block| (block.schema_object_id, block)).collect();

        loop {
            self.check_cancelled()?;
            let mut frame = self.stream.read_message().await?;
            match frame.mtype() {
                client::MSGTYPE_RESTORE_BLOCK => {
                    let block = client::RestoreBlock::decode(&mut frame)?;
                    let restore_block = blocks
                        .get(&block.block_id)
                        .ok_or_else(|| Error::protocol("unknown restore block id"))?;
                    let type_id_map = self.build_type_map(&restore_block.data_mending)?;
                    backend.restore(restore_block, block.data, &type_id_map).await?;
                }
                client::MSGTYPE_RESTORE_EOF => {
                    frame.finish()?;
                    break;
                }
                mtype => {
                    return Err(Error::binary_protocol(format!(
                        "unexpected message type {:?} during restore",
                        mtype as char,
                    )));
                }
            }
        }

        if !desc.tables.is_empty() {
            backend.sql_execute(&trigger_stmt(&desc.tables, "ENABLE")).await?;
        }
        self.utility_stmt(backend, "COMMIT").await?;

        self.view_mut().signal_side_effects(side_effect::SCHEMA_CHANGES);
        self.tenant.introspect_db(self.dbname()).await;

        self.send_state_description_if_changed();
        let state_desc = self.view().state_descriptor();
        let state_data = self.view().serialize_state();
        self.stream.send(&CommandComplete {
            capabilities: 0,
            status: b"RESTORE",
            state_tid: state_desc.type_id,
            state_data: &state_data,
        });
        self.stream.flush().await?;
        Ok(())
    }

    /// Resolve every type id the mending tree names to its backend id in
    /// this database.
    fn build_type_map(&self, desc: &DataMendingDesc) -> Result<Vec<(Uuid, u32)>> {
        let mut map = Vec::new();
        let mut stack = vec![desc];
        while let Some(node) = stack.pop() {
            if node.needs_mending
                && let Some(schema_type_id) = node.schema_type_id
            {
                let backend_id = self.view().resolve_backend_type_id(schema_type_id)?;
                map.push((schema_type_id, backend_id));
            }
            stack.extend(node.elements.iter());
        }
        Ok(map)
    }

    /// Run a protocol-internal statement as a normal unit, routing
    /// success and failure through the view.
    pub(crate) async fn utility_stmt(
        &mut self,
        backend: &mut dyn BackendConn,
        source: &str,
    ) -> Result<()> {
        let request = QueryRequest::utility(source, self.version);
        let compiled = self.compiler.compile(self.dbname(), &request).await?;
        let unit = single_unit(&compiled)?.clone();

        self.view_mut().start(&unit)?;
        let mut res = Ok(());
        for sql in &unit.sql {
            res = backend.sql_execute(sql).await;
            if res.is_err() {
                break;
            }
        }
        match res {
            Ok(()) => {
                let _ = self.view_mut().on_success(&unit, None);
                Ok(())
            }
            Err(err) => {
                self.view_mut().on_error();
                if unit.tx_commit && !backend.in_tx() && self.view().in_tx() {
                    self.view_mut().abort_tx();
                }
                Err(err)
            }
        }
    }
}

fn trigger_stmt(tables: &[String], action: &str) -> String {
    let mut stmt = String::new();
    for table in tables {
        stmt.push_str("ALTER TABLE ");
        stmt.push_str(table);
        stmt.push(' ');
        stmt.push_str(action);
        stmt.push_str(" TRIGGER ALL;\n");
    }
    stmt
}
