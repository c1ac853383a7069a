//! The dump engine.
//!
//! A dump is a serializable deferrable read-only snapshot walked by a
//! producer (the backend connection) while the consumer frames data blocks
//! to the client. A bounded queue of capacity 2 provides backpressure
//! between the two without locks; both run cooperatively in this
//! connection's task.
use std::{
    sync::atomic::Ordering,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use uuid::Uuid;

use crate::{
    backend::{BackendConn, DumpChunk, Introspection},
    compiler::DumpArgs,
    connection::Connection,
    error::{Error, Result},
    message::{
        CURRENT_PROTOCOL, Frame, HEADER_DUMP_SECRETS, read_headers,
        server::{CommandComplete, DumpBlock, DumpHeader},
    },
};

const SNAPSHOT_SQL: &str = "START TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE;\
     SET LOCAL idle_in_transaction_session_timeout = 0;\
     SET LOCAL statement_timeout = 0;";

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub(crate) async fn handle_dump(&mut self, frame: &mut Frame) -> Result<()> {
        let headers = read_headers(frame)?;
        frame.finish()?;
        let include_secrets = headers
            .iter()
            .any(|(key, value)| *key == HEADER_DUMP_SECRETS && value.first() == Some(&1));

        if self.view().in_tx() {
            return Err(Error::protocol(
                "DUMP must not be executed while in transaction",
            ));
        }

        self.check_cancelled()?;
        let mut backend = self.tenant.acquire_backend(self.dbname()).await?;
        self.in_dump_restore = true;

        let res = self.dump_inner(backend.as_mut(), include_secrets).await;
        if res.is_err() {
            let _ = backend.sql_execute("ROLLBACK").await;
        }

        self.in_dump_restore = false;
        self.tenant.release_backend(backend).await;
        res
    }

    async fn dump_inner(
        &mut self,
        backend: &mut dyn BackendConn,
        include_secrets: bool,
    ) -> Result<()> {
        backend.sql_execute(SNAPSHOT_SQL).await?;

        let user_schema_json = backend.introspect_json(Introspection::UserSchema).await?;
        let global_schema_json = backend.introspect_json(Introspection::GlobalSchema).await?;
        let db_config_json = backend.introspect_json(Introspection::DbConfig).await?;

        // The dump is always written in the newest format we support,
        // regardless of what this session negotiated.
        let desc = self
            .compiler
            .describe_dump(
                self.dbname(),
                DumpArgs {
                    protocol_version: CURRENT_PROTOCOL,
                    user_schema_json,
                    global_schema_json,
                    db_config_json,
                    include_secrets,
                },
            )
            .await?;

        let mut schema_ddl = desc.schema_ddl.clone();
        for ddl in &desc.dynamic_ddl {
            let value = backend.sql_fetch_val(ddl).await?;
            if !value.is_empty() {
                let text = std::str::from_utf8(&value)
                    .map_err(|_| Error::internal("dynamic DDL produced non-utf8 output"))?;
                schema_ddl.push('\n');
                schema_ddl.push_str(text);
            }
        }

        let server_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        self.stream.send(&DumpHeader {
            server_version: self.tenant.server_version(),
            catalog_version: self.tenant.catalog_version(),
            server_time,
            protocol_version: CURRENT_PROTOCOL,
            schema_ddl: &schema_ddl,
            types: &desc.types,
            blocks: &desc.blocks,
        });
        self.stream.flush().await?;

        // Capacity 2 gives the producer one block of lookahead while the
        // consumer drains the socket.
        let (tx, mut rx) = mpsc::channel::<DumpChunk>(2);
        let producer = backend.dump(desc.blocks.clone(), tx);

        let stream = &mut self.stream;
        let cancelled = &self.cancelled;
        let blocks = &desc.blocks;
        let consumer = async move {
            // Single producer: the first None is EOF. A parallel-producer
            // setup would need a stop counter here instead.
            while let Some(chunk) = rx.recv().await {
                if cancelled.load(Ordering::Relaxed) {
                    return Err(Error::aborted());
                }
                let block = blocks
                    .get(chunk.block_idx)
                    .ok_or_else(|| Error::internal("dump chunk for unknown block"))?;
                stream.send(&DumpBlock {
                    block_id: block.schema_object_id,
                    block_num: chunk.block_num,
                    data: &chunk.data,
                });
                if stream.wants_drain() {
                    stream.drain().await?;
                }
            }
            Ok(())
        };

        // Dropping the consumer's receiver on error aborts the producer.
        let (produced, consumed) = tokio::join!(producer, consumer);
        consumed?;
        produced?;

        backend.sql_execute("ROLLBACK").await?;

        self.stream.send(&CommandComplete {
            capabilities: 0,
            status: b"DUMP",
            state_tid: Uuid::nil(),
            state_data: b"",
        });
        self.stream.flush().await?;
        Ok(())
    }
}
