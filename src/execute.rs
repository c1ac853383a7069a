//! The Parse/Execute engine.
//!
//! Compiles requests through the compiler pool (with two cache layers in
//! front of it), enforces capabilities and type-id agreement, and runs the
//! compiled group against the backend in one of three modes: the rollback
//! fast path, the single-statement path, or the pipelined script path.
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::{
    backend::{BackendConn, ExecuteParams, PipelineEnd},
    common::ByteStr,
    connection::Connection,
    error::{Error, ErrorKind, Result},
    message::{
        Frame,
        client::{ExecuteTail, ParseExecuteRequest},
        server::{CommandComplete, CommandDataDescription, Data, LOG_SEVERITY_NOTICE, LogMessage},
    },
    query::{
        CompiledQuery, ConfigOp, QueryRequest, QueryUnit, capability, recode_bind_args,
    },
};

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    /// Parse: compile, describe, and arm the anonymous fast path.
    pub(crate) async fn handle_parse(&mut self, frame: &mut Frame) -> Result<()> {
        let req = ParseExecuteRequest::decode(frame, self.version)?;
        frame.finish()?;

        self.apply_client_state(req.state_tid, &req.state_data)?;

        let compiled = self.compile_query(&req.request).await?;
        self.describe(&compiled);
        self.last_anon_compiled = Some((req.request.cache_key(), compiled));
        Ok(())
    }

    /// Execute: resolve the compiled group, gate it, run it, complete.
    pub(crate) async fn handle_execute(&mut self, frame: &mut Frame) -> Result<()> {
        let req = ParseExecuteRequest::decode(frame, self.version)?;
        let tail = ExecuteTail::decode(frame)?;

        self.apply_client_state(req.state_tid, &req.state_data)?;

        // The fast path survives exactly one Execute; a follow-up pays the
        // normal cache path and respects each unit's cacheable flag.
        let key = req.request.cache_key();
        let compiled = match self.last_anon_compiled.take() {
            Some((hash, compiled))
                if hash == key
                    && compiled.group.in_type_id == tail.in_type_id
                    && compiled.group.out_type_id == tail.out_type_id =>
            {
                compiled
            }
            _ => self.compile_query(&req.request).await?,
        };

        if let Some(bit) = capability::first_disabled(
            compiled.group.capabilities,
            req.request.allow_capabilities,
        ) {
            return Err(Error::disabled_capability(format!(
                "cannot execute {}: disabled by the client",
                capability::title(bit),
            )));
        }

        if compiled.group.in_type_id != tail.in_type_id {
            self.describe(&compiled);
            return Err(Error::parameter_type_mismatch(
                "specified parameter type(s) do not match the parameter \
                 types inferred from specified command(s)",
            ));
        }
        if compiled.group.out_type_id != tail.out_type_id {
            // Only the output shape moved; tell the client and continue.
            self.describe(&compiled);
        }

        self.execute(&compiled, tail.bind_args).await
    }

    /// Decode session state carried by the request; on a shape mismatch a
    /// fresh `s` goes out before the error.
    fn apply_client_state(&mut self, state_tid: Uuid, data: &Bytes) -> Result<()> {
        match self.view_mut().decode_state(state_tid, data) {
            Err(err) if matches!(err.kind(), ErrorKind::StateMismatch(_)) => {
                self.send_state_description();
                Err(err)
            }
            res => res,
        }
    }

    /// Per-view cache lookup, then the compiler pool.
    async fn compile_query(&mut self, request: &QueryRequest) -> Result<CompiledQuery> {
        if let Some(hit) = self.view_mut().lookup_compiled(request) {
            return Ok(hit);
        }
        let compiled = self.compiler.compile(self.dbname(), request).await?;
        self.view_mut().cache_compiled(request.clone(), &compiled);
        Ok(compiled)
    }

    fn describe(&mut self, compiled: &CompiledQuery) {
        let group = &compiled.group;
        self.stream.send(&CommandDataDescription {
            capabilities: group.capabilities,
            result_cardinality: group.cardinality.as_u8(),
            in_type_id: group.in_type_id,
            in_type_data: &group.in_type_data,
            out_type_id: group.out_type_id,
            out_type_data: &group.out_type_data,
        });
    }

    async fn execute(&mut self, compiled: &CompiledQuery, bind_args: Bytes) -> Result<()> {
        let group = compiled.group.clone();
        let Some(first) = group.units.first() else {
            return Err(Error::internal("compiler returned an empty query unit group"));
        };

        let status = if self.view().in_tx_error()
            || first.tx_savepoint_rollback
            || first.tx_abort_migration
        {
            self.rollback_fast_path(first, group.units.len()).await?
        } else if group.needs_script() {
            self.execute_script(compiled, &bind_args).await?
        } else {
            self.execute_single(compiled, &bind_args).await?
        };

        self.send_state_description_if_changed();
        let desc = self.view().state_descriptor();
        let state_data = self.view().serialize_state();
        self.stream.send(&CommandComplete {
            capabilities: group.capabilities,
            status: &status,
            state_tid: desc.type_id,
            state_data: &state_data,
        });
        Ok(())
    }

    /// The only statements accepted while the transaction is in the error
    /// state: rollback, savepoint rollback, migration abort.
    async fn rollback_fast_path(&mut self, unit: &QueryUnit, group_len: usize) -> Result<Bytes> {
        if group_len > 1 {
            return Err(Error::protocol(
                "cannot execute a multi-command script in a failed transaction",
            ));
        }
        if !(unit.tx_rollback || unit.tx_savepoint_rollback || unit.tx_abort_migration) {
            return Err(Error::protocol(
                "current transaction is aborted, commands ignored until end of \
                 transaction block",
            ));
        }

        if !unit.sql.is_empty() {
            self.check_cancelled()?;
            let mut backend = self.tenant.acquire_backend(self.dbname()).await?;
            let mut res = Ok(());
            for sql in &unit.sql {
                res = backend.sql_execute(sql).await;
                if res.is_err() {
                    break;
                }
            }
            self.tenant.release_backend(backend).await;
            res?;
        }

        let view = self.view_mut();
        if unit.tx_savepoint_rollback {
            let name = unit.sp_name.clone().unwrap_or_default();
            view.rollback_to_savepoint(&name);
            view.clear_tx_error();
        } else {
            // Plain rollback and migration abort both tear the tx down.
            view.abort_tx();
        }
        Ok(unit.status.clone())
    }

    async fn execute_single(&mut self, compiled: &CompiledQuery, bind_args: &Bytes) -> Result<Bytes> {
        self.check_cancelled()?;
        let mut backend = self.tenant.acquire_backend(self.dbname()).await?;
        let res = self.execute_single_inner(backend.as_mut(), compiled, bind_args).await;
        self.tenant.release_backend(backend).await;
        res
    }

    async fn execute_single_inner(
        &mut self,
        backend: &mut dyn BackendConn,
        compiled: &CompiledQuery,
        bind_args: &Bytes,
    ) -> Result<Bytes> {
        let unit = &compiled.group.units[0];

        // Outside a transaction the state travels with the request, unless
        // the backend session already holds the exact same image.
        let mut state: Option<Bytes> = None;
        if !self.view().in_tx() {
            let serialized = self.view().serialize_state();
            if backend.last_state().as_deref() != Some(&serialized[..]) {
                state = Some(serialized);
            }
        }

        self.view_mut().start(unit)?;
        match self.run_single_unit(backend, compiled, unit, bind_args, state).await {
            Ok((new_types, config_ops, status)) => {
                let effects = self.view_mut().on_success(unit, new_types.as_deref());
                if !config_ops.is_empty() {
                    self.view_mut().apply_config_ops(&config_ops)?;
                }
                if effects != 0 {
                    self.view_mut().signal_side_effects(effects);
                }
                if !self.view().in_tx() {
                    backend.set_last_state(self.view().serialize_state());
                }
                Ok(status)
            }
            Err(err) => {
                self.view_mut().on_error();
                if unit.tx_commit && !backend.in_tx() && self.view().in_tx() {
                    // A failed COMMIT left the backend out of tx while the
                    // view still thinks it is in one; reconcile.
                    self.view_mut().abort_tx();
                }
                Err(err)
            }
        }
    }

    async fn run_single_unit(
        &mut self,
        backend: &mut dyn BackendConn,
        compiled: &CompiledQuery,
        unit: &QueryUnit,
        bind_args: &Bytes,
        state: Option<Bytes>,
    ) -> Result<(Option<Vec<(Uuid, u32)>>, Vec<ConfigOp>, Bytes)> {
        if let Some(template) = &unit.create_db_template {
            self.tenant.on_before_create_db_from_template(template).await?;
        }
        if let Some(dbname) = &unit.drop_db {
            self.tenant.on_before_drop_db(dbname).await?;
        }

        let mut new_types = None;
        let mut config_ops = Vec::new();
        let mut status = unit.status.clone();

        if unit.system_config {
            self.execute_system_config(backend, unit, state).await?;
        } else if unit.ddl_stmt_id.is_some() {
            new_types = backend.run_ddl(unit, state).await?;
        } else {
            let args = recode_bind_args(compiled, bind_args)?;
            let read_data = unit.needs_readback || unit.is_explain;
            let out = backend
                .parse_execute(ExecuteParams {
                    sqls: &unit.sql,
                    bind_args: Some(args),
                    state,
                    use_prep_stmt: unit.sql_hash.is_some(),
                    read_data,
                    end: PipelineEnd::Sync,
                })
                .await?;
            self.forward_notices(&out.notices);

            if unit.needs_readback {
                for row in &out.rows {
                    config_ops.push(ConfigOp::from_readback_row(row)?);
                }
            } else if unit.is_explain {
                let analyzed = self.compiler.analyze_explain_output(out.rows).await?;
                self.stream.send(&Data { chunks: &[analyzed] });
            } else {
                for row in &out.rows {
                    self.stream.send(&Data { chunks: std::slice::from_ref(row) });
                }
            }
            if !out.status.is_empty() {
                status = out.status;
            }
        }

        Ok((new_types, config_ops, status))
    }

    /// `CONFIGURE INSTANCE` and friends go through the tenant, not the
    /// session view.
    async fn execute_system_config(
        &mut self,
        backend: &mut dyn BackendConn,
        unit: &QueryUnit,
        state: Option<Bytes>,
    ) -> Result<()> {
        self.tenant.before_system_config(unit).await?;

        // Position the session: a no-op carrying the state.
        backend
            .parse_execute(ExecuteParams {
                sqls: &[ByteStr::from_static("select 1")],
                bind_args: None,
                state,
                use_prep_stmt: false,
                read_data: true,
                end: PipelineEnd::Sync,
            })
            .await?;

        let ops = if unit.sql.is_empty() {
            unit.config_ops.clone()
        } else {
            if unit.sql.len() != 1 {
                return Err(Error::internal(
                    "system config command compiled into multiple statements",
                ));
            }
            let rows = backend.sql_fetch_col(&unit.sql[0]).await?;
            if rows.first().and_then(|row| row.first()) == Some(&0x01) {
                rows.iter()
                    .map(|row| ConfigOp::from_readback_row(row))
                    .collect::<Result<Vec<_>>>()?
            } else {
                unit.config_ops.clone()
            }
        };

        self.tenant.apply_system_config(&ops).await?;
        backend.sql_execute("delete from _config_cache").await?;
        if unit.backend_config {
            backend.sql_execute("SELECT pg_reload_conf()").await?;
        }
        Ok(())
    }

    async fn execute_script(&mut self, compiled: &CompiledQuery, bind_args: &Bytes) -> Result<Bytes> {
        self.check_cancelled()?;
        let mut backend = self.tenant.acquire_backend(self.dbname()).await?;
        let res = self.execute_script_inner(backend.as_mut(), compiled, bind_args).await;
        self.tenant.release_backend(backend).await;
        res
    }

    async fn execute_script_inner(
        &mut self,
        backend: &mut dyn BackendConn,
        compiled: &CompiledQuery,
        bind_args: &Bytes,
    ) -> Result<Bytes> {
        let implicit_opened = !self.view().in_tx();

        let mut state: Option<Bytes> = None;
        if implicit_opened {
            let serialized = self.view().serialize_state();
            if backend.last_state().as_deref() != Some(&serialized[..]) {
                state = Some(serialized);
            }
        }

        let args = recode_bind_args(compiled, bind_args)?;
        let mut needs_sync = false;

        let run = self
            .run_script_units(backend, compiled, &args, &mut state, &mut needs_sync)
            .await;

        match run {
            Ok(status) => {
                if needs_sync {
                    // The last batch ended with a Flush; the Sync both
                    // closes the pipeline and commits the implicit tx.
                    backend.sync().await?;
                }
                if implicit_opened {
                    let effects = self.view_mut().commit_implicit_tx();
                    if effects != 0 {
                        self.view_mut().signal_side_effects(effects);
                    }
                }
                if !self.view().in_tx() {
                    backend.set_last_state(self.view().serialize_state());
                }
                Ok(status)
            }
            Err(err) => {
                if implicit_opened {
                    self.view_mut().abort_tx();
                    // Keep the pipeline in a known state for the next user.
                    backend.force_error().await;
                } else if needs_sync {
                    let _ = backend.sync().await;
                }
                Err(err)
            }
        }
    }

    /// Walk the group in order, batching consecutive units between
    /// boundaries marked by `ddl_stmt_id` or `needs_readback`.
    async fn run_script_units(
        &mut self,
        backend: &mut dyn BackendConn,
        compiled: &CompiledQuery,
        args: &Bytes,
        state: &mut Option<Bytes>,
        needs_sync: &mut bool,
    ) -> Result<Bytes> {
        let units = &compiled.group.units;
        let mut status = Bytes::new();
        let mut idx = 0;

        while idx < units.len() {
            self.check_cancelled()?;

            if units[idx].is_batch_boundary() {
                let unit = &units[idx];
                self.view_mut().start_implicit(unit);

                if unit.ddl_stmt_id.is_some() {
                    let new_types = backend.run_ddl(unit, state.take()).await?;
                    self.script_unit_done(unit, new_types.as_deref())?;
                    status = unit.status.clone();
                } else {
                    let out = backend
                        .parse_execute(ExecuteParams {
                            sqls: &unit.sql,
                            bind_args: Some(args.clone()),
                            state: state.take(),
                            use_prep_stmt: false,
                            read_data: true,
                            end: PipelineEnd::Flush,
                        })
                        .await?;
                    *needs_sync = true;
                    self.forward_notices(&out.notices);

                    let ops = out
                        .rows
                        .iter()
                        .map(|row| ConfigOp::from_readback_row(row))
                        .collect::<Result<Vec<_>>>()?;
                    self.view_mut().apply_config_ops(&ops)?;
                    self.script_unit_done(unit, None)?;
                    status = if out.status.is_empty() {
                        unit.status.clone()
                    } else {
                        out.status
                    };
                }
                idx += 1;
                continue;
            }

            let mut end = idx + 1;
            while end < units.len() && !units[end].is_batch_boundary() {
                end += 1;
            }
            let batch = &units[idx..end];
            let ends_group = end == units.len();

            for unit in batch {
                self.view_mut().start_implicit(unit);
            }

            let sqls: Vec<ByteStr> =
                batch.iter().flat_map(|unit| unit.sql.iter().cloned()).collect();
            let pipeline_end =
                if ends_group { PipelineEnd::Sync } else { PipelineEnd::Flush };
            let out = backend
                .parse_execute(ExecuteParams {
                    sqls: &sqls,
                    bind_args: Some(args.clone()),
                    state: state.take(),
                    use_prep_stmt: false,
                    read_data: false,
                    end: pipeline_end,
                })
                .await?;
            *needs_sync = pipeline_end == PipelineEnd::Flush;
            self.forward_notices(&out.notices);

            for row in &out.rows {
                self.stream.send(&Data { chunks: std::slice::from_ref(row) });
            }
            for unit in batch {
                self.script_unit_done(unit, None)?;
            }
            if !out.status.is_empty() {
                status = out.status;
            } else if let Some(last) = batch.last() {
                status = last.status.clone();
            }
            idx = end;
        }

        Ok(status)
    }

    fn forward_notices(&mut self, notices: &[Bytes]) {
        for notice in notices {
            let text = String::from_utf8_lossy(notice);
            self.stream.send(&LogMessage {
                severity: LOG_SEVERITY_NOTICE,
                code: 0,
                text: &text,
            });
        }
    }

    /// Mid-script side effects cannot be signalled; they belong to the
    /// implicit commit.
    fn script_unit_done(
        &mut self,
        unit: &QueryUnit,
        new_types: Option<&[(Uuid, u32)]>,
    ) -> Result<()> {
        let effects = self.view_mut().on_success(unit, new_types);
        if effects != 0 {
            return Err(Error::internal("Side-effects in implicit transaction!"));
        }
        Ok(())
    }
}
