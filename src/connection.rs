//! Connection lifecycle and the request dispatcher.
//!
//! One task owns the connection and all its buffers; there is no locking
//! at this level. The dispatcher reads one message at a time and routes it
//! by type; error recovery (drain-to-Sync) is a sub-mode of the loop, not
//! exception unwinding.
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::{
    auth::{jwt, scram},
    common::{span, verbose},
    compiler::Compiler,
    error::{Error, ErrorKind, Interpreted, Result, SEVERITY_ERROR, static_interpret_backend_error},
    message::{
        self, CURRENT_PROTOCOL, Frame, MIN_PROTOCOL, MessageBuf, ProtocolVersion, ServerMessage,
        client::{self, ClientHandshake, SaslInitialResponse, SaslResponse},
        server::{
            Authentication, BackendKeyData, ErrorResponse, NegotiateProtocolVersion,
            ParameterStatus, ReadyForQuery, StateDataDescription, TX_STATUS_IDLE, TX_STATUS_IN_TX,
            TX_STATUS_IN_TX_ERROR,
        },
    },
    query::CompiledQuery,
    tenant::{AuthMethod, Readiness, Tenant},
    view::ConnectionView,
};

/// Flush eagerly once this much output is buffered; the dump loop also
/// awaits a drain at this mark before producing more.
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// A buffered message stream over the client transport.
#[derive(Debug)]
pub(crate) struct Stream<S> {
    io: S,
    incoming: MessageBuf,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Stream<S> {
    fn new(io: S) -> Self {
        Self { io, incoming: MessageBuf::new(), write_buf: BytesMut::with_capacity(1024) }
    }

    /// Wait for one complete message.
    pub(crate) async fn read_message(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.incoming.take_message()? {
                verbose!("(C){:?}", frame.mtype() as char);
                return Ok(frame);
            }
            let n = self.io.read_buf(self.incoming.buf_mut()).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Buffer a message; call [`flush`][Self::flush] to actually send.
    pub(crate) fn send<M: ServerMessage>(&mut self, msg: &M) {
        span!("send");
        verbose!("(S){:?}", M::MSGTYPE as char);
        message::write(msg, &mut self.write_buf);
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            self.io.write_all_buf(&mut self.write_buf).await?;
        }
        self.io.flush().await
    }

    /// Whether the write buffer passed the high-water mark.
    pub(crate) fn wants_drain(&self) -> bool {
        self.write_buf.len() >= WRITE_HIGH_WATER
    }

    /// Backpressure point: push the buffered output down the socket.
    pub(crate) async fn drain(&mut self) -> io::Result<()> {
        self.flush().await
    }
}

/// How the connection was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A raw stream socket; the first message must be a ClientHandshake.
    Stream,
    /// Tunnelled through an outer request which already carried the
    /// connection parameters; no handshake message is expected.
    Tunnelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStatus {
    New,
    Started,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Terminate,
}

/// A single peer session.
pub struct Connection<S> {
    pub(crate) stream: Stream<S>,
    pub(crate) tenant: Arc<dyn Tenant>,
    pub(crate) compiler: Arc<dyn Compiler>,
    transport: TransportKind,
    pub(crate) version: ProtocolVersion,
    status: ConnStatus,
    params: HashMap<String, String>,
    auth_data: Option<String>,
    pub(crate) view: Option<Box<dyn ConnectionView>>,
    /// Single-slot fast cache for the Parse -> Execute sequence.
    pub(crate) last_anon_compiled: Option<(u64, CompiledQuery)>,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) in_dump_restore: bool,
    /// The state-descriptor id last sent as an `s` message; a fresh `s` is
    /// emitted whenever the view's descriptor moves away from it.
    pub(crate) last_state_desc_id: Option<Uuid>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    /// A connection over a raw stream socket.
    pub fn new(io: S, tenant: Arc<dyn Tenant>) -> Self {
        let compiler = tenant.compiler();
        Self {
            stream: Stream::new(io),
            tenant,
            compiler,
            transport: TransportKind::Stream,
            version: CURRENT_PROTOCOL,
            status: ConnStatus::New,
            params: HashMap::new(),
            auth_data: None,
            view: None,
            last_anon_compiled: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            in_dump_restore: false,
            last_state_desc_id: None,
        }
    }

    /// A connection tunnelled through an outer request; `params` come from
    /// the outer transport, `auth_data` is its bearer authorization value.
    pub fn tunnelled(
        io: S,
        tenant: Arc<dyn Tenant>,
        params: HashMap<String, String>,
        auth_data: Option<String>,
    ) -> Self {
        let mut me = Self::new(io, tenant);
        me.transport = TransportKind::Tunnelled;
        me.params = params;
        me.auth_data = auth_data;
        me
    }

    /// Handle for cancelling this connection from outside; the next
    /// cancellation check aborts the connection.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Error::aborted());
        }
        Ok(())
    }

    pub(crate) fn view(&self) -> &dyn ConnectionView {
        self.view.as_deref().expect("connection not authenticated")
    }

    pub(crate) fn view_mut(&mut self) -> &mut dyn ConnectionView {
        self.view.as_deref_mut().expect("connection not authenticated")
    }

    pub(crate) fn dbname(&self) -> &str {
        self.params.get("database").map(String::as_str).unwrap_or_default()
    }

    /// Serve this connection to completion.
    pub async fn serve(mut self) -> Result<()> {
        let res = self.run().await;
        if let Err(err) = &res {
            self.status = ConnStatus::Bad;
            if !matches!(err.kind(), ErrorKind::Io(_)) {
                log::error!("connection terminated: {err:#?}");
            }
        }
        let _ = self.stream.flush().await;
        res
    }

    async fn run(&mut self) -> Result<()> {
        match self.handshake().await {
            Ok(()) => {}
            // Startup errors are surfaced before closing; transport
            // failures are not worth a frame.
            Err(err) if matches!(err.kind(), ErrorKind::Io(_)) => return Err(err),
            Err(err) => {
                let err = self.interpret_error(err).await;
                self.send_error(&err);
                let _ = self.stream.flush().await;
                return Err(err);
            }
        }
        self.main_loop().await
    }

    fn check_readiness(&self) -> Result<()> {
        match self.tenant.readiness() {
            Readiness::Ready => Ok(()),
            Readiness::Blocked => {
                Err(Error::blocked("the server is not accepting requests"))
            }
            Readiness::Offline => {
                Err(Error::offline("the server is going offline"))
            }
        }
    }

    // Handshake & authentication.

    async fn handshake(&mut self) -> Result<()> {
        self.check_readiness()?;

        if self.transport == TransportKind::Stream {
            let mut frame = self.stream.read_message().await?;
            if frame.mtype() != ClientHandshake::MSGTYPE {
                return Err(Error::binary_protocol(format!(
                    "unexpected initial message type {:?}, expected ClientHandshake",
                    frame.mtype() as char,
                )));
            }
            let handshake = ClientHandshake::decode(&mut frame)?;

            let offered = handshake.version;
            let target = offered.clamp(MIN_PROTOCOL, CURRENT_PROTOCOL);
            if target != offered {
                self.stream.send(&NegotiateProtocolVersion { version: target });
                self.stream.flush().await?;
            }
            self.version = target;

            for (key, value) in handshake.params {
                self.params.insert(key.to_string(), value.to_string());
            }
        }

        let user = self
            .params
            .get("user")
            .cloned()
            .ok_or_else(|| Error::binary_protocol("missing required connection parameter \"user\""))?;
        let dbname = self
            .params
            .get("database")
            .cloned()
            .ok_or_else(|| {
                Error::binary_protocol("missing required connection parameter \"database\"")
            })?;

        if !self.tenant.database_accepts_connections(&dbname) {
            return Err(Error::access(format!(
                "database \"{dbname}\" does not accept connections",
            )));
        }

        self.authenticate(&user, &dbname).await?;

        let view = self.tenant.new_view(&dbname, &user).await?;
        self.view = Some(view);
        self.status = ConnStatus::Started;

        self.stream.send(&Authentication::Ok);
        self.stream.send(&BackendKeyData);
        self.send_state_description();
        if let Some(pgaddr) = self.tenant.dev_pgaddr() {
            self.stream.send(&ParameterStatus { name: "pgaddr", value: pgaddr.as_bytes() });
        }
        let concurrency = self.tenant.suggested_pool_concurrency().to_string();
        self.stream.send(&ParameterStatus {
            name: "suggested_pool_concurrency",
            value: concurrency.as_bytes(),
        });
        let system_config = self.tenant.system_config_json();
        self.stream.send(&ParameterStatus { name: "system_config", value: &system_config });
        self.send_ready();
        self.stream.flush().await?;
        Ok(())
    }

    async fn authenticate(&mut self, user: &str, dbname: &str) -> Result<()> {
        for method in self.tenant.auth_methods() {
            match method {
                AuthMethod::Trust => return Ok(()),
                AuthMethod::Jwt => {
                    // Only applicable when the peer actually carries a
                    // token; otherwise fall through to the next method.
                    if let Some(token) = self.bearer_token() {
                        return self.auth_jwt(&token, user, dbname);
                    }
                }
                AuthMethod::Scram => return self.auth_sasl(user).await,
            }
        }
        Err(Error::auth("no applicable authentication method"))
    }

    /// The JWT, from the transport's bearer header if present, else from
    /// the `secret_key` connection parameter.
    fn bearer_token(&self) -> Option<String> {
        if let Some(auth_data) = &self.auth_data {
            let (scheme, value) = auth_data.split_once(' ')?;
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(value.trim().to_owned());
            }
            return None;
        }
        self.params.get("secret_key").cloned()
    }

    fn auth_jwt(&self, token: &str, user: &str, dbname: &str) -> Result<()> {
        let key = self
            .tenant
            .jwt_key()
            .ok_or_else(|| Error::auth("JWT authentication is not configured"))?;
        let (version, claims) = jwt::validate(token, key)?;
        self.tenant.check_jwt_claims(&claims)?;
        let scopes = jwt::parse_scopes(&claims, version)?;
        jwt::check_authz(&scopes, self.tenant.instance_name(), dbname, user)
    }

    async fn auth_sasl(&mut self, user: &str) -> Result<()> {
        self.stream.send(&Authentication::SaslMethods(&[scram::MECHANISM]));
        self.stream.flush().await?;

        let mut frame = self.stream.read_message().await?;
        if frame.mtype() != SaslInitialResponse::MSGTYPE {
            return Err(Error::binary_protocol(format!(
                "expected SASL response, got message type {:?}",
                frame.mtype() as char,
            )));
        }
        let initial = SaslInitialResponse::decode(&mut frame)?;
        if &*initial.method != scram::MECHANISM {
            return Err(Error::auth(format!(
                "unsupported SASL authentication method requested: {}",
                initial.method,
            )));
        }

        // An unknown role takes the same path as a bad password.
        let verifier = self
            .tenant
            .scram_verifier(user)
            .ok_or_else(|| Error::auth("authentication failed"))?;

        let (exchange, server_first) = scram::ServerExchange::start(verifier, &initial.data)?;
        self.stream.send(&Authentication::SaslContinue(server_first.as_bytes()));
        self.stream.flush().await?;

        let mut frame = self.stream.read_message().await?;
        if frame.mtype() != SaslResponse::MSGTYPE {
            return Err(Error::binary_protocol(format!(
                "expected SASL response, got message type {:?}",
                frame.mtype() as char,
            )));
        }
        let response = SaslResponse::decode(&mut frame)?;
        let server_final = exchange.finish(&response.data)?;
        self.stream.send(&Authentication::SaslFinal(server_final.as_bytes()));
        // Authentication OK follows in the post-auth sequence.
        Ok(())
    }

    // The request dispatcher.

    async fn main_loop(&mut self) -> Result<()> {
        loop {
            let mut frame = self.stream.read_message().await?;
            let control = match self.dispatch(&mut frame).await {
                Ok(control) => control,
                Err(err) => self.recover(err).await?,
            };
            self.stream.flush().await?;
            if control == LoopControl::Terminate {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, frame: &mut Frame) -> Result<LoopControl> {
        self.check_readiness()?;
        if self.status != ConnStatus::Started {
            return Err(Error::protocol("connection is not in an operable state"));
        }

        match frame.mtype() {
            client::MSGTYPE_PARSE => self.handle_parse(frame).await?,
            client::MSGTYPE_EXECUTE => self.handle_execute(frame).await?,
            client::MSGTYPE_SYNC => {
                // Body discarded.
                self.send_ready();
            }
            client::MSGTYPE_FLUSH => {
                // Body discarded; the loop flushes after dispatch.
            }
            client::MSGTYPE_TERMINATE => return Ok(LoopControl::Terminate),
            client::MSGTYPE_DUMP => self.handle_dump(frame).await?,
            client::MSGTYPE_RESTORE => self.handle_restore(frame).await?,
            mtype if client::LEGACY_MSGTYPES.contains(&mtype) => {
                return Err(Error::binary_protocol(format!(
                    "legacy protocol message {:?} is no longer supported",
                    mtype as char,
                )));
            }
            mtype => {
                return Err(Error::binary_protocol(format!(
                    "unexpected message type {:?}",
                    mtype as char,
                )));
            }
        }
        Ok(LoopControl::Continue)
    }

    /// The error sub-mode: frame the error, then drain to the next Sync.
    async fn recover(&mut self, err: Error) -> Result<LoopControl> {
        // A backend cancel echo while we were locally cancelled is the
        // cancellation itself; anything else with that code is a normal
        // backend error (a query cancel can have other causes).
        if err.is_backend_cancel() && self.cancelled.load(Ordering::Relaxed) {
            return Err(err);
        }
        if matches!(err.kind(), ErrorKind::Io(_)) {
            // The transport is gone; no frame can be delivered.
            return Err(err);
        }

        if let Some(view) = self.view.as_deref_mut() {
            view.tx_error();
        }

        let err = self.interpret_error(err).await;
        self.send_error(&err);

        if err.closes_connection() {
            self.send_ready();
            self.stream.flush().await?;
            return Ok(LoopControl::Terminate);
        }

        self.drain_to_sync().await
    }

    /// Discard all messages until the next Sync, then signal readiness.
    async fn drain_to_sync(&mut self) -> Result<LoopControl> {
        self.stream.flush().await?;
        loop {
            let frame = self.stream.read_message().await?;
            match frame.mtype() {
                client::MSGTYPE_SYNC => break,
                client::MSGTYPE_TERMINATE => return Ok(LoopControl::Terminate),
                _ => continue,
            }
        }
        self.send_ready();
        Ok(LoopControl::Continue)
    }

    /// Route an error through interpretation before it goes on the wire.
    pub(crate) async fn interpret_error(&self, err: Error) -> Error {
        match err.kind() {
            ErrorKind::Backend(backend_err) => match static_interpret_backend_error(backend_err) {
                Interpreted::Known(known) => known,
                Interpreted::SchemaRequired => {
                    self.compiler.interpret_backend_error(self.dbname(), backend_err).await
                }
            },
            _ => err,
        }
    }

    pub(crate) fn send_error(&mut self, err: &Error) {
        let message = err.to_message();
        let fields = err.wire_fields();
        self.stream.send(&ErrorResponse {
            severity: SEVERITY_ERROR,
            code: err.code(),
            message: &message,
            fields: &fields,
        });
    }

    pub(crate) fn tx_status(&self) -> u8 {
        match self.view.as_deref() {
            Some(view) if view.in_tx_error() => TX_STATUS_IN_TX_ERROR,
            Some(view) if view.in_tx() => TX_STATUS_IN_TX,
            _ => TX_STATUS_IDLE,
        }
    }

    pub(crate) fn send_ready(&mut self) {
        self.stream.send(&ReadyForQuery { status: self.tx_status() });
    }

    /// Emit a fresh `s` state description and remember its id.
    pub(crate) fn send_state_description(&mut self) {
        let desc = self.view().state_descriptor();
        self.stream
            .send(&StateDataDescription { typedesc_id: desc.type_id, typedesc: &desc.typedesc });
        self.last_state_desc_id = Some(desc.type_id);
    }

    /// Emit `s` only when the view's descriptor moved since the last one
    /// sent.
    pub(crate) fn send_state_description_if_changed(&mut self) {
        if self.last_state_desc_id != Some(self.view().state_descriptor().type_id) {
            self.send_state_description();
        }
    }
}
