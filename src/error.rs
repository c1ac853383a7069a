//! `veld-proto` error types.
//!
//! Every error the engine surfaces to a client carries a 32-bit wire code
//! from the [`codes`] registry, so it can be framed as an `E` message.
use std::{backtrace::Backtrace, fmt, io};

/// A specialized [`Result`] type for `veld-proto` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wire error codes.
///
/// The registry is hierarchical: the first byte names the class, deeper
/// bytes refine it. Clients match on prefixes.
pub mod codes {
    pub const INTERNAL_SERVER: u32 = 0x01_00_00_00;
    pub const UNSUPPORTED_FEATURE: u32 = 0x02_00_00_00;
    pub const PROTOCOL: u32 = 0x03_00_00_00;
    pub const BINARY_PROTOCOL: u32 = 0x03_01_00_00;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u32 = 0x03_01_00_01;
    pub const CAPABILITY: u32 = 0x03_04_00_00;
    pub const DISABLED_CAPABILITY: u32 = 0x03_04_02_00;
    pub const PARAMETER_TYPE_MISMATCH: u32 = 0x03_06_01_00;
    pub const STATE_MISMATCH: u32 = 0x03_06_02_00;
    pub const QUERY: u32 = 0x04_00_00_00;
    pub const TRANSACTION_SERIALIZATION: u32 = 0x05_01_00_01;
    pub const TRANSACTION_DEADLOCK: u32 = 0x05_01_00_02;
    pub const ACCESS: u32 = 0x07_00_00_00;
    pub const AUTHENTICATION: u32 = 0x07_01_00_00;
    pub const AVAILABILITY: u32 = 0x08_00_00_00;
    pub const BACKEND_UNAVAILABLE: u32 = 0x08_00_00_01;
    pub const SERVER_OFFLINE: u32 = 0x08_00_00_02;
    pub const SERVER_BLOCKED: u32 = 0x08_00_00_04;
    pub const IDLE_SESSION_TIMEOUT: u32 = 0x0A_05_00_00;
}

/// Error frame field keys.
pub mod fields {
    pub const HINT: u16 = 0x0001;
    pub const DETAILS: u16 = 0x0002;
    pub const SERVER_TRACEBACK: u16 = 0x0101;
}

/// `E` frame severity.
pub const SEVERITY_ERROR: u8 = 120;

const BUG_REPORT_HINT: &str =
    "This is most likely a server bug. Please consider opening an issue at \
     https://github.com/veld/veld/issues/new";

/// All possible error from `veld-proto` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach context shown before the message.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// The wire code for the `E` frame.
    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    /// The message for the `E` frame.
    pub fn to_message(&self) -> String {
        if self.context.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}: {}", self.context, self.kind)
        }
    }

    /// Extra `E` frame fields: hint and server traceback.
    pub fn wire_fields(&self) -> Vec<(u16, String)> {
        let mut out = Vec::new();
        match &self.kind {
            ErrorKind::InternalServer { traceback, .. } => {
                out.push((fields::HINT, BUG_REPORT_HINT.to_owned()));
                if let Some(tb) = traceback {
                    out.push((fields::SERVER_TRACEBACK, tb.clone()));
                }
            }
            ErrorKind::Backend(err) => {
                for (key, value) in &err.fields {
                    out.push((*key, value.clone()));
                }
            }
            _ => {}
        }
        out
    }

    /// Whether this error is a backend query-cancel echo (SQLSTATE 57014).
    pub fn is_backend_cancel(&self) -> bool {
        matches!(&self.kind, ErrorKind::Backend(err) if err.sqlstate == "57014")
    }

    /// Whether the connection must be closed instead of drained to Sync.
    pub fn closes_connection(&self) -> bool {
        matches!(
            &self.kind,
            ErrorKind::ServerOffline(_) | ErrorKind::ServerBlocked(_)
        )
    }
}

macro_rules! constructors {
    ($($fn:ident => $variant:ident,)*) => {$(
        impl Error {
            pub fn $fn(message: impl Into<String>) -> Self {
                ErrorKind::$variant(message.into()).into()
            }
        }
    )*};
}

constructors! {
    protocol => Protocol,
    binary_protocol => BinaryProtocol,
    unsupported_protocol_version => UnsupportedProtocolVersion,
    unsupported_feature => UnsupportedFeature,
    disabled_capability => DisabledCapability,
    parameter_type_mismatch => ParameterTypeMismatch,
    state_mismatch => StateMismatch,
    query => Query,
    access => Access,
    auth => Authentication,
    backend_unavailable => BackendUnavailable,
    offline => ServerOffline,
    blocked => ServerBlocked,
    idle_timeout => IdleSessionTimeout,
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        ErrorKind::InternalServer { message: message.into(), traceback: None }.into()
    }

    /// Wrap an arbitrary failure as an internal server error, preserving its
    /// formatted rendering as the server traceback.
    pub fn internal_with_source(source: &dyn std::error::Error) -> Self {
        ErrorKind::InternalServer {
            message: source.to_string(),
            traceback: Some(format!("{source:?}")),
        }
        .into()
    }

    /// The connection was cancelled from outside.
    pub fn aborted() -> Self {
        ErrorKind::Io(io::Error::from(io::ErrorKind::ConnectionAborted)).into()
    }
}

/// All possible error kind from `veld-proto` library.
pub enum ErrorKind {
    Io(io::Error),
    InternalServer { message: String, traceback: Option<String> },
    UnsupportedFeature(String),
    Protocol(String),
    BinaryProtocol(String),
    UnsupportedProtocolVersion(String),
    DisabledCapability(String),
    ParameterTypeMismatch(String),
    StateMismatch(String),
    Query(String),
    TransactionSerialization(String),
    TransactionDeadlock(String),
    Access(String),
    Authentication(String),
    BackendUnavailable(String),
    ServerOffline(String),
    ServerBlocked(String),
    IdleSessionTimeout(String),
    /// An uninterpreted backend error; the dispatcher routes it through
    /// [`static_interpret_backend_error`] before it reaches the wire.
    Backend(BackendError),
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Io(_) => codes::AVAILABILITY,
            Self::InternalServer { .. } => codes::INTERNAL_SERVER,
            Self::UnsupportedFeature(_) => codes::UNSUPPORTED_FEATURE,
            Self::Protocol(_) => codes::PROTOCOL,
            Self::BinaryProtocol(_) => codes::BINARY_PROTOCOL,
            Self::UnsupportedProtocolVersion(_) => codes::UNSUPPORTED_PROTOCOL_VERSION,
            Self::DisabledCapability(_) => codes::DISABLED_CAPABILITY,
            Self::ParameterTypeMismatch(_) => codes::PARAMETER_TYPE_MISMATCH,
            Self::StateMismatch(_) => codes::STATE_MISMATCH,
            Self::Query(_) => codes::QUERY,
            Self::TransactionSerialization(_) => codes::TRANSACTION_SERIALIZATION,
            Self::TransactionDeadlock(_) => codes::TRANSACTION_DEADLOCK,
            Self::Access(_) => codes::ACCESS,
            Self::Authentication(_) => codes::AUTHENTICATION,
            Self::BackendUnavailable(_) => codes::BACKEND_UNAVAILABLE,
            Self::ServerOffline(_) => codes::SERVER_OFFLINE,
            Self::ServerBlocked(_) => codes::SERVER_BLOCKED,
            Self::IdleSessionTimeout(_) => codes::IDLE_SESSION_TIMEOUT,
            Self::Backend(_) => codes::QUERY,
        }
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::Io(e));
from!(<BackendError>e => ErrorKind::Backend(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::InternalServer { message, .. } => f.write_str(message),
            Self::UnsupportedFeature(m)
            | Self::Protocol(m)
            | Self::BinaryProtocol(m)
            | Self::UnsupportedProtocolVersion(m)
            | Self::DisabledCapability(m)
            | Self::ParameterTypeMismatch(m)
            | Self::StateMismatch(m)
            | Self::Query(m)
            | Self::TransactionSerialization(m)
            | Self::TransactionDeadlock(m)
            | Self::Access(m)
            | Self::Authentication(m)
            | Self::BackendUnavailable(m)
            | Self::ServerOffline(m)
            | Self::ServerBlocked(m)
            | Self::IdleSessionTimeout(m) => f.write_str(m),
            Self::Backend(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An error reported by the backend connection.
///
/// `fields` carries already-translated `E` frame fields, if any.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub sqlstate: String,
    pub message: String,
    pub fields: Vec<(u16, String)>,
}

impl BackendError {
    pub fn new(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self { sqlstate: sqlstate.into(), message: message.into(), fields: Vec::new() }
    }
}

/// Outcome of the static backend-error mapping.
pub enum Interpreted {
    /// Fully mapped into the domain hierarchy.
    Known(Error),
    /// The message needs the current schema to be rendered; resend to the
    /// compiler pool.
    SchemaRequired,
}

/// First stage of backend error interpretation: a static SQLSTATE mapping
/// that needs no schema knowledge.
pub fn static_interpret_backend_error(err: &BackendError) -> Interpreted {
    match err.sqlstate.as_str() {
        // serialization_failure
        "40001" => Interpreted::Known(
            ErrorKind::TransactionSerialization(err.message.clone()).into(),
        ),
        // deadlock_detected
        "40P01" => {
            Interpreted::Known(ErrorKind::TransactionDeadlock(err.message.clone()).into())
        }
        // query_canceled
        "57014" => Interpreted::Known(err.clone().into()),
        // statement_too_complex
        "54001" => Interpreted::Known(Error::unsupported_feature(
            "The query caused the compiler stack to overflow. \
             It is likely too deeply nested.",
        )),
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => {
            Interpreted::Known(Error::backend_unavailable(err.message.clone()))
        }
        // too_many_connections
        "53300" => Interpreted::Known(Error::backend_unavailable(err.message.clone())),
        // integrity violations render with schema names
        s if s.starts_with("23") => Interpreted::SchemaRequired,
        // invalid catalog name
        "3D000" => Interpreted::Known(Error::query(strip_tenant_prefix(&err.message))),
        // duplicate database
        "42P04" => Interpreted::Known(Error::query(strip_tenant_prefix(&err.message))),
        _ => Interpreted::Known(err.clone().into()),
    }
}

/// Backend database names are prefixed with the tenant id; error messages
/// must not leak it.
fn strip_tenant_prefix(message: &str) -> String {
    match message.split_once("_vd_") {
        Some((head, tail)) => match tail.split_once('_') {
            Some((_tenant, rest)) => format!("{head}{rest}"),
            None => message.to_owned(),
        },
        None => message.to_owned(),
    }
}
