//! Veld frontend binary protocol engine.
//!
//! This crate owns a single client connection to the Veld database server:
//! it speaks the length-prefixed binary wire protocol, authenticates the
//! peer, parses and executes queries against a backend connection, and
//! streams bulk dump/restore payloads.
//!
//! The compiler pool, the backend connection driver, the per-database view
//! and the tenant are external collaborators; this crate consumes them
//! through the [`compiler::Compiler`], [`backend::BackendConn`],
//! [`view::ConnectionView`] and [`tenant::Tenant`] traits.
//!
//! # Examples
//!
//! Serving an accepted socket:
//!
//! ```no_run
//! use std::sync::Arc;
//! use veld_proto::Connection;
//!
//! # async fn app(tenant: Arc<dyn veld_proto::tenant::Tenant>) -> veld_proto::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5656").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     tokio::spawn(Connection::new(socket, tenant.clone()).serve());
//! }
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod message;

// Data model
pub mod query;

// Collaborator seams
pub mod backend;
pub mod compiler;
pub mod tenant;
pub mod view;

// Operation
pub mod auth;
pub mod connection;
mod dump;
mod execute;
mod restore;

// Accept loop
pub mod server;

mod error;

#[cfg(test)]
pub(crate) mod testing;

#[doc(inline)]
pub use connection::Connection;
#[doc(inline)]
pub use error::{BackendError, Error, ErrorKind, Result, codes};
#[doc(inline)]
pub use message::{CURRENT_PROTOCOL, MIN_PROTOCOL, ProtocolVersion};
