//! The tenant seam.
//!
//! The tenant owns everything that outlives a single connection: the
//! backend connection pool, the per-database views, the auth policy and
//! JWT keys, and instance-wide configuration. The engine holds one
//! `Arc<dyn Tenant>` per connection.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, DecodingKey};

use crate::{
    backend::BackendConn,
    compiler::Compiler,
    error::Result,
    query::{ConfigOp, QueryUnit},
    view::ConnectionView,
};

/// Whether the instance currently accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Administratively blocked; connections are refused with a retryable
    /// error.
    Blocked,
    /// The server is shutting down or failing over.
    Offline,
}

/// Authentication methods, in policy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Trust,
    Scram,
    Jwt,
}

/// Stored SCRAM-SHA-256 verifier for one role.
///
/// The server never sees the password; it keeps only the derived keys.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

/// A JWT validation key with its fixed algorithm family.
pub struct JwtKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

impl JwtKey {
    /// Load a key from PEM material, inferring the family from the
    /// algorithm.
    pub fn from_pem(pem: &[u8], algorithm: Algorithm) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 => DecodingKey::from_ec_pem(pem),
            _ => {
                return Err(crate::error::Error::auth(
                    "unsupported JWT signing algorithm",
                ));
            }
        }
        .map_err(|e| crate::error::Error::auth(format!("invalid JWT key: {e}")))?;
        Ok(Self { key, algorithm })
    }
}

#[async_trait]
pub trait Tenant: Send + Sync {
    fn readiness(&self) -> Readiness;

    fn instance_name(&self) -> &str;
    fn server_version(&self) -> &str;
    fn catalog_version(&self) -> i64;

    // Auth policy.
    fn auth_methods(&self) -> Vec<AuthMethod>;
    fn scram_verifier(&self, user: &str) -> Option<ScramVerifier>;
    fn jwt_key(&self) -> Option<&JwtKey>;
    /// Tenant-level claim hook; key rotation and revocation live here.
    fn check_jwt_claims(&self, claims: &serde_json::Value) -> Result<()>;

    fn database_accepts_connections(&self, dbname: &str) -> bool;

    /// Create the session view for an authenticated connection.
    async fn new_view(&self, dbname: &str, user: &str) -> Result<Box<dyn ConnectionView>>;

    // Backend pool.
    async fn acquire_backend(&self, dbname: &str) -> Result<Box<dyn BackendConn>>;
    async fn release_backend(&self, conn: Box<dyn BackendConn>);

    fn compiler(&self) -> Arc<dyn Compiler>;

    // Startup status values.
    fn suggested_pool_concurrency(&self) -> usize;
    fn system_config_json(&self) -> Bytes;
    /// Backend address for dev tooling; passwords already redacted.
    /// `None` outside dev mode.
    fn dev_pgaddr(&self) -> Option<String>;

    // System config hooks.
    async fn before_system_config(&self, unit: &QueryUnit) -> Result<()>;
    async fn apply_system_config(&self, ops: &[ConfigOp]) -> Result<()>;

    // Database lifecycle hooks.
    async fn on_before_create_db_from_template(&self, template: &str) -> Result<()>;
    async fn on_before_drop_db(&self, dbname: &str) -> Result<()>;

    /// Kick off an asynchronous re-introspection of a database, e.g. after
    /// a restore replaced its schema.
    async fn introspect_db(&self, dbname: &str);
}
