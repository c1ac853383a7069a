//! The per-database session view seam.
//!
//! The view owns the frontend's picture of session state: the transaction
//! state machine, session config and globals, and the per-view compiled
//! query cache. The protocol engine reads and drives it but never owns the
//! data; real implementations live with the tenant.
use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use uuid::Uuid;

use crate::{
    error::Result,
    query::{CompiledQuery, ConfigOp, QueryRequest, QueryUnit},
};

/// The shape of the current session state.
#[derive(Debug, Clone)]
pub struct StateDescriptor {
    pub type_id: Uuid,
    pub typedesc: Bytes,
}

/// A single connection's view over one database.
///
/// All methods are synchronous: the view is a state machine, not an I/O
/// surface. It is driven by exactly one connection task, so no locking
/// happens at this level.
pub trait ConnectionView: Send + Sync {
    fn user(&self) -> &str;
    fn dbname(&self) -> &str;

    // Transaction state machine.
    fn in_tx(&self) -> bool;
    fn in_tx_error(&self) -> bool;
    /// Mark the current transaction as failed.
    fn tx_error(&mut self);
    fn clear_tx_error(&mut self);
    fn abort_tx(&mut self);
    fn declare_savepoint(&mut self, name: &str);
    fn rollback_to_savepoint(&mut self, name: &str);

    // Unit lifecycle.
    fn start(&mut self, unit: &QueryUnit) -> Result<()>;
    fn start_implicit(&mut self, unit: &QueryUnit);
    /// Returns the side-effect bits this unit produced (see
    /// [`side_effect`][crate::query::side_effect]).
    fn on_success(&mut self, unit: &QueryUnit, new_types: Option<&[(Uuid, u32)]>) -> u64;
    fn on_error(&mut self);
    /// Commit the implicit script transaction, returning deferred
    /// side-effect bits.
    fn commit_implicit_tx(&mut self) -> u64;
    fn signal_side_effects(&mut self, effects: u64);

    // Session state.
    fn serialize_state(&self) -> Bytes;
    fn state_descriptor(&self) -> StateDescriptor;
    fn decode_state(&mut self, type_id: Uuid, data: &[u8]) -> Result<()>;
    /// Ensure the state serializer is present, reloading it if the schema
    /// changed underneath.
    fn reload_state_serializer(&mut self) -> Result<()>;

    // Compiled query cache.
    fn lookup_compiled(&mut self, request: &QueryRequest) -> Option<CompiledQuery>;
    fn cache_compiled(&mut self, request: QueryRequest, compiled: &CompiledQuery);

    // Config.
    fn apply_config_ops(&mut self, ops: &[ConfigOp]) -> Result<()>;

    /// Resolve a source schema type id to this database's backend type id;
    /// used for data mending during restore.
    fn resolve_backend_type_id(&self, schema_type_id: Uuid) -> Result<u32>;
}

const DEFAULT_QUERY_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(256).unwrap();

/// An LRU compiled-query cache keyed by the request fingerprint.
///
/// View implementations embed one of these; the engine only sees the
/// [`ConnectionView`] lookup/insert pair.
#[derive(Debug)]
pub struct QueryCache {
    queries: LruCache<QueryRequest, CompiledQuery>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self { queries: LruCache::new(DEFAULT_QUERY_CACHE_SIZE) }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self { queries: LruCache::new(capacity) }
    }

    pub fn get(&mut self, request: &QueryRequest) -> Option<CompiledQuery> {
        self.queries.get(request).cloned()
    }

    pub fn insert(&mut self, request: QueryRequest, compiled: CompiledQuery) {
        if !compiled.group.cacheable() {
            return;
        }
        self.queries.push(request, compiled);
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
