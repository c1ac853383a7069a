//! Peer authentication: SASL (SCRAM-SHA-256) and JWT bearer tokens.
pub mod jwt;
pub mod scram;
