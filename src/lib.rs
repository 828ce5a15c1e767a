//! Core of a binary-protocol client for a query-capable database server.
//!
//! This crate owns the query-execution pipeline: the wire-protocol state
//! machine, the type-descriptor/codec subsystem, the granular-flow
//! Parse/Execute loop, the connection pool, and the transaction retry
//! runner. DSN resolution, config-file loading, the full convenience API,
//! and reflection-based struct mapping are external collaborators and live
//! outside this crate; they consume the types exposed here.

#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    unused_qualifications
)]

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod query;
pub mod retry;

pub use config::{ConnectionConfig, RootCertSource, TlsSecurity};
pub use connection::pool::{ConnectionEvent, Pool};
pub use connection::reconnecting::ReconnectingConnection;
pub use connection::transactable::Transactable;
pub use error::{Error, ErrorCategory, Result};
pub use protocol::ProtocolVersion;
pub use query::{Cardinality, Format, Query};
pub use retry::{RetryRule, TxOptions};
