#![doc = "table-sync-core: core logic library for table-sync."]

//! This crate contains the transport-free logic of table-sync: the key-value
//! record parser, the identity rules it applies, the [`contract::TableGateway`]
//! trait that backends implement, and the gateway operations built on it.
//! Storage clients and the CLI live in the `table-sync` crate.
//!
//! # Usage
//! Parse a file with [`record::parse_file`], then hand the [`record::Record`]
//! to [`gateway::upsert`] with any `TableGateway` implementation.

pub mod config;
pub mod contract;
pub mod gateway;
pub mod record;

pub use config::IdentityConfig;
pub use contract::{Continuation, GatewayError, QueryPage, TableGateway};
pub use record::{ParseError, Record};
