#![allow(unused)]

//! # contract: the backend seam
//!
//! [`TableGateway`] is everything table-sync needs from a table-storage
//! backend: whole-row upsert, point get, point delete, and one page of a
//! filtered query. A gateway is bound to one table of one account for its
//! whole lifetime.
//!
//! ## Implementors
//! - `table_sync::storage::TableClient` talks to the Azure Table service.
//! - [`MockTableGateway`] (generated by `mockall`) for tests.
//!
//! ## Errors
//! Implementors map every transport or service failure to a [`GatewayError`].
//! A missing row is not an error for [`TableGateway::get_entity`]; it is
//! `Ok(None)`.

use async_trait::async_trait;

use mockall::{automock, predicate::*};

use crate::record::Record;

/// Where the next page of a query starts. Returned by the backend when a
/// result set does not fit in one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<Record>,
    /// `None` on the last page.
    pub continuation: Option<Continuation>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The connection string is unusable or the service could not be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// The service rejected or failed a request.
    #[error("backend error: {message}")]
    Backend {
        status: Option<u16>,
        message: String,
    },
}

impl GatewayError {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        GatewayError::Backend {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::Backend { status: Some(404), .. })
    }
}

/// Trait for the four row operations against one table.
///
/// The trait is `Send` + `Sync` and intended for async/await usage.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TableGateway: Send + Sync {
    /// Insert the row, or fully replace an existing row with the same
    /// (PartitionKey, RowKey). Fields absent from `record` are removed.
    async fn upsert_entity(&self, record: &Record) -> Result<(), GatewayError>;

    /// Fetch one row. A missing row is `Ok(None)`.
    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Record>, GatewayError>;

    /// Delete one row, with whatever not-found semantics the backend has.
    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), GatewayError>;

    /// Fetch one page of rows matching `filter` (all rows when `None`),
    /// projected to `select` (all columns when `None`).
    async fn query_page(
        &self,
        filter: Option<String>,
        select: Option<Vec<String>>,
        continuation: Option<Continuation>,
    ) -> Result<QueryPage, GatewayError>;
}
