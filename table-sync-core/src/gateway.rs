//! Table operations as the CLI sees them, expressed over any [`TableGateway`].
//!
//! These are thin: each one is a single backend call, with three policies
//! layered on top:
//!   - a missing partition key falls back to [`IdentityConfig::default_partition_key`]
//!   - `get` never fails; backend errors are logged and reported as not found
//!   - `query` fetches pages lazily and treats an empty field list as "all fields"
//!
//! Nothing here retries, caches or rewrites results.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::config::IdentityConfig;
use crate::contract::{Continuation, GatewayError, TableGateway};
use crate::record::Record;

/// Insert or fully replace the row identified by the record's identity fields.
pub async fn upsert<G>(table: &G, record: &Record) -> Result<(), GatewayError>
where
    G: TableGateway + ?Sized,
{
    info!(
        partition_key = record.partition_key().unwrap_or_default(),
        row_key = record.row_key().unwrap_or_default(),
        fields = record.len(),
        "Upserting entry"
    );
    match table.upsert_entity(record).await {
        Ok(()) => {
            info!("Upsert succeeded");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Upsert failed");
            Err(e)
        }
    }
}

/// Look up one row. Returns `None` both when the row does not exist and when
/// the backend call fails.
pub async fn get<G>(
    table: &G,
    row_key: &str,
    partition_key: Option<&str>,
    config: &IdentityConfig,
) -> Option<Record>
where
    G: TableGateway + ?Sized,
{
    let partition_key = config.partition_key_or_default(partition_key);
    info!(partition_key, row_key, "Fetching entry");
    match table.get_entity(partition_key, row_key).await {
        Ok(Some(record)) => {
            info!(fields = record.len(), "Entry found");
            Some(record)
        }
        Ok(None) => {
            info!(partition_key, row_key, "Entry not found");
            None
        }
        Err(e) => {
            warn!(error = %e, partition_key, row_key, "Fetch failed, reporting entry as not found");
            None
        }
    }
}

/// Delete one row with a single backend call.
pub async fn delete<G>(
    table: &G,
    row_key: &str,
    partition_key: Option<&str>,
    config: &IdentityConfig,
) -> Result<(), GatewayError>
where
    G: TableGateway + ?Sized,
{
    let partition_key = config.partition_key_or_default(partition_key);
    info!(partition_key, row_key, "Deleting entry");
    table
        .delete_entity(partition_key, row_key)
        .await
        .inspect(|_| info!(partition_key, row_key, "Entry deleted"))
        .inspect_err(|e| error!(error = %e, partition_key, row_key, "Delete failed"))
}

/// An empty projection means every column, same as no projection.
pub fn normalize_fields(fields: Option<Vec<String>>) -> Option<Vec<String>> {
    fields.filter(|f| !f.is_empty())
}

enum PageCursor {
    First,
    Next(Continuation),
    Done,
}

/// Stream every row matching `filter`, following continuation tokens.
///
/// Nothing is requested until the stream is polled, and each further page is
/// requested only once the previous one has been consumed. The first error
/// ends the stream.
pub fn query<'a, G>(
    table: &'a G,
    filter: Option<String>,
    fields: Option<Vec<String>>,
) -> BoxStream<'a, Result<Record, GatewayError>>
where
    G: TableGateway + ?Sized,
{
    let select = normalize_fields(fields);
    info!(filter = ?filter, select = ?select, "Starting query");

    stream::try_unfold(PageCursor::First, move |cursor| {
        let filter = filter.clone();
        let select = select.clone();
        async move {
            let continuation = match cursor {
                PageCursor::First => None,
                PageCursor::Next(c) => Some(c),
                PageCursor::Done => return Ok(None),
            };
            let page = table
                .query_page(filter, select, continuation)
                .await
                .inspect_err(|e| error!(error = %e, "Query page failed"))?;
            debug!(
                rows = page.records.len(),
                more = page.continuation.is_some(),
                "Fetched query page"
            );
            let next = match page.continuation {
                Some(c) => PageCursor::Next(c),
                None => PageCursor::Done,
            };
            let rows = stream::iter(page.records.into_iter().map(Ok::<Record, GatewayError>));
            Ok::<_, GatewayError>(Some((rows, next)))
        }
    })
    .try_flatten()
    .boxed()
}
