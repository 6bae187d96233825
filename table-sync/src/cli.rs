///
/// This module implements the CLI interface for table-sync: command parsing, argument
/// resolution, and dispatch of one table operation per invocation.
///
/// All parsing rules and gateway policies live in the [`table-sync-core`] crate; the
/// concrete table-service client lives in [`crate::storage`]. This module is glue.
///
/// ## Commands
/// - `publish`: parse a record file and insert-or-replace it as one row
/// - `get`: print one row as JSON (`null` when absent)
/// - `delete`: remove one row
/// - `query`: stream matching rows, one JSON object per line
/// - `help`: usage (provided by clap)
///
/// ## How To Use
/// - For command-line users: run `table-sync --help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// Every command resolves its inputs (and parses its record file, if any) before the
/// first request is sent, so usage and parse errors never touch the backend.
///
/// [`table-sync-core`]: ../../table_sync_core/
use crate::load_config::{self, TableTarget};
use crate::storage::{TableClient, TableServiceClient};
use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use table_sync_core::gateway;
use table_sync_core::record::parse_file;
use table_sync_core::IdentityConfig;

/// CLI for table-sync: publish key-value files as table rows and read them back.
#[derive(Parser, Debug)]
#[clap(
    name = "table-sync",
    version,
    about = "Publish key-value text files as rows of an Azure/Cosmos table, and get, delete or query them"
)]
pub struct Cli {
    /// Partition used when a file or lookup names none [env: DEFAULT_PARTITION_KEY] [default: pkey]
    #[clap(long, global = true)]
    pub default_partition_key: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Where the rows live. Both fall back to the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct TableArgs {
    /// Table service connection string [env: CONNECTION_STRING]
    pub connection_string: Option<String>,
    /// Table name, created if it does not exist [env: TABLE_NAME]
    pub table_name: Option<String>,
}

/// Which row. `--row-key` wins over the identity parsed from FILE.
#[derive(Args, Debug, Clone, Default)]
pub struct RowArgs {
    /// Record file whose PartitionKey/RowKey identify the row [env: FILE_PATH]
    pub file: Option<PathBuf>,
    /// Row key to use instead of reading a file
    #[clap(long)]
    pub row_key: Option<String>,
    /// Partition of the row (defaults to the default partition key)
    #[clap(long)]
    pub partition_key: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a key-value file and insert or replace it as one row
    Publish {
        #[clap(flatten)]
        table: TableArgs,
        /// Path to the key-value record file [env: FILE_PATH]
        file: Option<PathBuf>,
    },
    /// Print one row as JSON, or null if it does not exist
    Get {
        #[clap(flatten)]
        table: TableArgs,
        #[clap(flatten)]
        row: RowArgs,
    },
    /// Delete one row
    Delete {
        #[clap(flatten)]
        table: TableArgs,
        #[clap(flatten)]
        row: RowArgs,
    },
    /// Print every matching row as one JSON object per line
    Query {
        #[clap(flatten)]
        table: TableArgs,
        /// Filter expression, e.g. "name eq 'Widget' and size gt 10" (all rows if omitted)
        #[clap(short = 'q', long = "query")]
        filter: Option<String>,
        /// Field to return; repeat the flag or separate with commas (all fields if omitted)
        #[clap(short = 'f', long = "fields", action = ArgAction::Append, value_delimiter = ',')]
        fields: Option<Vec<String>>,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let identity = load_config::identity_config(cli.default_partition_key);
    identity.trace_loaded();

    match cli.command {
        Commands::Publish { table, file } => {
            let target = load_config::resolve_target(
                "publish",
                table.connection_string,
                table.table_name,
            )?;
            let path = load_config::resolve_file_path("publish", file)?;
            let record = parse_file(&path, &identity)
                .with_context(|| format!("publish: could not parse {}", path.display()))?;
            tracing::info!(command = "publish", path = %path.display(), "Publishing record");

            let table = open_table(&target).await?;
            gateway::upsert(&table, &record)
                .await
                .context("publish: upsert failed")?;
            tracing::info!(command = "publish", table = %target.table_name, "Publish complete");
            Ok(())
        }
        Commands::Get { table, row } => {
            let target = load_config::resolve_target(
                "get",
                table.connection_string,
                table.table_name,
            )?;
            let (row_key, partition_key) = resolve_row("get", row, &identity)?;

            let table = open_table(&target).await?;
            let found =
                gateway::get(&table, &row_key, partition_key.as_deref(), &identity).await;
            println!("{}", serde_json::to_string_pretty(&found)?);
            Ok(())
        }
        Commands::Delete { table, row } => {
            let target = load_config::resolve_target(
                "delete",
                table.connection_string,
                table.table_name,
            )?;
            let (row_key, partition_key) = resolve_row("delete", row, &identity)?;

            let table = open_table(&target).await?;
            gateway::delete(&table, &row_key, partition_key.as_deref(), &identity)
                .await
                .context("delete failed")?;
            tracing::info!(command = "delete", row_key = %row_key, "Delete complete");
            Ok(())
        }
        Commands::Query {
            table,
            filter,
            fields,
        } => {
            let target = load_config::resolve_target(
                "query",
                table.connection_string,
                table.table_name,
            )?;

            let table = open_table(&target).await?;
            let mut rows = gateway::query(&table, filter, fields);
            let mut count = 0usize;
            while let Some(record) = rows.try_next().await.context("query failed")? {
                println!("{}", serde_json::to_string(&record)?);
                count += 1;
            }
            tracing::info!(command = "query", rows = count, "Query complete");
            Ok(())
        }
    }
}

/// Connects and opens (creating if needed) the target table.
async fn open_table(target: &TableTarget) -> Result<TableClient> {
    let client = TableServiceClient::from_connection_string(&target.connection_string)?;
    let table = client
        .create_table_if_not_exists(&target.table_name)
        .await
        .with_context(|| format!("could not open table {}", target.table_name))?;
    Ok(table)
}

/// Row key and optional partition key for get/delete: from `--row-key`, or
/// from the identity of the parsed record file.
fn resolve_row(
    command: &'static str,
    row: RowArgs,
    identity: &IdentityConfig,
) -> Result<(String, Option<String>)> {
    if let Some(row_key) = row.row_key {
        return Ok((row_key, row.partition_key));
    }
    let Some(path) = load_config::file_path(row.file) else {
        return Err(load_config::UsageError::MissingIdentity { command }.into());
    };
    let record = parse_file(&path, identity)
        .with_context(|| format!("{command}: could not parse {}", path.display()))?;
    let row_key = record
        .row_key()
        .context("parsed record has no RowKey")?
        .to_string();
    let partition_key = row
        .partition_key
        .or_else(|| record.partition_key().map(str::to_owned));
    Ok((row_key, partition_key))
}
