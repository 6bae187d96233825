/// `load_config` module: resolves what a single invocation operates on (connection string,
/// table name, record file, identity defaults) from CLI arguments with environment fallback.
///
/// This module is the only place that reads configuration from the environment. A `.env`
/// file, if present, has already been loaded into the environment by `main` before any of
/// these functions run.
///
/// # Precedence
/// 1. Value given on the command line
/// 2. Environment variable (`CONNECTION_STRING`, `TABLE_NAME`, `FILE_PATH`,
///    `DEFAULT_PARTITION_KEY`)
///
/// Empty environment values count as unset.
///
/// # Errors
/// A required value missing from both sources is a [`UsageError`] naming the subcommand,
/// raised before any file is parsed or any backend call is made.
use std::env;
use std::fmt;
use std::path::PathBuf;
use table_sync_core::IdentityConfig;
use tracing::{error, info};

pub const CONNECTION_STRING_ENV: &str = "CONNECTION_STRING";
pub const TABLE_NAME_ENV: &str = "TABLE_NAME";
pub const FILE_PATH_ENV: &str = "FILE_PATH";
pub const DEFAULT_PARTITION_KEY_ENV: &str = "DEFAULT_PARTITION_KEY";

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("{command}: missing {what}; pass it as an argument or set {env_var}\nusage: {}", usage(.command))]
    Missing {
        command: &'static str,
        what: &'static str,
        env_var: &'static str,
    },
    #[error("{command}: provide either a record file or --row-key\nusage: {}", usage(.command))]
    MissingIdentity { command: &'static str },
}

/// One-line usage for a subcommand, shown with usage errors.
pub fn usage(command: &str) -> &'static str {
    match command {
        "publish" => "table-sync publish [CONNECTION_STRING] [TABLE_NAME] [FILE]",
        "get" => "table-sync get [CONNECTION_STRING] [TABLE_NAME] [FILE] [--row-key <KEY>] [--partition-key <KEY>]",
        "delete" => "table-sync delete [CONNECTION_STRING] [TABLE_NAME] [FILE] [--row-key <KEY>] [--partition-key <KEY>]",
        "query" => "table-sync query [CONNECTION_STRING] [TABLE_NAME] [-q <FILTER>] [-f <FIELD>[,<FIELD>...]]...",
        _ => "table-sync <publish|get|delete|query|help> ...",
    }
}

/// The table an invocation talks to.
#[derive(Clone)]
pub struct TableTarget {
    pub connection_string: String,
    pub table_name: String,
}

impl fmt::Debug for TableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableTarget")
            .field("connection_string", &"<redacted>")
            .field("table_name", &self.table_name)
            .finish()
    }
}

fn arg_or_env(arg: Option<String>, env_var: &str) -> Option<String> {
    arg.or_else(|| env::var(env_var).ok())
        .filter(|v| !v.trim().is_empty())
}

/// Resolves connection string and table name for `command`.
pub fn resolve_target(
    command: &'static str,
    connection_string: Option<String>,
    table_name: Option<String>,
) -> Result<TableTarget, UsageError> {
    let Some(connection_string) = arg_or_env(connection_string, CONNECTION_STRING_ENV) else {
        error!(command, "No connection string given");
        return Err(UsageError::Missing {
            command,
            what: "connection string",
            env_var: CONNECTION_STRING_ENV,
        });
    };
    let Some(table_name) = arg_or_env(table_name, TABLE_NAME_ENV) else {
        error!(command, "No table name given");
        return Err(UsageError::Missing {
            command,
            what: "table name",
            env_var: TABLE_NAME_ENV,
        });
    };
    info!(command, table = %table_name, "Resolved table target");
    Ok(TableTarget {
        connection_string,
        table_name,
    })
}

/// Resolves the record file path for `command`, or `None` when neither the
/// argument nor `FILE_PATH` is set.
pub fn file_path(file: Option<PathBuf>) -> Option<PathBuf> {
    file.or_else(|| arg_or_env(None, FILE_PATH_ENV).map(PathBuf::from))
}

/// Like [`file_path`], but a missing file is a usage error.
pub fn resolve_file_path(
    command: &'static str,
    file: Option<PathBuf>,
) -> Result<PathBuf, UsageError> {
    file_path(file).ok_or_else(|| {
        error!(command, "No record file given");
        UsageError::Missing {
            command,
            what: "record file",
            env_var: FILE_PATH_ENV,
        }
    })
}

/// Identity rules for this invocation: the default partition key may be
/// overridden by flag or `DEFAULT_PARTITION_KEY`.
pub fn identity_config(default_partition_key: Option<String>) -> IdentityConfig {
    match arg_or_env(default_partition_key, DEFAULT_PARTITION_KEY_ENV) {
        Some(partition_key) => IdentityConfig::with_default_partition_key(partition_key),
        None => IdentityConfig::default(),
    }
}
