//! # record: flat key-value records and the text file parser
//!
//! A [`Record`] is one table row: a flat map of field name to string value.
//! Files are read one field per line, as `key = value` or `key=value`, with
//! optional double quotes around either side:
//!
//! ```text
//! id = "abc123"
//! name="Widget"
//! ```
//!
//! After all lines are read the identity fields are filled in from
//! [`IdentityConfig`]: a missing `PartitionKey` takes the default partition,
//! a missing `RowKey` is copied from the first fallback field present.
//!
//! Any malformed line fails the whole file; there is no partial result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::config::IdentityConfig;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";

/// One table row. Keys are kept sorted so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Inserts or overwrites a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(field.into(), value.into())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.get(PARTITION_KEY)
    }

    pub fn row_key(&self) -> Option<&str> {
        self.get(ROW_KEY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Builds a record from a JSON object returned by a backend.
    ///
    /// String values are taken as-is, `null` values are dropped and any other
    /// value is kept in its JSON text form.
    pub fn from_json_object(object: serde_json::Map<String, serde_json::Value>) -> Self {
        object
            .into_iter()
            .filter_map(|(field, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((field, s)),
                other => Some((field, other.to_string())),
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Record {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read record file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line_number}: expected `key = value`, got {line:?}")]
    MalformedLine { line_number: usize, line: String },
    #[error(
        "no RowKey: provide a field named \"{}\" with a unique value",
        .fallbacks.join("\" or \"")
    )]
    MissingRowKey { fallbacks: Vec<String> },
}

/// Reads and parses a record file, then applies the identity rules.
///
/// The file is streamed line by line and closed before returning, on success
/// and on failure alike.
pub fn parse_file<P: AsRef<Path>>(path: P, config: &IdentityConfig) -> Result<Record, ParseError> {
    let path = path.as_ref();
    info!(path = %path.display(), "Parsing record file");

    let io_error = |source: std::io::Error| {
        error!(path = %path.display(), error = %source, "Failed to read record file");
        ParseError::Io {
            path: path.to_path_buf(),
            source,
        }
    };

    let file = File::open(path).map_err(io_error)?;
    let mut record = Record::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error)?;
        parse_line_into(&mut record, index + 1, &line)?;
    }
    apply_identity_defaults(&mut record, config)?;

    info!(
        path = %path.display(),
        fields = record.len(),
        partition_key = record.partition_key().unwrap_or_default(),
        row_key = record.row_key().unwrap_or_default(),
        "Parsed record file"
    );
    Ok(record)
}

/// Same rules as [`parse_file`], over text already in memory.
pub fn parse_str(text: &str, config: &IdentityConfig) -> Result<Record, ParseError> {
    let mut record = Record::new();
    for (index, line) in text.lines().enumerate() {
        parse_line_into(&mut record, index + 1, line)?;
    }
    apply_identity_defaults(&mut record, config)?;
    Ok(record)
}

fn parse_line_into(record: &mut Record, line_number: usize, line: &str) -> Result<(), ParseError> {
    // Editors on Windows often save with a byte order mark.
    let line = match line_number {
        1 => line.strip_prefix('\u{feff}').unwrap_or(line),
        _ => line,
    };
    if line.trim().is_empty() {
        return Ok(());
    }
    match split_line(line) {
        Some((key, value)) => {
            if let Some(previous) = record.insert(key, value) {
                debug!(line_number, key, previous = %previous, "Duplicate key overwritten");
            }
            Ok(())
        }
        None => {
            error!(line_number, line, "Malformed record line");
            Err(ParseError::MalformedLine {
                line_number,
                line: line.to_string(),
            })
        }
    }
}

/// Splits `key = value` (or `key=value`) on the first `=` and unquotes both sides.
/// Returns `None` when there is no separator or the key is empty.
pub fn split_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = strip_quotes(key.trim());
    if key.is_empty() {
        return None;
    }
    Some((key, strip_quotes(value.trim())))
}

/// Removes one pair of enclosing double quotes; one-sided quotes are kept.
fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

/// Fills in `PartitionKey` and `RowKey` when the source did not provide them.
///
/// Empty values do not count as an identity: an empty `PartitionKey` is
/// replaced by the default and empty fallback fields are skipped.
pub fn apply_identity_defaults(
    record: &mut Record,
    config: &IdentityConfig,
) -> Result<(), ParseError> {
    if record.partition_key().map_or(true, str::is_empty) {
        record.insert(PARTITION_KEY, config.default_partition_key.clone());
    }
    if record.row_key().is_some_and(|k| !k.is_empty()) {
        return Ok(());
    }

    let derived = config
        .row_key_fallbacks
        .iter()
        .find_map(|field| record.get(field).filter(|v| !v.is_empty()))
        .map(str::to_owned);

    match derived {
        Some(row_key) => {
            debug!(row_key = %row_key, "Derived RowKey from fallback field");
            record.insert(ROW_KEY, row_key);
            Ok(())
        }
        None => Err(ParseError::MissingRowKey {
            fallbacks: config.row_key_fallbacks.clone(),
        }),
    }
}
