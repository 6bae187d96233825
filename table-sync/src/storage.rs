#![doc = "Azure Table service client: implements the core `TableGateway` trait over the Table REST API."]
//
//! # Storage client (CLI <-> Table service)
//!
//! This module is the bridge between the gateway operations in
//! [`table_sync_core::gateway`] and a real table-storage account. It covers
//! both Azure Storage tables and the Cosmos DB Table API, which speak the
//! same protocol.
//!
//! ## Client Usage
//!
//! - Build a [`TableServiceClient`] from a connection string
//!   ([`TableServiceClient::from_connection_string`]). The string is only
//!   parsed here; the account is first contacted by the next call.
//! - Get a [`TableClient`] with [`TableServiceClient::create_table_if_not_exists`].
//! - Use the [`TableGateway`] trait methods on the `TableClient`.
//!
//! Connection strings may authenticate with `AccountKey` (Shared Key Lite
//! signing) or `SharedAccessSignature`, and may set `UseDevelopmentStorage=true`
//! for the local emulator.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use table_sync_core::contract::{Continuation, GatewayError, QueryPage, TableGateway};
use table_sync_core::Record;

const API_VERSION: &str = "2019-02-02";
const JSON_NO_METADATA: &str = "application/json;odata=nometadata";
const NEXT_PARTITION_KEY_HEADER: &str = "x-ms-continuation-nextpartitionkey";
const NEXT_ROW_KEY_HEADER: &str = "x-ms-continuation-nextrowkey";

const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_TABLE_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";

#[derive(Clone)]
enum Credential {
    SharedKey(Vec<u8>),
    Sas(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey(_) => f.write_str("SharedKey(<redacted>)"),
            Credential::Sas(_) => f.write_str("Sas(<redacted>)"),
        }
    }
}

/// Parsed form of a table-storage connection string.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub account_name: String,
    pub endpoint: Url,
    credential: Credential,
}

impl ConnectionSettings {
    /// Parses `Key=Value;Key=Value` connection strings. Keys are matched
    /// case-insensitively; values keep any `=` they contain.
    pub fn parse(connection_string: &str) -> Result<Self, GatewayError> {
        let mut pairs: HashMap<String, String> = HashMap::new();
        for segment in connection_string
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                GatewayError::Connection(
                    "malformed connection string: every segment must be Key=Value".to_string(),
                )
            })?;
            pairs.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let development = pairs
            .get("usedevelopmentstorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if development {
            pairs
                .entry("accountname".into())
                .or_insert_with(|| DEV_ACCOUNT_NAME.into());
            pairs
                .entry("accountkey".into())
                .or_insert_with(|| DEV_ACCOUNT_KEY.into());
            pairs
                .entry("tableendpoint".into())
                .or_insert_with(|| DEV_TABLE_ENDPOINT.into());
        }

        let account_name = pairs.get("accountname").cloned();
        let endpoint = match (pairs.get("tableendpoint"), &account_name) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(account)) => {
                let protocol = pairs
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = pairs
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{protocol}://{account}.table.{suffix}")
            }
            (None, None) => {
                return Err(GatewayError::Connection(
                    "connection string needs AccountName or TableEndpoint".to_string(),
                ))
            }
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| GatewayError::Connection(format!("invalid table endpoint: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(GatewayError::Connection(
                "invalid table endpoint: not a base URL".to_string(),
            ));
        }

        let credential = match (pairs.get("accountkey"), pairs.get("sharedaccesssignature")) {
            (Some(key), _) => {
                let key = STANDARD.decode(key).map_err(|_| {
                    GatewayError::Connection("AccountKey is not valid base64".to_string())
                })?;
                Credential::SharedKey(key)
            }
            (None, Some(sas)) => Credential::Sas(sas.trim_start_matches('?').to_string()),
            (None, None) => {
                return Err(GatewayError::Connection(
                    "connection string needs AccountKey or SharedAccessSignature".to_string(),
                ))
            }
        };

        let account_name = match (account_name, &credential) {
            (Some(name), _) => name,
            (None, Credential::Sas(_)) => endpoint
                .host_str()
                .and_then(|h| h.split('.').next())
                .unwrap_or_default()
                .to_string(),
            (None, Credential::SharedKey(_)) => {
                return Err(GatewayError::Connection(
                    "AccountKey given without AccountName".to_string(),
                ))
            }
        };

        Ok(ConnectionSettings {
            account_name,
            endpoint,
            credential,
        })
    }

    /// Endpoint URL with one extra, percent-encoded, path segment.
    fn resource_url(&self, segment: &str) -> Result<Url, GatewayError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Connection("table endpoint is not a base URL".to_string()))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    /// Builds a request with the service headers and credentials applied.
    /// `url` must already carry every query parameter except the SAS token.
    fn request(&self, http: &Client, method: Method, mut url: Url) -> RequestBuilder {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();

        let authorization = match &self.credential {
            Credential::SharedKey(key) => {
                let resource = canonicalized_resource(&self.account_name, &url);
                let signature = shared_key_lite_signature(key, &date, &resource);
                Some(format!("SharedKeyLite {}:{}", self.account_name, signature))
            }
            Credential::Sas(token) => {
                let query = match url.query() {
                    Some(q) if !q.is_empty() => format!("{q}&{token}"),
                    _ => token.clone(),
                };
                url.set_query(Some(&query));
                None
            }
        };

        let builder = http
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("DataServiceVersion", "3.0")
            .header("MaxDataServiceVersion", "3.0;NetFx")
            .header(ACCEPT, JSON_NO_METADATA);
        match authorization {
            Some(value) => builder.header(AUTHORIZATION, value),
            None => builder,
        }
    }
}

fn canonicalized_resource(account_name: &str, url: &Url) -> String {
    format!("/{}{}", account_name, url.path())
}

/// Shared Key Lite signature for the Table service: HMAC-SHA256 over
/// `date + "\n" + canonicalized resource`, base64 encoded.
fn shared_key_lite_signature(key: &[u8], date: &str, canonicalized_resource: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(date.as_bytes());
    mac.update(b"\n");
    mac.update(canonicalized_resource.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Single quotes inside OData key literals are escaped by doubling.
fn odata_key_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn continuation_from_headers(headers: &HeaderMap) -> Option<Continuation> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    header(NEXT_PARTITION_KEY_HEADER).map(|next_partition_key| Continuation {
        next_partition_key,
        next_row_key: header(NEXT_ROW_KEY_HEADER),
    })
}

/// Turns a non-success response into a backend error carrying the service's
/// error code and message when the body has them.
async fn error_from_response(response: Response) -> GatewayError {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(rename = "odata.error")]
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        code: String,
        message: ErrorMessage,
    }
    #[derive(Deserialize)]
    struct ErrorMessage {
        value: String,
    }

    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<failed to decode response body>"));
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => format!("{status} {}: {}", parsed.error.code, parsed.error.message.value),
        Err(_) => format!("{status}: {body}"),
    };
    GatewayError::backend(Some(status.as_u16()), message)
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::backend(e.status().map(|s| s.as_u16()), format!("request failed: {e}"))
}

/// Account-level handle: knows how to reach the service, not bound to a table.
#[derive(Debug, Clone)]
pub struct TableServiceClient {
    http: Client,
    settings: Arc<ConnectionSettings>,
}

impl TableServiceClient {
    pub fn from_connection_string(connection_string: &str) -> Result<Self, GatewayError> {
        let settings = ConnectionSettings::parse(connection_string).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse connection string");
            e
        })?;
        tracing::info!(
            account = %settings.account_name,
            endpoint = %settings.endpoint,
            "Initialized TableServiceClient from connection string"
        );
        Ok(TableServiceClient {
            http: Client::new(),
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Creates `table_name` unless it already exists, and returns a client
    /// bound to it. An existing table is not an error.
    pub async fn create_table_if_not_exists(
        &self,
        table_name: &str,
    ) -> Result<TableClient, GatewayError> {
        tracing::info!(table = table_name, "Ensuring table exists");
        let url = self.settings.resource_url("Tables")?;
        let response = self
            .settings
            .request(&self.http, Method::POST, url)
            .header("Prefer", "return-no-content")
            .json(&serde_json::json!({ "TableName": table_name }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, table = table_name, "Could not reach table service");
                GatewayError::Connection(format!("could not reach table service: {e}"))
            })?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!(table = table_name, "Created table");
            }
            StatusCode::CONFLICT => {
                tracing::info!(table = table_name, "Table already exists");
            }
            _ => {
                let e = error_from_response(response).await;
                tracing::error!(error = %e, table = table_name, "Failed to create table");
                return Err(e);
            }
        }

        Ok(TableClient {
            http: self.http.clone(),
            settings: self.settings.clone(),
            table_name: table_name.to_string(),
        })
    }
}

/// Handle on one table. Implements [`TableGateway`].
#[derive(Debug, Clone)]
pub struct TableClient {
    http: Client,
    settings: Arc<ConnectionSettings>,
    table_name: String,
}

impl TableClient {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn entity_url(&self, partition_key: &str, row_key: &str) -> Result<Url, GatewayError> {
        self.settings.resource_url(&format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            self.table_name,
            odata_key_literal(partition_key),
            odata_key_literal(row_key)
        ))
    }

    fn query_url(
        &self,
        filter: Option<&str>,
        select: Option<&[String]>,
        continuation: Option<&Continuation>,
    ) -> Result<Url, GatewayError> {
        let mut url = self.settings.resource_url(&format!("{}()", self.table_name))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(filter) = filter {
                query.append_pair("$filter", filter);
            }
            if let Some(select) = select {
                query.append_pair("$select", &select.join(","));
            }
            if let Some(c) = continuation {
                query.append_pair("NextPartitionKey", &c.next_partition_key);
                if let Some(row_key) = &c.next_row_key {
                    query.append_pair("NextRowKey", row_key);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl TableGateway for TableClient {
    async fn upsert_entity(&self, record: &Record) -> Result<(), GatewayError> {
        let (Some(partition_key), Some(row_key)) = (record.partition_key(), record.row_key())
        else {
            return Err(GatewayError::backend(
                None,
                "record must carry PartitionKey and RowKey",
            ));
        };
        tracing::info!(
            table = %self.table_name,
            partition_key,
            row_key,
            "Sending insert-or-replace"
        );
        let url = self.entity_url(partition_key, row_key)?;
        let response = self
            .settings
            .request(&self.http, Method::PUT, url)
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Record>, GatewayError> {
        tracing::debug!(table = %self.table_name, partition_key, row_key, "Sending entity get");
        let url = self.entity_url(partition_key, row_key)?;
        let response = self
            .settings
            .request(&self.http, Method::GET, url)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let object = response
                    .json::<serde_json::Map<String, serde_json::Value>>()
                    .await
                    .map_err(transport_error)?;
                Ok(Some(Record::from_json_object(object)))
            }
            _ => Err(error_from_response(response).await),
        }
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), GatewayError> {
        tracing::debug!(table = %self.table_name, partition_key, row_key, "Sending entity delete");
        let url = self.entity_url(partition_key, row_key)?;
        let response = self
            .settings
            .request(&self.http, Method::DELETE, url)
            .header("If-Match", "*")
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    async fn query_page(
        &self,
        filter: Option<String>,
        select: Option<Vec<String>>,
        continuation: Option<Continuation>,
    ) -> Result<QueryPage, GatewayError> {
        #[derive(Deserialize)]
        struct QueryBody {
            value: Vec<serde_json::Map<String, serde_json::Value>>,
        }

        let url = self.query_url(
            filter.as_deref(),
            select.as_deref(),
            continuation.as_ref(),
        )?;
        tracing::debug!(table = %self.table_name, url = %url, "Sending query");
        let response = self
            .settings
            .request(&self.http, Method::GET, url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let continuation = continuation_from_headers(response.headers());
        let body = response.json::<QueryBody>().await.map_err(transport_error)?;
        Ok(QueryPage {
            records: body.value.into_iter().map(Record::from_json_object).collect(),
            continuation,
        })
    }
}
