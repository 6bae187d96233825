//! Drives the storage client and the CLI against a local HTTP server that
//! records each request and answers with canned responses.

use assert_cmd::assert::Assert;
use assert_cmd::Command;
use futures::TryStreamExt;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use table_sync::storage::TableServiceClient;
use table_sync_core::contract::TableGateway;
use table_sync_core::gateway;
use table_sync_core::record::parse_str;
use table_sync_core::{GatewayError, IdentityConfig, Record};

const DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    target: String,
    headers: HashMap<String, String>,
    body: String,
}

struct Canned {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: String,
}

fn canned(status: u16, body: &str) -> Canned {
    Canned {
        status,
        headers: vec![],
        body: body.to_string(),
    }
}

struct FakeTableService {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeTableService {
    /// Serves `responses` in order, one per request, across any number of connections.
    async fn start(responses: Vec<Canned>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let mut parts = request_line.split_whitespace();
                        let method = parts.next().unwrap_or_default().to_string();
                        let target = parts.next().unwrap_or_default().to_string();

                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            reader.read_line(&mut line).await.unwrap();
                            let line = line.trim_end();
                            if line.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = line.split_once(':') {
                                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                            }
                        }
                        let length: usize = headers
                            .get("content-length")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        let mut body = vec![0u8; length];
                        reader.read_exact(&mut body).await.unwrap();

                        recorded.lock().unwrap().push(RecordedRequest {
                            method,
                            target,
                            headers,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });

                        let response = queue
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or_else(|| canned(500, "no canned response left"));
                        let mut raw = format!(
                            "HTTP/1.1 {} Canned\r\nContent-Length: {}\r\nContent-Type: application/json\r\n",
                            response.status,
                            response.body.len()
                        );
                        for (name, value) in &response.headers {
                            raw.push_str(&format!("{name}: {value}\r\n"));
                        }
                        raw.push_str("\r\n");
                        raw.push_str(&response.body);
                        if write.write_all(raw.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        FakeTableService {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    fn connection_string(&self) -> String {
        format!(
            "DefaultEndpointsProtocol=http;AccountName=devstoreaccount1;AccountKey={DEV_KEY};TableEndpoint={}/devstoreaccount1",
            self.base_url
        )
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Runs the binary off the runtime thread so the fake service keeps serving.
fn run_cli(workdir: &Path, args: Vec<String>) -> JoinHandle<Assert> {
    let workdir = workdir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("table-sync")
            .unwrap()
            .current_dir(workdir)
            .env_remove("CONNECTION_STRING")
            .env_remove("TABLE_NAME")
            .env_remove("FILE_PATH")
            .env_remove("DEFAULT_PARTITION_KEY")
            .args(args)
            .assert()
    })
}

fn widget() -> Record {
    parse_str("id = \"abc123\"\nname = \"Widget\"\n", &IdentityConfig::default()).unwrap()
}

#[tokio::test]
async fn create_table_treats_conflict_as_existing() {
    let service = FakeTableService::start(vec![canned(
        409,
        r#"{"odata.error":{"code":"TableAlreadyExists","message":{"lang":"en-US","value":"The table specified already exists."}}}"#,
    )])
    .await;

    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let table = client
        .create_table_if_not_exists("widgets")
        .await
        .expect("existing table is not an error");

    assert_eq!(table.table_name(), "widgets");
    let requests = service.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].target, "/devstoreaccount1/Tables");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body, json!({ "TableName": "widgets" }));
    assert!(requests[0].headers["authorization"].starts_with("SharedKeyLite devstoreaccount1:"));
    assert_eq!(requests[0].headers["x-ms-version"], "2019-02-02");
    assert!(requests[0].headers.contains_key("x-ms-date"));
}

#[tokio::test]
async fn create_table_surfaces_service_errors() {
    let service = FakeTableService::start(vec![canned(
        403,
        r#"{"odata.error":{"code":"AuthenticationFailed","message":{"lang":"en-US","value":"Server failed to authenticate the request."}}}"#,
    )])
    .await;

    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let err = client.create_table_if_not_exists("widgets").await.unwrap_err();

    match err {
        GatewayError::Backend { status, message } => {
            assert_eq!(status, Some(403));
            assert!(message.contains("AuthenticationFailed"), "got: {message}");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_service_is_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = TableServiceClient::from_connection_string(&format!(
        "AccountName=devstoreaccount1;AccountKey={DEV_KEY};TableEndpoint=http://{addr}/devstoreaccount1"
    ))
    .expect("string is well formed; reachability is checked lazily");
    let err = client.create_table_if_not_exists("widgets").await.unwrap_err();

    assert!(matches!(err, GatewayError::Connection(_)), "got {err:?}");
}

#[tokio::test]
async fn upsert_puts_the_whole_record_at_its_identity() {
    let service = FakeTableService::start(vec![canned(204, ""), canned(204, "")]).await;
    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let table = client.create_table_if_not_exists("widgets").await.unwrap();

    gateway::upsert(&table, &widget()).await.unwrap();

    let put = &service.requests()[1];
    assert_eq!(put.method, "PUT");
    assert_eq!(
        put.target,
        "/devstoreaccount1/widgets(PartitionKey='pkey',RowKey='abc123')"
    );
    assert!(!put.headers.contains_key("if-match"), "insert-or-replace sends no If-Match");
    let body: serde_json::Value = serde_json::from_str(&put.body).unwrap();
    assert_eq!(
        body,
        json!({
            "PartitionKey": "pkey",
            "RowKey": "abc123",
            "id": "abc123",
            "name": "Widget"
        })
    );
}

#[tokio::test]
async fn get_maps_not_found_to_none_and_found_to_record() {
    let service = FakeTableService::start(vec![
        canned(204, ""),
        canned(
            404,
            r#"{"odata.error":{"code":"ResourceNotFound","message":{"lang":"en-US","value":"The specified resource does not exist."}}}"#,
        ),
        canned(
            200,
            r#"{"PartitionKey":"pkey","RowKey":"abc123","Timestamp":"2026-10-18T10:00:00Z","name":"Widget","size":12}"#,
        ),
    ])
    .await;
    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let table = client.create_table_if_not_exists("widgets").await.unwrap();

    assert_eq!(table.get_entity("pkey", "missing").await.unwrap(), None);
    let found = table.get_entity("pkey", "abc123").await.unwrap().unwrap();

    assert_eq!(found.get("name"), Some("Widget"));
    assert_eq!(found.get("size"), Some("12"));
    let requests = service.requests();
    assert_eq!(requests[2].method, "GET");
    assert_eq!(
        requests[2].headers["accept"],
        "application/json;odata=nometadata"
    );
}

#[tokio::test]
async fn delete_sends_unconditional_delete_once() {
    let service = FakeTableService::start(vec![canned(204, ""), canned(204, "")]).await;
    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let table = client.create_table_if_not_exists("widgets").await.unwrap();

    gateway::delete(&table, "abc123", None, &IdentityConfig::default())
        .await
        .unwrap();

    let requests = service.requests();
    assert_eq!(requests.len(), 2, "one create, one delete");
    assert_eq!(requests[1].method, "DELETE");
    assert_eq!(requests[1].headers["if-match"], "*");
    assert_eq!(
        requests[1].target,
        "/devstoreaccount1/widgets(PartitionKey='pkey',RowKey='abc123')"
    );
}

#[tokio::test]
async fn query_follows_continuation_headers() {
    let service = FakeTableService::start(vec![
        canned(204, ""),
        Canned {
            status: 200,
            headers: vec![
                ("x-ms-continuation-NextPartitionKey", "1!8!cGtleQ--"),
                ("x-ms-continuation-NextRowKey", "1!4!Yw--"),
            ],
            body: r#"{"value":[{"PartitionKey":"pkey","RowKey":"a"},{"PartitionKey":"pkey","RowKey":"b"}]}"#
                .to_string(),
        },
        canned(200, r#"{"value":[{"PartitionKey":"pkey","RowKey":"c"}]}"#),
    ])
    .await;
    let client = TableServiceClient::from_connection_string(&service.connection_string()).unwrap();
    let table = client.create_table_if_not_exists("widgets").await.unwrap();

    let rows: Vec<Record> = gateway::query(
        &table,
        Some("RowKey ge 'a'".to_string()),
        Some(vec![]),
    )
    .try_collect()
    .await
    .unwrap();

    let keys: Vec<&str> = rows.iter().filter_map(|r| r.row_key()).collect();
    assert_eq!(keys, ["a", "b", "c"]);

    let requests = service.requests();
    assert!(requests[1].target.starts_with("/devstoreaccount1/widgets()?"));
    assert!(requests[1].target.contains("%24filter="));
    assert!(!requests[1].target.contains("select"), "empty field list selects everything");
    assert!(requests[2].target.contains("NextPartitionKey=1%218%21cGtleQ--"));
    assert!(requests[2].target.contains("NextRowKey=1%214%21Yw--"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_publishes_then_reads_back() {
    let service = FakeTableService::start(vec![
        // publish: create table, put
        canned(409, ""),
        canned(204, ""),
        // get: create table, get
        canned(409, ""),
        canned(
            200,
            r#"{"PartitionKey":"pkey","RowKey":"abc123","id":"abc123","name":"Widget"}"#,
        ),
        // query: create table, one page
        canned(409, ""),
        canned(
            200,
            r#"{"value":[{"name":"Widget"},{"name":"Gadget"}]}"#,
        ),
    ])
    .await;
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "id = \"abc123\"\nname = \"Widget\"\n").unwrap();
    let connection = service.connection_string();
    let workdir = tempfile::tempdir().unwrap();

    let run = |args: Vec<String>| run_cli(workdir.path(), args);

    run(vec![
        "publish".into(),
        connection.clone(),
        "widgets".into(),
        file.path().display().to_string(),
    ])
    .await
    .unwrap()
    .success();

    let got = run(vec![
        "get".into(),
        connection.clone(),
        "widgets".into(),
        "--row-key".into(),
        "abc123".into(),
    ])
    .await
    .unwrap()
    .success();
    let printed: serde_json::Value =
        serde_json::from_slice(&got.get_output().stdout).expect("get prints JSON");
    assert_eq!(printed["name"], "Widget");

    run(vec![
        "query".into(),
        connection.clone(),
        "widgets".into(),
        "-q".into(),
        "name ne 'x'".into(),
        "-f".into(),
        "name".into(),
    ])
    .await
    .unwrap()
    .success()
    .stdout("{\"name\":\"Widget\"}\n{\"name\":\"Gadget\"}\n");

    let requests = service.requests();
    assert_eq!(requests[1].method, "PUT");
    assert_eq!(requests[3].target, "/devstoreaccount1/widgets(PartitionKey='pkey',RowKey='abc123')");
    assert!(requests[5].target.contains("%24select=name"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_get_and_delete_take_identity_from_record_file() {
    let service = FakeTableService::start(vec![
        // get FILE: create table, get
        canned(409, ""),
        canned(
            200,
            r#"{"PartitionKey":"p1","RowKey":"x","prefix":"x","name":"Widget"}"#,
        ),
        // delete FILE --partition-key p2: create table, delete
        canned(409, ""),
        canned(204, ""),
        // get --row-key gone: create table, not found
        canned(409, ""),
        canned(
            404,
            r#"{"odata.error":{"code":"ResourceNotFound","message":{"lang":"en-US","value":"The specified resource does not exist."}}}"#,
        ),
    ])
    .await;
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "PartitionKey = p1\nprefix = x\nname = Widget\n").unwrap();
    let file_arg = file.path().display().to_string();
    let connection = service.connection_string();
    let workdir = tempfile::tempdir().unwrap();

    let got = run_cli(
        workdir.path(),
        vec!["get".into(), connection.clone(), "widgets".into(), file_arg.clone()],
    )
    .await
    .unwrap()
    .success();
    let printed: serde_json::Value =
        serde_json::from_slice(&got.get_output().stdout).expect("get prints JSON");
    assert_eq!(printed["name"], "Widget");

    run_cli(
        workdir.path(),
        vec![
            "delete".into(),
            connection.clone(),
            "widgets".into(),
            file_arg,
            "--partition-key".into(),
            "p2".into(),
        ],
    )
    .await
    .unwrap()
    .success()
    .stdout("");

    run_cli(
        workdir.path(),
        vec![
            "get".into(),
            connection.clone(),
            "widgets".into(),
            "--row-key".into(),
            "gone".into(),
        ],
    )
    .await
    .unwrap()
    .success()
    .stdout("null\n");

    let requests = service.requests();
    assert_eq!(requests.len(), 6);
    assert_eq!(requests[1].method, "GET");
    assert_eq!(
        requests[1].target,
        "/devstoreaccount1/widgets(PartitionKey='p1',RowKey='x')"
    );
    assert_eq!(requests[3].method, "DELETE");
    assert_eq!(
        requests[3].target,
        "/devstoreaccount1/widgets(PartitionKey='p2',RowKey='x')"
    );
    assert_eq!(
        requests[5].target,
        "/devstoreaccount1/widgets(PartitionKey='pkey',RowKey='gone')"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_query_fields_flag_leaves_positionals_alone() {
    let service = FakeTableService::start(vec![
        canned(409, ""),
        canned(200, r#"{"value":[{"name":"Widget","size":"12"}]}"#),
    ])
    .await;
    let workdir = tempfile::tempdir().unwrap();

    run_cli(
        workdir.path(),
        vec![
            "query".into(),
            "-f".into(),
            "name".into(),
            service.connection_string(),
            "widgets".into(),
            "-f".into(),
            "size".into(),
        ],
    )
    .await
    .unwrap()
    .success()
    .stdout("{\"name\":\"Widget\",\"size\":\"12\"}\n");

    let requests = service.requests();
    assert_eq!(requests[0].target, "/devstoreaccount1/Tables");
    assert!(
        requests[1].target.contains("%24select=name%2Csize"),
        "got {}",
        requests[1].target
    );
}
