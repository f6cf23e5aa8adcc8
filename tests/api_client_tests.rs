//! Integration tests for the REST client against a loopback Axum API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Json;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use scan_worker::error::OrchestratorError;
use scan_worker::orchestrator::{ApiClient, IMPORT_SUCCESS, Orchestrator, ToolUpdate};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests seen by the fake API, as `(route, auth header, body)`.
#[derive(Default)]
struct Seen {
    calls: Mutex<Vec<(String, Option<String>, Value)>>,
}

impl Seen {
    fn record(&self, route: &str, headers: &HeaderMap, body: Value) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.calls
            .lock()
            .unwrap()
            .push((route.to_string(), auth, body));
    }

    fn find(&self, route: &str) -> (Option<String>, Value) {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _, _)| r == route)
            .map(|(_, auth, body)| (auth.clone(), body.clone()))
            .unwrap_or_else(|| panic!("no call to {route}"))
    }
}

async fn root() -> impl IntoResponse {
    StatusCode::OK
}

async fn register_commands(
    State(seen): State<Arc<Seen>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    seen.record(&format!("register:{name}"), &headers, body);
    Json(json!({"ok": true}))
}

async fn craft(
    Path((pentest, tool)): Path<(String, String)>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> axum::response::Response {
    if tool == "missing" {
        return (StatusCode::BAD_REQUEST, "Tool not found").into_response();
    }
    Json(json!({
        "comm": format!("-oX |outputDir|.xml {pentest} {}", query.get("plugin").cloned().unwrap_or_default()),
        "ext": ".xml"
    }))
    .into_response()
}

async fn import_result(
    State(seen): State<Arc<Seen>>,
    Path((_pentest, tool)): Path<(String, String)>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut fields = serde_json::Map::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let text = field.text().await.unwrap();
        fields.insert(name, Value::String(text));
    }
    seen.record(&format!("import:{tool}"), &headers, Value::Object(fields));
    Json(json!(IMPORT_SUCCESS))
}

async fn change_status(
    State(seen): State<Arc<Seen>>,
    Path((_pentest, tool)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    seen.record(&format!("status:{tool}"), &headers, body);
    Json(json!("OK"))
}

async fn update_tool(
    State(seen): State<Arc<Seen>>,
    Path((_pentest, tool)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    seen.record(&format!("update:{tool}"), &headers, body);
    Json(json!("OK"))
}

async fn find(
    State(seen): State<Arc<Seen>>,
    Path((_pentest, collection)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    seen.record(&format!("find:{collection}"), &headers, body.clone());
    let answer = match collection.as_str() {
        "tools" if body["pipeline"]["_id"]["$oid"] == "t1" => json!({
            "_id": {"$oid": "t1"},
            "name": "nmap",
            "wave": "Wave 1",
            "command_iid": "c1",
            "status": ["OOS"],
        }),
        "commands" => json!({"timeout": "60", "sleep_between": 0}),
        "intervals" => json!([
            {"wave": "Wave 1", "dated": "01/05/2024 09:00:00", "datef": "None"}
        ]),
        _ => Value::Null,
    };
    Json(answer)
}

/// Start the fake API on a random port and return its base URL.
async fn start_server() -> (String, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let app = Router::new()
        .route("/api/v1/", get(root))
        .route("/api/v1/workers/{name}/registerCommands", put(register_commands))
        .route("/api/v1/tools/{pentest}/craftCommandLine/{tool}", get(craft))
        .route("/api/v1/tools/{pentest}/importResult/{tool}", post(import_result))
        .route("/api/v1/tools/{pentest}/{tool}/changeStatus", post(change_status))
        .route("/api/v1/tools/update/{pentest}/{tool}", put(update_tool))
        .route("/api/v1/find/{pentest}/{collection}", post(find))
        .with_state(Arc::clone(&seen));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}/api/v1"), seen)
}

#[tokio::test]
async fn probe_and_register() {
    timeout(TEST_TIMEOUT, async {
        let (base, seen) = start_server().await;
        let client = ApiClient::new(&base).unwrap();

        assert!(client.try_connection().await);
        client
            .register_commands("w1@host", &["nmap".to_string()])
            .await
            .unwrap();

        let (auth, body) = seen.find("register:w1@host");
        assert_eq!(auth, None);
        assert_eq!(body, json!(["nmap"]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_probe_is_false() {
    let client = ApiClient::new("http://127.0.0.1:9/api/v1/").unwrap();
    assert!(!client.try_connection().await);
}

#[tokio::test]
async fn craft_command_line_and_refusal() {
    timeout(TEST_TIMEOUT, async {
        let (base, _seen) = start_server().await;
        let client = ApiClient::new(&base).unwrap();

        let line = client.craft_command_line("acme", "t1", "nmap").await.unwrap();
        assert_eq!(line.command, "-oX |outputDir|.xml acme nmap");
        assert_eq!(line.extension, ".xml");

        let err = client
            .craft_command_line("acme", "missing", "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Rejected { status: 400, .. }));
        assert_eq!(err.to_string(), "Tool not found");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn authorized_calls_carry_token() {
    timeout(TEST_TIMEOUT, async {
        let (base, seen) = start_server().await;
        let client = ApiClient::new(&base).unwrap().authorized("job-token");

        client
            .set_status("acme", "t1", &["error".to_string()], "boom")
            .await
            .unwrap();
        client
            .update_tool("acme", "t1", &ToolUpdate::notes("hello"))
            .await
            .unwrap();

        let (auth, body) = seen.find("status:t1");
        assert_eq!(auth.as_deref(), Some("Bearer job-token"));
        assert_eq!(body, json!({"newStatus": ["error"], "arg": "boom"}));

        let (_, body) = seen.find("update:t1");
        assert_eq!(body, json!({"notes": "hello"}));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn import_uploads_file_with_parser() {
    timeout(TEST_TIMEOUT, async {
        let (base, seen) = start_server().await;
        let client = ApiClient::new(&base).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nmap_1.xml");
        std::fs::write(&file, "<nmaprun/>").unwrap();

        let message = client.import_result("acme", "t1", "nmap", &file).await.unwrap();
        assert_eq!(message, IMPORT_SUCCESS);

        let (_, fields) = seen.find("import:t1");
        assert_eq!(fields["upfile"], "<nmaprun/>");
        assert_eq!(fields["plugin"], "nmap");

        let err = client
            .import_result("acme", "t1", "nmap", &dir.path().join("absent.xml"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failure to open provided file"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn data_layer_reads() {
    timeout(TEST_TIMEOUT, async {
        let (base, seen) = start_server().await;
        let client = ApiClient::new(&base).unwrap();

        let tool = client.fetch_tool("acme", "t1").await.unwrap();
        assert_eq!(tool.name, "nmap");
        assert_eq!(tool.command_iid, "c1");
        assert_eq!(tool.status, vec!["OOS"]);

        let (_, query) = seen.find("find:tools");
        assert_eq!(query["many"], false);

        let missing = client.fetch_tool("acme", "nope").await.unwrap_err();
        assert!(matches!(missing, OrchestratorError::NotFound { .. }));

        let command = client.fetch_command("acme", "c1").await.unwrap().unwrap();
        assert_eq!(command.timeout_secs(), Some(60));
        assert_eq!(client.fetch_command("acme", "").await.unwrap(), None);

        let windows = client.fetch_intervals("acme", "Wave 1").await.unwrap();
        assert_eq!(windows.len(), 1);
        assert!(windows[0].start.is_some());
        assert!(windows[0].end.is_none());

        let (_, query) = seen.find("find:intervals");
        assert_eq!(query, json!({"pipeline": {"wave": "Wave 1"}, "many": true}));
    })
    .await
    .expect("test timed out");
}
