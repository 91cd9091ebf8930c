//! End-to-end scenarios against a local canned-response HTTP server.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use vigil::change::content_hash;
use vigil::config::{Config, HttpConfig};
use vigil::http::HttpClient;
use vigil::model::{
    ChangeType, ComparisonMode, ExecutionMode, ExtractMethod, Header, HttpMethod, NewVariable,
    NewWatcher, NewWorkflow, VariableSource, WatcherStatus, WorkflowStatus, WorkflowStep,
};
use vigil::executor::{WatcherExecutor, WorkflowExecutor};
use vigil::notify::LogNotifier;
use vigil::scheduler::Scheduler;
use vigil::storage::{ChangeLogFilter, MemoryStorage, OrderBy, OrderDirection, Storage};

/// Serves one canned response per connection, recording each request.
struct TestServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    async fn start(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let requests = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));

        let server_requests = requests.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };

                let request = read_request(&mut socket).await;
                server_requests.lock().unwrap().push(request);

                let response = queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| http_response(404, &[], "not found"));

                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self { base_url, requests }
    }

    fn request(&self, index: usize) -> String {
        self.requests.lock().unwrap()[index].clone()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let read = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(end) = find(&buffer, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buffer[..end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);

            let total = end + 4 + content_length;
            while buffer.len() < total {
                let read = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                buffer.extend_from_slice(&chunk[..read]);
            }
            break;
        }
    }

    String::from_utf8_lossy(&buffer).to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn http_response(status: u16, headers: &[(&str, &str)], body: &str) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

fn watcher(name: &str, url: &str, mode: ComparisonMode) -> NewWatcher {
    NewWatcher {
        name: name.into(),
        url: url.into(),
        method: HttpMethod::Get,
        headers: vec![],
        body: None,
        execution_mode: ExecutionMode::Both,
        watch_interval: Some(60),
        is_active: true,
        save_cookies: false,
        use_cookies: false,
        cookie_watcher_id: None,
        comparison_mode: mode,
    }
}

fn watcher_executor(storage: Arc<MemoryStorage>) -> WatcherExecutor {
    let client = HttpClient::new(&HttpConfig::default()).unwrap();
    WatcherExecutor::new(storage, client, Arc::new(LogNotifier))
}

fn workflow_executor(storage: Arc<MemoryStorage>) -> WorkflowExecutor {
    let client = HttpClient::new(&HttpConfig::default()).unwrap();
    WorkflowExecutor::new(storage, client)
}

// First observation, unchanged repeat, then a modification with a diff.
#[tokio::test]
async fn test_first_unchanged_modified() {
    let server = TestServer::start(vec![
        http_response(200, &[], "hello"),
        http_response(200, &[], "hello"),
        http_response(200, &[], "hello world"),
    ])
    .await;

    let storage = Arc::new(MemoryStorage::new());
    let executor = watcher_executor(storage.clone());

    let created = storage
        .create_watcher(&watcher("w1", &server.base_url, ComparisonMode::Hash))
        .await
        .unwrap();

    // First observation.
    let outcome = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(outcome.http_status, Some(200));
    assert_eq!(outcome.change_type, ChangeType::New);
    assert_eq!(outcome.size, 5);

    let logs = storage
        .change_logs(&ChangeLogFilter {
            watcher_id: Some(created.id),
            order_by: OrderBy::DetectedAt,
            direction: OrderDirection::Asc,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].change_type, ChangeType::New);
    assert_eq!(logs[0].new_hash.as_deref(), Some(content_hash(b"hello").as_str()));
    assert_eq!(logs[0].new_size, Some(5));
    assert_eq!(logs[0].old_hash, None);
    assert_eq!(logs[0].old_size, None);

    let snapshot = storage.snapshot(created.id).await.unwrap().unwrap();
    assert_eq!(snapshot.content_hash, content_hash(b"hello"));
    assert_eq!(snapshot.content_size, 5);

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.check_count, 1);
    assert_eq!(refreshed.change_count, 1);
    assert_eq!(refreshed.status, WatcherStatus::Success);

    // Same body again: unchanged.
    let outcome = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(outcome.change_type, ChangeType::Unchanged);

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.check_count, 2);
    assert_eq!(refreshed.change_count, 1);

    let snapshot = storage.snapshot(created.id).await.unwrap().unwrap();
    assert_eq!(snapshot.content_hash, content_hash(b"hello"));

    // Modified body produces a diff and rewrites the snapshot.
    let outcome = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(outcome.change_type, ChangeType::Modified);

    let logs = storage
        .change_logs(&ChangeLogFilter {
            watcher_id: Some(created.id),
            change_type: Some(ChangeType::Modified),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);

    let full = storage.change_log(logs[0].id).await.unwrap();
    let diff = String::from_utf8(full.diff.unwrap()).unwrap();
    assert!(diff.contains("-hello"));
    assert!(diff.contains("+hello world"));

    let snapshot = storage.snapshot(created.id).await.unwrap().unwrap();
    assert_eq!(snapshot.content, b"hello world");
    assert_eq!(snapshot.content_size, 11);

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.check_count, 3);
    assert_eq!(refreshed.change_count, 2);
}

// Whitespace-only differences are unchanged under content_aware.
#[tokio::test]
async fn test_content_aware_equivalence() {
    let server = TestServer::start(vec![
        http_response(200, &[], "  a   b\n"),
        http_response(200, &[], "a b"),
    ])
    .await;

    let storage = Arc::new(MemoryStorage::new());
    let executor = watcher_executor(storage.clone());

    let created = storage
        .create_watcher(&watcher("w2", &server.base_url, ComparisonMode::ContentAware))
        .await
        .unwrap();

    let first = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(first.change_type, ChangeType::New);

    let second = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(second.change_type, ChangeType::Unchanged);
}

// A failed request becomes an error observation and latches the error
// message until the next successful run clears it.
#[tokio::test]
async fn test_network_error_then_recovery() {
    let storage = Arc::new(MemoryStorage::new());
    let executor = watcher_executor(storage.clone());

    // A port nothing listens on.
    let unreachable = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };

    let created = storage
        .create_watcher(&watcher("w3", &unreachable, ComparisonMode::Hash))
        .await
        .unwrap();

    let outcome = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(outcome.change_type, ChangeType::Error);
    assert_eq!(outcome.http_status, None);

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.status, WatcherStatus::Error);
    assert!(refreshed.error_message.is_some());
    assert_eq!(refreshed.check_count, 1);
    assert_eq!(refreshed.change_count, 0);
    assert!(storage.snapshot(created.id).await.unwrap().is_none());

    // Point the watcher at a live server; a successful run clears the
    // error state.
    let server = TestServer::start(vec![http_response(200, &[], "ok")]).await;
    storage
        .update_watcher(
            created.id,
            &vigil::model::WatcherUpdate {
                url: Some(server.base_url.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = executor.run_by_id(created.id).await.unwrap();
    assert_eq!(outcome.change_type, ChangeType::New);

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.status, WatcherStatus::Success);
    assert_eq!(refreshed.error_message, None);
}

// Cookie reuse chain: one watcher earns cookies, another sends them.
#[tokio::test]
async fn test_cookie_reuse_chain() {
    let auth_server = TestServer::start(vec![http_response(
        200,
        &[("Set-Cookie", "sid=ABC; Path=/")],
        "logged in",
    )])
    .await;
    let use_server = TestServer::start(vec![http_response(200, &[], "data")]).await;

    let storage = Arc::new(MemoryStorage::new());
    let executor = watcher_executor(storage.clone());

    let mut auth = watcher("w-auth", &auth_server.base_url, ComparisonMode::Hash);
    auth.save_cookies = true;
    let auth = storage.create_watcher(&auth).await.unwrap();

    let mut consumer = watcher("w-use", &use_server.base_url, ComparisonMode::Hash);
    consumer.use_cookies = true;
    consumer.cookie_watcher_id = Some(auth.id);
    let consumer = storage.create_watcher(&consumer).await.unwrap();

    executor.run_by_id(auth.id).await.unwrap();

    let stored = storage.cookies(auth.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "sid");
    assert_eq!(stored[0].value, "ABC");

    executor.run_by_id(consumer.id).await.unwrap();

    let request = use_server.request(0).to_lowercase();
    let cookie_line = request
        .lines()
        .find(|line| line.starts_with("cookie:"))
        .expect("request carries a cookie header")
        .to_string();
    // Precisely the chained cookie, nothing else.
    assert_eq!(cookie_line, "cookie: sid=abc");
}

// Workflow extraction and substitution across steps.
#[tokio::test]
async fn test_workflow_extraction_and_substitution() {
    let login_server = TestServer::start(vec![http_response(
        200,
        &[("Content-Type", "application/json")],
        r#"{"token":"T42"}"#,
    )])
    .await;
    let submit_server = TestServer::start(vec![http_response(200, &[], "accepted")]).await;

    let storage = Arc::new(MemoryStorage::new());
    let executor = workflow_executor(storage.clone());

    let login = storage
        .create_watcher(&watcher("login", &login_server.base_url, ComparisonMode::Hash))
        .await
        .unwrap();

    let mut submit = watcher("submit", &submit_server.base_url, ComparisonMode::Hash);
    submit.method = HttpMethod::Post;
    submit.headers = vec![Header::new("Content-Type", "application/json")];
    submit.body = Some(br#"{"k":"[[auth]]"}"#.to_vec());
    let submit = storage.create_watcher(&submit).await.unwrap();

    let workflow = storage
        .create_workflow(&NewWorkflow {
            name: "login-then-submit".into(),
            description: None,
            steps: vec![
                WorkflowStep {
                    order: 1,
                    watcher_id: login.id,
                    continue_on_error: false,
                    extract_variables: vec!["auth".into()],
                },
                WorkflowStep {
                    order: 2,
                    watcher_id: submit.id,
                    continue_on_error: false,
                    extract_variables: vec![],
                },
            ],
            is_active: true,
            schedule_enabled: false,
            schedule_interval: None,
        })
        .await
        .unwrap();

    storage
        .create_variable(&NewVariable {
            workflow_id: workflow.id,
            name: "auth".into(),
            source: VariableSource::ResponseBody,
            extract_method: ExtractMethod::JsonPath,
            extract_pattern: Some("token".into()),
            random_length: None,
            random_format: None,
            static_value: None,
        })
        .await
        .unwrap();

    let execution = executor.execute(&workflow, None).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Success);
    assert_eq!(execution.steps_completed, 2);
    assert_eq!(
        execution.variables_extracted.get("auth"),
        Some(&"T42".to_string())
    );

    // The second request carried the substituted body.
    let request = submit_server.request(0);
    assert!(request.ends_with(r#"{"k":"T42"}"#));

    // The extracted value was persisted on the variable.
    let variables = storage.variables(workflow.id).await.unwrap();
    assert_eq!(variables[0].current_value.as_deref(), Some("T42"));
    assert!(variables[0].last_extracted_at.is_some());

    let workflow = storage.workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.execution_count, 1);
    assert_eq!(workflow.success_count, 1);
    assert_eq!(workflow.last_execution_status, Some(WorkflowStatus::Success));
}

// A failing step stops the workflow when continue_on_error is off.
#[tokio::test]
async fn test_workflow_stops_on_error() {
    let server = TestServer::start(vec![
        http_response(200, &[], "one"),
        http_response(500, &[], "boom"),
        http_response(200, &[], "three"),
    ])
    .await;

    let storage = Arc::new(MemoryStorage::new());
    let executor = workflow_executor(storage.clone());

    let mut watcher_ids = vec![];
    for name in ["s1", "s2", "s3"] {
        let created = storage
            .create_watcher(&watcher(name, &server.base_url, ComparisonMode::Hash))
            .await
            .unwrap();
        watcher_ids.push(created.id);
    }

    let steps = watcher_ids
        .iter()
        .enumerate()
        .map(|(i, watcher_id)| WorkflowStep {
            order: i as i32 + 1,
            watcher_id: *watcher_id,
            continue_on_error: false,
            extract_variables: vec![],
        })
        .collect();

    let workflow = storage
        .create_workflow(&NewWorkflow {
            name: "three-steps".into(),
            description: None,
            steps,
            is_active: true,
            schedule_enabled: false,
            schedule_interval: None,
        })
        .await
        .unwrap();

    let execution = executor.execute(&workflow, None).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.error_step, Some(2));
    assert_eq!(execution.steps_completed, 2);
    assert_eq!(execution.step_results.len(), 2);
    assert_eq!(execution.step_results[1].response_status, Some(500));
    assert_eq!(execution.step_results[1].error.as_deref(), Some("HTTP 500"));

    // Step 3 never ran.
    assert_eq!(server.request_count(), 2);

    let workflow = storage.workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.failure_count, 1);
    assert_eq!(workflow.last_execution_status, Some(WorkflowStatus::Failed));
    assert!(workflow.last_execution_error.is_some());
}

// The scheduler picks up an eligible watcher and runs it.
#[tokio::test]
async fn test_scheduler_dispatches_due_watcher() {
    let server = TestServer::start(vec![http_response(200, &[], "hello")]).await;

    let storage = Arc::new(MemoryStorage::new());
    let created = storage
        .create_watcher(&watcher("scheduled", &server.base_url, ComparisonMode::Hash))
        .await
        .unwrap();

    let scheduler = Scheduler::new(storage.clone(), Arc::new(LogNotifier), &Config::default())
        .unwrap();
    let handle = scheduler.start();

    // Wait for the first run to land.
    timeout(Duration::from_secs(10), async {
        loop {
            let refreshed = storage.watcher(created.id).await.unwrap();
            if refreshed.check_count >= 1 {
                break refreshed;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("watcher was dispatched");

    let refreshed = storage.watcher(created.id).await.unwrap();
    assert_eq!(refreshed.status, WatcherStatus::Success);
    assert_eq!(refreshed.change_count, 1);

    scheduler.shutdown();
    let _ = handle.await;
}
