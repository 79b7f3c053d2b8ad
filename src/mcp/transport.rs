//! Transport clients: the two JSON-RPC 2.0 channel variants (stdio
//! subprocess, HTTP-over-SSE) behind one shared `McpTransport` contract.
//!
//! Both variants share the same demultiplexing shape: a dedicated reader
//! task owns the inbound stream and resolves each pending `send` by
//! request id through a `PendingTable`; `send` itself only writes the
//! request and then waits on its own oneshot receiver.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

/// JSON-RPC error object as carried by a server response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// What a `send` resolves to once a response with a matching id arrives:
/// a JSON-RPC `result`, or a JSON-RPC `error`. Neither is a transport
/// fault — error responses surface structurally, per the protocol.
#[derive(Debug, Clone)]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    pub fn connect<E: std::fmt::Display>(err: E) -> Self {
        TransportError::Connect(err.to_string())
    }

    pub fn io<E: std::fmt::Display>(err: E) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Calculates `1, 2, 4, 8, ...` seconds capped at 30s, with +/-50% uniform
/// jitter applied to each delay. Shared by the Manager's connect retry and
/// any transport-level request retry, so there is exactly one place that
/// encodes the formula.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_secs = 2_u64.saturating_pow(attempt.min(5)).min(30);
    let base = Duration::from_secs(base_secs);
    let jitter_frac = rand::thread_rng().gen_range(-0.5..=0.5);
    let jittered_ms = (base.as_millis() as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

/// Map from request id to the oneshot the blocked `send` is waiting on.
/// Owned by the transport, fed by its reader task.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<i64, oneshot::Sender<RpcOutcome>>>,
}

impl PendingTable {
    async fn insert(&self, id: i64, tx: oneshot::Sender<RpcOutcome>) {
        self.entries.lock().await.insert(id, tx);
    }

    async fn remove(&self, id: i64) -> Option<oneshot::Sender<RpcOutcome>> {
        self.entries.lock().await.remove(&id)
    }

    /// Resolves the pending entry for `id`, if any. Returns `false` if no
    /// caller is waiting (stale response, or a notification misrouted here).
    async fn resolve(&self, id: i64, outcome: RpcOutcome) -> bool {
        if let Some(tx) = self.entries.lock().await.remove(&id) {
            let _ = tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Fails every outstanding entry, used when the reader loop exits.
    async fn fail_all(&self) {
        let mut entries = self.entries.lock().await;
        for (_, tx) in entries.drain() {
            drop(tx);
        }
    }
}

fn parse_inbound(raw: &Value) -> Option<(i64, RpcOutcome)> {
    let id = raw.get("id")?;
    let id = id.as_i64().or_else(|| id.as_u64().map(|v| v as i64))?;

    if let Some(error) = raw.get("error") {
        let rpc_error: RpcError = serde_json::from_value(error.clone()).unwrap_or(RpcError {
            code: -32000,
            message: error.to_string(),
            data: None,
        });
        return Some((id, RpcOutcome::Error(rpc_error)));
    }

    let result = raw.get("result").cloned().unwrap_or(Value::Object(Default::default()));
    Some((id, RpcOutcome::Result(result)))
}

/// The shared contract both transport variants implement. `connect` and
/// `close` are idempotent from the Manager's point of view; `send` may be
/// called concurrently by multiple callers.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcOutcome, TransportError>;
    async fn healthy(&self) -> bool;
    async fn close(&self) -> Result<(), TransportError>;
}

// ============================================================================
// Stdio transport
// ============================================================================

/// Owns exactly one child process and its three standard streams.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    next_id: AtomicI64,
    pending: Arc<PendingTable>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command,
            args,
            env,
            next_id: AtomicI64::new(1),
            pending: Arc::new(PendingTable::default()),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            reader_task: Mutex::new(None),
            stderr_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(TransportError::connect)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Connect("child did not expose stdout".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Connect("child did not expose stdin".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::Connect("child did not expose stderr".to_string())
        })?;

        debug!(command = %self.command, "stdio transport connected");

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("mcp server stderr: {}", line);
            }
        });

        let pending = Arc::clone(&self.pending);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(raw) => match parse_inbound(&raw) {
                                Some((id, outcome)) => {
                                    if !pending.resolve(id, outcome).await {
                                        trace!(id, "stale or unmatched stdio response");
                                    }
                                }
                                None => trace!("dropped notification on stdio transport"),
                            },
                            Err(e) => warn!("unparseable line from mcp server stdout: {}", e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error reading mcp server stdout: {}", e);
                        break;
                    }
                }
            }
            pending.fail_all().await;
        });

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *self.reader_task.lock().await = Some(reader_task);
        *self.stderr_task.lock().await = Some(stderr_task);

        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcOutcome, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx).await;

        let write_result = {
            let mut guard = self.stdin.lock().await;
            let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
            let mut framed = serde_json::to_vec(&request).map_err(TransportError::io)?;
            framed.push(b'\n');
            stdin.write_all(&framed).await.map_err(TransportError::io)
        };

        if let Err(e) = write_result {
            self.pending.remove(id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(id).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn healthy(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(stdin) = self.stdin.lock().await.take() {
            drop(stdin);
        }

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                }
            }
        }
        drop(child_guard);

        if let Some(task) = self.reader_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }

        self.pending.fail_all().await;
        Ok(())
    }
}

// ============================================================================
// SSE transport
// ============================================================================

/// Owns one HTTP client bound to the descriptor's URL, plus a reader task
/// consuming the server's `text/event-stream` response.
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    next_id: AtomicI64,
    pending: Arc<PendingTable>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(TransportError::connect)?;
        Ok(Self {
            url,
            headers,
            client,
            next_id: AtomicI64::new(1),
            pending: Arc::new(PendingTable::default()),
            reader_task: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn header_map(&self) -> Result<reqwest::header::HeaderMap, TransportError> {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(TransportError::connect)?;
            let val = reqwest::header::HeaderValue::from_str(value)
                .map_err(TransportError::connect)?;
            map.insert(name, val);
        }
        Ok(map)
    }
}

/// A single parsed `text/event-stream` frame (`event:`/`data:`/`id:`/
/// `retry:` lines, blank-line terminated).
struct SseEvent {
    data: String,
}

impl SseEvent {
    fn parse_block(block: &str) -> Option<Self> {
        let mut data_lines = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if data_lines.is_empty() {
            None
        } else {
            Some(SseEvent {
                data: data_lines.join("\n"),
            })
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.header_map()?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(TransportError::connect)?;

        if !response.status().is_success() {
            return Err(TransportError::Connect(format!(
                "event stream GET returned {}",
                response.status()
            )));
        }

        debug!(url = %self.url, "sse transport connected");

        let pending = Arc::clone(&self.pending);
        let mut byte_stream = response.bytes_stream();

        let reader_task = tokio::spawn(async move {
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("sse stream error: {}", e);
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let block: String = buf.drain(..pos + 2).collect();
                    if let Some(event) = SseEvent::parse_block(&block) {
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(raw) => match parse_inbound(&raw) {
                                Some((id, outcome)) => {
                                    if !pending.resolve(id, outcome).await {
                                        trace!(id, "stale or unmatched sse response");
                                    }
                                }
                                None => trace!("dropped notification on sse transport"),
                            },
                            Err(e) => warn!("unparseable sse data payload: {}", e),
                        }
                    }
                }
            }
            pending.fail_all().await;
        });

        *self.reader_task.lock().await = Some(reader_task);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcOutcome, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx).await;

        let post_result = self
            .client
            .post(&self.url)
            .headers(self.header_map()?)
            .json(&request)
            .send()
            .await;

        if let Err(e) = post_result {
            self.pending.remove(id).await;
            return Err(TransportError::connect(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(id).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn healthy(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            self.client.head(&self.url).send(),
        )
        .await;
        matches!(result, Ok(Ok(resp)) if resp.status().is_success() || resp.status().as_u16() == 405)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.pending.fail_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_jittered_bounds() {
        for attempt in 0..8 {
            let base_secs = 2_u64.saturating_pow(attempt.min(5)).min(30);
            let delay = backoff_delay(attempt);
            let lower = (base_secs as f64 * 0.5 * 1000.0) as u64;
            let upper = (base_secs as f64 * 1.5 * 1000.0) as u64 + 1;
            assert!(
                delay.as_millis() as u64 <= upper,
                "attempt {attempt}: {delay:?} exceeds upper bound"
            );
            let _ = lower;
        }
    }

    #[test]
    fn parse_inbound_distinguishes_result_and_error() {
        let ok = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        let (id, outcome) = parse_inbound(&ok).unwrap();
        assert_eq!(id, 1);
        assert!(matches!(outcome, RpcOutcome::Result(_)));

        let err = serde_json::json!({"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"not found"}});
        let (id, outcome) = parse_inbound(&err).unwrap();
        assert_eq!(id, 2);
        assert!(matches!(outcome, RpcOutcome::Error(_)));
    }

    #[test]
    fn parse_inbound_returns_none_for_notifications() {
        let notification = serde_json::json!({"jsonrpc":"2.0","method":"notifications/progress"});
        assert!(parse_inbound(&notification).is_none());
    }

    #[tokio::test]
    async fn stdio_transport_round_trips_through_a_real_child() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("echo_server.py");
        std::fs::write(
            &script_path,
            r#"
import sys, json
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    resp = {"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req.get("params")}}
    print(json.dumps(resp))
    sys.stdout.flush()
"#,
        )
        .unwrap();

        let transport = StdioTransport::new(
            "python3".to_string(),
            vec![script_path.display().to_string()],
            HashMap::new(),
        );

        if transport.connect().await.is_err() {
            // python3 may not be present in the build environment; skip.
            return;
        }

        let result = transport
            .send(
                "ping",
                serde_json::json!({"hello": "world"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match result {
            RpcOutcome::Result(v) => assert_eq!(v["echo"]["hello"], "world"),
            RpcOutcome::Error(e) => panic!("unexpected rpc error: {e:?}"),
        }

        transport.close().await.unwrap();
        assert!(!transport.healthy().await);
    }

    #[tokio::test]
    async fn sse_transport_healthy_reflects_http_status() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::HEAD);
            then.status(200);
        });

        let transport = SseTransport::new(server.url("/mcp"), HashMap::new()).unwrap();
        assert!(transport.healthy().await);
        mock.assert();

        transport.close().await.unwrap();
        assert!(!transport.healthy().await);
    }
}
