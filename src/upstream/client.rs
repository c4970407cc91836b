//! Upstream MCP client — JSON-RPC 2.0 over a child process's stdio.
//!
//! Each client owns one child process and its lifecycle:
//! - Spawning with a pre-computed environment
//! - Line-delimited JSON-RPC framing on stdin/stdout
//! - Request/response correlation by id
//! - `connect` → `initialize` → `list_tools` → `call_tool` → `close`
//!
//! One writer task drains the outgoing queue (it alone owns the child's
//! stdin, so lines never interleave) and one reader task routes inbound
//! responses to waiters. All public methods are safe for concurrent use.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::errors::UpstreamError;
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, ToolSchema, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Grace period after closing stdin before the child is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─── Shared State ────────────────────────────────────────────────────────────

type Waiter = oneshot::Sender<Result<JsonRpcResponse, UpstreamError>>;

/// State shared between the client handle and its reader/writer tasks.
struct Shared {
    name: String,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

struct ClientState {
    connected: bool,
    child: Option<Child>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

impl Shared {
    /// Flip to disconnected and fail every in-flight request. Safe to call
    /// more than once; later calls are no-ops for already-drained waiters.
    fn disconnect(&self, make_err: impl Fn() -> UpstreamError) {
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            state.connected = false;
            state.outgoing = None;
        }
        self.fail_all_waiters(make_err);
    }

    fn fail_all_waiters(&self, make_err: impl Fn() -> UpstreamError) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("waiter table lock poisoned");
            waiters.drain().map(|(_, w)| w).collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(make_err()));
        }
    }
}

// ─── UpstreamClient ──────────────────────────────────────────────────────────

/// A managed connection to one upstream MCP server.
pub struct UpstreamClient {
    shared: Arc<Shared>,
    command: String,
    args: Vec<String>,
    /// Child environment in `"KEY=value"` form, computed by the env builder.
    env: Vec<String>,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a disconnected client. `env` is the full child environment in
    /// `"KEY=value"` form; the child inherits nothing else.
    pub fn new(
        name: &str,
        command: &str,
        args: &[String],
        env: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                next_id: AtomicU64::new(1),
                state: Mutex::new(ClientState {
                    connected: false,
                    child: None,
                    outgoing: None,
                }),
                waiters: Mutex::new(HashMap::new()),
            }),
            command: command.to_string(),
            args: args.to_vec(),
            env,
            timeout,
        }
    }

    /// The upstream's logical name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the transport is currently usable.
    pub fn connected(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("client state lock poisoned")
            .connected
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the child process and wire up the reader and writer tasks.
    pub fn connect(&self) -> Result<(), UpstreamError> {
        let name = &self.shared.name;

        let mut state = self.shared.state.lock().expect("client state lock poisoned");
        if state.connected {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.env_clear();
        for entry in &self.env {
            if let Some((key, value)) = super::env::split_env_entry(entry) {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| UpstreamError::SpawnFailed {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| UpstreamError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| UpstreamError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        // Drain stderr so the child never blocks on a full pipe; each line
        // is logged under the upstream's name for diagnosis.
        if let Some(stderr) = child.stderr.take() {
            let server = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "upstream stderr: {line}");
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        start_io_tasks(&self.shared, stdout, stdin, rx);

        state.child = Some(child);
        state.outgoing = Some(tx);
        state.connected = true;

        tracing::info!(server = %name, command = %self.command, "upstream connected");
        Ok(())
    }

    /// Perform the MCP `initialize` handshake. The response payload is
    /// discarded; only success matters.
    pub async fn initialize(&self) -> Result<(), UpstreamError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-proxy",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let init_failed = |reason: String| UpstreamError::InitFailed {
            name: self.shared.name.clone(),
            reason,
        };

        let response = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| init_failed(e.to_string()))?;
        let result = extract_result(response).map_err(|e| init_failed(e.to_string()))?;

        if let Ok(init) = serde_json::from_value::<InitializeResult>(result) {
            if let Some(info) = init.server_info {
                tracing::info!(
                    server = %self.shared.name,
                    peer = %info.name,
                    peer_version = %info.version,
                    "upstream initialized"
                );
            }
        }

        // Completes the handshake; the peer does not answer notifications.
        let _ = self.notify("notifications/initialized", None);
        Ok(())
    }

    /// Fetch the peer's advertised tools.
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, UpstreamError> {
        let response = self.request("tools/list", None).await?;
        let result = extract_result(response)?;
        let listed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| UpstreamError::TransportError {
                server: self.shared.name.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        Ok(listed.tools)
    }

    /// Invoke a tool on the peer. Tool-reported failures come back as a
    /// result with `is_error` set; only transport and protocol faults raise.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, UpstreamError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(|e| UpstreamError::TransportError {
            server: self.shared.name.clone(),
            reason: format!("failed to serialize tools/call params: {e}"),
        })?;

        let response = self.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;
        serde_json::from_value(result).map_err(|e| UpstreamError::TransportError {
            server: self.shared.name.clone(),
            reason: format!("failed to parse tools/call response: {e}"),
        })
    }

    /// Close the connection and terminate the child. Idempotent: closing
    /// stdin signals EOF, and the child is killed if it has not exited
    /// within the grace period. All in-flight requests fail with a closed
    /// error.
    pub async fn close(&self) {
        let child = {
            let mut state = self.shared.state.lock().expect("client state lock poisoned");
            state.connected = false;
            state.outgoing = None; // dropping the sender ends the writer task
            state.child.take()
        };

        let server = self.shared.name.clone();
        self.shared
            .fail_all_waiters(|| UpstreamError::Closed { server: server.clone() });

        let Some(mut child) = child else { return };

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.shared.name, ?status, "upstream exited");
            }
            _ => {
                tracing::warn!(server = %self.shared.name, "upstream did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    // ─── Request Plumbing ────────────────────────────────────────────────

    /// Send one request and wait for the matching response, bounded by the
    /// client's timeout. The connected check and sender copy happen in a
    /// single critical section.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let server = self.shared.name.clone();

        let outgoing = {
            let state = self.shared.state.lock().expect("client state lock poisoned");
            if !state.connected {
                return Err(UpstreamError::Closed { server });
            }
            state
                .outgoing
                .clone()
                .ok_or(UpstreamError::Closed { server: server.clone() })?
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(
            |e| UpstreamError::TransportError {
                server: server.clone(),
                reason: format!("failed to serialize request: {e}"),
            },
        )?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .waiters
            .lock()
            .expect("waiter table lock poisoned")
            .insert(id, tx);

        if outgoing.send(frame).is_err() {
            self.remove_waiter(id);
            return Err(UpstreamError::Closed { server });
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            // Waiter dropped without completion: the client closed
            Ok(Err(_)) => Err(UpstreamError::Closed { server }),
            Err(_) => {
                // Deadline expired for this call only; the waiter is
                // removed so a late response is silently discarded.
                self.remove_waiter(id);
                Err(UpstreamError::Timeout {
                    server,
                    method: method.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), UpstreamError> {
        let server = self.shared.name.clone();

        let outgoing = {
            let state = self.shared.state.lock().expect("client state lock poisoned");
            if !state.connected {
                return Err(UpstreamError::Closed { server });
            }
            state
                .outgoing
                .clone()
                .ok_or(UpstreamError::Closed { server: server.clone() })?
        };

        let frame = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(|e| UpstreamError::TransportError {
                server: server.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;

        outgoing
            .send(frame)
            .map_err(|_| UpstreamError::Closed { server })
    }

    fn remove_waiter(&self, id: u64) {
        self.shared
            .waiters
            .lock()
            .expect("waiter table lock poisoned")
            .remove(&id);
    }

    // ─── Test Wiring ─────────────────────────────────────────────────────

    /// Build a connected client over arbitrary streams, with no child
    /// process behind it. Used with `tokio::io::duplex` peers in tests.
    #[cfg(test)]
    pub(crate) fn connect_streams<R, W>(name: &str, timeout: Duration, read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client = Self::new(name, "<test>", &[], Vec::new(), timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        start_io_tasks(&client.shared, read, write, rx);
        {
            let mut state = client
                .shared
                .state
                .lock()
                .expect("client state lock poisoned");
            state.outgoing = Some(tx);
            state.connected = true;
        }
        client
    }
}

// ─── I/O Tasks ───────────────────────────────────────────────────────────────

/// Spawn the writer task (sole owner of the child's stdin) and the reader
/// task (sole owner of its stdout).
fn start_io_tasks<R, W>(
    shared: &Arc<Shared>,
    read: R,
    mut write: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_shared = shared.clone();
    tokio::spawn(async move {
        while let Some(mut line) = outgoing.recv().await {
            line.push('\n');
            let write_result = async {
                write.write_all(line.as_bytes()).await?;
                write.flush().await
            }
            .await;

            if let Err(e) = write_result {
                let server = writer_shared.name.clone();
                tracing::warn!(server = %server, error = %e, "upstream write failed");
                writer_shared.disconnect(|| UpstreamError::TransportError {
                    server: server.clone(),
                    reason: format!("failed to write to stdin: {e}"),
                });
                return;
            }
        }
        // Sender dropped: the client is closing; nothing left to do.
    });

    let reader_shared = shared.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    route_line(&reader_shared, trimmed);
                }
                Ok(None) => {
                    let server = reader_shared.name.clone();
                    reader_shared.disconnect(|| UpstreamError::TransportError {
                        server: server.clone(),
                        reason: "server stdout closed (process may have exited)".into(),
                    });
                    return;
                }
                Err(e) => {
                    let server = reader_shared.name.clone();
                    tracing::warn!(server = %server, error = %e, "upstream read failed");
                    reader_shared.disconnect(|| UpstreamError::TransportError {
                        server: server.clone(),
                        reason: format!("failed to read from stdout: {e}"),
                    });
                    return;
                }
            }
        }
    });
}

/// Route one inbound line: responses complete their waiter, notifications
/// are dropped, and non-JSON lines (server log noise) are skipped.
fn route_line(shared: &Shared, line: &str) {
    let response: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(resp) => resp,
        Err(_) => {
            tracing::debug!(server = %shared.name, "skipping non-response line");
            return;
        }
    };

    let Some(id) = response.id.as_u64() else {
        tracing::debug!(server = %shared.name, id = %response.id, "response with non-numeric id");
        return;
    };

    let waiter = shared
        .waiters
        .lock()
        .expect("waiter table lock poisoned")
        .remove(&id);

    match waiter {
        Some(waiter) => {
            // A dropped receiver means the caller gave up; discard.
            let _ = waiter.send(Ok(response));
        }
        None => {
            tracing::debug!(server = %shared.name, id, "response for unknown request id");
        }
    }
}

/// Extract the result payload from a response, converting peer errors.
fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, UpstreamError> {
    if let Some(err) = response.error {
        return Err(UpstreamError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    response.result.ok_or(UpstreamError::ServerError {
        code: crate::protocol::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePeer, PeerOptions};

    fn peer_client(timeout_ms: u64, options: PeerOptions) -> (UpstreamClient, Arc<FakePeer>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = FakePeer::spawn(remote, options);
        let (read, write) = tokio::io::split(local);
        let client = UpstreamClient::connect_streams(
            "test",
            Duration::from_millis(timeout_ms),
            read,
            write,
        );
        (client, peer)
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (client, peer) = peer_client(1000, PeerOptions::default());
        client.initialize().await.unwrap();

        // Allow the notification to be flushed through the peer
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = peer.seen_methods();
        assert!(seen.contains(&"initialize".to_string()));
        assert!(seen.contains(&"notifications/initialized".to_string()));
    }

    #[tokio::test]
    async fn test_list_tools() {
        let (client, _peer) = peer_client(1000, PeerOptions::default());
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let (client, _peer) = peer_client(1000, PeerOptions::default());
        let result = client
            .call_tool("greet", serde_json::json!({"who": "a"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[0].as_text(), Some("hi a"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_by_id() {
        // Five concurrent calls with inverted delays: responses arrive in
        // reverse order, each caller must still receive its own echo.
        let (client, _peer) = peer_client(2000, PeerOptions::default());
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let delay = (4 - i) * 40;
                let result = client
                    .call_tool(
                        "echo",
                        serde_json::json!({"tag": format!("t{i}"), "delay_ms": delay}),
                    )
                    .await
                    .unwrap();
                (i, result.content[0].as_text().unwrap().to_string())
            }));
        }

        for handle in handles {
            let (i, text) = handle.await.unwrap();
            assert_eq!(text, format!("echo:t{i}"));
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_other_calls_unaffected() {
        // One caller exceeds the 100ms deadline while a faster concurrent
        // caller on the same upstream still gets its response.
        let (client, _peer) = peer_client(100, PeerOptions::default());
        let client = Arc::new(client);

        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("echo", serde_json::json!({"tag": "slow", "delay_ms": 500}))
                    .await
            })
        };
        let fast = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("echo", serde_json::json!({"tag": "fast", "delay_ms": 10}))
                    .await
            })
        };

        let slow = slow.await.unwrap();
        assert!(matches!(slow, Err(UpstreamError::Timeout { .. })));

        let fast = fast.await.unwrap().unwrap();
        assert_eq!(fast.content[0].as_text(), Some("echo:fast"));
    }

    #[tokio::test]
    async fn test_peer_error_becomes_server_error() {
        let (client, _peer) = peer_client(1000, PeerOptions::default());
        let err = client
            .call_tool("explode", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            UpstreamError::ServerError { code, .. } => assert_eq!(code, -32601),
            other => panic!("expected ServerError, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_tool_error_result_does_not_raise() {
        let (client, _peer) = peer_client(1000, PeerOptions::default());
        let result = client
            .call_tool("fail", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_non_json_lines_are_skipped() {
        let options = PeerOptions {
            banner: Some("starting up, please hold\n".to_string()),
            ..Default::default()
        };
        let (client, _peer) = peer_client(1000, options);
        let result = client
            .call_tool("greet", serde_json::json!({"who": "b"}))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("hi b"));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_idempotent() {
        let (client, _peer) = peer_client(5000, PeerOptions::default());
        let client = Arc::new(client);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("echo", serde_json::json!({"tag": "x", "delay_ms": 2000}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close().await;
        client.close().await; // idempotent

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(UpstreamError::Closed { .. })));
        assert!(!client.connected());

        // Subsequent calls fail fast
        let err = client
            .call_tool("greet", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_peer_eof_drains_pending_with_transport_error() {
        let (client, peer) = peer_client(5000, PeerOptions::default());
        let client = Arc::new(client);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("echo", serde_json::json!({"tag": "x", "delay_ms": 2000}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.shutdown();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(UpstreamError::TransportError { .. })));
        assert!(!client.connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let client = UpstreamClient::new(
            "ghost",
            "/nonexistent/definitely-not-a-binary",
            &[],
            Vec::new(),
            Duration::from_secs(1),
        );
        let err = client.connect().unwrap_err();
        assert!(matches!(err, UpstreamError::SpawnFailed { .. }));
        assert!(!client.connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_terminates_child() {
        // A child that ignores stdin EOF gets killed after the grace period;
        // afterwards every method fails fast.
        let client = UpstreamClient::new(
            "sleeper",
            "/bin/sh",
            &["-c".to_string(), "sleep 60".to_string()],
            Vec::new(),
            Duration::from_secs(1),
        );
        client.connect().unwrap();
        assert!(client.connected());

        client.close().await;
        assert!(!client.connected());

        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Closed { .. }));
    }
}
