//! Shared test fixtures: an in-memory MCP peer driven over
//! `tokio::io::duplex`, and an on-disk shell implementation of a minimal
//! MCP server for process-level tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{CallToolParams, JsonRpcError, JsonRpcResponse, ToolSchema};

// ─── FakePeer ────────────────────────────────────────────────────────────────

/// Behavior knobs for a [`FakePeer`].
pub(crate) struct PeerOptions {
    /// Identity returned by `initialize` and the `whoami` tool. Lets tests
    /// tell two generations of the same logical upstream apart.
    pub tag: String,
    /// Tools advertised by `tools/list`.
    pub tools: Vec<ToolSchema>,
    /// Raw text written before serving, to simulate startup log noise.
    pub banner: Option<String>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            tag: "peer".to_string(),
            tools: vec![ToolSchema {
                name: "greet".to_string(),
                description: "Say hello".to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"who": {"type": "string"}},
                }),
            }],
            banner: None,
        }
    }
}

/// An in-memory MCP server speaking newline-delimited JSON-RPC over one half
/// of a duplex stream.
///
/// Implemented tools:
/// - `greet {who}` → `"hi {who}"`
/// - `echo {tag, delay_ms}` → `"echo:{tag}"` after the delay (responses can
///   complete out of order)
/// - `whoami {}` → the peer's tag
/// - `fail {}` → a tool result with `isError` set
/// - anything else → JSON-RPC method-not-found error
pub(crate) struct FakePeer {
    seen: Arc<Mutex<Vec<String>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakePeer {
    pub fn spawn(stream: DuplexStream, options: PeerOptions) -> Arc<Self> {
        let peer = Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            kill: Mutex::new(None),
        });

        let (read, mut write) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        *peer.kill.lock().unwrap() = Some(kill_tx);

        // Writer: sole owner of the write half. Ends (dropping the stream
        // and signalling EOF to the client) on kill or when all senders go.
        let banner = options.banner.clone();
        tokio::spawn(async move {
            if let Some(banner) = banner {
                let _ = write.write_all(banner.as_bytes()).await;
            }
            loop {
                tokio::select! {
                    _ = &mut kill_rx => return,
                    line = out_rx.recv() => {
                        let Some(mut line) = line else { return };
                        line.push('\n');
                        if write.write_all(line.as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = write.flush().await;
                    }
                }
            }
        });

        let seen = peer.seen.clone();
        let tag = options.tag.clone();
        let tools = options.tools.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(msg) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                let Some(method) = msg["method"].as_str().map(str::to_string) else {
                    continue;
                };
                seen.lock().unwrap().push(method.clone());

                let Some(id) = msg.get("id").cloned().filter(|id| !id.is_null()) else {
                    continue; // notification
                };

                let response = match method.as_str() {
                    "initialize" => JsonRpcResponse::success(
                        id,
                        serde_json::json!({
                            "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                            "capabilities": {},
                            "serverInfo": {"name": tag, "version": "0"},
                        }),
                    ),
                    "tools/list" => JsonRpcResponse::success(
                        id,
                        serde_json::json!({ "tools": tools }),
                    ),
                    "tools/call" => {
                        let params: CallToolParams =
                            match serde_json::from_value(msg["params"].clone()) {
                                Ok(params) => params,
                                Err(e) => {
                                    let err = JsonRpcError::invalid_params(e.to_string());
                                    let _ = out_tx.send(
                                        serde_json::to_string(&JsonRpcResponse::error(id, err))
                                            .unwrap(),
                                    );
                                    continue;
                                }
                            };
                        match params.name.as_str() {
                            "greet" => {
                                let who =
                                    params.arguments["who"].as_str().unwrap_or("stranger");
                                tool_text(id, &format!("hi {who}"), false)
                            }
                            "whoami" => tool_text(id, &tag, false),
                            "fail" => tool_text(id, "boom", true),
                            "echo" => {
                                let delay =
                                    params.arguments["delay_ms"].as_u64().unwrap_or(0);
                                let reply_tag = params.arguments["tag"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string();
                                let out_tx = out_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_millis(delay)).await;
                                    let response =
                                        tool_text(id, &format!("echo:{reply_tag}"), false);
                                    let _ = out_tx
                                        .send(serde_json::to_string(&response).unwrap());
                                });
                                continue;
                            }
                            other => JsonRpcResponse::error(
                                id,
                                JsonRpcError::method_not_found(other),
                            ),
                        }
                    }
                    _ => JsonRpcResponse::success(id, serde_json::json!({})),
                };

                if out_tx
                    .send(serde_json::to_string(&response).unwrap())
                    .is_err()
                {
                    return;
                }
            }
        });

        peer
    }

    /// Methods received so far, in order.
    pub fn seen_methods(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Drop the peer's end of the stream, producing EOF on the client side.
    pub fn shutdown(&self) {
        if let Some(kill) = self.kill.lock().unwrap().take() {
            let _ = kill.send(());
        }
    }
}

fn tool_text(id: serde_json::Value, text: &str, is_error: bool) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "content": [{"type": "text", "text": text}],
            "isError": is_error,
        }),
    )
}

// ─── On-disk fake server ─────────────────────────────────────────────────────

/// A minimal MCP server written in POSIX sh. It answers `initialize`,
/// `tools/list` (one `pid` tool), and `tools/call` (reports the shell's
/// `$$`), so tests can observe which process generation answered a call.
#[cfg(unix)]
const FAKE_SERVER_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"pid","description":"report the server pid","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pid:%s"}],"isError":false}}\n' "$id" "$$";;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
  esac
done
"#;

/// Write the fake server script into a temp dir and return it with the
/// executable's path. The dir must outlive the spawned children.
#[cfg(unix)]
pub(crate) fn fake_server_script() -> (tempfile::TempDir, std::path::PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("fake-mcp-server");
    std::fs::write(&path, FAKE_SERVER_SCRIPT).expect("write fake server script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("mark script executable");
    (dir, path)
}
