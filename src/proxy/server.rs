//! Host-side MCP server adapter.
//!
//! Speaks JSON-RPC 2.0 to the single MCP client attached to the proxy's own
//! stdio. Advertises tool capabilities only; the tool set is dynamic so
//! management tools can bind new handlers while the server is running.
//!
//! One reader loop parses inbound lines, one writer task owns stdout, and
//! each request with an id is dispatched on its own task so tool calls run
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcError, JsonRpcResponse, ToolSchema, PROTOCOL_VERSION,
};

// ─── Tool Trait ──────────────────────────────────────────────────────────────

/// A tool bound on the host-side server.
///
/// `call` returns a tool result in every case: foreseeable failures are
/// results with `is_error` set, never transport-level errors, so the
/// host-side client stays connected even when every upstream is down.
#[async_trait]
pub trait ProxyTool: Send + Sync {
    /// The schema advertised in `tools/list`.
    fn schema(&self) -> ToolSchema;

    /// Execute the tool.
    async fn call(&self, arguments: serde_json::Value) -> CallToolResult;
}

// ─── ToolSet ─────────────────────────────────────────────────────────────────

/// The dynamic tool set owned by the server. The aggregator and management
/// layer hold this as their registration handle.
#[derive(Default)]
pub struct ToolSet {
    tools: RwLock<HashMap<String, Arc<dyn ProxyTool>>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a tool under its schema name. Re-binding an existing name
    /// replaces the previous handler.
    pub fn register(&self, tool: Arc<dyn ProxyTool>) {
        let name = tool.schema().name;
        self.tools
            .write()
            .expect("tool set lock poisoned")
            .insert(name, tool);
    }

    /// Look up a tool, cloning the handle so no lock is held during the call.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProxyTool>> {
        self.tools
            .read()
            .expect("tool set lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool set lock poisoned")
            .contains_key(name)
    }

    /// All bound schemas, sorted by name for a stable listing.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .expect("tool set lock poisoned")
            .values()
            .map(|tool| tool.schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── McpServer ───────────────────────────────────────────────────────────────

/// The host-side MCP endpoint.
pub struct McpServer {
    name: String,
    version: String,
    tools: Arc<ToolSet>,
}

impl McpServer {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            tools: Arc::new(ToolSet::new()),
        }
    }

    /// The registration handle for binding tools.
    pub fn tool_set(&self) -> Arc<ToolSet> {
        self.tools.clone()
    }

    /// Serve MCP over this process's stdin/stdout until EOF.
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();

        // Single writer task owns stdout; responses from concurrent
        // request tasks are funneled through this channel.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
        });

        let mut lines = BufReader::new(stdin).lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(_) => {
                    let response = JsonRpcResponse::error(
                        serde_json::Value::Null,
                        JsonRpcError::parse_error(),
                    );
                    let _ = tx.send(serde_json::to_string(&response).unwrap_or_default());
                    continue;
                }
            };

            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_message(message).await {
                    if let Ok(frame) = serde_json::to_string(&response) {
                        let _ = tx.send(frame);
                    }
                }
            });
        }

        drop(tx);
        let _ = writer.await;
        tracing::info!("host-side stdin closed, server loop ending");
        Ok(())
    }

    /// Handle one inbound message. Returns `None` for notifications and for
    /// stray responses (the proxy never issues host-side requests).
    pub async fn handle_message(&self, message: serde_json::Value) -> Option<JsonRpcResponse> {
        let Some(obj) = message.as_object() else {
            return Some(JsonRpcResponse::error(
                serde_json::Value::Null,
                JsonRpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(serde_json::Value::Null);
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(|v| v.as_str()) else {
            return None;
        };
        let params = obj.get("params").cloned().unwrap_or(serde_json::Value::Null);

        let Some(id) = obj.get("id").cloned().filter(|id| !id.is_null()) else {
            self.handle_notification(method);
            return None;
        };

        Some(match self.handle_request(method, params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn handle_notification(&self, method: &str) {
        // Notifications are accepted and dropped, including
        // notifications/initialized and notifications/cancelled.
        tracing::debug!(method, "dropping notification");
    }

    async fn handle_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, JsonRpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => Ok(serde_json::json!({ "tools": self.tools.schemas() })),
            "tools/call" => self.handle_tools_call(params).await,
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": self.name,
                "version": self.version,
            },
        })
    }

    async fn handle_tools_call(
        &self,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let params: CallToolParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("invalid tools/call params: {e}")))?;

        let result = match self.tools.get(&params.name) {
            Some(tool) => tool.call(params.arguments).await,
            None => CallToolResult::error(format!("Unknown tool '{}'", params.name)),
        };

        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::internal_error(format!("failed to serialize result: {e}")))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ProxyTool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo the input".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
            CallToolResult::text(arguments["text"].as_str().unwrap_or("").to_string())
        }
    }

    fn server_with_echo() -> McpServer {
        let server = McpServer::new("test-proxy", "0.0.0");
        server.tool_set().register(Arc::new(EchoTool));
        server
    }

    #[tokio::test]
    async fn test_initialize() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"protocolVersion": PROTOCOL_VERSION, "capabilities": {}},
            }))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "test-proxy");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/list",
            }))
            .await
            .unwrap();

        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], "echo");
    }

    #[tokio::test]
    async fn test_tools_call_routes_to_handler() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hello"}},
            }))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_tool_result_error() {
        // The host-side client must stay connected: unknown tools come back
        // as isError results, not JSON-RPC failures.
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "missing", "arguments": {}},
            }))
            .await
            .unwrap();

        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Unknown tool 'missing'"));
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "id": 5, "method": "resources/list",
            }))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_notifications_produce_no_response() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "2.0", "method": "notifications/initialized",
            }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_wrong_jsonrpc_version_rejected() {
        let server = server_with_echo();
        let response = server
            .handle_message(serde_json::json!({
                "jsonrpc": "1.0", "id": 6, "method": "ping",
            }))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[test]
    fn test_rebinding_replaces_handler() {
        let tools = ToolSet::new();
        tools.register(Arc::new(EchoTool));
        tools.register(Arc::new(EchoTool));
        assert_eq!(tools.len(), 1);
        assert!(tools.contains("echo"));
    }
}
