//! Management tools — the in-band control surface of the proxy.
//!
//! Five reflective tools bound on the host-side server mutate the upstream
//! set while the proxy is serving: `server_add`, `server_remove`,
//! `server_disconnect`, `server_reconnect`, and `server_list`. Every
//! handler takes the aggregator's write lock for its full duration; the
//! operator serializes these operations by invoking them.
//!
//! All failures are returned as tool results with `is_error` set, never as
//! transport errors, so the host-side client stays connected.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use super::aggregator::{prefixed_name, Aggregator, UpstreamOrigin, UpstreamRecord};
use super::server::{ProxyTool, ToolSet};
use crate::config::ServerConfig;
use crate::protocol::{CallToolResult, ToolSchema};
use crate::upstream::UpstreamError;

/// Bind all five management tools on the given tool set.
pub fn register_management_tools(tools: &ToolSet, aggregator: Arc<Aggregator>) {
    tools.register(Arc::new(ServerAddTool {
        aggregator: aggregator.clone(),
    }));
    tools.register(Arc::new(ServerRemoveTool {
        aggregator: aggregator.clone(),
    }));
    tools.register(Arc::new(ServerDisconnectTool {
        aggregator: aggregator.clone(),
    }));
    tools.register(Arc::new(ServerReconnectTool {
        aggregator: aggregator.clone(),
    }));
    tools.register(Arc::new(ServerListTool { aggregator }));
}

// ─── Shared Helpers ──────────────────────────────────────────────────────────

/// Extract a required string field from the tool-call arguments.
fn required_string(arguments: &serde_json::Value, field: &str) -> Result<String, CallToolResult> {
    arguments[field]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CallToolResult::error(format!("{field} is required")))
}

/// Record the request, run the operation, annotate and record the response.
async fn recorded<F>(aggregator: &Aggregator, tool: &str, arguments: &serde_json::Value, op: F) -> CallToolResult
where
    F: std::future::Future<Output = CallToolResult>,
{
    let request = serde_json::json!({"name": tool, "arguments": arguments});
    aggregator.record("request", tool, "proxy", &request);

    let result = aggregator.annotate_success(op.await);

    let response = serde_json::to_value(&result).unwrap_or_default();
    aggregator.record("response", tool, "proxy", &response);
    result
}

/// Translate a startup failure into the operator-facing message.
fn startup_error_message(error: &UpstreamError) -> String {
    match error {
        UpstreamError::SpawnFailed { reason, .. } => format!("Failed to connect: {reason}"),
        UpstreamError::InitFailed { reason, .. } => format!("Failed to initialize: {reason}"),
        other => format!("Failed to list tools: {other}"),
    }
}

fn schema_name_only(name: &str, description: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Name of the server",
                }
            },
            "required": ["name"],
        }),
    }
}

// ─── server_add ──────────────────────────────────────────────────────────────

struct ServerAddTool {
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ProxyTool for ServerAddTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "server_add".to_string(),
            description: "Add a new MCP server to the proxy dynamically".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Name/prefix for the server",
                    },
                    "command": {
                        "type": "string",
                        "description": "Command to run (e.g., 'npx -y @modelcontextprotocol/filesystem /path')",
                    }
                },
                "required": ["name", "command"],
            }),
        }
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        recorded(&self.aggregator, "server_add", &arguments, self.execute(&arguments)).await
    }
}

impl ServerAddTool {
    async fn execute(&self, arguments: &serde_json::Value) -> CallToolResult {
        let name = match required_string(arguments, "name") {
            Ok(name) => name,
            Err(error) => return error,
        };
        let command = match required_string(arguments, "command") {
            Ok(command) => command,
            Err(error) => return error,
        };

        let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return CallToolResult::error("Invalid command");
        }

        let mut state = self.aggregator.state.write().await;

        if state.upstreams.contains_key(&name) {
            return CallToolResult::error(format!("Server '{name}' already exists"));
        }

        let spec = ServerConfig {
            name: name.clone(),
            prefix: name.clone(),
            transport: "stdio".to_string(),
            command: parts[0].clone(),
            args: parts[1..].to_vec(),
            timeout: Some("30s".to_string()),
            ..Default::default()
        };

        let (client, tools) = match self.aggregator.spawn_upstream(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => return CallToolResult::error(startup_error_message(&e)),
        };

        // Reject prefixed-name collisions before touching the table.
        for schema in &tools {
            let prefixed = prefixed_name(&name, &schema.name);
            if state.registry.contains_key(&prefixed) {
                client.close().await;
                return CallToolResult::error(format!(
                    "Tool name collision: '{prefixed}' is already registered"
                ));
            }
        }

        let mut bound = Vec::with_capacity(tools.len());
        for schema in &tools {
            bound.push(self.aggregator.bind_tool(&mut state, &name, schema));
        }
        let registered = bound.len();

        state.upstreams.insert(
            name.clone(),
            UpstreamRecord {
                spec: spec.clone(),
                client: Some(client),
                tools: bound,
                connected: true,
                last_error: String::new(),
                origin: UpstreamOrigin::Dynamic,
            },
        );

        tracing::info!(server = %name, tools = registered, "server added");
        CallToolResult::text(format!(
            "Added server '{name}' with command: {}\nRegistered {registered} tools successfully.",
            parts.join(" "),
        ))
    }
}

// ─── server_remove ───────────────────────────────────────────────────────────

struct ServerRemoveTool {
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ProxyTool for ServerRemoveTool {
    fn schema(&self) -> ToolSchema {
        schema_name_only("server_remove", "Remove an MCP server from the proxy")
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        recorded(&self.aggregator, "server_remove", &arguments, self.execute(&arguments)).await
    }
}

impl ServerRemoveTool {
    async fn execute(&self, arguments: &serde_json::Value) -> CallToolResult {
        let name = match required_string(arguments, "name") {
            Ok(name) => name,
            Err(error) => return error,
        };

        let mut state = self.aggregator.state.write().await;
        let Some(record) = state.upstreams.remove(&name) else {
            return CallToolResult::error(format!("Server '{name}' not found"));
        };

        if let Some(client) = record.client {
            client.close().await;
        }

        // Host-side handler bindings stay in place (they will answer with a
        // not-found error result); the registry entries go so that a later
        // server_add with the same name can register the same tool names.
        for prefixed in &record.tools {
            state.registry.remove(prefixed);
        }

        tracing::info!(server = %name, "server removed");
        CallToolResult::text(format!(
            "Removed server '{name}'. Note: {} tools remain registered but are now unavailable.",
            record.tools.len(),
        ))
    }
}

// ─── server_disconnect ───────────────────────────────────────────────────────

struct ServerDisconnectTool {
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ProxyTool for ServerDisconnectTool {
    fn schema(&self) -> ToolSchema {
        schema_name_only(
            "server_disconnect",
            "Disconnect a server (tools remain but return errors)",
        )
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        recorded(&self.aggregator, "server_disconnect", &arguments, self.execute(&arguments)).await
    }
}

impl ServerDisconnectTool {
    async fn execute(&self, arguments: &serde_json::Value) -> CallToolResult {
        let name = match required_string(arguments, "name") {
            Ok(name) => name,
            Err(error) => return error,
        };

        let mut state = self.aggregator.state.write().await;
        let Some(record) = state.upstreams.get_mut(&name) else {
            return CallToolResult::error(format!("Server '{name}' not found"));
        };

        if !record.connected {
            return CallToolResult::text(format!("Server '{name}' is already disconnected"));
        }

        tracing::info!(server = %name, "disconnecting server");
        if let Some(client) = record.client.take() {
            client.close().await;
        }
        record.connected = false;
        record.last_error = "Server disconnected by user".to_string();

        CallToolResult::text(format!(
            "Disconnected server '{name}'. Tools remain registered but will return errors.\nUse server_reconnect to restore with new binary/command.",
        ))
    }
}

// ─── server_reconnect ────────────────────────────────────────────────────────

struct ServerReconnectTool {
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ProxyTool for ServerReconnectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "server_reconnect".to_string(),
            description:
                "Reconnect a server with optional new command (use after server_disconnect)"
                    .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Name of the server to reconnect",
                    },
                    "command": {
                        "type": "string",
                        "description": "New command to run. If omitted, uses the stored configuration.",
                    }
                },
                "required": ["name"],
            }),
        }
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        recorded(&self.aggregator, "server_reconnect", &arguments, self.execute(&arguments)).await
    }
}

impl ServerReconnectTool {
    async fn execute(&self, arguments: &serde_json::Value) -> CallToolResult {
        let name = match required_string(arguments, "name") {
            Ok(name) => name,
            Err(error) => return error,
        };
        let command = arguments["command"].as_str().unwrap_or("");

        let mut guard = self.aggregator.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.upstreams.get_mut(&name) else {
            return CallToolResult::error(format!("Server '{name}' not found"));
        };

        if record.connected {
            return CallToolResult::error(format!(
                "Server '{name}' is still connected. Use server_disconnect first."
            ));
        }

        let spec = if command.is_empty() {
            tracing::info!(server = %name, "reconnecting with stored configuration");
            record.spec.clone()
        } else {
            // A new command builds a minimal spec: only name and prefix
            // survive; stored env and inherit settings are lost.
            tracing::info!(server = %name, command, "reconnecting with new command");
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return CallToolResult::error("Invalid command");
            }
            ServerConfig {
                name: name.clone(),
                prefix: record.spec.prefix.clone(),
                transport: "stdio".to_string(),
                command: parts[0].clone(),
                args: parts[1..].to_vec(),
                timeout: Some("30s".to_string()),
                ..Default::default()
            }
        };

        // A transport failure can leave a dead client behind; reap it.
        if let Some(old) = record.client.take() {
            old.close().await;
        }

        let (client, tools) = match self.aggregator.spawn_upstream(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = startup_error_message(&e);
                record.connected = false;
                record.last_error = message.clone();
                record.spec = spec;
                return CallToolResult::error(message);
            }
        };

        record.client = Some(client);
        record.spec = spec;
        record.last_error.clear();

        // Re-point prefixed names that were already bound; tools missing
        // from the new list are left orphaned, and brand-new names are not
        // bound mid-session.
        for schema in &tools {
            let prefixed = prefixed_name(&name, &schema.name);
            if record.tools.contains(&prefixed) {
                state.registry.insert(
                    prefixed.clone(),
                    super::aggregator::RegistryEntry {
                        upstream: name.clone(),
                        original: schema.name.clone(),
                        prefixed,
                        schema: schema.clone(),
                    },
                );
            }
        }

        // Atomic flip: connected only after every field is in place.
        record.connected = true;
        tracing::info!(server = %name, "server reconnected");

        if command.is_empty() {
            CallToolResult::text(format!(
                "Reconnected server '{name}' using stored configuration\nServer now connected and tools updated.",
            ))
        } else {
            CallToolResult::text(format!(
                "Reconnected server '{name}' with new command: {command}\nStored env and inherit settings were replaced.\nServer now connected and tools updated.",
            ))
        }
    }
}

// ─── server_list ─────────────────────────────────────────────────────────────

struct ServerListTool {
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ProxyTool for ServerListTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "server_list".to_string(),
            description: "List all connected MCP servers".to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        recorded(&self.aggregator, "server_list", &arguments, self.execute()).await
    }
}

impl ServerListTool {
    async fn execute(&self) -> CallToolResult {
        let state = self.aggregator.state.read().await;

        let mut static_names: Vec<&String> = Vec::new();
        let mut dynamic_names: Vec<&String> = Vec::new();
        for (name, record) in &state.upstreams {
            match record.origin {
                UpstreamOrigin::Static => static_names.push(name),
                UpstreamOrigin::Dynamic => dynamic_names.push(name),
            }
        }
        static_names.sort();
        dynamic_names.sort();

        let mut out = String::new();
        out.push_str("Connected MCP Servers:\n");
        out.push_str("=====================\n\n");

        if static_names.is_empty() && dynamic_names.is_empty() {
            out.push_str("No servers connected.\n");
        }

        if !static_names.is_empty() {
            out.push_str("Static servers (from config):\n");
            for name in &static_names {
                render_server(&mut out, name, &state.upstreams[*name]);
            }
            out.push('\n');
        }

        if !dynamic_names.is_empty() {
            out.push_str("Dynamic servers:\n");
            for name in &dynamic_names {
                render_server(&mut out, name, &state.upstreams[*name]);
            }
        }

        let _ = write!(
            out,
            "\nTotal servers: {} (static: {}, dynamic: {})\n",
            static_names.len() + dynamic_names.len(),
            static_names.len(),
            dynamic_names.len(),
        );

        CallToolResult::text(out)
    }
}

/// Render one upstream with connection status and a truncated tool listing:
/// up to five tools in full, otherwise the first three plus a count.
fn render_server(out: &mut String, name: &str, record: &UpstreamRecord) {
    let status = if record.connected {
        "connected".to_string()
    } else if record.last_error.is_empty() {
        "disconnected".to_string()
    } else {
        format!("disconnected ({})", record.last_error)
    };

    let _ = writeln!(out, "- {name} [{status}] - {} tools", record.tools.len());

    if record.tools.len() <= 5 {
        for tool in &record.tools {
            let _ = writeln!(out, "  * {tool}");
        }
    } else {
        for tool in &record.tools[..3] {
            let _ = writeln!(out, "  * {tool}");
        }
        let _ = writeln!(out, "  * ... and {} more", record.tools.len() - 3);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
