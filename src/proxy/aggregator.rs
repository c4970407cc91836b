//! Aggregator — the upstream table and the registry of prefixed tools.
//!
//! The aggregator owns one record per upstream (its spec, current client,
//! advertised tool names, connection state) and one registry entry per
//! prefixed tool name. Handlers never capture a client: they store the
//! upstream's *name* and resolve the current client through the table on
//! every call, which is what keeps hot-swap sound.
//!
//! Locking: readers (tool handlers) take the state lock only long enough to
//! copy the current client handle; writers (management tools) hold it for
//! the whole operation, including child I/O, which the operator has
//! serialized by invoking them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;

use super::recorder::Recorder;
use super::server::{ProxyTool, ToolSet};
use crate::config::{InheritConfig, ProxyConfig, ServerConfig};
use crate::protocol::{CallToolResult, ToolSchema};
use crate::upstream::{env, UpstreamClient, UpstreamError};

// ─── Records ─────────────────────────────────────────────────────────────────

/// Whether an upstream came from the initial configuration or was added at
/// runtime via `server_add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOrigin {
    Static,
    Dynamic,
}

/// Runtime state for one upstream. `connected` flips to true only after
/// every other field is in place, and implies `client` is present.
pub struct UpstreamRecord {
    pub spec: ServerConfig,
    pub client: Option<Arc<UpstreamClient>>,
    /// Prefixed tool names currently advertised for this upstream.
    pub tools: Vec<String>,
    pub connected: bool,
    pub last_error: String,
    pub origin: UpstreamOrigin,
}

/// One registry entry per prefixed tool name. Points at an upstream by
/// name, never by client handle.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub upstream: String,
    pub original: String,
    pub prefixed: String,
    pub schema: ToolSchema,
}

pub(crate) struct AggregatorState {
    pub(crate) upstreams: HashMap<String, UpstreamRecord>,
    pub(crate) registry: HashMap<String, RegistryEntry>,
}

/// Compute the host-facing name for an upstream tool.
pub fn prefixed_name(upstream: &str, tool: &str) -> String {
    format!("{upstream}_{tool}")
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

pub struct Aggregator {
    pub(crate) state: RwLock<AggregatorState>,
    pub(crate) tools: Arc<ToolSet>,
    recorder: std::sync::RwLock<Option<Arc<Recorder>>>,
    pub(crate) proxy_inherit: Option<InheritConfig>,
}

impl Aggregator {
    pub fn new(tools: Arc<ToolSet>, proxy_inherit: Option<InheritConfig>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(AggregatorState {
                upstreams: HashMap::new(),
                registry: HashMap::new(),
            }),
            tools,
            recorder: std::sync::RwLock::new(None),
            proxy_inherit,
        })
    }

    // ─── Recording ───────────────────────────────────────────────────────

    pub fn enable_recording(&self, recorder: Arc<Recorder>) {
        *self.recorder.write().expect("recorder lock poisoned") = Some(recorder);
    }

    fn recorder(&self) -> Option<Arc<Recorder>> {
        self.recorder.read().expect("recorder lock poisoned").clone()
    }

    /// Record one side of a tool call. No-op while recording is disabled.
    pub(crate) fn record(
        &self,
        direction: &str,
        tool_name: &str,
        server_name: &str,
        message: &serde_json::Value,
    ) {
        if let Some(recorder) = self.recorder() {
            recorder.record(direction, "tool_call", tool_name, server_name, message);
        }
    }

    /// Append recording metadata to successful results. Error results and
    /// results produced while recording is disabled pass through untouched.
    pub(crate) fn annotate_success(&self, result: CallToolResult) -> CallToolResult {
        if result.is_error {
            return result;
        }
        match self.recorder() {
            Some(recorder) => recorder.annotate(&result),
            None => result,
        }
    }

    // ─── Upstream Lifecycle ──────────────────────────────────────────────

    /// Spawn, initialize, and list tools for one spec. On any failure the
    /// partially-created client is closed and nothing is registered.
    pub(crate) async fn spawn_upstream(
        &self,
        spec: &ServerConfig,
    ) -> Result<(Arc<UpstreamClient>, Vec<ToolSchema>), UpstreamError> {
        let environment = env::build_environment(spec, self.proxy_inherit.as_ref());
        let client = Arc::new(UpstreamClient::new(
            &spec.name,
            &spec.command,
            &spec.args,
            environment,
            spec.timeout(),
        ));

        client.connect()?;
        if let Err(e) = client.initialize().await {
            client.close().await;
            return Err(e);
        }
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        Ok((client, tools))
    }

    /// Bind one upstream tool: a registry entry plus a host-side handler
    /// under the prefixed name. Returns the prefixed name.
    pub(crate) fn bind_tool(
        self: &Arc<Self>,
        state: &mut AggregatorState,
        upstream: &str,
        schema: &ToolSchema,
    ) -> String {
        let prefixed = prefixed_name(upstream, &schema.name);

        let advertised = ToolSchema {
            name: prefixed.clone(),
            description: if schema.description.is_empty() {
                format!("[{upstream}] {}", schema.name)
            } else {
                format!("[{upstream}] {}", schema.description)
            },
            input_schema: schema.input_schema.clone(),
        };

        state.registry.insert(
            prefixed.clone(),
            RegistryEntry {
                upstream: upstream.to_string(),
                original: schema.name.clone(),
                prefixed: prefixed.clone(),
                schema: schema.clone(),
            },
        );

        self.tools.register(Arc::new(UpstreamTool {
            aggregator: self.clone(),
            upstream: upstream.to_string(),
            original: schema.name.clone(),
            prefixed: prefixed.clone(),
            advertised,
        }));

        tracing::info!(tool = %prefixed, server = %upstream, "registered tool");
        prefixed
    }

    /// Connect every statically configured upstream. Failures do not abort
    /// startup: the record is created disconnected with `last_error` set so
    /// `server_reconnect` can restore it later.
    pub async fn connect_static(self: &Arc<Self>, config: &ProxyConfig) {
        for spec in &config.servers {
            let mut state = self.state.write().await;
            match self.spawn_upstream(spec).await {
                Ok((client, tools)) => {
                    let mut bound = Vec::with_capacity(tools.len());
                    for schema in &tools {
                        bound.push(self.bind_tool(&mut state, &spec.name, schema));
                    }
                    tracing::info!(
                        server = %spec.name,
                        tools = bound.len(),
                        "static upstream connected"
                    );
                    state.upstreams.insert(
                        spec.name.clone(),
                        UpstreamRecord {
                            spec: spec.clone(),
                            client: Some(client),
                            tools: bound,
                            connected: true,
                            last_error: String::new(),
                            origin: UpstreamOrigin::Static,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(server = %spec.name, error = %e, "static upstream failed");
                    state.upstreams.insert(
                        spec.name.clone(),
                        UpstreamRecord {
                            spec: spec.clone(),
                            client: None,
                            tools: Vec::new(),
                            connected: false,
                            last_error: e.to_string(),
                            origin: UpstreamOrigin::Static,
                        },
                    );
                }
            }
        }
    }

    /// Close every upstream in parallel.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<UpstreamClient>> = {
            let mut state = self.state.write().await;
            state
                .upstreams
                .values_mut()
                .filter_map(|record| {
                    record.connected = false;
                    record.client.take()
                })
                .collect()
        };

        join_all(clients.iter().map(|client| client.close())).await;
        tracing::info!(count = clients.len(), "all upstreams closed");
    }
}

// ─── UpstreamTool ────────────────────────────────────────────────────────────

/// Host-side handler for one proxied tool. Holds only names; the client is
/// resolved through the aggregator table on every call.
struct UpstreamTool {
    aggregator: Arc<Aggregator>,
    upstream: String,
    original: String,
    prefixed: String,
    advertised: ToolSchema,
}

#[async_trait]
impl ProxyTool for UpstreamTool {
    fn schema(&self) -> ToolSchema {
        self.advertised.clone()
    }

    async fn call(&self, arguments: serde_json::Value) -> CallToolResult {
        let request = serde_json::json!({
            "name": self.prefixed,
            "arguments": arguments,
        });
        self.aggregator
            .record("request", &self.prefixed, &self.upstream, &request);

        let result = self.dispatch(arguments).await;

        let result = self.aggregator.annotate_success(result);
        let response = serde_json::to_value(&result).unwrap_or_default();
        self.aggregator
            .record("response", &self.prefixed, &self.upstream, &response);
        result
    }
}

impl UpstreamTool {
    async fn dispatch(&self, arguments: serde_json::Value) -> CallToolResult {
        // Copy the current client under the read lock, then release it
        // before any I/O.
        let client = {
            let state = self.aggregator.state.read().await;
            match state.upstreams.get(&self.upstream) {
                None => {
                    return CallToolResult::error(format!(
                        "Server '{}' not found.\nUse server_reconnect to restore connection.",
                        self.upstream
                    ));
                }
                Some(record) => {
                    if !record.connected || record.client.is_none() {
                        let mut message = format!("Server '{}' is disconnected", self.upstream);
                        if !record.last_error.is_empty() {
                            message.push_str(&format!(": {}", record.last_error));
                        }
                        message.push_str("\nUse server_reconnect to restore connection.");
                        return CallToolResult::error(message);
                    }
                    record.client.clone().expect("connected record has client")
                }
            }
        };

        match client.call_tool(&self.original, arguments).await {
            Ok(result) if result.is_error => {
                let text = flatten_text(&result);
                CallToolResult::error(if text.is_empty() {
                    "Tool execution failed".to_string()
                } else {
                    text
                })
            }
            Ok(result) => {
                let text = flatten_text(&result);
                CallToolResult::text(if text.is_empty() {
                    "Tool executed successfully".to_string()
                } else {
                    text
                })
            }
            Err(e) if e.is_connection_error() => {
                // Transport-level failure: flip the record to disconnected
                // so later calls steer the operator to server_reconnect.
                {
                    let mut state = self.aggregator.state.write().await;
                    if let Some(record) = state.upstreams.get_mut(&self.upstream) {
                        record.connected = false;
                        record.last_error = e.to_string();
                    }
                }
                tracing::warn!(server = %self.upstream, error = %e, "upstream connection failed");
                CallToolResult::error(format!(
                    "Server '{}' connection failed: {e}\nUse server_reconnect to restore connection.",
                    self.upstream
                ))
            }
            Err(e) => CallToolResult::error(format!("[{}] {e}", self.upstream)),
        }
    }
}

/// Concatenate the text items of a result, newline-separated.
fn flatten_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| item.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
