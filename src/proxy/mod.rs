//! The serving plane — everything the MCP client on our stdio talks to:
//! - Host-side JSON-RPC server adapter with a dynamic tool set
//! - Aggregator routing prefixed tool names to upstreams by name
//! - Management tools mutating the upstream set while serving
//! - Optional JSONL recording of every tool call

pub mod aggregator;
pub mod management;
pub mod recorder;
pub mod server;

pub use aggregator::Aggregator;
pub use recorder::Recorder;
pub use server::{McpServer, ProxyTool, ToolSet};
