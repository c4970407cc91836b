//! Upstream client stack — everything needed to own one child-process MCP
//! server:
//! - Spawning with a tier-filtered environment
//! - JSON-RPC 2.0 framing over the child's stdio
//! - Request/response correlation and per-call deadlines
//! - Lifecycle (connect, initialize, list, call, close)

pub mod client;
pub mod env;
pub mod errors;

pub use client::UpstreamClient;
pub use errors::UpstreamError;
