//! Cross-boundary tool bridge
//!
//! ```text
//! container                          host
//! ┌──────────────┐  stdio  ┌──────────┐  HTTP POST  ┌──────────────────┐
//! │ agent (MCP)  │ ──────▶ │companion │ ──────────▶ │ bridge_router    │
//! │              │ ◀────── │ / relay  │ ◀────────── │  → BridgeService │
//! └──────────────┘         └──────────┘  JSON-RPC   │  → ToolHandler   │
//!                                                   └──────────────────┘
//! ```

pub mod companion;
pub mod jsonrpc;
pub mod relay;
pub mod router;
pub mod service;
pub mod types;

pub use companion::{companion_env, mcp_config, COMPANION_COMMAND, COMPANION_SCRIPT, MCP_CONFIG_ENV};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use relay::{run_relay, Relay};
pub use router::{bridge_router, serve};
pub use service::{BridgeContext, BridgeReply, BridgeService, SessionToolHandler, ToolHandler};
pub use types::{ToolCall, ToolContent, ToolDescriptor, ToolResult};
