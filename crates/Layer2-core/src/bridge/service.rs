//! Host side of the tool bridge
//!
//! Authorizes each request against the session it names, then routes the
//! JSON-RPC method to a `ToolHandler`.

use super::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use super::types::{ToolCall, ToolDescriptor, ToolResult};
use async_trait::async_trait;
use berth_foundation::{Error, IsolationStore, Result, Session, SessionStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// MCP protocol revision announced by `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Who is calling
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub session: Session,
    pub user_id: Option<String>,
}

/// Host-side tool logic reachable from containers
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn initialize(&self, ctx: &BridgeContext, params: Option<Value>) -> Result<Value>;

    async fn list_tools(&self, ctx: &BridgeContext) -> Result<Value>;

    async fn call_tool(&self, ctx: &BridgeContext, params: Option<Value>) -> Result<Value>;
}

/// Outcome of one bridge request
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeReply {
    /// Malformed at the HTTP level (HTTP 400)
    BadRequest(String),
    /// A JSON-RPC answer (HTTP 200), errors included
    Rpc(JsonRpcResponse),
}

/// Validates and dispatches bridge requests
#[derive(Clone)]
pub struct BridgeService {
    store: Arc<dyn IsolationStore>,
    handler: Arc<dyn ToolHandler>,
}

impl BridgeService {
    pub fn new(store: Arc<dyn IsolationStore>, handler: Arc<dyn ToolHandler>) -> Self {
        Self { store, handler }
    }

    pub async fn handle(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
        body: &[u8],
    ) -> BridgeReply {
        let Some(session_id) = session_id.map(str::trim).filter(|s| !s.is_empty()) else {
            return BridgeReply::BadRequest("missing sessionId".to_string());
        };

        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return BridgeReply::BadRequest(format!("body is not JSON: {}", e)),
        };

        let request: JsonRpcRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(_) => {
                return BridgeReply::Rpc(JsonRpcResponse::failure(
                    value.get("id").cloned(),
                    JsonRpcError::invalid_request(),
                ))
            }
        };

        let session = match self.store.get_session(session_id) {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(session_id = %session_id, method = %request.method, "Bridge call for unknown session");
                return BridgeReply::Rpc(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::unauthorized(),
                ));
            }
            Err(e) => {
                return BridgeReply::Rpc(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::internal_error(e.to_string()),
                ))
            }
        };

        let ctx = BridgeContext {
            session,
            user_id: user_id.map(str::to_string),
        };

        BridgeReply::Rpc(self.dispatch(&ctx, request).await)
    }

    async fn dispatch(&self, ctx: &BridgeContext, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(session_id = %ctx.session.id, method = %request.method, "Bridge request");

        if request.is_notification() {
            return JsonRpcResponse::success(request.id, json!({}));
        }

        let result = match request.method.as_str() {
            "initialize" => self.handler.initialize(ctx, request.params).await,
            "tools/list" => self.handler.list_tools(ctx).await,
            "tools/call" => self.handler.call_tool(ctx, request.params).await,
            "ping" => Ok(json!({})),
            other => {
                return JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(other))
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                warn!(session_id = %ctx.session.id, method = %request.method, error = %e, "Tool handler failed");
                JsonRpcResponse::failure(request.id, JsonRpcError::internal_error(e.to_string()))
            }
        }
    }
}

// ============================================================================
// SessionToolHandler
// ============================================================================

/// Built-in tools that let an agent inspect and report on its own session
pub struct SessionToolHandler {
    store: Arc<dyn IsolationStore>,
}

impl SessionToolHandler {
    pub fn new(store: Arc<dyn IsolationStore>) -> Self {
        Self { store }
    }

    fn tools() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new(
                "session_info",
                "Describe the current session: id, project, mode and status",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDescriptor::new(
                "set_session_status",
                "Move the current session to review, done or cancelled",
                json!({
                    "type": "object",
                    "properties": {
                        "status": {"type": "string", "enum": ["review", "done", "cancelled"]}
                    },
                    "required": ["status"]
                }),
            ),
        ]
    }

    fn session_info(&self, ctx: &BridgeContext) -> Result<ToolResult> {
        let session = self
            .store
            .get_session(&ctx.session.id)?
            .unwrap_or_else(|| ctx.session.clone());
        let info = json!({
            "id": session.id,
            "projectId": session.project_id,
            "mode": session.mode.as_str(),
            "status": session.status.as_str(),
            "userId": ctx.user_id,
        });
        Ok(ToolResult::success(serde_json::to_string_pretty(&info)?))
    }

    fn set_session_status(&self, ctx: &BridgeContext, arguments: &Value) -> Result<ToolResult> {
        let Some(raw) = arguments.get("status").and_then(Value::as_str) else {
            return Ok(ToolResult::error("missing required argument: status"));
        };
        let status: SessionStatus = match raw.parse() {
            Ok(status) => status,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        if !matches!(
            status,
            SessionStatus::Review | SessionStatus::Done | SessionStatus::Cancelled
        ) {
            return Ok(ToolResult::error(format!("status {} cannot be set by the agent", status)));
        }

        self.store.update_session_status(&ctx.session.id, status)?;
        Ok(ToolResult::success(format!("session status set to {}", status)))
    }
}

#[async_trait]
impl ToolHandler for SessionToolHandler {
    async fn initialize(&self, _ctx: &BridgeContext, _params: Option<Value>) -> Result<Value> {
        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "berth", "version": env!("CARGO_PKG_VERSION")}
        }))
    }

    async fn list_tools(&self, _ctx: &BridgeContext) -> Result<Value> {
        Ok(json!({ "tools": Self::tools() }))
    }

    async fn call_tool(&self, ctx: &BridgeContext, params: Option<Value>) -> Result<Value> {
        let call: ToolCall = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| Error::InvalidInput(format!("invalid tools/call params: {}", e)))?;

        let result = match call.name.as_str() {
            "session_info" => self.session_info(ctx)?,
            "set_session_status" => self.set_session_status(ctx, &call.arguments)?,
            other => ToolResult::error(format!("unknown tool: {}", other)),
        };
        Ok(serde_json::to_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::jsonrpc::{INTERNAL_ERROR, METHOD_NOT_FOUND, UNAUTHORIZED};
    use berth_foundation::{Project, SessionMode, Storage};

    /// Echoes its input so results can be compared verbatim
    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn initialize(&self, _ctx: &BridgeContext, _params: Option<Value>) -> Result<Value> {
            Ok(json!({"protocolVersion": PROTOCOL_VERSION}))
        }

        async fn list_tools(&self, _ctx: &BridgeContext) -> Result<Value> {
            Ok(json!({"tools": []}))
        }

        async fn call_tool(&self, ctx: &BridgeContext, params: Option<Value>) -> Result<Value> {
            match params.as_ref().and_then(|p| p.get("name")).and_then(Value::as_str) {
                Some("explode") => Err(Error::Internal("tool exploded".into())),
                _ => Ok(json!({"session": ctx.session.id, "params": params, "user": ctx.user_id})),
            }
        }
    }

    fn seeded_store() -> Arc<Storage> {
        let store = Arc::new(Storage::in_memory().unwrap());
        store
            .insert_project(&Project::new("p1", "app", "/tmp/app"))
            .unwrap();
        store
            .insert_session(&Session::new("s1", "p1", SessionMode::Write))
            .unwrap();
        store
    }

    fn service(handler: Arc<dyn ToolHandler>) -> BridgeService {
        BridgeService::new(seeded_store(), handler)
    }

    fn rpc(reply: BridgeReply) -> JsonRpcResponse {
        match reply {
            BridgeReply::Rpc(response) => response,
            other => panic!("expected JSON-RPC reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_session_id_is_bad_request() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        assert!(matches!(svc.handle(None, None, body).await, BridgeReply::BadRequest(_)));
        assert!(matches!(svc.handle(Some(" "), None, body).await, BridgeReply::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_non_json_body_is_bad_request() {
        let svc = service(Arc::new(EchoHandler));
        let reply = svc.handle(Some("s1"), None, b"not json").await;
        assert!(matches!(reply, BridgeReply::BadRequest(msg) if msg.contains("not JSON")));
    }

    #[tokio::test]
    async fn test_unknown_session_is_unauthorized() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":5,"method":"tools/list"}"#;
        let response = rpc(svc.handle(Some("ghost"), None, body).await);
        assert_eq!(response.id, json!(5));
        assert_eq!(response.error.unwrap().code, UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_tools_call_returns_handler_result_verbatim() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":"req-1","method":"tools/call","params":{"name":"grep","arguments":{"q":"x"}}}"#;
        let response = rpc(svc.handle(Some("s1"), Some("u1"), body).await);

        assert_eq!(response.id, json!("req-1"));
        assert_eq!(
            response.result.unwrap(),
            json!({
                "session": "s1",
                "params": {"name": "grep", "arguments": {"q": "x"}},
                "user": "u1"
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_method_not_found() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#;
        let response = rpc(svc.handle(Some("s1"), None, body).await);
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_is_acknowledged() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let response = rpc(svc.handle(Some("s1"), None, body).await);
        assert!(!response.is_error());
        assert_eq!(response.result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_handler_error_is_internal_error() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"explode"}}"#;
        let error = rpc(svc.handle(Some("s1"), None, body).await).error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.contains("tool exploded"));
    }

    #[tokio::test]
    async fn test_ping() {
        let svc = service(Arc::new(EchoHandler));
        let body = br#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#;
        assert_eq!(rpc(svc.handle(Some("s1"), None, body).await).result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_session_tools() {
        let store = seeded_store();
        let svc = BridgeService::new(store.clone(), Arc::new(SessionToolHandler::new(store.clone())));

        let list = rpc(
            svc.handle(Some("s1"), None, br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
                .await,
        );
        let tools = list.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 2);

        let call = br#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"set_session_status","arguments":{"status":"review"}}}"#;
        let result = rpc(svc.handle(Some("s1"), None, call).await).result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Review
        );

        let bad = br#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"set_session_status","arguments":{"status":"in_progress"}}}"#;
        let result = rpc(svc.handle(Some("s1"), None, bad).await).result.unwrap();
        assert_eq!(result["isError"], true);
    }
}
