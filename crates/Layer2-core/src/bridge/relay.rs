//! Rust relay: stdin JSON-RPC lines → bridge HTTP POSTs → stdout
//!
//! Same contract as the companion script, for images that ship the
//! `berth` binary (`berth relay`).

use super::companion::{SESSION_ENV, URL_ENV, USER_ENV};
use super::jsonrpc::{JsonRpcError, JsonRpcResponse};
use berth_foundation::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Forwards JSON-RPC lines to the host bridge
#[derive(Clone)]
pub struct Relay {
    client: reqwest::Client,
    target: reqwest::Url,
}

impl Relay {
    pub fn new(bridge_url: &str, session_id: &str, user_id: Option<&str>) -> Result<Self> {
        let target = reqwest::Url::parse_with_params(
            bridge_url,
            &[("sessionId", session_id), ("userId", user_id.unwrap_or_default())],
        )
        .map_err(|e| Error::Config(format!("invalid {}: {}", URL_ENV, e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            target,
        })
    }

    /// Build from `BERTH_BRIDGE_URL` / `BERTH_SESSION_ID` / `BERTH_USER_ID`
    pub fn from_env() -> Result<Self> {
        let url = std::env::var(URL_ENV)
            .map_err(|_| Error::Config(format!("{} is not set", URL_ENV)))?;
        let session = std::env::var(SESSION_ENV)
            .map_err(|_| Error::Config(format!("{} is not set", SESSION_ENV)))?;
        let user = std::env::var(USER_ENV).ok();
        Self::new(&url, &session, user.as_deref())
    }

    /// Forward one line. Returns the text to print, or `None` when the line
    /// is blank or a notification (no reply expected).
    pub async fn relay_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|msg| msg.get("id").cloned())
            .filter(|id| !id.is_null());
        let expects_reply = id.is_some();

        let sent = self
            .client
            .post(self.target.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(line.to_string())
            .send()
            .await;

        let reply = match sent {
            Ok(response) => response.text().await,
            Err(e) => Err(e),
        };

        if !expects_reply {
            return None;
        }

        match reply {
            Ok(body) => Some(body.trim_end().to_string()),
            Err(e) => {
                debug!(error = %e, "Bridge unreachable");
                let failure = JsonRpcResponse::failure(
                    id,
                    JsonRpcError::bridge_unreachable(format!("bridge unreachable: {}", e)),
                );
                serde_json::to_string(&failure).ok()
            }
        }
    }
}

/// Relay every line of `input` until EOF
pub async fn run_relay<R, W>(relay: &Relay, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(reply) = relay.relay_line(&line).await {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::router::serve;
    use crate::bridge::service::{BridgeService, SessionToolHandler};
    use berth_foundation::{IsolationStore, Project, Session, SessionMode, Storage, BRIDGE_PATH};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_bridge() -> String {
        let store = Arc::new(Storage::in_memory().unwrap());
        store
            .insert_project(&Project::new("p1", "app", "/tmp/app"))
            .unwrap();
        store
            .insert_session(&Session::new("s1", "p1", SessionMode::Write))
            .unwrap();
        let service = Arc::new(BridgeService::new(
            store.clone(),
            Arc::new(SessionToolHandler::new(store)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, service, std::future::pending()));
        format!("http://{}{}", addr, BRIDGE_PATH)
    }

    #[tokio::test]
    async fn test_run_relay_round_trip() {
        let url = spawn_bridge().await;
        let relay = Relay::new(&url, "s1", Some("u1")).unwrap();

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#,
            "\n"
        );
        let mut output = Vec::new();
        run_relay(&relay, input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["result"], serde_json::json!({}));
        assert_eq!(lines[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_unreachable_bridge_synthesizes_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = Relay::new(&format!("http://{}{}", addr, BRIDGE_PATH), "s1", None).unwrap();
        let reply = relay
            .relay_line(r#"{"jsonrpc":"2.0","id":"abc","method":"tools/list"}"#)
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["id"], "abc");
        assert_eq!(reply["error"]["code"], -32000);

        assert!(relay
            .relay_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }
}
