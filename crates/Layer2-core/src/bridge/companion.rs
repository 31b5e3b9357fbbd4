//! Companion script run inside agent containers
//!
//! The agent talks MCP over stdio; the companion turns each stdin line into
//! an HTTP POST to the host bridge and prints the response body. It is
//! shipped through the environment so images need nothing but `node`.

/// Env var carrying the script source
pub const SCRIPT_ENV: &str = "BERTH_BRIDGE_SCRIPT";
pub const URL_ENV: &str = "BERTH_BRIDGE_URL";
pub const SESSION_ENV: &str = "BERTH_SESSION_ID";
pub const USER_ENV: &str = "BERTH_USER_ID";
/// Env var carrying an MCP client config that launches the companion
pub const MCP_CONFIG_ENV: &str = "BERTH_MCP_CONFIG";

/// Shell command that starts the companion inside the container
pub const COMPANION_COMMAND: &str = r#"node -e "$BERTH_BRIDGE_SCRIPT""#;

/// Node.js (18+) source of the companion
pub const COMPANION_SCRIPT: &str = r#"'use strict';
const readline = require('readline');

const base = process.env.BERTH_BRIDGE_URL || '';
const sessionId = process.env.BERTH_SESSION_ID || '';
const userId = process.env.BERTH_USER_ID || '';
const target = base + '?sessionId=' + encodeURIComponent(sessionId) +
  '&userId=' + encodeURIComponent(userId);

function write(text) {
  process.stdout.write(text.endsWith('\n') ? text : text + '\n');
}

async function relay(line) {
  let id = null;
  let expectsReply = true;
  try {
    const msg = JSON.parse(line);
    id = msg.id === undefined ? null : msg.id;
    expectsReply = id !== null;
  } catch (_) {}

  try {
    const res = await fetch(target, {
      method: 'POST',
      headers: { 'content-type': 'application/json' },
      body: line,
    });
    const body = await res.text();
    if (expectsReply) write(body);
  } catch (err) {
    if (expectsReply) {
      write(JSON.stringify({
        jsonrpc: '2.0',
        id,
        error: { code: -32000, message: 'bridge unreachable: ' + err.message },
      }));
    }
  }
}

const rl = readline.createInterface({ input: process.stdin, terminal: false });
let chain = Promise.resolve();
rl.on('line', (line) => {
  if (!line.trim()) return;
  chain = chain.then(() => relay(line));
});
"#;

/// MCP client config registering the companion as the `berth` server
pub fn mcp_config() -> String {
    serde_json::json!({
        "mcpServers": {
            "berth": {
                "command": "sh",
                "args": ["-c", COMPANION_COMMAND]
            }
        }
    })
    .to_string()
}

/// `KEY=VALUE` pairs a container needs to run the companion
pub fn companion_env(bridge_url: &str, session_id: &str, user_id: Option<&str>) -> Vec<String> {
    vec![
        format!("{}={}", SCRIPT_ENV, COMPANION_SCRIPT),
        format!("{}={}", URL_ENV, bridge_url),
        format!("{}={}", SESSION_ENV, session_id),
        format!("{}={}", USER_ENV, user_id.unwrap_or_default()),
        format!("{}={}", MCP_CONFIG_ENV, mcp_config()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_companion_env() {
        let env = companion_env("http://host.docker.internal:7420/api/bridge", "s1", Some("u1"));
        assert_eq!(env.len(), 5);
        assert!(env[0].starts_with("BERTH_BRIDGE_SCRIPT='use strict';"));
        assert!(env.contains(&"BERTH_BRIDGE_URL=http://host.docker.internal:7420/api/bridge".to_string()));
        assert!(env.contains(&"BERTH_SESSION_ID=s1".to_string()));
        assert!(env.contains(&"BERTH_USER_ID=u1".to_string()));
    }

    #[test]
    fn test_mcp_config_launches_companion() {
        let config: serde_json::Value = serde_json::from_str(&mcp_config()).unwrap();
        assert_eq!(config["mcpServers"]["berth"]["command"], "sh");
        assert_eq!(config["mcpServers"]["berth"]["args"][1], COMPANION_COMMAND);
    }

    #[test]
    fn test_script_synthesizes_error_with_request_id() {
        assert!(COMPANION_SCRIPT.contains("sessionId="));
        assert!(COMPANION_SCRIPT.contains("code: -32000"));
        assert!(COMPANION_SCRIPT.contains("id,"));
    }
}
