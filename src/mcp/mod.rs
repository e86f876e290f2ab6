//! External-tool bridge: long-lived helper processes speaking line-delimited
//! JSON-RPC 2.0 over stdio. Advertised tools are wrapped and merged into the
//! tool registry under `mcp_<server>_<tool>` names.

use crate::tool::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
/// Per-request deadline; expiry removes the pending entry and fails the caller.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One configured helper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// A tool advertised by a helper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn server: {0}")]
    SpawnFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Disconnected")]
    Disconnected,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

/// Client for one helper process.
pub struct McpClient {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: StdMutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl McpClient {
    /// Spawn the helper, run the `initialize` handshake, and send the
    /// `notifications/initialized` notification.
    pub async fn spawn(name: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("no stdout pipe".to_string()))?;

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        spawn_reader(name.to_string(), stdout, pending.clone());

        let client = Self {
            name: name.to_string(),
            stdin: Mutex::new(stdin),
            child: StdMutex::new(child),
            pending,
            next_id: AtomicU64::new(0),
            request_timeout: REQUEST_TIMEOUT,
        };

        client
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "tern", "version": env!("CARGO_PKG_VERSION") }
                })),
            )
            .await?;
        client.notify("notifications/initialized", None).await?;

        Ok(client)
    }

    #[cfg(test)]
    fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a request and await its response by id.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map lock").insert(id, tx);

        let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }

        if let Err(e) = self.write_line(&message).await {
            self.pending.lock().expect("pending map lock").remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                self.pending.lock().expect("pending map lock").remove(&id);
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut message = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.write_line(&message).await
    }

    async fn write_line(&self, message: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| McpError::Disconnected)?;
        stdin.flush().await.map_err(|_| McpError::Disconnected)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let response = self.request("tools/list", None).await?;
        serde_json::from_value(response.get("tools").cloned().unwrap_or(Value::Null))
            .map_err(|e| McpError::Protocol(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let response = self
            .request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        let (content, is_error) = render_call_response(&response);
        Ok(ToolOutput {
            content,
            is_error,
            metadata: Some(response),
        })
    }

    pub async fn list_resources(&self) -> Result<Value, McpError> {
        self.request("resources/list", None).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.request("resources/read", Some(json!({ "uri": uri }))).await
    }

    /// Terminate the helper and close its pipes.
    pub fn disconnect(&self) {
        if let Ok(mut child) = self.child.lock()
            && let Err(e) = child.start_kill()
        {
            warn!("failed to terminate MCP server {}: {e}", self.name);
        }
        let mut pending = self.pending.lock().expect("pending map lock");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::Disconnected));
        }
    }
}

fn spawn_reader(name: String, stdout: tokio::process::ChildStdout, pending: PendingMap) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(message) => dispatch_message(&name, &message, &pending),
                        Err(e) => warn!("MCP server {name}: unparsable line: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("MCP server {name}: read error: {e}");
                    break;
                }
            }
        }
        // EOF: fail every caller still waiting.
        let mut pending = pending.lock().expect("pending map lock");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::Disconnected));
        }
    });
}

fn dispatch_message(name: &str, message: &Value, pending: &PendingMap) {
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        debug!("MCP server {name}: notification: {message}");
        return;
    };

    let Some(tx) = pending.lock().expect("pending map lock").remove(&id) else {
        // Late response to a timed-out request.
        debug!("MCP server {name}: response for unknown id {id}");
        return;
    };

    let result = if let Some(error) = message.get("error") {
        Err(McpError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        })
    } else {
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = tx.send(result);
}

/// Flatten a `tools/call` response to text: content arrays of
/// `{type:"text", text}` parts join on newlines; anything structured is
/// JSON-stringified.
fn render_call_response(response: &Value) -> (String, bool) {
    let is_error = response
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let content = match response.get("content") {
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                Value::Array(items.clone()).to_string()
            } else {
                texts.join("\n")
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    (content, is_error)
}

/// Registry wrapper for one advertised tool.
pub struct McpTool {
    client: Arc<McpClient>,
    server: String,
    remote_name: String,
    registered_name: String,
    description: String,
    input_schema: Value,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.registered_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.input_schema.clone()
    }

    // auto_safe stays false: external tools always face the approval gate.

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        self.client
            .call_tool(&self.remote_name, args)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("MCP {} error: {e}", self.server)))
    }
}

/// Owns every connected helper and the registry entries they contributed.
#[derive(Default)]
pub struct McpManager {
    clients: Vec<Arc<McpClient>>,
    registered: Vec<String>,
}

impl McpManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect one server and merge its tools into the registry.
    /// Returns how many tools were registered.
    pub async fn connect(
        &mut self,
        name: &str,
        config: &McpServerConfig,
        registry: &ToolRegistry,
    ) -> Result<usize, McpError> {
        let client = Arc::new(McpClient::spawn(name, config).await?);
        let tools = client.list_tools().await?;
        let count = tools.len();

        for def in tools {
            let registered_name = format!("mcp_{name}_{}", def.name);
            registry.register(Arc::new(McpTool {
                client: client.clone(),
                server: name.to_string(),
                remote_name: def.name,
                registered_name: registered_name.clone(),
                description: format!("[MCP:{name}] {}", def.description),
                input_schema: def.input_schema,
            }));
            self.registered.push(registered_name);
        }

        self.clients.push(client);
        Ok(count)
    }

    /// Connect every configured server; failures are logged and skipped.
    pub async fn connect_all(
        &mut self,
        servers: &HashMap<String, McpServerConfig>,
        registry: &ToolRegistry,
    ) {
        for (name, config) in servers {
            match self.connect(name, config, registry).await {
                Ok(count) => debug!("MCP server {name}: registered {count} tools"),
                Err(e) => error!("MCP server {name}: connection failed: {e}"),
            }
        }
    }

    /// Drop every contributed tool and terminate the helpers.
    pub fn disconnect_all(&mut self, registry: &ToolRegistry) {
        for name in self.registered.drain(..) {
            registry.unregister(&name);
        }
        for client in self.clients.drain(..) {
            client.disconnect();
        }
    }
}
