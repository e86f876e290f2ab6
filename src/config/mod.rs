//! Configuration: built-in defaults layered under `~/.tern/config.toml`, the
//! `~/.tern/.env` file, and process environment variables (highest wins).

use crate::hook::{HookDescriptor, HookEvent, HookPipeline};
use crate::mcp::McpServerConfig;
use crate::tool::ApprovalMode;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const ENV_API_URL: &str = "TERN_API_URL";
pub const ENV_API_KEY: &str = "TERN_API_KEY";
pub const ENV_MODEL: &str = "TERN_MODEL";

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// A shell command hook from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Event name, e.g. "pre_tool_use".
    pub event: String,
    pub command: String,
    /// Optional regex on the tool name.
    #[serde(default)]
    pub tool_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_turns: usize,
    pub approval_mode: ApprovalMode,
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub hooks: Vec<HookConfig>,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_turns: crate::orchestrator::DEFAULT_MAX_TURNS,
            approval_mode: ApprovalMode::default(),
            mcp_servers: HashMap::new(),
            hooks: Vec::new(),
            data_dir: tern_home(),
        }
    }
}

/// Overlay shape for `config.toml`: only present keys override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_turns: Option<usize>,
    approval_mode: Option<ApprovalMode>,
    mcp_servers: Option<HashMap<String, McpServerConfig>>,
    hooks: Option<Vec<HookConfig>>,
}

/// `~/.tern`, falling back to the current directory without a home.
#[must_use]
pub fn tern_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".tern")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with_env(&tern_home(), &std::env::vars().collect())
    }

    /// Load from an explicit home directory and environment snapshot.
    pub fn load_with_env(
        home: &Path,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut config = Config {
            data_dir: home.to_path_buf(),
            ..Config::default()
        };

        let toml_path = home.join("config.toml");
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("reading {}", toml_path.display()))?;
            let overlay: FileConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", toml_path.display()))?;
            config.apply_file(overlay);
        }

        let env_path = home.join(".env");
        if env_path.exists()
            && let Ok(content) = std::fs::read_to_string(&env_path)
        {
            for (key, value) in parse_env_file(&content) {
                config.apply_env_var(&key, &value);
            }
        }

        // Process environment wins over everything.
        for key in [ENV_API_URL, ENV_API_KEY, ENV_MODEL] {
            if let Some(value) = env.get(key) {
                config.apply_env_var(key, value);
            }
        }

        Ok(config)
    }

    fn apply_file(&mut self, overlay: FileConfig) {
        if let Some(api_url) = overlay.api_url {
            self.api_url = api_url;
        }
        if overlay.api_key.is_some() {
            self.api_key = overlay.api_key;
        }
        if let Some(model) = overlay.model {
            self.model = model;
        }
        if let Some(max_turns) = overlay.max_turns {
            self.max_turns = max_turns;
        }
        if let Some(mode) = overlay.approval_mode {
            self.approval_mode = mode;
        }
        if let Some(servers) = overlay.mcp_servers {
            self.mcp_servers.extend(servers);
        }
        if let Some(hooks) = overlay.hooks {
            self.hooks = hooks;
        }
    }

    fn apply_env_var(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        match key {
            ENV_API_URL => self.api_url = value.to_string(),
            ENV_API_KEY => self.api_key = Some(value.to_string()),
            ENV_MODEL => self.model = value.to_string(),
            _ => {}
        }
    }

    #[must_use]
    pub fn memory_db_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Register every configured shell hook. Bad event names or regexes are
    /// logged and skipped. Returns how many registered.
    pub fn register_hooks(&self, pipeline: &HookPipeline) -> usize {
        let mut count = 0;
        for (i, hook) in self.hooks.iter().enumerate() {
            let event: HookEvent = match hook.event.parse() {
                Ok(event) => event,
                Err(e) => {
                    warn!("skipping hook #{i}: {e}");
                    continue;
                }
            };

            let mut descriptor =
                HookDescriptor::command(format!("config-hook-{i}"), event, &hook.command);
            if let Some(pattern) = &hook.tool_pattern {
                match regex::Regex::new(pattern) {
                    Ok(matcher) => descriptor = descriptor.with_matcher(matcher),
                    Err(e) => {
                        warn!("skipping hook #{i}: bad tool_pattern: {e}");
                        continue;
                    }
                }
            }
            pipeline.register(descriptor);
            count += 1;
        }
        count
    }
}

/// Parse `KEY=VALUE` lines; `#` comments and blanks are skipped, values may
/// be single- or double-quoted.
#[must_use]
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
