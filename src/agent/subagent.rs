//! Sub-agents: isolated specializations with restricted tool surfaces.
//!
//! Three are built in (coder, researcher, shell); more can be loaded from
//! YAML files in a config directory. Sub-agents never see the main running
//! history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_max_turns() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    pub name: String,
    pub description: String,
    /// Tool whitelist; names missing from the parent registry are ignored.
    #[serde(default)]
    pub tools: Vec<String>,
    pub system_prompt: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

#[must_use]
pub fn builtin_subagents() -> Vec<SubagentConfig> {
    vec![
        SubagentConfig {
            name: "coder".to_string(),
            description: "Implements focused code changes".to_string(),
            tools: vec![
                "read_file".to_string(),
                "write_file".to_string(),
                "edit_file".to_string(),
                "find_files".to_string(),
                "shell".to_string(),
            ],
            system_prompt: "You are a coding sub-agent. Complete the assigned change, \
                            verify it, and report exactly what you modified. Make minimal, \
                            focused edits; do not refactor beyond the task."
                .to_string(),
            max_turns: default_max_turns(),
        },
        SubagentConfig {
            name: "researcher".to_string(),
            description: "Reads and summarizes code or documents".to_string(),
            tools: vec![
                "read_file".to_string(),
                "find_files".to_string(),
                "grep".to_string(),
                "list_directory".to_string(),
            ],
            system_prompt: "You are a research sub-agent. Investigate the question using \
                            read-only tools and report findings concisely with file \
                            references. Never modify anything."
                .to_string(),
            max_turns: default_max_turns(),
        },
        SubagentConfig {
            name: "shell".to_string(),
            description: "Runs shell commands and reports their output".to_string(),
            tools: vec!["shell".to_string()],
            system_prompt: "You are a shell sub-agent. Run the commands needed for the \
                            task and report stdout, stderr, and exit status. Prefer \
                            non-interactive flags."
                .to_string(),
            max_turns: default_max_turns(),
        },
    ]
}

#[derive(Default)]
pub struct SubagentRegistry {
    configs: HashMap<String, SubagentConfig>,
}

impl SubagentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin specializations.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for config in builtin_subagents() {
            registry.configs.insert(config.name.clone(), config);
        }
        registry
    }

    /// Load additional configs from `*.yaml`/`*.yml` files in a directory.
    /// Returns how many were loaded; unreadable files are skipped.
    pub fn load_directory(&mut self, dir: &Path) -> usize {
        let mut count = 0;
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "yaml" || e == "yml")
                && let Ok(content) = std::fs::read_to_string(&path)
                && let Ok(config) = serde_yaml::from_str::<SubagentConfig>(&content)
            {
                self.configs.insert(config.name.clone(), config);
                count += 1;
            }
        }
        count
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SubagentConfig> {
        self.configs.get(name)
    }

    /// (name, description) pairs, name-sorted.
    #[must_use]
    pub fn list(&self) -> Vec<(String, String)> {
        let mut list: Vec<_> = self
            .configs
            .values()
            .map(|c| (c.name.clone(), c.description.clone()))
            .collect();
        list.sort();
        list
    }
}
