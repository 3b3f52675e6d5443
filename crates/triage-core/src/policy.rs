use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// Per-repository policy. Read-only after load; a reload replaces the
/// whole table atomically, so no mutation discipline is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPolicy {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub events: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_apply_labels: bool,
    #[serde(default = "default_true")]
    pub auto_post_comments: bool,
    #[serde(default)]
    pub auto_close: bool,
    #[serde(default)]
    pub label_categories: Vec<String>,
    #[serde(default)]
    pub local_context_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    repository: Vec<RepositoryPolicy>,
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryTable {
    policies: HashMap<String, RepositoryPolicy>,
}

impl RepositoryTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read repository policy file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(raw).context("parse repository policy toml")?;
        let policies = file
            .repository
            .into_iter()
            .map(|policy| (policy.name.clone(), policy))
            .collect();
        Ok(Self { policies })
    }

    pub fn from_policies(policies: Vec<RepositoryPolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|policy| (policy.name.clone(), policy))
                .collect(),
        }
    }

    pub fn get(&self, repo_full_name: &str) -> Option<&RepositoryPolicy> {
        self.policies.get(repo_full_name)
    }

    pub fn is_event_enabled(&self, repo_full_name: &str, event_type: &str) -> bool {
        self.get(repo_full_name)
            .map(|policy| {
                policy.enabled && policy.events.iter().any(|event| event == event_type)
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
