use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Prompt templates loaded from `{prompts_dir}/{event_type}/{name}.md`.
///
/// Rendering is deliberately lenient: unresolved variables render as
/// empty strings instead of failing, because templates reference
/// optional upstream fields (prior-step data that may not exist).
/// Templates must be written defensively against that contract.
pub struct PromptStore {
    env: Environment<'static>,
    sources: HashMap<String, String>,
}

impl PromptStore {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut sources = Vec::new();

        if dir.is_dir() {
            let entries = std::fs::read_dir(dir)
                .with_context(|| format!("read prompts directory {}", dir.display()))?;
            for entry in entries {
                let entry = entry.context("read prompts directory entry")?;
                let event_dir = entry.path();
                if !event_dir.is_dir() {
                    continue;
                }
                let Some(event_type) = event_dir.file_name().and_then(|name| name.to_str())
                else {
                    continue;
                };

                let templates = std::fs::read_dir(&event_dir)
                    .with_context(|| format!("read template directory {}", event_dir.display()))?;
                for template in templates {
                    let template = template.context("read template directory entry")?;
                    let path = template.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                        continue;
                    };
                    let source = std::fs::read_to_string(&path)
                        .with_context(|| format!("read template {}", path.display()))?;
                    sources.push((format!("{event_type}/{stem}"), source));
                }
            }
        } else {
            warn!(dir = %dir.display(), "prompts directory missing; starting with no templates");
        }

        Ok(Self::from_sources(sources))
    }

    pub fn from_sources(entries: Vec<(String, String)>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        let mut sources = HashMap::new();
        for (key, source) in entries {
            if let Err(error) = env.add_template_owned(key.clone(), source.clone()) {
                warn!(template = %key, error = %error, "template failed to parse; keeping raw source only");
            }
            sources.insert(key, source);
        }

        Self { env, sources }
    }

    pub fn contains(&self, event_type: &str, name: &str) -> bool {
        self.sources.contains_key(&template_key(event_type, name))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Renders a template against the given context. Returns `None`
    /// when no such template exists; render failure falls back to the
    /// raw template text rather than aborting the step.
    pub fn render(&self, event_type: &str, name: &str, context: &Value) -> Option<String> {
        let key = template_key(event_type, name);
        let raw = self.sources.get(&key)?;

        match self.env.get_template(&key) {
            Ok(template) => match template.render(context) {
                Ok(rendered) => {
                    debug!(template = %key, "rendered prompt template");
                    Some(rendered)
                }
                Err(error) => {
                    warn!(template = %key, error = %error, "template render failed; using raw source");
                    Some(raw.clone())
                }
            },
            Err(_) => Some(raw.clone()),
        }
    }
}

fn template_key(event_type: &str, name: &str) -> String {
    format!("{event_type}/{name}")
}
