use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a triage assistant for GitHub repositories. \
You analyze webhook events (issues, pull requests, reviews, workflow failures) and \
respond with a concise, actionable assessment.";

/// Capability seam to the external model. Implementations own their
/// timeout and pacing; callers treat any error as a failed step.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-style chat-completions client with a minimum inter-request
/// interval so bursts of deliveries do not hammer the model API.
pub struct ChatModelClient {
    http: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageContent,
}

#[derive(Deserialize)]
struct ChatMessageContent {
    content: Option<String>,
}

impl ChatModelClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_seconds))
            .build()
            .context("build llm http client")?;

        Ok(Self {
            http,
            api_base: config.llm_api_base.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            min_interval: Duration::from_millis(config.llm_min_interval_ms),
            last_request: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "pacing model request");
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ModelInvoker for ChatModelClient {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.pace().await;

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ]
        });

        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("send chat completion request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "model api returned non-success status");
            return Err(anyhow!(
                "model api returned {status}: {}",
                preview(&detail)
            ));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("parse chat completion response")?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("model response did not include message content"))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    let mut output = String::new();
    for character in text.chars() {
        if output.len() + character.len_utf8() > MAX {
            output.push_str("...");
            break;
        }
        output.push(character);
    }
    output
}
