use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::time::Duration;
use tracing::info;

const GITHUB_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Capability seam to the issue tracker. Label application and comment
/// posting are independent: a failure of one is recorded by the caller
/// and must not suppress the other.
#[async_trait]
pub trait IssueClient: Send + Sync {
    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()>;
    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()>;
    async fn close_issue(&self, repo: &str, issue_number: u64, comment: Option<&str>)
    -> Result<()>;
}

pub struct GitHubIssueClient {
    http: Client,
    api_base: String,
    token: String,
}

impl GitHubIssueClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(GITHUB_HTTP_TIMEOUT_SECONDS))
            .user_agent(concat!("webhook-triage/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build github http client")?;

        Ok(Self {
            http,
            api_base: config.github_api_base.trim_end_matches('/').to_string(),
            token: config.github_token.clone(),
        })
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("send github request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("github api returned {status} for {url}"));
        }
        Ok(())
    }
}

#[async_trait]
impl IssueClient for GitHubIssueClient {
    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }

        // Adding an already-present label is a no-op on GitHub's side,
        // which keeps this idempotent from the caller's perspective.
        let url = format!("{}/repos/{repo}/issues/{issue_number}/labels", self.api_base);
        self.post_json(&url, json!({ "labels": labels })).await?;
        info!(repo, issue = issue_number, ?labels, "applied labels");
        Ok(())
    }

    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{repo}/issues/{issue_number}/comments",
            self.api_base
        );
        self.post_json(&url, json!({ "body": body })).await?;
        info!(repo, issue = issue_number, "posted comment");
        Ok(())
    }

    async fn close_issue(
        &self,
        repo: &str,
        issue_number: u64,
        comment: Option<&str>,
    ) -> Result<()> {
        if let Some(comment) = comment {
            self.post_comment(repo, issue_number, comment).await?;
        }

        let url = format!("{}/repos/{repo}/issues/{issue_number}", self.api_base);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "state": "closed" }))
            .send()
            .await
            .with_context(|| format!("send github request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("github api returned {status} for {url}"));
        }
        info!(repo, issue = issue_number, "closed issue");
        Ok(())
    }
}
