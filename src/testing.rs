//! Shared fakes for unit tests: a scripted model and a recording
//! issue client, both counting calls so tests can assert that
//! rejected or deduplicated dispatches trigger zero downstream work.

use crate::github::IssueClient;
use crate::llm::ModelInvoker;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub enum ScriptedReply {
    Respond(String),
    Fail(String),
}

#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    pub prompts: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn respond_with(responses: &[&str]) -> Self {
        Self::new(
            responses
                .iter()
                .map(|response| ScriptedReply::Respond((*response).to_string()))
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().expect("prompts lock")[index].clone()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedModel {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());

        match self.replies.lock().expect("replies lock").pop_front() {
            Some(ScriptedReply::Respond(response)) => Ok(response),
            Some(ScriptedReply::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model exhausted")),
        }
    }
}

#[derive(Default)]
pub struct RecordingIssues {
    pub labels: Mutex<Vec<(String, u64, Vec<String>)>>,
    pub comments: Mutex<Vec<(String, u64, String)>>,
    pub closed: Mutex<Vec<(String, u64)>>,
    pub calls: AtomicUsize,
    pub fail_labels: bool,
    pub fail_comments: bool,
}

impl RecordingIssues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn applied_labels(&self) -> Vec<Vec<String>> {
        self.labels
            .lock()
            .expect("labels lock")
            .iter()
            .map(|(_, _, labels)| labels.clone())
            .collect()
    }

    pub fn comment_bodies(&self) -> Vec<String> {
        self.comments
            .lock()
            .expect("comments lock")
            .iter()
            .map(|(_, _, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl IssueClient for RecordingIssues {
    async fn add_labels(&self, repo: &str, issue_number: u64, labels: &[String]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_labels {
            return Err(anyhow!("label application failed"));
        }
        self.labels
            .lock()
            .expect("labels lock")
            .push((repo.to_string(), issue_number, labels.to_vec()));
        Ok(())
    }

    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_comments {
            return Err(anyhow!("comment posting failed"));
        }
        self.comments
            .lock()
            .expect("comments lock")
            .push((repo.to_string(), issue_number, body.to_string()));
        Ok(())
    }

    async fn close_issue(
        &self,
        repo: &str,
        issue_number: u64,
        comment: Option<&str>,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(comment) = comment {
            self.comments
                .lock()
                .expect("comments lock")
                .push((repo.to_string(), issue_number, comment.to_string()));
        }
        self.closed
            .lock()
            .expect("closed lock")
            .push((repo.to_string(), issue_number));
        Ok(())
    }
}
