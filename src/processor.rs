use crate::chain::{ChainContext, ChainRun, ChainRunner};
use crate::config::Config;
use crate::github::IssueClient;
use crate::llm::ModelInvoker;
use crate::registry::{CommentStyle, HandlerDescriptor, HandlerRegistry};
use crate::stats::Stats;
use crate::templates::PromptStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use triage_core::model::{
    ActionKind, ActionTaken, ExtractedData, ProcessingResult, WebhookEvent,
};
use triage_core::policy::RepositoryPolicy;

const CLOSE_COMMENT: &str =
    "Closing this issue automatically based on the analysis above. \
Reopen it if the assessment missed something.";

/// Ties a resolved handler to its side effects: runs the chain, then
/// applies labels, comments, and closes per the repository policy.
/// Action failures are recorded, never cascaded: a failed label call
/// does not suppress the comment.
pub struct Processor {
    registry: HandlerRegistry,
    runner: ChainRunner,
    github: Arc<dyn IssueClient>,
    settings: Arc<Config>,
    stats: Arc<Stats>,
}

impl Processor {
    pub fn new(
        prompts: Arc<PromptStore>,
        model: Arc<dyn ModelInvoker>,
        github: Arc<dyn IssueClient>,
        settings: Arc<Config>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            registry: HandlerRegistry::with_defaults(),
            runner: ChainRunner::new(prompts, model),
            github,
            settings,
            stats,
        }
    }

    /// Full dispatch of one event under the configured deadline. The
    /// returned result is terminal; the outcome counter is bumped here
    /// for both foreground and worker callers.
    pub async fn process(
        &self,
        event: &WebhookEvent,
        policy: &RepositoryPolicy,
        request_id: &str,
    ) -> ProcessingResult {
        let deadline = Duration::from_secs(self.settings.dispatch_timeout_seconds);
        let result = match timeout(deadline, self.run(event, policy, request_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id, %event.delivery_id, "dispatch timed out");
                ProcessingResult::error(request_id, "dispatch timed out")
            }
        };
        self.stats.record_outcome(result.status);
        result
    }

    async fn run(
        &self,
        event: &WebhookEvent,
        policy: &RepositoryPolicy,
        request_id: &str,
    ) -> ProcessingResult {
        let descriptor = self.registry.resolve(&event.event_type, &event.action);

        if descriptor.sentinel
            && issue_has_label(&event.raw_payload, &self.settings.analyzed_label)
        {
            info!(
                request_id,
                repo = %event.repository,
                "skipping; sentinel label already present"
            );
            return ProcessingResult::skipped(request_id, "already analyzed");
        }

        info!(
            request_id,
            handler = descriptor.name,
            event_type = %event.event_type,
            action = %event.action,
            repo = %event.repository,
            "dispatching event"
        );

        let run = self
            .runner
            .run(&descriptor.steps, ChainContext::for_event(event))
            .await;

        if let Some(failure) = &run.failure {
            return ProcessingResult::error(
                request_id,
                &format!("step {} failed: {}", failure.step, failure.error),
            );
        }

        let actions = self.apply_actions(event, policy, descriptor, &run).await;
        self.archive_run(event, descriptor, &run);
        ProcessingResult::processed(request_id, actions)
    }

    async fn apply_actions(
        &self,
        event: &WebhookEvent,
        policy: &RepositoryPolicy,
        descriptor: &HandlerDescriptor,
        run: &ChainRun,
    ) -> Vec<ActionTaken> {
        let mut actions = Vec::new();

        let Some(number) = descriptor.target.number(&event.raw_payload) else {
            return actions;
        };
        let extracted = descriptor
            .labels_from_step
            .and_then(|step| run.context.extracted.get(step));

        if policy.auto_apply_labels {
            let labels = self.collect_labels(event, policy, descriptor, extracted);
            if !labels.is_empty() {
                let ok = self
                    .github
                    .add_labels(&event.repository, number, &labels)
                    .await
                    .map_err(|error| {
                        warn!(repo = %event.repository, number, error = %format!("{error:#}"), "label application failed")
                    })
                    .is_ok();
                actions.push(ActionTaken {
                    kind: ActionKind::Label,
                    value: labels.join(","),
                    ok,
                });
            }
        }

        if policy.auto_post_comments {
            if let Some(body) = compose_comment(descriptor.comment, run, extracted) {
                let ok = self
                    .github
                    .post_comment(&event.repository, number, &body)
                    .await
                    .map_err(|error| {
                        warn!(repo = %event.repository, number, error = %format!("{error:#}"), "comment posting failed")
                    })
                    .is_ok();
                actions.push(ActionTaken {
                    kind: ActionKind::Comment,
                    value: format!("comment on #{number}"),
                    ok,
                });
            }
        }

        if policy.auto_close && extracted.is_some_and(|data| data.should_close) {
            let ok = self
                .github
                .close_issue(&event.repository, number, Some(CLOSE_COMMENT))
                .await
                .map_err(|error| {
                    warn!(repo = %event.repository, number, error = %format!("{error:#}"), "issue close failed")
                })
                .is_ok();
            actions.push(ActionTaken {
                kind: ActionKind::Close,
                value: format!("closed #{number}"),
                ok,
            });
        }

        actions
    }

    fn collect_labels(
        &self,
        event: &WebhookEvent,
        policy: &RepositoryPolicy,
        descriptor: &HandlerDescriptor,
        extracted: Option<&ExtractedData>,
    ) -> Vec<String> {
        let mut labels = Vec::new();

        if let Some(data) = extracted {
            for label in &data.labels {
                let allowed = policy.label_categories.is_empty()
                    || policy.label_categories.contains(label)
                    || label.starts_with("priority-");
                if allowed && !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }

        if descriptor.pr_size_labels {
            if let Some(size) = pr_size_label(&event.raw_payload) {
                labels.push(size.to_string());
            }
        }

        if descriptor.sentinel {
            labels.push(self.settings.analyzed_label.clone());
        }

        labels
    }

    /// Writes the run's responses under the outputs dir for later
    /// inspection. Best-effort: archival failure never fails the
    /// dispatch.
    fn archive_run(&self, event: &WebhookEvent, descriptor: &HandlerDescriptor, run: &ChainRun) {
        if run.outputs.is_empty() {
            return;
        }

        let dir = self.settings.outputs_dir.join(descriptor.archive_category);
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let path = dir.join(format!("{stamp}-{}.md", event.delivery_id));

        let mut body = format!(
            "# {} {} ({})\n\nDelivery: {}\n",
            event.event_type, event.action, event.repository, event.delivery_id
        );
        for output in &run.outputs {
            body.push_str(&format!("\n## {}\n\n{}\n", output.step, output.response));
        }

        let written = std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(&path, body));
        if let Err(error) = written {
            warn!(path = %path.display(), %error, "failed to archive analysis output");
        }
    }
}

fn issue_has_label(payload: &Value, label: &str) -> bool {
    payload
        .get("issue")
        .and_then(|issue| issue.get("labels"))
        .and_then(Value::as_array)
        .is_some_and(|labels| {
            labels
                .iter()
                .any(|entry| entry.get("name").and_then(Value::as_str) == Some(label))
        })
}

/// Size bucket from total changed lines on the PR. None when the
/// payload has no pull_request object.
fn pr_size_label(payload: &Value) -> Option<&'static str> {
    let pr = payload.get("pull_request")?;
    let additions = pr.get("additions").and_then(Value::as_u64).unwrap_or(0);
    let deletions = pr.get("deletions").and_then(Value::as_u64).unwrap_or(0);
    Some(match additions + deletions {
        0..50 => "size/small",
        50..200 => "size/medium",
        _ => "size/large",
    })
}

fn compose_comment(
    style: CommentStyle,
    run: &ChainRun,
    extracted: Option<&ExtractedData>,
) -> Option<String> {
    let response = run.final_response()?;
    match style {
        CommentStyle::None => None,
        CommentStyle::FinalResponse => Some(response.to_string()),
        CommentStyle::IssueMetadata => {
            let mut body = response.to_string();
            if let Some(data) = extracted {
                body.push_str("\n\n---\n**Issue Metadata**\n");
                body.push_str(&format!("- Category: {}\n", data.category));
                body.push_str(&format!("- Priority: {}\n", data.priority.as_str()));
                if !data.labels.is_empty() {
                    body.push_str(&format!("- Labels: {}\n", data.labels.join(", ")));
                }
                if data.needs_more_info {
                    body.push_str("- More information requested\n");
                }
                if data.is_duplicate {
                    body.push_str("- Flagged as a possible duplicate\n");
                }
            }
            Some(body)
        }
    }
}
