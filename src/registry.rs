use crate::chain::{ChainContext, ChainStep};
use serde_json::Value;
use std::collections::HashMap;

/// Built-in prompt used when no `generic/default` template is on disk,
/// so the catch-all handler always has something to send.
pub const DEFAULT_GENERIC_PROMPT: &str = "Analyze this GitHub webhook event and provide \
insights about what happened and any recommended actions.\n\nFocus on:\n\
1. What triggered this event\n2. What changes or actions occurred\n\
3. Any potential impact or follow-up needed\n\
4. Suggestions for automation or process improvements";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentStyle {
    /// No comment is posted for this event.
    None,
    /// The final step's raw response is the comment body.
    FinalResponse,
    /// Final response plus an "Issue Metadata" section built from the
    /// first extracting step's data.
    IssueMetadata,
}

/// Which payload object carries the issue/PR number that labels and
/// comments target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueTarget {
    None,
    Issue,
    PullRequest,
}

impl IssueTarget {
    pub fn number(self, payload: &Value) -> Option<u64> {
        let key = match self {
            IssueTarget::None => return None,
            IssueTarget::Issue => "issue",
            IssueTarget::PullRequest => "pull_request",
        };
        payload.get(key)?.get("number")?.as_u64()
    }
}

/// One registered handler: a chain definition plus the side-effect
/// policy applied when the chain completes. Carried as data so the
/// registry stays a plain table.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub name: &'static str,
    pub steps: Vec<ChainStep>,
    /// Which step's extracted data drives label application.
    pub labels_from_step: Option<&'static str>,
    pub comment: CommentStyle,
    pub target: IssueTarget,
    /// Subdirectory under the outputs dir for archived analyses.
    pub archive_category: &'static str,
    /// Skip the event entirely when the sentinel label is already on
    /// the issue, and apply the sentinel after successful processing.
    pub sentinel: bool,
    /// Add size/small|medium|large from the PR change volume.
    pub pr_size_labels: bool,
}

impl HandlerDescriptor {
    fn new(name: &'static str, steps: Vec<ChainStep>) -> Self {
        Self {
            name,
            steps,
            labels_from_step: None,
            comment: CommentStyle::None,
            target: IssueTarget::None,
            archive_category: "generic_events",
            sentinel: false,
            pr_size_labels: false,
        }
    }
}

fn workflow_failed(context: &ChainContext) -> bool {
    context
        .payload
        .get("workflow_run")
        .and_then(|run| run.get("conclusion"))
        .and_then(Value::as_str)
        == Some("failure")
}

fn has_commits(context: &ChainContext) -> bool {
    context
        .payload
        .get("commits")
        .and_then(Value::as_array)
        .map(|commits| !commits.is_empty())
        .unwrap_or(false)
}

/// Fixed `(event_type, action)` lookup table. Resolution order: exact
/// key, then `(event_type, "*")`, then the generic catch-all, so every
/// inbound event resolves to some handler.
pub struct HandlerRegistry {
    table: HashMap<(String, String), HandlerDescriptor>,
    generic: HandlerDescriptor,
}

impl HandlerRegistry {
    pub fn with_defaults() -> Self {
        let mut table = HashMap::new();

        let issue_chain = HandlerDescriptor {
            labels_from_step: Some("initial_analysis"),
            comment: CommentStyle::IssueMetadata,
            target: IssueTarget::Issue,
            archive_category: "issues",
            sentinel: true,
            ..HandlerDescriptor::new(
                "chained_issue",
                vec![
                    ChainStep::new("initial_analysis", ("issues", "analyze")).extracting(),
                    ChainStep::new("generate_response", ("issues", "respond")),
                ],
            )
        };
        table.insert(key("issues", "opened"), issue_chain);

        for (action, template) in [("opened", "new_pr"), ("synchronize", "pr_updated")] {
            let descriptor = HandlerDescriptor {
                labels_from_step: Some("analysis"),
                comment: CommentStyle::FinalResponse,
                target: IssueTarget::PullRequest,
                archive_category: "pull_requests",
                pr_size_labels: true,
                ..HandlerDescriptor::new(
                    "pull_request",
                    vec![ChainStep::new("analysis", ("pull_request", template)).extracting()],
                )
            };
            table.insert(key("pull_request", action), descriptor);
        }

        let review = HandlerDescriptor {
            comment: CommentStyle::FinalResponse,
            target: IssueTarget::PullRequest,
            archive_category: "reviews",
            ..HandlerDescriptor::new(
                "review_request",
                vec![ChainStep::new("review", ("pull_request_review", "requested"))],
            )
        };
        table.insert(key("pull_request_review", "*"), review);

        let workflow = HandlerDescriptor {
            archive_category: "workflows",
            ..HandlerDescriptor::new(
                "workflow_failure",
                vec![
                    ChainStep::new("failure_analysis", ("workflow_run", "completed"))
                        .when(workflow_failed),
                ],
            )
        };
        table.insert(key("workflow_run", "completed"), workflow);

        for action in ["published", "created", "edited"] {
            let descriptor = HandlerDescriptor {
                archive_category: "releases",
                ..HandlerDescriptor::new(
                    "release",
                    vec![ChainStep::new("release_notes", ("release", "notes"))],
                )
            };
            table.insert(key("release", action), descriptor);
        }

        let push = HandlerDescriptor {
            archive_category: "pushes",
            ..HandlerDescriptor::new(
                "push",
                vec![ChainStep::new("commit_review", ("push", "commits")).when(has_commits)],
            )
        };
        table.insert(key("push", "*"), push);

        let generic = HandlerDescriptor::new(
            "generic",
            vec![
                ChainStep::new("analysis", ("generic", "default"))
                    .or_prompt(DEFAULT_GENERIC_PROMPT),
            ],
        );

        Self { table, generic }
    }

    pub fn resolve(&self, event_type: &str, action: &str) -> &HandlerDescriptor {
        self.table
            .get(&key(event_type, action))
            .or_else(|| self.table.get(&key(event_type, "*")))
            .unwrap_or(&self.generic)
    }
}

fn key(event_type: &str, action: &str) -> (String, String) {
    (event_type.to_string(), action.to_string())
}
