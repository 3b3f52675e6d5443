use crate::config::Config;
use crate::dedup::{DedupDecision, DeliveryCache};
use crate::processor::Processor;
use crate::stats::Stats;
use crate::worker::DispatchJob;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use triage_core::model::{DispatchStatus, ProcessingResult, WebhookEvent};
use triage_core::policy::RepositoryTable;
use triage_core::signatures::verify_github_signature;
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

/// Rejection before an event is admitted. The HTTP layer maps these to
/// 401/400/503; everything past admission is a ProcessingResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    Unauthorized(&'static str),
    BadRequest(&'static str),
    Busy,
}

impl DispatchError {
    pub fn message(self) -> &'static str {
        match self {
            DispatchError::Unauthorized(message) => message,
            DispatchError::BadRequest(message) => message,
            DispatchError::Busy => "dispatch queue full",
        }
    }
}

/// Front door for raw deliveries: validates the signature over the raw
/// body, parses and filters, then runs the processor inline or hands
/// the job to the worker queue.
pub struct Dispatcher {
    settings: Arc<Config>,
    repositories: Arc<RepositoryTable>,
    dedup: DeliveryCache,
    processor: Arc<Processor>,
    queue: Option<mpsc::Sender<DispatchJob>>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<Config>,
        repositories: Arc<RepositoryTable>,
        processor: Arc<Processor>,
        queue: Option<mpsc::Sender<DispatchJob>>,
        stats: Arc<Stats>,
    ) -> Self {
        let dedup = DeliveryCache::new(settings.dedup_ttl_seconds);
        Self {
            settings,
            repositories,
            dedup,
            processor,
            queue,
            stats,
        }
    }

    pub async fn dispatch(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProcessingResult, DispatchError> {
        let request_id = Uuid::new_v4().to_string();
        self.stats.inc_received();

        if self.settings.signature_validation {
            let signature = header_str(headers, SIGNATURE_HEADER)
                .ok_or(DispatchError::Unauthorized("missing signature header"))?;
            if !verify_github_signature(&self.settings.webhook_secret, body, signature) {
                warn!(request_id, "rejecting delivery; signature mismatch");
                return Err(DispatchError::Unauthorized("invalid signature"));
            }
        }

        let event_type = header_str(headers, EVENT_HEADER)
            .ok_or(DispatchError::BadRequest("missing event header"))?
            .to_string();
        let delivery_id = header_str(headers, DELIVERY_HEADER)
            .ok_or(DispatchError::BadRequest("missing delivery header"))?
            .to_string();

        let payload: Value = serde_json::from_slice(body)
            .map_err(|_| DispatchError::BadRequest("invalid json payload"))?;
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let Some(repository) = payload
            .get("repository")
            .and_then(|repo| repo.get("full_name"))
            .and_then(Value::as_str)
        else {
            info!(request_id, %event_type, "skipping; payload has no repository");
            return Ok(self.skip(&request_id, "no repository in payload"));
        };

        let Some(policy) = self.repositories.get(repository) else {
            info!(request_id, repo = repository, "skipping; repository not configured");
            return Ok(self.skip(&request_id, "repository not configured"));
        };
        if !policy.enabled {
            info!(request_id, repo = repository, "skipping; repository disabled");
            return Ok(self.skip(&request_id, "repository disabled"));
        }
        if !self.repositories.is_event_enabled(repository, &event_type) {
            info!(
                request_id,
                repo = repository,
                %event_type,
                "skipping; event not enabled for repository"
            );
            return Ok(self.skip(&request_id, "event not enabled"));
        }

        if self.dedup.check(&delivery_id, Utc::now().timestamp()) == DedupDecision::Duplicate {
            info!(request_id, %delivery_id, "dropping replayed delivery");
            self.stats.record_outcome(DispatchStatus::Duplicate);
            return Ok(ProcessingResult::duplicate(&request_id));
        }

        self.stats.inc_event(&event_type);

        let event = WebhookEvent {
            delivery_id,
            event_type,
            action,
            repository: repository.to_string(),
            raw_payload: payload,
        };

        match &self.queue {
            Some(queue) => {
                let job = DispatchJob {
                    event,
                    policy: policy.clone(),
                    request_id: request_id.clone(),
                };
                match queue.try_send(job) {
                    Ok(()) => {
                        self.stats.record_outcome(DispatchStatus::Accepted);
                        Ok(ProcessingResult::accepted(&request_id))
                    }
                    // A shed delivery answers 503 so GitHub redelivers;
                    // its id must leave the dedup cache or the
                    // redelivery would be dropped as a replay.
                    Err(mpsc::error::TrySendError::Full(job)) => {
                        self.dedup.forget(&job.event.delivery_id);
                        warn!(request_id, "dispatch queue full; shedding delivery");
                        Err(DispatchError::Busy)
                    }
                    Err(mpsc::error::TrySendError::Closed(job)) => {
                        self.dedup.forget(&job.event.delivery_id);
                        warn!(request_id, "dispatch worker gone");
                        Err(DispatchError::Busy)
                    }
                }
            }
            None => Ok(self.processor.process(&event, policy, &request_id).await),
        }
    }

    fn skip(&self, request_id: &str, reason: &str) -> ProcessingResult {
        self.stats.record_outcome(DispatchStatus::Skipped);
        ProcessingResult::skipped(request_id, reason)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::processor::Processor;
    use crate::templates::PromptStore;
    use crate::testing::{RecordingIssues, ScriptedModel};
    use axum::http::HeaderValue;
    use serde_json::json;
    use triage_core::model::DispatchStatus;
    use triage_core::policy::RepositoryPolicy;
    use triage_core::signatures::compute_hmac_sha256_hex;

    fn table() -> RepositoryTable {
        RepositoryTable::from_policies(vec![RepositoryPolicy {
            name: "octocat/hello-world".to_string(),
            enabled: true,
            events: vec!["issues".to_string()],
            auto_apply_labels: true,
            auto_post_comments: true,
            auto_close: false,
            label_categories: Vec::new(),
            local_context_path: None,
        }])
    }

    fn dispatcher(
        model: Arc<ScriptedModel>,
        github: Arc<RecordingIssues>,
        outputs: &tempfile::TempDir,
    ) -> Dispatcher {
        let mut settings = test_config();
        settings.outputs_dir = outputs.path().to_path_buf();
        let settings = Arc::new(settings);
        let prompts = Arc::new(PromptStore::from_sources(vec![
            ("issues/analyze".to_string(), "analyze".to_string()),
            ("issues/respond".to_string(), "respond".to_string()),
        ]));
        let processor = Arc::new(Processor::new(
            prompts,
            model,
            github,
            settings.clone(),
            Arc::new(Stats::new()),
        ));
        Dispatcher::new(settings, Arc::new(table()), processor, None, Arc::new(Stats::new()))
    }

    fn signed_headers(body: &[u8], event: &str, delivery: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let signature = format!(
            "sha256={}",
            compute_hmac_sha256_hex("test-secret", body)
        );
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature).unwrap(),
        );
        headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        headers.insert(DELIVERY_HEADER, HeaderValue::from_str(delivery).unwrap());
        headers
    }

    fn issue_body(repo: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "opened",
            "repository": {"full_name": repo},
            "issue": {"number": 1, "title": "t", "labels": []}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn invalid_signature_rejects_before_any_processing() {
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model.clone(), github.clone(), &outputs);

        let body = issue_body("octocat/hello-world");
        let mut headers = signed_headers(&body, "issues", "d-1");
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_static("sha256=deadbeef"),
        );

        let error = dispatcher.dispatch(&headers, &body).await.unwrap_err();
        assert_eq!(error, DispatchError::Unauthorized("invalid signature"));
        assert_eq!(model.call_count(), 0);
        assert_eq!(github.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model, github, &outputs);

        let body = b"{not json".to_vec();
        let headers = signed_headers(&body, "issues", "d-2");

        let error = dispatcher.dispatch(&headers, &body).await.unwrap_err();
        assert_eq!(error, DispatchError::BadRequest("invalid json payload"));
    }

    #[tokio::test]
    async fn replayed_delivery_id_runs_the_chain_once() {
        let model = Arc::new(ScriptedModel::respond_with(&["analysis", "reply"]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model.clone(), github.clone(), &outputs);

        let body = issue_body("octocat/hello-world");
        let headers = signed_headers(&body, "issues", "d-3");

        let first = dispatcher.dispatch(&headers, &body).await.unwrap();
        assert_eq!(first.status, DispatchStatus::Processed);
        assert_eq!(model.call_count(), 2);

        let second = dispatcher.dispatch(&headers, &body).await.unwrap();
        assert_eq!(second.status, DispatchStatus::Duplicate);
        // No further model or GitHub traffic for the replay.
        assert_eq!(model.call_count(), 2);
        assert_eq!(github.comment_bodies().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_repository_is_skipped_without_processing() {
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model.clone(), github.clone(), &outputs);

        let body = issue_body("someone-else/repo");
        let headers = signed_headers(&body, "issues", "d-4");

        let result = dispatcher.dispatch(&headers, &body).await.unwrap();
        assert_eq!(result.status, DispatchStatus::Skipped);
        assert_eq!(model.call_count(), 0);
        assert_eq!(github.call_count(), 0);
    }

    #[tokio::test]
    async fn event_outside_the_policy_list_is_skipped() {
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model.clone(), github, &outputs);

        let body = issue_body("octocat/hello-world");
        let headers = signed_headers(&body, "pull_request", "d-5");

        let result = dispatcher.dispatch(&headers, &body).await.unwrap();
        assert_eq!(result.status, DispatchStatus::Skipped);
        assert_eq!(result.error_detail.as_deref(), Some("event not enabled"));
        assert_eq!(model.call_count(), 0);
    }

    fn queued_dispatcher(
        capacity: usize,
        outputs: &tempfile::TempDir,
    ) -> (Dispatcher, mpsc::Receiver<DispatchJob>) {
        let mut settings = test_config();
        settings.outputs_dir = outputs.path().to_path_buf();
        let settings = Arc::new(settings);
        let prompts = Arc::new(PromptStore::from_sources(Vec::new()));
        let processor = Arc::new(Processor::new(
            prompts,
            Arc::new(ScriptedModel::respond_with(&[])),
            Arc::new(RecordingIssues::new()),
            settings.clone(),
            Arc::new(Stats::new()),
        ));

        let (tx, rx) = mpsc::channel(capacity);
        let dispatcher = Dispatcher::new(
            settings,
            Arc::new(table()),
            processor,
            Some(tx),
            Arc::new(Stats::new()),
        );
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn full_queue_sheds_load_after_accepting_up_to_capacity() {
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        // Capacity-1 queue with no worker draining it.
        let (dispatcher, _rx) = queued_dispatcher(1, &outputs);

        let body = issue_body("octocat/hello-world");
        let headers = signed_headers(&body, "issues", "d-q1");
        let accepted = dispatcher.dispatch(&headers, &body).await.unwrap();
        assert_eq!(accepted.status, DispatchStatus::Accepted);

        let headers = signed_headers(&body, "issues", "d-q2");
        let error = dispatcher.dispatch(&headers, &body).await.unwrap_err();
        assert_eq!(error, DispatchError::Busy);
    }

    #[tokio::test]
    async fn shed_delivery_is_admitted_when_redelivered() {
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let (dispatcher, mut rx) = queued_dispatcher(1, &outputs);

        let body = issue_body("octocat/hello-world");
        let first = signed_headers(&body, "issues", "d-a");
        assert_eq!(
            dispatcher.dispatch(&first, &body).await.unwrap().status,
            DispatchStatus::Accepted
        );

        // Queue full: this delivery is shed with 503.
        let second = signed_headers(&body, "issues", "d-b");
        let error = dispatcher.dispatch(&second, &body).await.unwrap_err();
        assert_eq!(error, DispatchError::Busy);

        // GitHub redelivers the shed id after the queue drains; it
        // must be admitted, not dropped as a replay.
        let drained = rx.recv().await.expect("queued job");
        assert_eq!(drained.event.delivery_id, "d-a");
        let redelivered = dispatcher.dispatch(&second, &body).await.unwrap();
        assert_eq!(redelivered.status, DispatchStatus::Accepted);
    }

    #[tokio::test]
    async fn missing_event_header_is_a_bad_request() {
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let github = Arc::new(RecordingIssues::new());
        let outputs = tempfile::tempdir().expect("temp outputs dir");
        let dispatcher = dispatcher(model, github, &outputs);

        let body = issue_body("octocat/hello-world");
        let mut headers = signed_headers(&body, "issues", "d-6");
        headers.remove(EVENT_HEADER);

        let error = dispatcher.dispatch(&headers, &body).await.unwrap_err();
        assert_eq!(error, DispatchError::BadRequest("missing event header"));
    }
}
