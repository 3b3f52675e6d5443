use crate::processor::Processor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use triage_core::model::{DispatchStatus, WebhookEvent};
use triage_core::policy::RepositoryPolicy;

/// One admitted delivery queued for background processing.
#[derive(Debug)]
pub struct DispatchJob {
    pub event: WebhookEvent,
    pub policy: RepositoryPolicy,
    pub request_id: String,
}

/// Drains the dispatch queue one job at a time, which also keeps model
/// calls naturally serialized. Exits when every sender is dropped.
pub async fn run_dispatch_worker(mut rx: mpsc::Receiver<DispatchJob>, processor: Arc<Processor>) {
    info!("dispatch worker started");

    while let Some(job) = rx.recv().await {
        let result = processor
            .process(&job.event, &job.policy, &job.request_id)
            .await;

        match result.status {
            DispatchStatus::Error => warn!(
                request_id = %job.request_id,
                delivery_id = %job.event.delivery_id,
                detail = result.error_detail.as_deref().unwrap_or("unknown"),
                "background dispatch failed"
            ),
            status => info!(
                request_id = %job.request_id,
                delivery_id = %job.event.delivery_id,
                status = ?status,
                actions = result.actions_taken.len(),
                "background dispatch finished"
            ),
        }
    }

    info!("dispatch worker stopped");
}
