use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound delivery. Built after signature validation, never
/// mutated, dropped when the dispatch that owns it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub action: String,
    pub repository: String,
    pub raw_payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

/// Structured result of parsing one model response. Always fully
/// populated: extraction degrades to these defaults, it never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub labels: Vec<String>,
    pub priority: Priority,
    pub category: String,
    pub needs_more_info: bool,
    pub is_duplicate: bool,
    pub should_close: bool,
}

impl Default for ExtractedData {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            priority: Priority::Medium,
            category: "unknown".to_string(),
            needs_more_info: false,
            is_duplicate: false,
            should_close: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Processed,
    /// Handed to the background worker; the handler outcome is logged,
    /// not returned to the caller.
    Accepted,
    Skipped,
    Duplicate,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Label,
    Comment,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTaken {
    pub kind: ActionKind,
    pub value: String,
    pub ok: bool,
}

/// Terminal record of one dispatch, returned to the webhook caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub status: DispatchStatus,
    pub request_id: String,
    pub actions_taken: Vec<ActionTaken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ProcessingResult {
    pub fn processed(request_id: &str, actions_taken: Vec<ActionTaken>) -> Self {
        Self {
            status: DispatchStatus::Processed,
            request_id: request_id.to_string(),
            actions_taken,
            error_detail: None,
        }
    }

    pub fn accepted(request_id: &str) -> Self {
        Self {
            status: DispatchStatus::Accepted,
            request_id: request_id.to_string(),
            actions_taken: Vec::new(),
            error_detail: None,
        }
    }

    pub fn skipped(request_id: &str, reason: &str) -> Self {
        Self {
            status: DispatchStatus::Skipped,
            request_id: request_id.to_string(),
            actions_taken: Vec::new(),
            error_detail: Some(reason.to_string()),
        }
    }

    pub fn duplicate(request_id: &str) -> Self {
        Self {
            status: DispatchStatus::Duplicate,
            request_id: request_id.to_string(),
            actions_taken: Vec::new(),
            error_detail: None,
        }
    }

    pub fn error(request_id: &str, detail: &str) -> Self {
        Self {
            status: DispatchStatus::Error,
            request_id: request_id.to_string(),
            actions_taken: Vec::new(),
            error_detail: Some(detail.to_string()),
        }
    }
}
