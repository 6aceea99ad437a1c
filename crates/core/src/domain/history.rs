use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::RequestId;
use crate::domain::step::StepId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Created,
    Submitted,
    Approved,
    Rejected,
    Delegated,
    Escalated,
    Cancelled,
    Commented,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Delegated => "DELEGATED",
            Self::Escalated => "ESCALATED",
            Self::Cancelled => "CANCELLED",
            Self::Commented => "COMMENTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Some(Self::Created),
            "SUBMITTED" => Some(Self::Submitted),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "DELEGATED" => Some(Self::Delegated),
            "ESCALATED" => Some(Self::Escalated),
            "CANCELLED" => Some(Self::Cancelled),
            "COMMENTED" => Some(Self::Commented),
            _ => None,
        }
    }
}

/// An entry that has not yet been placed on its request's hash chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryDraft {
    pub request_id: RequestId,
    pub step_id: Option<StepId>,
    pub action: HistoryAction,
    pub actor_id: String,
    pub comments: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub is_internal: bool,
}

impl HistoryDraft {
    pub fn new(request_id: RequestId, action: HistoryAction, actor_id: impl Into<String>) -> Self {
        Self {
            request_id,
            step_id: None,
            action,
            actor_id: actor_id.into(),
            comments: None,
            metadata: BTreeMap::new(),
            is_internal: false,
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_comments(mut self, comments: Option<String>) -> Self {
        self.comments = comments.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }
}

/// Append-only audit record. `entry_hash` links to `prev_hash` of the
/// request's previous entry; `signature` is an HMAC over `entry_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistory {
    pub id: HistoryId,
    pub request_id: RequestId,
    pub sequence: u64,
    pub step_id: Option<StepId>,
    pub action: HistoryAction,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub comments: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub is_internal: bool,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub signature: String,
}
