use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::RequestId;
use crate::domain::step::StepId;

/// Events handed to the notification subsystem. Delivery is the gateway's
/// concern; the engine fires and forgets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    RequestSubmittedToApprover { request_id: RequestId, step_id: StepId, approver_id: String },
    RequestApproved { request_id: RequestId, requester_id: String },
    RequestRejected { request_id: RequestId, requester_id: String, reason: String },
    RequestEscalated { request_id: RequestId, requester_id: String, level_number: u32 },
}

impl NotificationEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::RequestSubmittedToApprover { request_id, .. }
            | Self::RequestApproved { request_id, .. }
            | Self::RequestRejected { request_id, .. }
            | Self::RequestEscalated { request_id, .. } => request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestSubmittedToApprover { .. } => "request_submitted_to_approver",
            Self::RequestApproved { .. } => "request_approved",
            Self::RequestRejected { .. } => "request_rejected",
            Self::RequestEscalated { .. } => "request_escalated",
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::RequestSubmittedToApprover { approver_id, .. } => approver_id,
            Self::RequestApproved { requester_id, .. }
            | Self::RequestRejected { requester_id, .. }
            | Self::RequestEscalated { requester_id, .. } => requester_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

pub trait NotificationGateway: Send + Sync {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// Logs each event; useful when no delivery subsystem is wired in.
#[derive(Clone, Debug, Default)]
pub struct TracingNotificationGateway;

impl NotificationGateway for TracingNotificationGateway {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        tracing::info!(
            event_name = "notification.dispatched",
            request_id = %event.request_id(),
            kind = event.kind(),
            recipient = event.recipient(),
            "notification dispatched"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationGateway {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
    fail_with: Option<String>,
}

impl InMemoryNotificationGateway {
    /// A gateway whose every dispatch fails after recording the event.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self { events: Arc::default(), fail_with: Some(reason.into()) }
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationGateway for InMemoryNotificationGateway {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        match &self.fail_with {
            Some(reason) => Err(NotificationError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}
