pub mod audit;
pub mod conditions;
pub mod config;
pub mod delegation;
pub mod directory;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod notify;
pub mod store;
pub mod visibility;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
pub use conditions::{Condition, ConditionError, ConditionEvaluator, MetadataConditionEvaluator};
pub use delegation::{DelegationRegistry, NewDelegation};
pub use directory::{DirectoryLookup, InMemoryDirectory};
pub use domain::delegation::{Delegation, DelegationId};
pub use domain::history::{ApprovalHistory, HistoryAction, HistoryId};
pub use domain::request::{
    ApprovalRequest, Priority, RequestId, RequestStatus, SubjectRef, Visibility,
};
pub use domain::step::{ApprovalStep, StepId, StepStatus};
pub use domain::workflow::{
    ApprovalMode, ApproverSelector, Level, LevelId, Workflow, WorkflowId, WorkflowType,
};
pub use engine::{
    EngineStores, EscalationSweep, NewRequest, PendingApproval, RequestView, WorkflowEngine,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{HistoryLedger, VerificationResult};
pub use notify::{NotificationEvent, NotificationGateway, TracingNotificationGateway};
pub use store::{
    DelegationStore, HistoryStore, PolicyStore, RequestCommit, RequestStore, StoreError,
};
