// AFT Tracker Library - Assured File Transfer request workflow
// This exposes the core components for testing and integration

pub mod audit;
pub mod clock;
pub mod config;
pub mod errors;
pub mod notifications;
pub mod observability;
pub mod service;
pub mod session;
pub mod signature;
pub mod storage;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use audit::{
    AuditTrail, HistoryAction, HistoryEntry, NewHistoryEntry, TimelineView, WorkflowStep,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{config, AftConfig};
pub use errors::WorkflowError;
pub use notifications::{
    DispatchReport, LogNotifier, NotificationDispatcher, NotificationKind, Notifier,
    RecordingNotifier, StaticDirectory,
};
pub use observability::{workflow_metrics, OperationTimer, WorkflowStats};
pub use service::{AftService, TransitionReceipt};
pub use session::{InMemorySessionStore, Session, SessionError, SessionStore, UserIdentity};
pub use signature::types::{
    CacSignature, CertificateDescriptor, IntegrityReport, ManualSignature, SignatureEvidence,
    SignaturePayload, SignatureRecord,
};
pub use signature::verifier::{Assurance, SignatureVerifier, VerifierPolicy};
pub use storage::{InMemoryStorage, Storage, StorageError};
#[cfg(feature = "database")]
pub use storage::SqliteStorage;
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workflow::authorization::{AccessDenied, AuthorizationGate, DenialReason};
pub use workflow::risk::{AtRiskRequest, SlaPolicy};
pub use workflow::types::{
    Action, NewRequest, Request, RequestId, RequestStatus, Role, SignatureMethod, StepType,
    TransferType, UserId,
};
