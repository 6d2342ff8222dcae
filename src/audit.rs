//! Append-only request history and the progress view derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::observability::workflow_metrics;
use crate::storage::{Storage, StorageError};
use crate::workflow::types::{RequestId, RequestStatus, TransferType};

/// Conventional history vocabulary. Unknown labels survive verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HistoryAction {
    Created,
    Submitted,
    Cancelled,
    Routed,
    DaoApproved,
    IssmApproved,
    IssmApprovedCac,
    CpsoApproved,
    CpsoApprovedCac,
    DtaAssigned,
    DtaSigned,
    DtaSignedCac,
    SmeSigned,
    SmeSignedCac,
    Completed,
    Disposed,
    Rejected,
    Other(String),
}

impl HistoryAction {
    const KNOWN: [HistoryAction; 17] = [
        HistoryAction::Created,
        HistoryAction::Submitted,
        HistoryAction::Cancelled,
        HistoryAction::Routed,
        HistoryAction::DaoApproved,
        HistoryAction::IssmApproved,
        HistoryAction::IssmApprovedCac,
        HistoryAction::CpsoApproved,
        HistoryAction::CpsoApprovedCac,
        HistoryAction::DtaAssigned,
        HistoryAction::DtaSigned,
        HistoryAction::DtaSignedCac,
        HistoryAction::SmeSigned,
        HistoryAction::SmeSignedCac,
        HistoryAction::Completed,
        HistoryAction::Disposed,
        HistoryAction::Rejected,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            HistoryAction::Created => "CREATED",
            HistoryAction::Submitted => "SUBMITTED",
            HistoryAction::Cancelled => "CANCELLED",
            HistoryAction::Routed => "ROUTED",
            HistoryAction::DaoApproved => "DAO_APPROVED",
            HistoryAction::IssmApproved => "ISSM_APPROVED",
            HistoryAction::IssmApprovedCac => "ISSM_APPROVED_CAC",
            HistoryAction::CpsoApproved => "CPSO_APPROVED",
            HistoryAction::CpsoApprovedCac => "CPSO_APPROVED_CAC",
            HistoryAction::DtaAssigned => "DTA_ASSIGNED",
            HistoryAction::DtaSigned => "DTA_SIGNED",
            HistoryAction::DtaSignedCac => "DTA_SIGNED_CAC",
            HistoryAction::SmeSigned => "SME_SIGNED",
            HistoryAction::SmeSignedCac => "SME_SIGNED_CAC",
            HistoryAction::Completed => "COMPLETED",
            HistoryAction::Disposed => "DISPOSED",
            HistoryAction::Rejected => "REJECTED",
            HistoryAction::Other(label) => label,
        }
    }

    /// The workflow step an entry of this kind marks as reached.
    pub fn step(&self) -> Option<WorkflowStep> {
        match self {
            HistoryAction::Created | HistoryAction::Cancelled => Some(WorkflowStep::Draft),
            HistoryAction::Submitted | HistoryAction::Routed => Some(WorkflowStep::Submitted),
            HistoryAction::DaoApproved => Some(WorkflowStep::DaoReview),
            HistoryAction::IssmApproved | HistoryAction::IssmApprovedCac => {
                Some(WorkflowStep::IssmReview)
            }
            HistoryAction::CpsoApproved | HistoryAction::CpsoApprovedCac => {
                Some(WorkflowStep::CpsoReview)
            }
            HistoryAction::DtaAssigned => Some(WorkflowStep::DtaAssignment),
            HistoryAction::DtaSigned | HistoryAction::DtaSignedCac => Some(WorkflowStep::Transfer),
            HistoryAction::SmeSigned | HistoryAction::SmeSignedCac => {
                Some(WorkflowStep::SmeSignature)
            }
            HistoryAction::Completed | HistoryAction::Disposed => Some(WorkflowStep::Closed),
            HistoryAction::Rejected | HistoryAction::Other(_) => None,
        }
    }
}

impl From<&str> for HistoryAction {
    fn from(value: &str) -> Self {
        HistoryAction::KNOWN
            .iter()
            .find(|known| known.as_str() == value)
            .cloned()
            .unwrap_or_else(|| HistoryAction::Other(value.to_string()))
    }
}

impl From<String> for HistoryAction {
    fn from(value: String) -> Self {
        HistoryAction::from(value.as_str())
    }
}

impl From<HistoryAction> for String {
    fn from(value: HistoryAction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub request_id: RequestId,
    pub action: HistoryAction,
    pub actor_email: String,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A stored history row. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub request_id: RequestId,
    pub action: HistoryAction,
    pub actor_email: String,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Fixed progress sequence shown on request timelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Draft,
    Submitted,
    DaoReview,
    IssmReview,
    CpsoReview,
    DtaAssignment,
    Transfer,
    SmeSignature,
    MediaCustody,
    Closed,
}

impl WorkflowStep {
    pub fn sequence(transfer_type: &TransferType) -> Vec<WorkflowStep> {
        let mut steps = vec![WorkflowStep::Draft, WorkflowStep::Submitted];
        if transfer_type.requires_dao_review() {
            steps.push(WorkflowStep::DaoReview);
        }
        steps.extend([
            WorkflowStep::IssmReview,
            WorkflowStep::CpsoReview,
            WorkflowStep::DtaAssignment,
            WorkflowStep::Transfer,
            WorkflowStep::SmeSignature,
            WorkflowStep::MediaCustody,
            WorkflowStep::Closed,
        ]);
        steps
    }

    /// The step a request in `status` is currently working on. Rejected and cancelled
    /// requests are off the sequence.
    pub fn for_status(status: RequestStatus) -> Option<WorkflowStep> {
        match status {
            RequestStatus::Draft => Some(WorkflowStep::Draft),
            RequestStatus::Submitted => Some(WorkflowStep::Submitted),
            RequestStatus::PendingDao => Some(WorkflowStep::DaoReview),
            RequestStatus::PendingApprover => Some(WorkflowStep::IssmReview),
            RequestStatus::PendingCpso => Some(WorkflowStep::CpsoReview),
            RequestStatus::PendingDta => Some(WorkflowStep::DtaAssignment),
            RequestStatus::ActiveTransfer => Some(WorkflowStep::Transfer),
            RequestStatus::PendingSmeSignature => Some(WorkflowStep::SmeSignature),
            RequestStatus::PendingMediaCustodian => Some(WorkflowStep::MediaCustody),
            RequestStatus::Completed | RequestStatus::Disposed => Some(WorkflowStep::Closed),
            RequestStatus::Rejected | RequestStatus::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineView {
    pub request_id: RequestId,
    pub status: RequestStatus,
    /// Oldest first.
    pub entries: Vec<HistoryEntry>,
    pub current_step: WorkflowStep,
    /// 1-based position of `current_step` in the sequence.
    pub current_step_index: usize,
    pub total_steps: usize,
}

impl TimelineView {
    pub fn build(
        request_id: RequestId,
        status: RequestStatus,
        transfer_type: &TransferType,
        mut entries: Vec<HistoryEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let sequence = WorkflowStep::sequence(transfer_type);
        let reached = entries.iter().filter_map(|entry| entry.action.step()).max();
        let current_step = match (WorkflowStep::for_status(status), reached) {
            (Some(from_status), Some(from_history)) => from_status.max(from_history),
            (Some(from_status), None) => from_status,
            (None, Some(from_history)) => from_history,
            (None, None) => WorkflowStep::Draft,
        };
        let current_step_index = sequence
            .iter()
            .position(|step| *step == current_step)
            .or_else(|| sequence.iter().rposition(|step| *step < current_step))
            .map(|idx| idx + 1)
            .unwrap_or(1);

        Self {
            request_id,
            status,
            entries,
            current_step,
            current_step_index,
            total_steps: sequence.len(),
        }
    }

    pub fn percent_complete(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        ((self.current_step_index * 100) / self.total_steps).min(100) as u8
    }
}

/// Writer and reader for request history.
pub struct AuditTrail {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub async fn append(
        &self,
        request_id: RequestId,
        action: HistoryAction,
        actor_email: &str,
        notes: Option<&str>,
    ) -> Result<HistoryEntry, StorageError> {
        let entry = NewHistoryEntry {
            request_id,
            action,
            actor_email: actor_email.to_string(),
            notes: notes.map(str::to_string),
            timestamp: self.clock.now(),
        };
        self.storage.insert_history(&entry).await
    }

    /// Append that never fails the caller. The surrounding transition has already committed,
    /// so a failed write is logged and counted, not propagated.
    pub async fn record(&self, entry: NewHistoryEntry) -> Option<HistoryEntry> {
        match self.storage.insert_history(&entry).await {
            Ok(stored) => Some(stored),
            Err(err) => {
                workflow_metrics().record_audit_failure();
                warn!(
                    request_id = %entry.request_id,
                    action = %entry.action,
                    actor = %entry.actor_email,
                    error = %err,
                    "Failed to write audit history entry; transition stands"
                );
                None
            }
        }
    }

    pub async fn timeline_for(&self, request_id: RequestId) -> Result<TimelineView, StorageError> {
        let request = self
            .storage
            .read_request(request_id)
            .await?
            .ok_or(StorageError::RequestNotFound(request_id))?;
        let entries = self.storage.history_for(request_id).await?;
        Ok(TimelineView::build(
            request_id,
            request.status,
            &request.transfer_type,
            entries,
        ))
    }
}
