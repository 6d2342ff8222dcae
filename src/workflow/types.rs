use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for UserId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roles a session can act under. A user may hold several but acts as exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requestor,
    Dao,
    Approver,
    Cpso,
    Dta,
    Sme,
    MediaCustodian,
    Admin,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Requestor,
        Role::Dao,
        Role::Approver,
        Role::Cpso,
        Role::Dta,
        Role::Sme,
        Role::MediaCustodian,
        Role::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Requestor => "requestor",
            Role::Dao => "dao",
            Role::Approver => "approver",
            Role::Cpso => "cpso",
            Role::Dta => "dta",
            Role::Sme => "sme",
            Role::MediaCustodian => "media_custodian",
            Role::Admin => "admin",
        }
    }

    /// Title used in user-facing messages.
    pub fn title(&self) -> &'static str {
        match self {
            Role::Requestor => "Requestor",
            Role::Dao => "DAO",
            Role::Approver => "ISSM",
            Role::Cpso => "CPSO",
            Role::Dta => "DTA",
            Role::Sme => "SME",
            Role::MediaCustodian => "Media Custodian",
            Role::Admin => "Admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "requestor" => Ok(Role::Requestor),
            "dao" => Ok(Role::Dao),
            "approver" | "issm" => Ok(Role::Approver),
            "cpso" => Ok(Role::Cpso),
            "dta" => Ok(Role::Dta),
            "sme" => Ok(Role::Sme),
            "media_custodian" => Ok(Role::MediaCustodian),
            "admin" => Ok(Role::Admin),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    Submitted,
    PendingDao,
    PendingApprover,
    PendingCpso,
    PendingDta,
    ActiveTransfer,
    PendingSmeSignature,
    PendingMediaCustodian,
    Completed,
    Disposed,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 13] = [
        RequestStatus::Draft,
        RequestStatus::Submitted,
        RequestStatus::PendingDao,
        RequestStatus::PendingApprover,
        RequestStatus::PendingCpso,
        RequestStatus::PendingDta,
        RequestStatus::ActiveTransfer,
        RequestStatus::PendingSmeSignature,
        RequestStatus::PendingMediaCustodian,
        RequestStatus::Completed,
        RequestStatus::Disposed,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Submitted => "submitted",
            RequestStatus::PendingDao => "pending_dao",
            RequestStatus::PendingApprover => "pending_approver",
            RequestStatus::PendingCpso => "pending_cpso",
            RequestStatus::PendingDta => "pending_dta",
            RequestStatus::ActiveTransfer => "active_transfer",
            RequestStatus::PendingSmeSignature => "pending_sme_signature",
            RequestStatus::PendingMediaCustodian => "pending_media_custodian",
            RequestStatus::Completed => "completed",
            RequestStatus::Disposed => "disposed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Disposed
                | RequestStatus::Rejected
                | RequestStatus::Cancelled
        )
    }

    /// The `pending_*` statuses, the only ones a reject may leave from.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RequestStatus::PendingDao
                | RequestStatus::PendingApprover
                | RequestStatus::PendingCpso
                | RequestStatus::PendingDta
                | RequestStatus::PendingSmeSignature
                | RequestStatus::PendingMediaCustodian
        )
    }

    /// The single role allowed to mutate a request in this status.
    pub fn owner(&self) -> Option<Role> {
        match self {
            RequestStatus::Draft => Some(Role::Requestor),
            RequestStatus::Submitted => Some(Role::Admin),
            RequestStatus::PendingDao => Some(Role::Dao),
            RequestStatus::PendingApprover => Some(Role::Approver),
            RequestStatus::PendingCpso => Some(Role::Cpso),
            RequestStatus::PendingDta | RequestStatus::ActiveTransfer => Some(Role::Dta),
            RequestStatus::PendingSmeSignature => Some(Role::Sme),
            RequestStatus::PendingMediaCustodian => Some(Role::MediaCustodian),
            RequestStatus::Completed
            | RequestStatus::Disposed
            | RequestStatus::Rejected
            | RequestStatus::Cancelled => None,
        }
    }

    /// Phrase describing where the request sits, for conflict and denial messages.
    pub fn describe(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "still a draft",
            RequestStatus::Submitted => "submitted and awaiting routing",
            RequestStatus::PendingDao => "pending DAO review",
            RequestStatus::PendingApprover => "pending ISSM approval",
            RequestStatus::PendingCpso => "already approved and pending CPSO review",
            RequestStatus::PendingDta => "approved and awaiting DTA assignment",
            RequestStatus::ActiveTransfer => "in active transfer",
            RequestStatus::PendingSmeSignature => "awaiting the SME two-person integrity signature",
            RequestStatus::PendingMediaCustodian => "awaiting media custodian processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Disposed => "closed with media disposed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("request status", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Submit,
    Cancel,
    Route,
    Approve,
    Reject,
    AssignDta,
    Sign,
    Complete,
    Dispose,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Submit,
        Action::Cancel,
        Action::Route,
        Action::Approve,
        Action::Reject,
        Action::AssignDta,
        Action::Sign,
        Action::Complete,
        Action::Dispose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Cancel => "cancel",
            Action::Route => "route",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::AssignDta => "assign_dta",
            Action::Sign => "sign",
            Action::Complete => "complete",
            Action::Dispose => "dispose",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the transfer. Only high-to-low gets the extra DAO review.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransferType {
    Standard,
    LowToHigh,
    HighToLow,
    Other(String),
}

impl TransferType {
    pub fn as_str(&self) -> &str {
        match self {
            TransferType::Standard => "standard",
            TransferType::LowToHigh => "low-to-high",
            TransferType::HighToLow => "high-to-low",
            TransferType::Other(value) => value,
        }
    }

    pub fn requires_dao_review(&self) -> bool {
        matches!(self, TransferType::HighToLow)
    }
}

impl From<&str> for TransferType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "standard" => TransferType::Standard,
            "low-to-high" => TransferType::LowToHigh,
            "high-to-low" => TransferType::HighToLow,
            _ => TransferType::Other(value.to_string()),
        }
    }
}

impl From<String> for TransferType {
    fn from(value: String) -> Self {
        TransferType::from(value.as_str())
    }
}

impl From<TransferType> for String {
    fn from(value: TransferType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMethod {
    Manual,
    Cac,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::Manual => "manual",
            SignatureMethod::Cac => "cac",
        }
    }
}

impl fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(SignatureMethod::Manual),
            "cac" => Ok(SignatureMethod::Cac),
            _ => Err(ParseEnumError::new("signature method", s)),
        }
    }
}

/// Workflow steps that carry a signature. At most one signature per step per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    RequestorSignature,
    ApproverApproval,
    CpsoApproval,
    DtaSignature,
    SmeSignature,
}

impl StepType {
    pub const ALL: [StepType; 5] = [
        StepType::RequestorSignature,
        StepType::ApproverApproval,
        StepType::CpsoApproval,
        StepType::DtaSignature,
        StepType::SmeSignature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::RequestorSignature => "requestor_signature",
            StepType::ApproverApproval => "approver_approval",
            StepType::CpsoApproval => "cpso_approval",
            StepType::DtaSignature => "dta_signature",
            StepType::SmeSignature => "sme_signature",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("signature step", s))
    }
}

/// A transfer request. `status` only changes through the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub request_number: String,
    pub title: String,
    pub status: RequestStatus,
    pub requestor_id: UserId,
    pub requestor_email: String,
    pub approver_id: Option<UserId>,
    pub dta_id: Option<UserId>,
    pub assigned_sme_id: Option<UserId>,
    pub transfer_type: TransferType,
    pub classification: String,
    pub signature_method: SignatureMethod,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Fields supplied by a requestor when opening a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub title: String,
    pub transfer_type: TransferType,
    pub classification: String,
    pub signature_method: SignatureMethod,
}

impl Request {
    pub fn draft(
        new: NewRequest,
        requestor_id: UserId,
        requestor_email: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            request_number: generate_request_number(now),
            title: new.title,
            status: RequestStatus::Draft,
            requestor_id,
            requestor_email: requestor_email.into(),
            approver_id: None,
            dta_id: None,
            assigned_sme_id: None,
            transfer_type: new.transfer_type,
            classification: new.classification,
            signature_method: new.signature_method,
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }

    /// Apply a committed status change and its field assignments to this copy.
    pub fn apply(&mut self, to: RequestStatus, fields: &RequestFieldUpdates, at: DateTime<Utc>) {
        self.status = to;
        self.updated_at = at;
        if let Some(approver) = &fields.approver_id {
            self.approver_id = Some(approver.clone());
        }
        if let Some(dta) = &fields.dta_id {
            self.dta_id = Some(dta.clone());
        }
        if let Some(sme) = &fields.assigned_sme_id {
            self.assigned_sme_id = Some(sme.clone());
        }
        if let Some(submitted) = fields.submitted_at {
            self.submitted_at = Some(submitted);
        }
    }
}

/// Role-bound fields assigned alongside a status change. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFieldUpdates {
    pub approver_id: Option<UserId>,
    pub dta_id: Option<UserId>,
    pub assigned_sme_id: Option<UserId>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// `AFT-YYYYMMDD-NNNNN`. Uniqueness is enforced by storage.
pub fn generate_request_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random_range(0..100_000);
    format!("AFT-{}-{:05}", now.format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>(), Ok(status));
        }
        assert!("pending_everyone".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses_have_no_owner() {
        for status in RequestStatus::ALL {
            assert_eq!(status.is_terminal(), status.owner().is_none(), "{status}");
        }
    }

    #[test]
    fn test_transfer_type_parsing() {
        assert!(TransferType::from("high-to-low").requires_dao_review());
        assert!(TransferType::from("HIGH_TO_LOW").requires_dao_review());
        assert!(!TransferType::from("standard").requires_dao_review());
        assert!(!TransferType::from("sideways").requires_dao_review());
        assert_eq!(TransferType::from("sideways").as_str(), "sideways");
    }

    #[test]
    fn test_role_aliases() {
        assert_eq!("issm".parse::<Role>(), Ok(Role::Approver));
        assert_eq!("Media-Custodian".parse::<Role>(), Ok(Role::MediaCustodian));
        assert!("janitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_request_number_format() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 9, 12, 0, 0).unwrap();
        let number = generate_request_number(now);
        assert!(number.starts_with("AFT-20260309-"));
        assert_eq!(number.len(), "AFT-20260309-00000".len());
    }
}
