//! The request lifecycle.
//!
//! `draft → submitted → [pending_dao →] pending_approver → pending_cpso → pending_dta →
//! active_transfer → pending_sme_signature → pending_media_custodian → completed | disposed`,
//! with `reject` from any `pending_*` status and `cancel` from `draft`.
//!
//! [`RequestStateMachine::transition`] is pure: it never touches storage or the mailer. It
//! returns the next status together with the signature to store, the history entry to append
//! and the notifications to send, and the caller commits them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::audit::{HistoryAction, NewHistoryEntry};
use crate::errors::WorkflowError;
use crate::notifications::{NotificationInstruction, NotificationKind, Recipient, TemplateData};
use crate::signature::types::{SignatureEvidence, SignaturePayload};
use crate::signature::verifier::{Assurance, SignatureVerifier, Verdict};
use crate::workflow::authorization::{AccessDenied, DenialReason};
use crate::workflow::types::{
    Action, Request, RequestFieldUpdates, RequestStatus, Role, StepType, TransferType, UserId,
};

/// Who is performing a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    pub action: Action,
    pub actor: &'a Actor,
    pub signature: Option<&'a SignaturePayload>,
    pub reason: Option<&'a str>,
    pub notes: Option<&'a str>,
    /// SME to bind when the DTA signs off the transfer.
    pub assign_sme: Option<UserId>,
    pub at: DateTime<Utc>,
}

impl<'a> TransitionInput<'a> {
    pub fn new(action: Action, actor: &'a Actor, at: DateTime<Utc>) -> Self {
        Self {
            action,
            actor,
            signature: None,
            reason: None,
            notes: None,
            assign_sme: None,
            at,
        }
    }

    pub fn with_signature(mut self, signature: &'a SignaturePayload) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_reason(mut self, reason: &'a str) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_notes(mut self, notes: Option<&'a str>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_sme(mut self, sme: Option<UserId>) -> Self {
        self.assign_sme = sme;
        self
    }
}

/// A verified signature waiting to be committed with the status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSignature {
    pub step: StepType,
    pub evidence: SignatureEvidence,
    pub assurance: Assurance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: RequestStatus,
    pub to: RequestStatus,
    /// Status passed through on the way, e.g. `submitted` on submit.
    pub via: Option<RequestStatus>,
    pub action: Action,
    pub fields: RequestFieldUpdates,
    pub signature: Option<PendingSignature>,
    pub history: NewHistoryEntry,
    pub notifications: Vec<NotificationInstruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    to: RequestStatus,
    via: Option<RequestStatus>,
    step: Option<StepType>,
    history: HistoryAction,
    history_cac: Option<HistoryAction>,
}

impl Rule {
    fn to(to: RequestStatus, history: HistoryAction) -> Self {
        Self {
            to,
            via: None,
            step: None,
            history,
            history_cac: None,
        }
    }

    fn signed(mut self, step: StepType, history_cac: Option<HistoryAction>) -> Self {
        self.step = Some(step);
        self.history_cac = history_cac;
        self
    }

    fn via(mut self, status: RequestStatus) -> Self {
        self.via = Some(status);
        self
    }
}

/// Where a submitted request goes. High-to-low transfers get DAO review first.
pub fn route_target(transfer_type: &TransferType) -> RequestStatus {
    if transfer_type.requires_dao_review() {
        RequestStatus::PendingDao
    } else {
        RequestStatus::PendingApprover
    }
}

fn rule_for(status: RequestStatus, action: Action, transfer_type: &TransferType) -> Option<Rule> {
    use RequestStatus::*;

    let rule = match (status, action) {
        (Draft, Action::Submit) => Rule::to(route_target(transfer_type), HistoryAction::Submitted)
            .via(Submitted)
            .signed(StepType::RequestorSignature, None),
        (Draft, Action::Cancel) => Rule::to(Cancelled, HistoryAction::Cancelled),
        (Submitted, Action::Route) => Rule::to(route_target(transfer_type), HistoryAction::Routed),
        (PendingDao, Action::Approve) => Rule::to(PendingApprover, HistoryAction::DaoApproved),
        (PendingApprover, Action::Approve) => Rule::to(PendingCpso, HistoryAction::IssmApproved)
            .signed(StepType::ApproverApproval, Some(HistoryAction::IssmApprovedCac)),
        (PendingCpso, Action::Approve) => Rule::to(PendingDta, HistoryAction::CpsoApproved)
            .signed(StepType::CpsoApproval, Some(HistoryAction::CpsoApprovedCac)),
        (PendingDta, Action::AssignDta) => Rule::to(ActiveTransfer, HistoryAction::DtaAssigned),
        (ActiveTransfer, Action::Sign) => Rule::to(PendingSmeSignature, HistoryAction::DtaSigned)
            .signed(StepType::DtaSignature, Some(HistoryAction::DtaSignedCac)),
        (PendingSmeSignature, Action::Sign) => {
            Rule::to(PendingMediaCustodian, HistoryAction::SmeSigned)
                .signed(StepType::SmeSignature, Some(HistoryAction::SmeSignedCac))
        }
        (PendingMediaCustodian, Action::Complete) => Rule::to(Completed, HistoryAction::Completed),
        (PendingMediaCustodian, Action::Dispose) => Rule::to(Disposed, HistoryAction::Disposed),
        (from, Action::Reject) if from.is_pending() => Rule::to(Rejected, HistoryAction::Rejected),
        _ => return None,
    };
    Some(rule)
}

/// The signature step an action at `status` requires, if any.
pub fn required_step(status: RequestStatus, action: Action) -> Option<StepType> {
    rule_for(status, action, &TransferType::Standard).and_then(|rule| rule.step)
}

/// Actions the owner of `request`'s status may take right now.
pub fn available_actions(request: &Request) -> Vec<Action> {
    Action::ALL
        .into_iter()
        .filter(|action| rule_for(request.status, *action, &request.transfer_type).is_some())
        .collect()
}

pub struct RequestStateMachine {
    verifier: Arc<SignatureVerifier>,
}

impl RequestStateMachine {
    pub fn new(verifier: Arc<SignatureVerifier>) -> Self {
        Self { verifier }
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Compute the outcome of `input` applied to `request`, or the guard that refused it.
    ///
    /// Guards run in order: terminal status, role ownership, legal action, rejection reason,
    /// SME separation, signature (required on signed steps, refused elsewhere). The
    /// stored-status check happens later, at write time.
    pub fn transition(
        &self,
        request: &Request,
        input: &TransitionInput<'_>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let from = request.status;
        let actor = input.actor;

        if from.is_terminal() {
            return Err(AccessDenied::new(DenialReason::TerminalStatus { status: from }).into());
        }
        if from.owner() != Some(actor.role) {
            return Err(AccessDenied::for_status(actor.role, from).into());
        }

        let rule = rule_for(from, input.action, &request.transfer_type).ok_or_else(|| {
            WorkflowError::validation(format!(
                "A request that is {} cannot be sent the '{}' action.",
                from.describe(),
                input.action
            ))
        })?;

        let reason = match input.action {
            Action::Reject => {
                let reason = input.reason.map(str::trim).unwrap_or_default();
                if reason.is_empty() {
                    return Err(WorkflowError::validation(
                        "A reason is required to reject a request.",
                    ));
                }
                Some(reason)
            }
            _ => None,
        };

        if from == RequestStatus::ActiveTransfer
            && input.action == Action::Sign
            && input.assign_sme.as_ref() == Some(&actor.user_id)
        {
            return Err(AccessDenied::new(DenialReason::SecondPersonRequired).into());
        }

        let signature = match (rule.step, input.signature) {
            (Some(step), payload) => Some(self.check_signature(step, payload)?),
            (None, Some(_)) => {
                return Err(WorkflowError::validation(format!(
                    "The '{}' action on a request that is {} does not take a signature.",
                    input.action,
                    from.describe()
                )))
            }
            (None, None) => None,
        };

        let fields = self.field_updates(from, input);
        let history_action = match (&signature, &rule.history_cac) {
            (Some(sig), Some(cac_action)) if matches!(sig.evidence, SignatureEvidence::Cac(_)) => {
                cac_action.clone()
            }
            _ => rule.history.clone(),
        };
        let history = NewHistoryEntry {
            request_id: request.id,
            action: history_action,
            actor_email: actor.email.clone(),
            notes: history_notes(reason, input.notes),
            timestamp: input.at,
        };
        let notifications = notifications_for(request, from, rule.to, actor, reason);

        debug!(
            request_id = %request.id,
            from = %from,
            to = %rule.to,
            action = %input.action,
            role = %actor.role,
            "Transition accepted"
        );

        Ok(TransitionOutcome {
            from,
            to: rule.to,
            via: rule.via,
            action: input.action,
            fields,
            signature,
            history,
            notifications,
        })
    }

    fn check_signature(
        &self,
        step: StepType,
        payload: Option<&SignaturePayload>,
    ) -> Result<PendingSignature, WorkflowError> {
        let payload = payload.ok_or_else(|| WorkflowError::MissingSignature {
            step,
            detail: "no signature was provided".to_string(),
        })?;
        match self.verifier.verify(payload) {
            Verdict::Valid { assurance } => Ok(PendingSignature {
                step,
                evidence: self.verifier.evidence_for(payload),
                assurance,
            }),
            Verdict::Invalid { reason } => Err(WorkflowError::MissingSignature {
                step,
                detail: reason,
            }),
        }
    }

    fn field_updates(
        &self,
        from: RequestStatus,
        input: &TransitionInput<'_>,
    ) -> RequestFieldUpdates {
        let mut fields = RequestFieldUpdates::default();
        match (from, input.action) {
            (RequestStatus::Draft, Action::Submit) => fields.submitted_at = Some(input.at),
            (RequestStatus::PendingApprover, Action::Approve) => {
                fields.approver_id = Some(input.actor.user_id.clone())
            }
            (RequestStatus::PendingDta, Action::AssignDta) => {
                fields.dta_id = Some(input.actor.user_id.clone())
            }
            (RequestStatus::ActiveTransfer, Action::Sign) => {
                fields.assigned_sme_id = input.assign_sme.clone()
            }
            _ => {}
        }
        fields
    }
}

fn history_notes(reason: Option<&str>, notes: Option<&str>) -> Option<String> {
    let notes = notes.map(str::trim).filter(|n| !n.is_empty());
    match (reason, notes) {
        (Some(reason), Some(notes)) => Some(format!("Reason: {reason}\nNotes: {notes}")),
        (Some(reason), None) => Some(format!("Reason: {reason}")),
        (None, notes) => notes.map(str::to_string),
    }
}

fn notifications_for(
    request: &Request,
    from: RequestStatus,
    to: RequestStatus,
    actor: &Actor,
    reason: Option<&str>,
) -> Vec<NotificationInstruction> {
    let mut template = TemplateData::new();
    template.insert("request_id".to_string(), request.id.to_string());
    template.insert("request_number".to_string(), request.request_number.clone());
    template.insert("title".to_string(), request.title.clone());
    template.insert("previous_status".to_string(), from.to_string());
    template.insert("status".to_string(), to.to_string());
    template.insert("actor_email".to_string(), actor.email.clone());
    template.insert("actor_role".to_string(), actor.role.title().to_string());

    let requestor = Recipient::Email(request.requestor_email.clone());
    match to {
        RequestStatus::Rejected => {
            if let Some(reason) = reason {
                template.insert("reason".to_string(), reason.to_string());
            }
            vec![NotificationInstruction {
                kind: NotificationKind::RequestRejected,
                recipient: requestor,
                template,
            }]
        }
        RequestStatus::Completed => vec![NotificationInstruction {
            kind: NotificationKind::RequestCompleted,
            recipient: requestor,
            template,
        }],
        RequestStatus::Disposed => vec![NotificationInstruction {
            kind: NotificationKind::MediaDisposed,
            recipient: requestor,
            template,
        }],
        RequestStatus::Cancelled => Vec::new(),
        status => status
            .owner()
            .map(|owner| NotificationInstruction {
                kind: NotificationKind::ActionRequired,
                recipient: Recipient::Role(owner),
                template,
            })
            .into_iter()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::signature::types::{CacSignature, CertificateDescriptor};
    use crate::signature::verifier::VerifierPolicy;
    use crate::workflow::types::{NewRequest, SignatureMethod};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 14, 0, 0).unwrap()
    }

    fn machine() -> RequestStateMachine {
        let clock = Arc::new(FixedClock::new(now()));
        let verifier = SignatureVerifier::new(VerifierPolicy::default(), clock);
        RequestStateMachine::new(Arc::new(verifier))
    }

    fn actor(role: Role) -> Actor {
        Actor {
            user_id: UserId::new(format!("{role}-1")),
            email: format!("{role}@example.mil"),
            display_name: format!("{} One", role.title()),
            role,
        }
    }

    fn request(status: RequestStatus, transfer_type: TransferType) -> Request {
        let mut request = Request::draft(
            NewRequest {
                title: "Firmware drop".to_string(),
                transfer_type,
                classification: "SECRET".to_string(),
                signature_method: SignatureMethod::Manual,
            },
            UserId::new("requestor-1"),
            "requestor@example.mil",
            now(),
        );
        request.status = status;
        request
    }

    fn cac() -> SignaturePayload {
        SignaturePayload::Cac(CacSignature {
            certificate: CertificateDescriptor {
                thumbprint: "FF00".to_string(),
                subject: "CN=ROE.RICH.B.99, OU=USAF, OU=DoD".to_string(),
                issuer: "CN=DOD ID CA-62, OU=PKI, OU=DoD".to_string(),
                serial_number: "42".to_string(),
                valid_from: now() - Duration::days(10),
                valid_to: now() + Duration::days(10),
                raw_certificate: vec![1],
            },
            signature: vec![9, 9],
            algorithm: "SHA256withECDSA".to_string(),
            signed_at: now(),
        })
    }

    #[test]
    fn test_submit_branches_on_transfer_type() {
        let m = machine();
        let requestor = actor(Role::Requestor);
        let sig = SignaturePayload::manual("Req One");

        let submit = TransitionInput::new(Action::Submit, &requestor, now()).with_signature(&sig);

        let high = request(RequestStatus::Draft, TransferType::HighToLow);
        let outcome = m.transition(&high, &submit).unwrap();
        assert_eq!(outcome.to, RequestStatus::PendingDao);
        assert_eq!(outcome.via, Some(RequestStatus::Submitted));

        let standard = request(RequestStatus::Draft, TransferType::Standard);
        let outcome = m.transition(&standard, &submit).unwrap();
        assert_eq!(outcome.to, RequestStatus::PendingApprover);
        assert_eq!(outcome.history.action, HistoryAction::Submitted);
        assert_eq!(outcome.fields.submitted_at, Some(now()));
        assert_eq!(outcome.signature.unwrap().step, StepType::RequestorSignature);
    }

    #[test]
    fn test_submit_without_signature_is_missing_signature() {
        let requestor = actor(Role::Requestor);
        let err = machine()
            .transition(
                &request(RequestStatus::Draft, TransferType::Standard),
                &TransitionInput::new(Action::Submit, &requestor, now()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::MissingSignature {
                step: StepType::RequestorSignature,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_signature_reason_is_surfaced() {
        let requestor = actor(Role::Requestor);
        let blank = SignaturePayload::manual("  ");
        let err = machine()
            .transition(
                &request(RequestStatus::Draft, TransferType::Standard),
                &TransitionInput::new(Action::Submit, &requestor, now()).with_signature(&blank),
            )
            .unwrap_err();
        assert!(err.to_string().contains("signer name is required"));
    }

    #[test]
    fn test_cac_approval_uses_cac_history_action() {
        let approver = actor(Role::Approver);
        let sig = cac();
        let outcome = machine()
            .transition(
                &request(RequestStatus::PendingApprover, TransferType::Standard),
                &TransitionInput::new(Action::Approve, &approver, now()).with_signature(&sig),
            )
            .unwrap();
        assert_eq!(outcome.to, RequestStatus::PendingCpso);
        assert_eq!(outcome.history.action, HistoryAction::IssmApprovedCac);
        assert_eq!(outcome.fields.approver_id, Some(approver.user_id.clone()));
        assert_eq!(outcome.signature.unwrap().assurance, Assurance::Structural);
    }

    #[test]
    fn test_wrong_role_is_authorization_error() {
        let cpso = actor(Role::Cpso);
        let err = machine()
            .transition(
                &request(RequestStatus::PendingApprover, TransferType::Standard),
                &TransitionInput::new(Action::Approve, &cpso, now()),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Authorization(_)));
    }

    #[test]
    fn test_reject_requires_reason() {
        let cpso = actor(Role::Cpso);
        let pending = request(RequestStatus::PendingCpso, TransferType::Standard);
        for reason in ["", "   "] {
            let input = TransitionInput::new(Action::Reject, &cpso, now()).with_reason(reason);
            let err = machine().transition(&pending, &input).unwrap_err();
            assert!(matches!(err, WorkflowError::Validation(_)));
        }
        let input = TransitionInput::new(Action::Reject, &cpso, now())
            .with_reason("insufficient justification");
        let outcome = machine().transition(&pending, &input).unwrap();
        assert_eq!(outcome.to, RequestStatus::Rejected);
        assert_eq!(outcome.history.notes.as_deref(), Some("Reason: insufficient justification"));
        assert_eq!(outcome.notifications[0].kind, NotificationKind::RequestRejected);
        assert_eq!(
            outcome.notifications[0].recipient,
            Recipient::Email("requestor@example.mil".to_string())
        );
    }

    #[test]
    fn test_reject_not_allowed_from_draft_or_active_transfer() {
        let dta = actor(Role::Dta);
        let err = machine()
            .transition(
                &request(RequestStatus::ActiveTransfer, TransferType::Standard),
                &TransitionInput::new(Action::Reject, &dta, now()).with_reason("no"),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_terminal_statuses_refuse_everything() {
        let m = machine();
        for status in RequestStatus::ALL.into_iter().filter(RequestStatus::is_terminal) {
            for role in Role::ALL {
                let who = actor(role);
                for action in Action::ALL {
                    let err = m
                        .transition(
                            &request(status, TransferType::Standard),
                            &TransitionInput::new(action, &who, now()).with_reason("x"),
                        )
                        .unwrap_err();
                    assert!(
                        matches!(err, WorkflowError::Authorization(_)),
                        "{status} {role} {action}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_dta_sign_binds_sme_and_notifies_sme_role() {
        let dta = actor(Role::Dta);
        let sig = SignaturePayload::manual("Dee Tee");
        let outcome = machine()
            .transition(
                &request(RequestStatus::ActiveTransfer, TransferType::Standard),
                &TransitionInput::new(Action::Sign, &dta, now())
                    .with_signature(&sig)
                    .with_sme(Some(UserId::new("sme-7"))),
            )
            .unwrap();
        assert_eq!(outcome.to, RequestStatus::PendingSmeSignature);
        assert_eq!(outcome.fields.assigned_sme_id, Some(UserId::new("sme-7")));
        assert_eq!(outcome.notifications[0].recipient, Recipient::Role(Role::Sme));
    }

    #[test]
    fn test_dta_cannot_name_themselves_as_sme() {
        let dta = actor(Role::Dta);
        let sig = SignaturePayload::manual("Dee Tee");
        let err = machine()
            .transition(
                &request(RequestStatus::ActiveTransfer, TransferType::Standard),
                &TransitionInput::new(Action::Sign, &dta, now())
                    .with_signature(&sig)
                    .with_sme(Some(dta.user_id.clone())),
            )
            .unwrap_err();
        match err {
            WorkflowError::Authorization(denied) => {
                assert_eq!(denied.reason, DenialReason::SecondPersonRequired)
            }
            other => panic!("expected a denial, got {other:?}"),
        }
    }

    #[test]
    fn test_signature_on_unsigned_step_is_refused() {
        let dao = actor(Role::Dao);
        let sig = SignaturePayload::manual("Dao One");
        let pending = request(RequestStatus::PendingDao, TransferType::HighToLow);

        let err = machine()
            .transition(
                &pending,
                &TransitionInput::new(Action::Approve, &dao, now()).with_signature(&sig),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(err.to_string().contains("does not take a signature"));

        let outcome = machine()
            .transition(&pending, &TransitionInput::new(Action::Approve, &dao, now()))
            .unwrap();
        assert_eq!(outcome.to, RequestStatus::PendingApprover);
        assert!(outcome.signature.is_none());
    }

    #[test]
    fn test_media_custodian_closes_either_way() {
        let custodian = actor(Role::MediaCustodian);
        let pending = request(RequestStatus::PendingMediaCustodian, TransferType::Standard);
        let completed = machine()
            .transition(&pending, &TransitionInput::new(Action::Complete, &custodian, now()))
            .unwrap();
        assert_eq!(completed.to, RequestStatus::Completed);
        let disposed = machine()
            .transition(&pending, &TransitionInput::new(Action::Dispose, &custodian, now()))
            .unwrap();
        assert_eq!(disposed.to, RequestStatus::Disposed);
    }

    #[test]
    fn test_available_actions() {
        let draft = request(RequestStatus::Draft, TransferType::Standard);
        assert_eq!(available_actions(&draft), vec![Action::Submit, Action::Cancel]);
        let cpso = request(RequestStatus::PendingCpso, TransferType::Standard);
        assert_eq!(available_actions(&cpso), vec![Action::Approve, Action::Reject]);
        let completed = request(RequestStatus::Completed, TransferType::Standard);
        assert!(available_actions(&completed).is_empty());
        assert_eq!(required_step(RequestStatus::PendingDao, Action::Approve), None);
        assert_eq!(
            required_step(RequestStatus::PendingSmeSignature, Action::Sign),
            Some(StepType::SmeSignature)
        );
    }
}
