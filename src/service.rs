//! The operations a front end calls. Every mutation runs the same pipeline:
//! read, authorize, compute the transition, commit status and signature together,
//! then append history and hand notifications off. The last two never fail the call.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::audit::{AuditTrail, HistoryAction, HistoryEntry, NewHistoryEntry, TimelineView};
use crate::clock::{Clock, SystemClock};
use crate::config::AftConfig;
use crate::errors::WorkflowError;
use crate::notifications::{DispatchReport, NotificationDispatcher, Notifier};
use crate::observability::{workflow_metrics, OperationTimer};
use crate::session::Session;
use crate::signature::store::SignatureStore;
use crate::signature::types::{IntegrityReport, SignaturePayload, SignatureRecord};
use crate::signature::verifier::{Assurance, SignatureVerifier, VerifierPolicy};
use crate::storage::{StatusUpdate, Storage, StorageError};
use crate::telemetry::{generate_correlation_id, workflow_span};
use crate::workflow::authorization::{AccessDenied, AuthorizationGate};
use crate::workflow::risk::{AtRiskRequest, SlaPolicy};
use crate::workflow::state_machine::{required_step, Actor, RequestStateMachine, TransitionInput};
use crate::workflow::types::{Action, NewRequest, Request, RequestId, RequestStatus, UserId};

const REQUEST_NUMBER_ATTEMPTS: usize = 5;

/// What a committed transition produced.
#[derive(Debug)]
pub struct TransitionReceipt {
    /// The request as it stands after the transition.
    pub request: Request,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub signature_id: Option<Uuid>,
    pub assurance: Option<Assurance>,
    /// `None` when the history write failed; the transition still stands.
    pub history: Option<HistoryEntry>,
    /// Background notification delivery, if any was started. Safe to drop.
    pub delivery: Option<JoinHandle<DispatchReport>>,
}

impl TransitionReceipt {
    pub fn status(&self) -> RequestStatus {
        self.to
    }
}

#[derive(Debug, Default)]
struct Command {
    signature: Option<SignaturePayload>,
    /// Supply a manual signature from the session when the step needs one and none was given.
    attest_from_session: bool,
    reason: Option<String>,
    notes: Option<String>,
    assign_sme: Option<UserId>,
    /// Status the operation is only meaningful at, for actions shared between steps.
    expected_status: Option<RequestStatus>,
}

pub struct AftService {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    gate: AuthorizationGate,
    machine: RequestStateMachine,
    signatures: SignatureStore,
    audit: AuditTrail,
    dispatcher: NotificationDispatcher,
    sla: SlaPolicy,
}

impl AftService {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        policy: VerifierPolicy,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let verifier = Arc::new(SignatureVerifier::new(policy, clock.clone()));
        Self {
            gate: AuthorizationGate::new(clock.clone()),
            machine: RequestStateMachine::new(verifier.clone()),
            signatures: SignatureStore::new(storage.clone(), verifier, clock.clone()),
            audit: AuditTrail::new(storage.clone(), clock.clone()),
            dispatcher,
            sla: SlaPolicy::default(),
            storage,
            clock,
        }
    }

    /// Wire a service from configuration with the system clock.
    pub fn from_config(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        config: &AftConfig,
    ) -> Result<Self, regex::Error> {
        let policy = VerifierPolicy::from_config(&config.signatures)?;
        let dispatcher = NotificationDispatcher::from_config(notifier, &config.notifications);
        Ok(Self::new(storage, Arc::new(SystemClock), policy, dispatcher)
            .with_sla(SlaPolicy::days(config.sla.at_risk_after_days)))
    }

    pub fn with_sla(mut self, sla: SlaPolicy) -> Self {
        self.sla = sla;
        self
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn signature_store(&self) -> &SignatureStore {
        &self.signatures
    }

    pub async fn create_draft(
        &self,
        session: &Session,
        new: NewRequest,
    ) -> Result<Request, WorkflowError> {
        let correlation_id = generate_correlation_id();
        let span = workflow_span("create_draft", None, &correlation_id);
        async {
            self.gate.check_can_create(session).map_err(|denied| self.denied(denied))?;

            if new.title.trim().is_empty() {
                return Err(WorkflowError::validation("A request title is required."));
            }
            if new.classification.trim().is_empty() {
                return Err(WorkflowError::validation("A classification is required."));
            }

            let mut attempts = 0;
            let request = loop {
                attempts += 1;
                let candidate = Request::draft(
                    new.clone(),
                    session.user_id.clone(),
                    session.email.clone(),
                    self.clock.now(),
                );
                match self.storage.insert_request(&candidate).await {
                    Ok(()) => break candidate,
                    Err(StorageError::DuplicateRequestNumber(number))
                        if attempts < REQUEST_NUMBER_ATTEMPTS =>
                    {
                        warn!(
                            request_number = %number,
                            attempts,
                            "Request number collision, retrying"
                        );
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to store new request");
                        return Err(err.into());
                    }
                }
            };

            info!(
                request_id = %request.id,
                request_number = %request.request_number,
                transfer_type = %request.transfer_type,
                "Draft request created"
            );
            self.audit
                .record(NewHistoryEntry {
                    request_id: request.id,
                    action: HistoryAction::Created,
                    actor_email: session.email.clone(),
                    notes: None,
                    timestamp: request.created_at,
                })
                .await;
            Ok(request)
        }
        .instrument(span)
        .await
    }

    pub async fn submit_request(
        &self,
        session: &Session,
        request_id: RequestId,
        signature: SignaturePayload,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "submit_request",
            session,
            request_id,
            Action::Submit,
            Command {
                signature: Some(signature),
                ..Command::default()
            },
        )
        .await
    }

    /// Approve at the actor's review step, attesting the signature from the session.
    pub async fn approve(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "approve",
            session,
            request_id,
            Action::Approve,
            Command {
                attest_from_session: true,
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn approve_with_signature(
        &self,
        session: &Session,
        request_id: RequestId,
        signature: SignaturePayload,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "approve_with_signature",
            session,
            request_id,
            Action::Approve,
            Command {
                signature: Some(signature),
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn reject(
        &self,
        session: &Session,
        request_id: RequestId,
        reason: &str,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "reject",
            session,
            request_id,
            Action::Reject,
            Command {
                reason: Some(reason.to_string()),
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    /// Two-person integrity sign-off by the assigned SME.
    pub async fn sign_as_sme(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "sign_as_sme",
            session,
            request_id,
            Action::Sign,
            Command {
                attest_from_session: true,
                notes: notes.map(str::to_string),
                expected_status: Some(RequestStatus::PendingSmeSignature),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn assign_dta(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "assign_dta",
            session,
            request_id,
            Action::AssignDta,
            Command {
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    /// DTA finishes the transfer and hands it to an SME.
    pub async fn sign_as_dta(
        &self,
        session: &Session,
        request_id: RequestId,
        signature: Option<SignaturePayload>,
        sme: Option<UserId>,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "sign_as_dta",
            session,
            request_id,
            Action::Sign,
            Command {
                attest_from_session: signature.is_none(),
                signature,
                notes: notes.map(str::to_string),
                assign_sme: sme,
                expected_status: Some(RequestStatus::ActiveTransfer),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn complete_transfer(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "complete_transfer",
            session,
            request_id,
            Action::Complete,
            Command {
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn dispose_media(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "dispose_media",
            session,
            request_id,
            Action::Dispose,
            Command {
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    pub async fn cancel(
        &self,
        session: &Session,
        request_id: RequestId,
        notes: Option<&str>,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform(
            "cancel",
            session,
            request_id,
            Action::Cancel,
            Command {
                notes: notes.map(str::to_string),
                ..Command::default()
            },
        )
        .await
    }

    /// Admin re-routing of a request left in `submitted`.
    pub async fn route(
        &self,
        session: &Session,
        request_id: RequestId,
    ) -> Result<TransitionReceipt, WorkflowError> {
        self.perform("route", session, request_id, Action::Route, Command::default())
            .await
    }

    pub async fn get_request(
        &self,
        session: &Session,
        request_id: RequestId,
    ) -> Result<Request, WorkflowError> {
        let request = self.load(request_id).await?;
        self.gate
            .can_view(session, &request)
            .map_err(|denied| self.denied(denied))?;
        Ok(request)
    }

    /// Requests the session may see, oldest first.
    pub async fn list_visible(&self, session: &Session) -> Result<Vec<Request>, WorkflowError> {
        let requests = self.storage.list_requests().await?;
        Ok(requests
            .into_iter()
            .filter(|request| self.gate.can_view(session, request).is_ok())
            .collect())
    }

    pub async fn get_timeline(&self, request_id: RequestId) -> Result<TimelineView, WorkflowError> {
        Ok(self.audit.timeline_for(request_id).await?)
    }

    pub async fn list_signatures(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<SignatureRecord>, WorkflowError> {
        self.signatures.list_for(request_id).await
    }

    pub async fn verify_signature(
        &self,
        signature_id: Uuid,
    ) -> Result<IntegrityReport, WorkflowError> {
        self.signatures.verify_integrity(signature_id).await
    }

    pub async fn at_risk_requests(&self) -> Result<Vec<AtRiskRequest>, WorkflowError> {
        let requests = self.storage.list_requests().await?;
        Ok(self.sla.at_risk(&requests, self.clock.now()))
    }

    async fn load(&self, request_id: RequestId) -> Result<Request, WorkflowError> {
        self.storage
            .read_request(request_id)
            .await?
            .ok_or(WorkflowError::NotFound(request_id))
    }

    fn denied(&self, denied: AccessDenied) -> WorkflowError {
        workflow_metrics().record_denial();
        info!(reason = ?denied.reason, "Action denied");
        WorkflowError::Authorization(denied)
    }

    async fn perform(
        &self,
        operation: &'static str,
        session: &Session,
        request_id: RequestId,
        action: Action,
        command: Command,
    ) -> Result<TransitionReceipt, WorkflowError> {
        let correlation_id = generate_correlation_id();
        let request_label = request_id.to_string();
        let span = workflow_span(operation, Some(&request_label), &correlation_id);
        let timer = OperationTimer::new(operation);

        let result = self
            .perform_inner(operation, session, request_id, action, command)
            .instrument(span)
            .await;

        timer.finish(match &result {
            Ok(_) => "committed",
            Err(WorkflowError::Authorization(_)) => "denied",
            Err(WorkflowError::Conflict { .. }) => "conflict",
            Err(_) => "failed",
        });
        result
    }

    async fn perform_inner(
        &self,
        operation: &'static str,
        session: &Session,
        request_id: RequestId,
        action: Action,
        command: Command,
    ) -> Result<TransitionReceipt, WorkflowError> {
        let mut request = self.load(request_id).await?;
        let role = self
            .gate
            .check(session, &request, action)
            .map_err(|denied| self.denied(denied))?;

        if let Some(expected) = command.expected_status {
            if request.status != expected {
                return Err(WorkflowError::validation(format!(
                    "{operation} applies to a request that is {}, but this one is {}.",
                    expected.describe(),
                    request.status.describe()
                )));
            }
        }

        let actor = Actor {
            user_id: session.user_id.clone(),
            email: session.email.clone(),
            display_name: session.display_name.clone(),
            role,
        };

        let signature = match command.signature {
            Some(payload) => Some(payload),
            None if command.attest_from_session
                && required_step(request.status, action).is_some() =>
            {
                Some(SignaturePayload::manual(session.display_name.clone()))
            }
            None => None,
        };

        let at = self.clock.now();
        let mut input = TransitionInput::new(action, &actor, at)
            .with_notes(command.notes.as_deref())
            .with_sme(command.assign_sme);
        if let Some(payload) = &signature {
            input = input.with_signature(payload);
        }
        if let Some(reason) = command.reason.as_deref() {
            input = input.with_reason(reason);
        }

        let outcome = self.machine.transition(&request, &input)?;

        let (record, assurance) = match outcome.signature {
            Some(pending) => {
                let record = self.signatures.prepare(
                    request.id,
                    pending.step,
                    &actor.user_id,
                    &actor.email,
                    pending.evidence,
                )?;
                (Some(record), Some(pending.assurance))
            }
            None => (None, None),
        };

        let update = StatusUpdate {
            request_id: request.id,
            expected_from: outcome.from,
            to: outcome.to,
            fields: outcome.fields.clone(),
            updated_at: at,
        };

        if let Err(err) = self.storage.write_request_status(&update, record.as_ref()).await {
            match &err {
                StorageError::StatusMismatch { actual, .. } => {
                    workflow_metrics().record_conflict();
                    warn!(
                        request_id = %request.id,
                        action = %action,
                        expected = %outcome.from,
                        actual = %actual,
                        "Request changed underneath this action"
                    );
                }
                StorageError::DuplicateSignature { step, .. } => {
                    warn!(request_id = %request.id, step = %step, "Step already signed");
                }
                other => {
                    error!(
                        request_id = %request.id,
                        action = %action,
                        expected = %outcome.from,
                        error = %other,
                        "Failed to commit transition"
                    );
                }
            }
            return Err(err.into());
        }

        workflow_metrics().record_transition();
        info!(
            request_id = %request.id,
            request_number = %request.request_number,
            from = %outcome.from,
            via = ?outcome.via,
            to = %outcome.to,
            action = %action,
            role = %role,
            actor = %actor.email,
            "Request transitioned"
        );

        let history = self.audit.record(outcome.history).await;
        let delivery = self.dispatcher.dispatch(outcome.notifications);

        request.apply(outcome.to, &update.fields, at);
        Ok(TransitionReceipt {
            request,
            from: outcome.from,
            to: outcome.to,
            signature_id: record.map(|r| r.id),
            assurance,
            history,
            delivery,
        })
    }
}
