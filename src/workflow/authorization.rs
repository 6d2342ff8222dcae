use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::session::Session;
use crate::workflow::types::{Action, Request, RequestStatus, Role, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    SessionExpired,
    NoActiveRole,
    RoleNotHeld { role: Role },
    TerminalStatus { status: RequestStatus },
    RoleMismatch {
        active: Role,
        required: Role,
        status: RequestStatus,
    },
    NotRecordOwner,
    NotAssignee { assignee: UserId },
    SelfApproval,
    /// The SME countersign must come from someone other than the DTA.
    SecondPersonRequired,
}

/// A refused action, with an explanation fit to show the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AccessDenied {
    pub reason: DenialReason,
    pub message: String,
}

impl AccessDenied {
    pub fn new(reason: DenialReason) -> Self {
        let message = match &reason {
            DenialReason::SessionExpired => "Your session has expired; sign in again.".to_string(),
            DenialReason::NoActiveRole => {
                "Select the role you are acting as before performing this action.".to_string()
            }
            DenialReason::RoleNotHeld { role } => {
                format!("Your account does not hold the {} role.", role.title())
            }
            DenialReason::TerminalStatus { status } => format!(
                "This request is {} and can no longer be changed.",
                status.describe()
            ),
            DenialReason::RoleMismatch {
                active,
                required,
                status,
            } => format!(
                "You are acting as {}, but a request {} can only be acted on by the {}.",
                active.title(),
                status.describe(),
                required.title()
            ),
            DenialReason::NotRecordOwner => {
                "Only the requestor who created this request may do that.".to_string()
            }
            DenialReason::NotAssignee { assignee } => {
                format!("This request is assigned to {assignee}.")
            }
            DenialReason::SelfApproval => {
                "You cannot approve or countersign a request you submitted.".to_string()
            }
            DenialReason::SecondPersonRequired => {
                "Two-person integrity requires a different person from the DTA who performed \
                 the transfer."
                    .to_string()
            }
        };
        Self { reason, message }
    }

    /// Denial for an actor whose role does not own `status`.
    pub fn for_status(active: Role, status: RequestStatus) -> Self {
        match status.owner() {
            Some(required) => Self::new(DenialReason::RoleMismatch {
                active,
                required,
                status,
            }),
            None => Self::new(DenialReason::TerminalStatus { status }),
        }
    }
}

/// Single choke point deciding whether a session may act on, or look at, a request.
pub struct AuthorizationGate {
    clock: Arc<dyn Clock>,
}

impl AuthorizationGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// The role the session is acting under, once it is live and explicitly selected.
    pub fn acting_role(&self, session: &Session) -> Result<Role, AccessDenied> {
        if session.is_expired(self.clock.now()) {
            return Err(AccessDenied::new(DenialReason::SessionExpired));
        }
        let role = session
            .active_role
            .ok_or_else(|| AccessDenied::new(DenialReason::NoActiveRole))?;
        if !session.holds(role) {
            return Err(AccessDenied::new(DenialReason::RoleNotHeld { role }));
        }
        Ok(role)
    }

    pub fn check_can_create(&self, session: &Session) -> Result<Role, AccessDenied> {
        let role = self.acting_role(session)?;
        if role != Role::Requestor {
            return Err(AccessDenied::for_status(role, RequestStatus::Draft));
        }
        Ok(role)
    }

    /// Decide whether `session` may perform `action` on `request` in its current status.
    pub fn check(
        &self,
        session: &Session,
        request: &Request,
        action: Action,
    ) -> Result<Role, AccessDenied> {
        let role = self.acting_role(session)?;

        let status = request.status;
        match status.owner() {
            Some(owner) if owner == role => {}
            _ => {
                debug!(
                    request_id = %request.id,
                    role = %role,
                    status = %status,
                    action = %action,
                    "Role does not own request status"
                );
                return Err(AccessDenied::for_status(role, status));
            }
        }

        self.check_record_scope(session, request, action)?;
        Ok(role)
    }

    fn check_record_scope(
        &self,
        session: &Session,
        request: &Request,
        action: Action,
    ) -> Result<(), AccessDenied> {
        let user = &session.user_id;
        match request.status {
            RequestStatus::Draft => {
                if &request.requestor_id != user {
                    return Err(AccessDenied::new(DenialReason::NotRecordOwner));
                }
            }
            RequestStatus::ActiveTransfer => {
                if let Some(dta) = &request.dta_id {
                    if dta != user {
                        return Err(AccessDenied::new(DenialReason::NotAssignee {
                            assignee: dta.clone(),
                        }));
                    }
                }
            }
            RequestStatus::PendingSmeSignature => {
                if request.dta_id.as_ref() == Some(user) {
                    return Err(AccessDenied::new(DenialReason::SecondPersonRequired));
                }
                if let Some(sme) = &request.assigned_sme_id {
                    if sme != user {
                        return Err(AccessDenied::new(DenialReason::NotAssignee {
                            assignee: sme.clone(),
                        }));
                    }
                }
            }
            _ => {}
        }

        let countersigns = matches!(action, Action::Approve | Action::Sign);
        if countersigns && request.status != RequestStatus::Draft && &request.requestor_id == user {
            return Err(AccessDenied::new(DenialReason::SelfApproval));
        }
        Ok(())
    }

    /// Read access. APPROVER and CPSO share the review dashboard, so each may view the
    /// other's queue without gaining mutation authority over it.
    pub fn can_view(&self, session: &Session, request: &Request) -> Result<(), AccessDenied> {
        let role = self.acting_role(session)?;
        let user = &session.user_id;

        let bound_to_record = &request.requestor_id == user
            || request.approver_id.as_ref() == Some(user)
            || request.dta_id.as_ref() == Some(user)
            || request.assigned_sme_id.as_ref() == Some(user);

        let shared_review = matches!(role, Role::Approver | Role::Cpso)
            && matches!(
                request.status,
                RequestStatus::PendingApprover | RequestStatus::PendingCpso
            );

        let allowed = match role {
            Role::Admin => true,
            Role::Requestor => &request.requestor_id == user,
            _ => request.status.owner() == Some(role) || shared_review || bound_to_record,
        };

        if allowed {
            Ok(())
        } else if role == Role::Requestor {
            Err(AccessDenied::new(DenialReason::NotRecordOwner))
        } else {
            Err(AccessDenied::for_status(role, request.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::session::UserIdentity;
    use crate::workflow::types::{NewRequest, SignatureMethod, TransferType};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap()
    }

    fn gate() -> AuthorizationGate {
        AuthorizationGate::new(Arc::new(FixedClock::new(now())))
    }

    fn session(user: &str, role: Role) -> Session {
        Session::acting(
            UserIdentity {
                user_id: UserId::new(user),
                email: format!("{user}@example.mil"),
                display_name: user.to_string(),
                primary_role: role,
                available_roles: vec![role],
            },
            role,
            now(),
            Duration::hours(8),
        )
    }

    fn request(status: RequestStatus) -> Request {
        let mut request = Request::draft(
            NewRequest {
                title: "Move logs".to_string(),
                transfer_type: TransferType::Standard,
                classification: "SECRET".to_string(),
                signature_method: SignatureMethod::Manual,
            },
            UserId::new("req-1"),
            "req-1@example.mil",
            now(),
        );
        request.status = status;
        request
    }

    #[test]
    fn test_owner_role_is_allowed() {
        let role = gate()
            .check(
                &session("issm-1", Role::Approver),
                &request(RequestStatus::PendingApprover),
                Action::Approve,
            )
            .unwrap();
        assert_eq!(role, Role::Approver);
    }

    #[test]
    fn test_cpso_cannot_act_on_approver_step() {
        let err = gate()
            .check(
                &session("cpso-1", Role::Cpso),
                &request(RequestStatus::PendingApprover),
                Action::Approve,
            )
            .unwrap_err();
        assert_eq!(
            err.reason,
            DenialReason::RoleMismatch {
                active: Role::Cpso,
                required: Role::Approver,
                status: RequestStatus::PendingApprover,
            }
        );
        assert!(err.message.contains("acting as CPSO"));
        assert!(err.message.contains("ISSM"));
    }

    #[test]
    fn test_missing_active_role_is_denied() {
        let mut s = session("issm-1", Role::Approver);
        s.active_role = None;
        let err = gate()
            .check(&s, &request(RequestStatus::PendingApprover), Action::Approve)
            .unwrap_err();
        assert_eq!(err.reason, DenialReason::NoActiveRole);
    }

    #[test]
    fn test_active_role_must_be_held() {
        let mut s = session("issm-1", Role::Approver);
        s.active_role = Some(Role::Cpso);
        let err = gate()
            .check(&s, &request(RequestStatus::PendingCpso), Action::Approve)
            .unwrap_err();
        assert_eq!(err.reason, DenialReason::RoleNotHeld { role: Role::Cpso });
    }

    #[test]
    fn test_expired_session_is_denied() {
        let mut s = session("issm-1", Role::Approver);
        s.expires_at = now() - Duration::seconds(1);
        let err = gate()
            .check(&s, &request(RequestStatus::PendingApprover), Action::Approve)
            .unwrap_err();
        assert_eq!(err.reason, DenialReason::SessionExpired);
    }

    #[test]
    fn test_draft_requires_record_ownership() {
        let draft = request(RequestStatus::Draft);
        let err = gate()
            .check(&session("someone-else", Role::Requestor), &draft, Action::Submit)
            .unwrap_err();
        assert_eq!(err.reason, DenialReason::NotRecordOwner);
        assert!(gate()
            .check(&session("req-1", Role::Requestor), &draft, Action::Submit)
            .is_ok());
    }

    #[test]
    fn test_terminal_status_denied_for_everyone() {
        for role in Role::ALL {
            let err = gate()
                .check(&session("x", role), &request(RequestStatus::Rejected), Action::Approve)
                .unwrap_err();
            assert_eq!(
                err.reason,
                DenialReason::TerminalStatus {
                    status: RequestStatus::Rejected
                }
            );
        }
    }

    #[test]
    fn test_assigned_sme_only() {
        let mut r = request(RequestStatus::PendingSmeSignature);
        r.assigned_sme_id = Some(UserId::new("sme-2"));
        let err = gate()
            .check(&session("sme-1", Role::Sme), &r, Action::Sign)
            .unwrap_err();
        assert!(matches!(err.reason, DenialReason::NotAssignee { .. }));
        assert!(gate().check(&session("sme-2", Role::Sme), &r, Action::Sign).is_ok());
    }

    #[test]
    fn test_dta_cannot_take_the_sme_step() {
        let mut r = request(RequestStatus::PendingSmeSignature);
        r.dta_id = Some(UserId::new("dta-1"));
        let mut dual = session("dta-1", Role::Sme);
        dual.available_roles = vec![Role::Dta, Role::Sme];

        let err = gate().check(&dual, &r, Action::Sign).unwrap_err();
        assert_eq!(err.reason, DenialReason::SecondPersonRequired);
        assert!(err.message.contains("different person"));
        assert!(gate().check(&session("sme-1", Role::Sme), &r, Action::Sign).is_ok());
    }

    #[test]
    fn test_requestor_cannot_countersign_own_request() {
        let s = session("req-1", Role::Approver);
        let mut r = request(RequestStatus::PendingApprover);
        r.requestor_id = UserId::new("req-1");
        let err = gate().check(&s, &r, Action::Approve).unwrap_err();
        assert_eq!(err.reason, DenialReason::SelfApproval);
    }

    #[test]
    fn test_shared_dashboard_visibility() {
        let g = gate();
        let cpso = session("cpso-1", Role::Cpso);
        let issm = session("issm-1", Role::Approver);
        assert!(g.can_view(&cpso, &request(RequestStatus::PendingApprover)).is_ok());
        assert!(g.can_view(&issm, &request(RequestStatus::PendingCpso)).is_ok());
        assert!(g.can_view(&cpso, &request(RequestStatus::PendingDta)).is_err());

        let admin = session("admin", Role::Admin);
        assert!(g.can_view(&admin, &request(RequestStatus::Completed)).is_ok());
        let stranger = session("req-2", Role::Requestor);
        assert!(g.can_view(&stranger, &request(RequestStatus::Draft)).is_err());
        let owner = session("req-1", Role::Requestor);
        assert!(g.can_view(&owner, &request(RequestStatus::Rejected)).is_ok());
    }
}
