pub mod authorization;
pub mod risk;
pub mod state_machine;
pub mod types;

pub use authorization::{AccessDenied, AuthorizationGate, DenialReason};
pub use risk::{AtRiskRequest, SlaPolicy};
pub use state_machine::{
    available_actions, route_target, Actor, PendingSignature, RequestStateMachine,
    TransitionInput, TransitionOutcome,
};
pub use types::{
    Action, NewRequest, Request, RequestFieldUpdates, RequestId, RequestStatus, Role,
    SignatureMethod, StepType, TransferType, UserId,
};
