//! Shared fixtures for the workflow integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use aft_tracker::{
    AftConfig, AftService, Clock, FixedClock, InMemoryStorage, NewRequest, NotificationDispatcher,
    RecordingNotifier, Request, RequestStatus, Role, Session, SignatureMethod, StaticDirectory,
    Storage, TransferType, UserId, UserIdentity, VerifierPolicy,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).unwrap()
}

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: AftService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryStorage::new()))
    }

    pub fn with_storage(storage: Arc<InMemoryStorage>) -> Self {
        let clock = Arc::new(FixedClock::new(start_time()));
        let notifier = Arc::new(RecordingNotifier::new());
        let directory = StaticDirectory::new(
            Role::ALL
                .iter()
                .map(|role| (*role, vec![format!("{}-queue@example.mil", role.as_str())]))
                .collect::<HashMap<_, _>>(),
        );
        let dispatcher = NotificationDispatcher::new(
            notifier.clone(),
            Arc::new(directory),
            StdDuration::from_secs(1),
        );
        let policy = VerifierPolicy::from_config(&AftConfig::default().signatures).unwrap();
        let service = AftService::new(storage.clone(), clock.clone(), policy, dispatcher);
        Self {
            storage,
            clock,
            notifier,
            service,
        }
    }

    pub fn session(&self, user: &str, role: Role) -> Session {
        self.session_holding(user, &[role], role)
    }

    /// A session for a user holding several roles, acting as `active`.
    pub fn session_holding(&self, user: &str, roles: &[Role], active: Role) -> Session {
        Session::acting(
            UserIdentity {
                user_id: UserId::new(user),
                email: format!("{user}@example.mil"),
                display_name: display_name(user),
                primary_role: roles[0],
                available_roles: roles.to_vec(),
            },
            active,
            self.clock.now(),
            Duration::hours(8),
        )
    }

    pub async fn draft(&self, transfer_type: &str) -> Request {
        let requestor = self.session("rivera", Role::Requestor);
        self.service
            .create_draft(
                &requestor,
                NewRequest {
                    title: "Quarterly test results".to_string(),
                    transfer_type: TransferType::from(transfer_type),
                    classification: "UNCLASSIFIED".to_string(),
                    signature_method: SignatureMethod::Manual,
                },
            )
            .await
            .unwrap()
    }

    /// Put a request straight into `status`, bypassing the workflow.
    pub async fn seed(&self, status: RequestStatus) -> Request {
        let mut request = Request::draft(
            NewRequest {
                title: "Seeded".to_string(),
                transfer_type: TransferType::Standard,
                classification: "UNCLASSIFIED".to_string(),
                signature_method: SignatureMethod::Manual,
            },
            UserId::new("rivera"),
            "rivera@example.mil".to_string(),
            start_time(),
        );
        request.status = status;
        self.storage.insert_request(&request).await.unwrap();
        request
    }

    pub async fn stored_status(&self, request: &Request) -> RequestStatus {
        self.storage
            .read_request(request.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

fn display_name(user: &str) -> String {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
