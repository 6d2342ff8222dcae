//! Dashboard "at risk" flags: requests idle longer than the SLA allows.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::workflow::types::{Request, RequestId, RequestStatus, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtRiskRequest {
    pub request_id: RequestId,
    pub request_number: String,
    pub status: RequestStatus,
    /// Role that has to act to move it along.
    pub waiting_on: Option<Role>,
    pub idle_days: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaPolicy {
    pub at_risk_after: Duration,
}

impl SlaPolicy {
    pub fn days(days: u32) -> Self {
        Self {
            at_risk_after: Duration::days(i64::from(days)),
        }
    }

    /// Drafts belong to the requestor and terminal requests are done, so neither is tracked.
    pub fn is_at_risk(&self, request: &Request, now: DateTime<Utc>) -> bool {
        if request.status.is_terminal() || request.status == RequestStatus::Draft {
            return false;
        }
        now.signed_duration_since(request.updated_at) > self.at_risk_after
    }

    /// At-risk requests, longest idle first.
    pub fn at_risk<'a>(
        &self,
        requests: impl IntoIterator<Item = &'a Request>,
        now: DateTime<Utc>,
    ) -> Vec<AtRiskRequest> {
        let mut flagged: Vec<AtRiskRequest> = requests
            .into_iter()
            .filter(|request| self.is_at_risk(request, now))
            .map(|request| AtRiskRequest {
                request_id: request.id,
                request_number: request.request_number.clone(),
                status: request.status,
                waiting_on: request.status.owner(),
                idle_days: now.signed_duration_since(request.updated_at).num_days(),
                last_updated: request.updated_at,
            })
            .collect();
        flagged.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        flagged
    }
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self::days(5)
    }
}
