use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Barrier, Mutex};
use uuid::Uuid;

use super::{StatusUpdate, Storage, StorageError};
use crate::audit::{HistoryEntry, NewHistoryEntry};
use crate::signature::types::SignatureRecord;
use crate::workflow::types::{Request, RequestId};

#[derive(Default)]
struct State {
    requests: HashMap<RequestId, Request>,
    insertion_order: Vec<RequestId>,
    signatures: Vec<SignatureRecord>,
    history: Vec<HistoryEntry>,
    next_history_id: i64,
}

impl State {
    fn has_signature(&self, record: &SignatureRecord) -> bool {
        self.signatures.iter().any(|existing| {
            existing.request_id == record.request_id && existing.step == record.step
        })
    }
}

/// Process-local storage with the same atomicity guarantees as the SQLite backend.
///
/// Also carries failure injection switches and a read rendezvous so tests can force the
/// interleavings the workflow has to survive.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
    fail_history_writes: AtomicBool,
    fail_status_writes: AtomicBool,
    read_rendezvous: StdMutex<Option<(Arc<Barrier>, usize)>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every history insert fail with `Unavailable`.
    pub fn fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every status write fail with `Unavailable` before anything is applied.
    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold the next `readers` calls to `read_request` until all of them have arrived.
    pub fn hold_reads_until(&self, readers: usize) {
        if let Ok(mut slot) = self.read_rendezvous.lock() {
            *slot = (readers > 0).then(|| (Arc::new(Barrier::new(readers)), readers));
        }
    }

    fn take_rendezvous(&self) -> Option<Arc<Barrier>> {
        let mut slot = self.read_rendezvous.lock().ok()?;
        let (barrier, remaining) = slot.as_mut()?;
        let barrier = barrier.clone();
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(barrier)
    }

    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_request(&self, request: &Request) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state
            .requests
            .values()
            .any(|existing| existing.request_number == request.request_number)
        {
            return Err(StorageError::DuplicateRequestNumber(
                request.request_number.clone(),
            ));
        }
        state.insertion_order.push(request.id);
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn read_request(&self, id: RequestId) -> Result<Option<Request>, StorageError> {
        let snapshot = self.state.lock().await.requests.get(&id).cloned();
        if let Some(barrier) = self.take_rendezvous() {
            barrier.wait().await;
        }
        Ok(snapshot)
    }

    async fn list_requests(&self) -> Result<Vec<Request>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.requests.get(id).cloned())
            .collect())
    }

    async fn write_request_status(
        &self,
        update: &StatusUpdate,
        signature: Option<&SignatureRecord>,
    ) -> Result<(), StorageError> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "status writes disabled".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let current = state
            .requests
            .get(&update.request_id)
            .map(|request| request.status)
            .ok_or(StorageError::RequestNotFound(update.request_id))?;
        if current != update.expected_from {
            return Err(StorageError::StatusMismatch {
                request_id: update.request_id,
                expected: update.expected_from,
                actual: current,
            });
        }
        if let Some(record) = signature {
            if state.has_signature(record) {
                return Err(StorageError::DuplicateSignature {
                    request_id: record.request_id,
                    step: record.step,
                });
            }
        }

        // All checks passed; apply both halves under the same lock.
        if let Some(request) = state.requests.get_mut(&update.request_id) {
            request.apply(update.to, &update.fields, update.updated_at);
        }
        if let Some(record) = signature {
            state.signatures.push(record.clone());
        }
        Ok(())
    }

    async fn insert_signature(&self, signature: &SignatureRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if !state.requests.contains_key(&signature.request_id) {
            return Err(StorageError::RequestNotFound(signature.request_id));
        }
        if state.has_signature(signature) {
            return Err(StorageError::DuplicateSignature {
                request_id: signature.request_id,
                step: signature.step,
            });
        }
        state.signatures.push(signature.clone());
        Ok(())
    }

    async fn read_signature(&self, id: Uuid) -> Result<Option<SignatureRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.signatures.iter().find(|s| s.id == id).cloned())
    }

    async fn signatures_for(&self, id: RequestId) -> Result<Vec<SignatureRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .signatures
            .iter()
            .filter(|s| s.request_id == id)
            .cloned()
            .collect())
    }

    async fn insert_history(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry, StorageError> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "history writes disabled".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        state.next_history_id += 1;
        let stored = HistoryEntry {
            id: state.next_history_id,
            request_id: entry.request_id,
            action: entry.action.clone(),
            actor_email: entry.actor_email.clone(),
            notes: entry.notes.clone(),
            timestamp: entry.timestamp,
        };
        state.history.push(stored.clone());
        Ok(stored)
    }

    async fn history_for(&self, id: RequestId) -> Result<Vec<HistoryEntry>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.request_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::HistoryAction;
    use crate::signature::types::SignatureEvidence;
    use crate::workflow::types::{
        NewRequest, RequestFieldUpdates, RequestStatus, SignatureMethod, StepType, TransferType,
        UserId,
    };
    use chrono::{TimeZone, Utc};

    fn draft() -> Request {
        Request::draft(
            NewRequest {
                title: "Patch bundle".to_string(),
                transfer_type: TransferType::Standard,
                classification: "SECRET".to_string(),
                signature_method: SignatureMethod::Manual,
            },
            UserId::new("req-1"),
            "req-1@example.mil",
            Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    fn signature(request_id: RequestId, step: StepType) -> SignatureRecord {
        SignatureRecord {
            id: Uuid::new_v4(),
            request_id,
            step,
            signer_id: UserId::new("req-1"),
            signer_email: "req-1@example.mil".to_string(),
            evidence: SignatureEvidence::Manual {
                signer_name: "Req One".to_string(),
                certification_statement: "I certify".to_string(),
                client_ip: None,
            },
            integrity_hash: "00".repeat(32),
            created_at: Utc::now(),
        }
    }

    fn submit(request: &Request) -> StatusUpdate {
        StatusUpdate {
            request_id: request.id,
            expected_from: RequestStatus::Draft,
            to: RequestStatus::PendingApprover,
            fields: RequestFieldUpdates::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_status_swap_with_signature() {
        let storage = InMemoryStorage::new();
        let request = draft();
        storage.insert_request(&request).await.unwrap();

        let sig = signature(request.id, StepType::RequestorSignature);
        storage
            .write_request_status(&submit(&request), Some(&sig))
            .await
            .unwrap();

        let stored = storage.read_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::PendingApprover);
        assert_eq!(storage.signatures_for(request.id).await.unwrap(), vec![sig]);
    }

    #[tokio::test]
    async fn test_stale_expected_status_is_mismatch_and_writes_nothing() {
        let storage = InMemoryStorage::new();
        let request = draft();
        storage.insert_request(&request).await.unwrap();
        storage.write_request_status(&submit(&request), None).await.unwrap();

        let sig = signature(request.id, StepType::RequestorSignature);
        let err = storage
            .write_request_status(&submit(&request), Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::StatusMismatch {
                actual: RequestStatus::PendingApprover,
                ..
            }
        ));
        assert!(storage.signatures_for(request.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_step_signature_rejected() {
        let storage = InMemoryStorage::new();
        let request = draft();
        storage.insert_request(&request).await.unwrap();
        let first = signature(request.id, StepType::SmeSignature);
        storage.insert_signature(&first).await.unwrap();

        let err = storage
            .insert_signature(&signature(request.id, StepType::SmeSignature))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateSignature { .. }));
        assert_eq!(storage.signatures_for(request.id).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_history_ids_increase_and_injection() {
        let storage = InMemoryStorage::new();
        let request = draft();
        let entry = NewHistoryEntry {
            request_id: request.id,
            action: HistoryAction::Created,
            actor_email: "req-1@example.mil".to_string(),
            notes: None,
            timestamp: Utc::now(),
        };
        let a = storage.insert_history(&entry).await.unwrap();
        let b = storage.insert_history(&entry).await.unwrap();
        assert!(b.id > a.id);

        storage.fail_history_writes(true);
        assert!(storage.insert_history(&entry).await.is_err());
        assert_eq!(storage.history_for(request.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_request_number_rejected() {
        let storage = InMemoryStorage::new();
        let request = draft();
        storage.insert_request(&request).await.unwrap();
        let mut clash = draft();
        clash.request_number = request.request_number.clone();
        assert!(matches!(
            storage.insert_request(&clash).await,
            Err(StorageError::DuplicateRequestNumber(_))
        ));
    }
}
