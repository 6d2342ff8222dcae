use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::WorkflowError;
use crate::signature::types::{
    IntegrityReport, SignatureEvidence, SignaturePayload, SignatureRecord,
};
use crate::signature::verifier::{integrity_hash, SignatureVerifier, Verdict};
use crate::storage::{Storage, StorageError};
use crate::workflow::types::{RequestId, StepType, UserId};

/// Signature persistence plus the after-the-fact integrity audit.
pub struct SignatureStore {
    storage: Arc<dyn Storage>,
    verifier: Arc<SignatureVerifier>,
    clock: Arc<dyn Clock>,
}

impl SignatureStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        verifier: Arc<SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            verifier,
            clock,
        }
    }

    /// Build the record for already-verified evidence, sealing it with its integrity hash.
    pub fn prepare(
        &self,
        request_id: RequestId,
        step: StepType,
        signer_id: &UserId,
        signer_email: &str,
        evidence: SignatureEvidence,
    ) -> Result<SignatureRecord, WorkflowError> {
        let hash = integrity_hash(&request_id, step, signer_id, signer_email, &evidence)
            .map_err(|err| WorkflowError::Storage(StorageError::Corrupt(err.to_string())))?;
        Ok(SignatureRecord {
            id: Uuid::new_v4(),
            request_id,
            step,
            signer_id: signer_id.clone(),
            signer_email: signer_email.to_string(),
            evidence,
            integrity_hash: hash,
            created_at: self.clock.now(),
        })
    }

    /// Verify and store a signature outside of a status transition.
    pub async fn record(
        &self,
        request_id: RequestId,
        step: StepType,
        signer_id: &UserId,
        signer_email: &str,
        payload: &SignaturePayload,
    ) -> Result<Uuid, WorkflowError> {
        if let Verdict::Invalid { reason } = self.verifier.verify(payload) {
            return Err(WorkflowError::MissingSignature {
                step,
                detail: reason,
            });
        }
        let record = self.prepare(
            request_id,
            step,
            signer_id,
            signer_email,
            self.verifier.evidence_for(payload),
        )?;
        self.storage.insert_signature(&record).await?;
        info!(
            request_id = %request_id,
            step = %step,
            signature_id = %record.id,
            method = %record.method(),
            "Signature recorded"
        );
        Ok(record.id)
    }

    /// Signatures on a request, most recent first.
    pub async fn list_for(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<SignatureRecord>, WorkflowError> {
        let mut signatures = self.storage.signatures_for(request_id).await?;
        // Later inserts win ties on equal timestamps.
        signatures.reverse();
        signatures.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(signatures)
    }

    /// Recompute the tamper-evidence hash and re-check the certificate window as of now.
    pub async fn verify_integrity(
        &self,
        signature_id: Uuid,
    ) -> Result<IntegrityReport, WorkflowError> {
        let record = self
            .storage
            .read_signature(signature_id)
            .await?
            .ok_or(WorkflowError::SignatureNotFound(signature_id))?;

        let mut problems = Vec::new();
        let hash_matches = match integrity_hash(
            &record.request_id,
            record.step,
            &record.signer_id,
            &record.signer_email,
            &record.evidence,
        ) {
            Ok(recomputed) => recomputed == record.integrity_hash,
            Err(err) => {
                problems.push(format!("hash could not be recomputed: {err}"));
                false
            }
        };
        if !hash_matches && problems.is_empty() {
            problems.push("stored hash does not match signature contents".to_string());
        }

        let certificate_currently_valid = match &record.evidence {
            SignatureEvidence::Manual { .. } => None,
            SignatureEvidence::Cac(cac) => {
                let window = self.verifier.certificate_window_check(&cac.certificate);
                if let Err(reason) = &window {
                    problems.push(reason.clone());
                }
                Some(window.is_ok())
            }
        };

        let report = IntegrityReport {
            signature_id,
            hash_matches,
            certificate_currently_valid,
            problems,
        };
        if !report.is_intact() {
            warn!(
                signature_id = %signature_id,
                request_id = %record.request_id,
                problems = ?report.problems,
                "Signature failed integrity re-verification"
            );
        }
        Ok(report)
    }
}
