use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::types::{RequestId, SignatureMethod, StepType, UserId};

/// Certificate details read from the signer's CAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDescriptor {
    pub thumbprint: String,
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// DER or PEM blob as captured by the client.
    pub raw_certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacSignature {
    pub certificate: CertificateDescriptor,
    pub signature: Vec<u8>,
    pub algorithm: String,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualSignature {
    pub signer_name: String,
    pub client_ip: Option<String>,
}

/// Signing evidence as submitted by a client, before verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SignaturePayload {
    Manual(ManualSignature),
    Cac(CacSignature),
}

impl SignaturePayload {
    pub fn manual(signer_name: impl Into<String>) -> Self {
        SignaturePayload::Manual(ManualSignature {
            signer_name: signer_name.into(),
            client_ip: None,
        })
    }

    pub fn method(&self) -> SignatureMethod {
        match self {
            SignaturePayload::Manual(_) => SignatureMethod::Manual,
            SignaturePayload::Cac(_) => SignatureMethod::Cac,
        }
    }
}

/// Stored evidence for one step. Written once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub id: Uuid,
    pub request_id: RequestId,
    pub step: StepType,
    pub signer_id: UserId,
    pub signer_email: String,
    pub evidence: SignatureEvidence,
    /// Hex SHA-256 over the canonical record fields.
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
}

impl SignatureRecord {
    pub fn method(&self) -> SignatureMethod {
        match self.evidence {
            SignatureEvidence::Manual { .. } => SignatureMethod::Manual,
            SignatureEvidence::Cac(_) => SignatureMethod::Cac,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SignatureEvidence {
    Manual {
        signer_name: String,
        certification_statement: String,
        client_ip: Option<String>,
    },
    Cac(CacSignature),
}

/// Result of re-checking a stored signature during an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub signature_id: Uuid,
    pub hash_matches: bool,
    /// `None` for manual signatures, which carry no certificate.
    pub certificate_currently_valid: Option<bool>,
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.hash_matches && self.certificate_currently_valid.unwrap_or(true)
    }
}
