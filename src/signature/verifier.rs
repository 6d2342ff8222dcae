//! Acceptance checks for signing credentials.
//!
//! CAC acceptance here is structural: the validity window, the issuer pattern, the subject
//! shape and the presence of signature bytes are checked, but the signature bytes are NOT
//! verified against the certificate's public key and the chain to a DOD root is NOT walked.
//! A fabricated certificate descriptor with a plausible issuer string would be accepted.
//! Every CAC verdict therefore reports [`Assurance::Structural`], and deployments that need
//! more can set `reject_structural_only` to refuse CAC signatures until real chain-of-trust
//! verification exists.

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::SignatureConfig;
use crate::signature::types::{
    CacSignature, CertificateDescriptor, SignatureEvidence, SignaturePayload,
};
use crate::workflow::types::{RequestId, StepType, UserId};

pub const DEFAULT_CERTIFICATION_STATEMENT: &str =
    "I certify that the information provided in this request is accurate and that this transfer \
     is authorized.";

pub const DEFAULT_DOD_ISSUER_PATTERN: &str = r"(?i)CN=DOD (?:ID |EMAIL |SW |DERILITY )?CA-\d+";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Assurance {
    /// Manual name entry attested with the certification statement.
    Attested,
    /// Certificate passed structural checks only; no cryptographic proof.
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid { assurance: Assurance },
    Invalid { reason: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Valid { .. } => None,
            Verdict::Invalid { reason } => Some(reason),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Verdict::Invalid {
            reason: reason.into(),
        }
    }
}

/// Trust anchors and manual-signature wording.
#[derive(Debug, Clone)]
pub struct VerifierPolicy {
    pub trusted_issuers: Vec<Regex>,
    pub certification_statement: String,
    pub reject_structural_only: bool,
}

impl VerifierPolicy {
    pub fn from_config(config: &SignatureConfig) -> Result<Self, regex::Error> {
        let trusted_issuers = config
            .trusted_issuer_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            trusted_issuers,
            certification_statement: config.certification_statement.clone(),
            reject_structural_only: config.reject_structural_only,
        })
    }

    pub fn issuer_is_trusted(&self, issuer: &str) -> bool {
        self.trusted_issuers.iter().any(|re| re.is_match(issuer))
    }
}

impl Default for VerifierPolicy {
    fn default() -> Self {
        Self::from_config(&SignatureConfig::default()).unwrap_or_else(|_| Self {
            trusted_issuers: Vec::new(),
            certification_statement: DEFAULT_CERTIFICATION_STATEMENT.to_string(),
            reject_structural_only: false,
        })
    }
}

pub struct SignatureVerifier {
    policy: VerifierPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("policy", &self.policy)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(policy: VerifierPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &VerifierPolicy {
        &self.policy
    }

    /// Validate a payload. User-input problems come back as `Verdict::Invalid`, never as panics.
    pub fn verify(&self, payload: &SignaturePayload) -> Verdict {
        match payload {
            SignaturePayload::Manual(manual) => {
                if manual.signer_name.trim().is_empty() {
                    Verdict::invalid("signer name is required for a manual signature")
                } else {
                    Verdict::Valid {
                        assurance: Assurance::Attested,
                    }
                }
            }
            SignaturePayload::Cac(cac) => self.verify_cac(cac),
        }
    }

    fn verify_cac(&self, cac: &CacSignature) -> Verdict {
        if self.policy.reject_structural_only {
            return Verdict::invalid(
                "CAC signatures require cryptographic verification, which is not available",
            );
        }

        if let Err(reason) = self.certificate_window_check(&cac.certificate) {
            return Verdict::invalid(reason);
        }

        if !self.policy.issuer_is_trusted(&cac.certificate.issuer) {
            return Verdict::invalid(format!(
                "certificate issuer '{}' is not a recognized DOD certificate authority",
                cac.certificate.issuer
            ));
        }

        let subject = DistinguishedName::parse(&cac.certificate.subject);
        if !subject.has("CN") || !subject.has("OU") {
            return Verdict::invalid(
                "certificate subject must contain both a CN and an OU component",
            );
        }

        if cac.signature.is_empty() {
            return Verdict::invalid("signature bytes are missing");
        }

        if cac.algorithm.trim().is_empty() {
            return Verdict::invalid("signature algorithm is missing");
        }

        if let Err(err) = hash_canonical(&cac) {
            warn!(error = %err, "Could not compute tamper-evidence hash for CAC payload");
            return Verdict::invalid("signature metadata could not be hashed");
        }

        debug!(
            thumbprint = %cac.certificate.thumbprint,
            serial = %cac.certificate.serial_number,
            "CAC signature accepted on structural checks only"
        );
        Verdict::Valid {
            assurance: Assurance::Structural,
        }
    }

    /// `Err` carries a human-readable reason when "now" falls outside the certificate window.
    pub fn certificate_window_check(
        &self,
        certificate: &CertificateDescriptor,
    ) -> Result<(), String> {
        let now = self.clock.now();
        if certificate.valid_from > certificate.valid_to {
            return Err("certificate validity window is inverted".to_string());
        }
        if now < certificate.valid_from {
            return Err(format!(
                "certificate is not valid until {}",
                certificate.valid_from.to_rfc3339()
            ));
        }
        if now > certificate.valid_to {
            return Err(format!(
                "certificate expired at {}",
                certificate.valid_to.to_rfc3339()
            ));
        }
        Ok(())
    }

    /// Turn a verified payload into stored evidence.
    pub fn evidence_for(&self, payload: &SignaturePayload) -> SignatureEvidence {
        match payload {
            SignaturePayload::Manual(manual) => SignatureEvidence::Manual {
                signer_name: manual.signer_name.trim().to_string(),
                certification_statement: self.policy.certification_statement.clone(),
                client_ip: manual.client_ip.clone(),
            },
            SignaturePayload::Cac(cac) => SignatureEvidence::Cac(cac.clone()),
        }
    }
}

/// `KEY=value` components of an X.500 subject or issuer string.
#[derive(Debug, Default)]
struct DistinguishedName {
    components: Vec<(String, String)>,
}

impl DistinguishedName {
    fn parse(raw: &str) -> Self {
        let components = raw
            .split([',', '/'])
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                let key = key.trim().to_ascii_uppercase();
                let value = value.trim().to_string();
                (!key.is_empty()).then_some((key, value))
            })
            .collect();
        Self { components }
    }

    fn has(&self, key: &str) -> bool {
        self.components
            .iter()
            .any(|(k, v)| k == key && !v.is_empty())
    }
}

#[derive(Serialize)]
struct IntegrityInput<'a> {
    request_id: &'a RequestId,
    step: StepType,
    signer_id: &'a UserId,
    signer_email: &'a str,
    evidence: &'a SignatureEvidence,
}

fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

/// Tamper-evidence hash over the fields that make up a stored signature.
pub fn integrity_hash(
    request_id: &RequestId,
    step: StepType,
    signer_id: &UserId,
    signer_email: &str,
    evidence: &SignatureEvidence,
) -> Result<String, serde_json::Error> {
    hash_canonical(&IntegrityInput {
        request_id,
        step,
        signer_id,
        signer_email,
        evidence,
    })
}
