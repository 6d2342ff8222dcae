pub mod store;
pub mod types;
pub mod verifier;

pub use store::SignatureStore;
pub use types::{
    CacSignature, CertificateDescriptor, IntegrityReport, ManualSignature, SignatureEvidence,
    SignaturePayload, SignatureRecord,
};
pub use verifier::{integrity_hash, Assurance, SignatureVerifier, Verdict, VerifierPolicy};
