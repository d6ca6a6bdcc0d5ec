//! Client SDK core.
//!
//! Establishes attested secure sessions against a gardbase deployment,
//! verifies the enclave's attestation document, and unseals the DEKs the
//! enclave returns. See [`session::Session`].

pub mod attestation;
pub mod session;

pub use attestation::{AttestationDocument, VerificationResult, VerifierConfig};
pub use session::{Session, SessionConfig};
