//! The trusted enclave service.
//!
//! All code that touches plaintext key material lives here. The enclave
//! never calls KMS, never reads storage and never contacts the network; it
//! only answers framed requests on its host-to-guest socket.

pub mod handlers;
pub mod nsm;
pub mod server;
pub mod session;

use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::enclave::nsm::{PlatformAdapter, PlatformRng};
use crate::enclave::session::SessionStore;

const RSA_KEY_BITS: usize = 2048;

/// Process-global enclave state: the platform handle, the long-lived RSA
/// keypair, the cached attestation document and the session store. Built
/// exactly once at startup.
pub struct EnclaveState {
    platform: PlatformAdapter,
    rsa_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
    attestation: RwLock<Vec<u8>>,
    pub sessions: Arc<SessionStore>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl EnclaveState {
    /// Runs the startup sequence: platform session, RSA-2048 keypair from
    /// the platform RNG, DER-encoded public key, initial attestation
    /// document. Any failure is fatal; no partially-initialized state is
    /// returned.
    pub fn initialize(platform: PlatformAdapter) -> Result<Self> {
        let mut rng = PlatformRng::new(&platform);
        let rsa_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::Crypto(format!("RSA key generation failed: {e}")))?;

        let public_key_der = rsa_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| Error::Crypto(format!("public key DER encoding failed: {e}")))?
            .into_vec();

        let initial_doc = platform.attestation_document(&public_key_der, None, None)?;

        info!(
            fingerprint = %hex::encode(Sha256::digest(&public_key_der)),
            local_mode = platform.is_local_mode(),
            "enclave RSA public key generated"
        );

        Ok(Self {
            platform,
            rsa_key,
            public_key_der,
            attestation: RwLock::new(initial_doc),
            sessions: Arc::new(SessionStore::new()),
            started_at: chrono::Utc::now(),
        })
    }

    pub fn platform(&self) -> &PlatformAdapter {
        &self.platform
    }

    /// DER-encoded (SubjectPublicKeyInfo) RSA public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// The RSA public key, e.g. for tooling that seals test payloads.
    pub fn rsa_public_key(&self) -> RsaPublicKey {
        self.rsa_key.to_public_key()
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Detached copy of the most recent attestation document.
    pub fn cached_attestation(&self) -> Result<Vec<u8>> {
        let doc = self.attestation.read().expect("attestation lock poisoned");
        if doc.is_empty() {
            return Err(Error::Attestation("attestation document not available".into()));
        }
        Ok(doc.clone())
    }

    /// Requests a fresh document over the long-lived public key and swaps
    /// it into the cache. On failure the previous document stays valid.
    pub fn refresh_attestation(&self) -> Result<()> {
        let doc = self
            .platform
            .attestation_document(&self.public_key_der, None, None)?;
        let len = doc.len();
        *self.attestation.write().expect("attestation lock poisoned") = doc;
        info!(len, "attestation document refreshed");
        Ok(())
    }

    /// Opens a KMS `CiphertextForRecipient` blob with the long-lived RSA
    /// key (RSA-OAEP-SHA256). The plaintext is wiped on drop.
    pub fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.rsa_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto("RSA decryption failed".into()))
    }
}

/// Spawns the background task refreshing the cached attestation document.
/// A failed refresh is logged and leaves the previous document in place.
pub fn start_attestation_refresher(
    state: Arc<EnclaveState>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = state.refresh_attestation() {
                warn!(error = %e, "attestation refresh failed, keeping previous document");
            }
        }
    })
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<EnclaveState> {
    use std::sync::OnceLock;
    static STATE: OnceLock<Arc<EnclaveState>> = OnceLock::new();
    STATE
        .get_or_init(|| {
            Arc::new(EnclaveState::initialize(PlatformAdapter::local()).expect("test enclave"))
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn startup_produces_key_and_document() {
        let state = test_state();
        assert!(!state.public_key_der().is_empty());
        assert!(!state.cached_attestation().unwrap().is_empty());
    }

    #[test]
    fn refresh_keeps_document_nonempty() {
        let state = test_state();
        state.refresh_attestation().unwrap();
        assert!(!state.cached_attestation().unwrap().is_empty());
    }

    #[test]
    fn rsa_oaep_round_trip() {
        let state = test_state();
        let ct = state
            .rsa_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), b"a 32 byte data encryption key!!!")
            .unwrap();
        let pt = state.rsa_decrypt(&ct).unwrap();
        assert_eq!(pt.as_slice(), b"a 32 byte data encryption key!!!");
    }

    #[test]
    fn rsa_decrypt_rejects_garbage() {
        let state = test_state();
        assert!(state.rsa_decrypt(&[0u8; 256]).is_err());
    }
}
