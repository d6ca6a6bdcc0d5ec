//! Attested secure sessions against a gardbase deployment.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::time::Duration;
use zeroize::{Zeroize, Zeroizing};

use crate::api;
use crate::client::attestation::{self, VerificationResult, VerifierConfig};
use crate::crypto::keys;
use crate::crypto::{KEY_SIZE, XNONCE_SIZE};
use crate::error::{Error, Result};
use crate::proto;

/// Header carrying the tenant id.
pub const TENANT_HEADER: &str = "X-Tenant-ID";
/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker base URL including the `/api` prefix.
    pub endpoint: String,
    pub tenant_id: String,
    pub api_key: String,
    pub verifier: VerifierConfig,
    pub http_timeout: Duration,
}

impl SessionConfig {
    pub fn new(
        endpoint: impl Into<String>,
        tenant_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            tenant_id: tenant_id.into(),
            api_key: api_key.into(),
            verifier: VerifierConfig::default(),
            http_timeout: Duration::from_secs(15),
        }
    }
}

/// A verified secure session. Holds the shared AEAD key until [`close`]
/// wipes it.
///
/// [`close`]: Session::close
pub struct Session {
    session_id: String,
    session_key: Zeroizing<[u8; KEY_SIZE]>,
    expires_at: DateTime<Utc>,
    verification: VerificationResult,
    client: reqwest::Client,
    config: SessionConfig,
    closed: bool,
}

impl Session {
    /// Establishes a session: ephemeral X25519 keypair, init call,
    /// attestation verification, session-key derivation. On a failed
    /// verification the private scalar is wiped and no session exists.
    pub async fn init(config: SessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        let (secret, public) = keys::generate_ephemeral_keypair();
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let body = proto::SessionInitRequest {
            client_ephemeral_public_key: B64.encode(public.as_bytes()),
            nonce: B64.encode(nonce),
        };
        let res: proto::SessionInitResponse = post_json(
            &client,
            &config,
            "/encryption/secure-session/init",
            &body,
            None,
        )
        .await?;

        let enclave_pub_bytes = B64
            .decode(&res.enclave_ephemeral_public_key)
            .map_err(|_| Error::Validation("invalid enclave ephemeral public key".into()))?;
        let enclave_pub = keys::decode_public_key(&enclave_pub_bytes)?;

        let attestation_doc = B64
            .decode(&res.attestation)
            .map_err(|_| Error::Validation("invalid attestation encoding".into()))?;

        // Dropping `secret` on any failure below wipes the scalar.
        let verification = attestation::verify(
            &attestation_doc,
            &nonce,
            &enclave_pub_bytes,
            &config.verifier,
        )?;

        let session_key = keys::derive_session_key(&secret, &enclave_pub)?;

        let expires_at = DateTime::parse_from_rfc3339(&res.expires_at)
            .map_err(|_| Error::Validation("invalid session expiry".into()))?
            .with_timezone(&Utc);

        Ok(Self {
            session_id: res.session_id,
            session_key,
            expires_at,
            verification,
            client,
            config,
            closed: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The attestation verification outcome, including the audit trail of
    /// completed steps.
    pub fn verification(&self) -> &VerificationResult {
        &self.verification
    }

    /// Requests `count` prepared DEK triples (1..=100).
    pub async fn generate_deks(&self, count: u32) -> Result<Vec<proto::PreparedDek>> {
        self.ensure_active()?;
        if count == 0 || count > api::MAX_DEK_COUNT {
            return Err(Error::Validation(format!(
                "count must be between 1 and {}",
                api::MAX_DEK_COUNT
            )));
        }

        let body = api::GenerateDeksRequest {
            session_id: self.session_id.clone(),
            count,
        };
        let res: api::GenerateDeksResponse = post_json(
            &self.client,
            &self.config,
            "/encryption/secure-session/generate-deks",
            &body,
            Some(Duration::from_secs(30)),
        )
        .await?;
        Ok(res.deks)
    }

    /// Unwraps a batch of KMS-wrapped DEKs into session-sealed DEKs.
    /// Per-item failures are reported inside the response.
    pub async fn unwrap(
        &self,
        items: Vec<proto::SessionUnwrapItem>,
    ) -> Result<api::UnwrapResponse> {
        self.ensure_active()?;
        let body = api::UnwrapRequest {
            session_id: self.session_id.clone(),
            items,
        };
        post_json(
            &self.client,
            &self.config,
            "/encryption/secure-session/unwrap",
            &body,
            Some(Duration::from_secs(30)),
        )
        .await
    }

    /// Resolves a cleartext table name to its opaque table hash. The name
    /// travels sealed under the session key and is only opened inside the
    /// enclave.
    pub async fn table_hash(&self, table_name: &str) -> Result<String> {
        self.ensure_active()?;

        let mut nonce = [0u8; XNONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = self.cipher()?;
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), table_name.as_bytes())
            .map_err(|_| Error::Crypto("table name seal failed".into()))?;

        let body = api::TableHashRequest {
            session_id: self.session_id.clone(),
            encrypted_table_name: B64.encode(sealed),
            table_name_nonce: B64.encode(nonce),
        };
        let res: api::TableHashResponse = post_json(
            &self.client,
            &self.config,
            "/objects/table-hash",
            &body,
            None,
        )
        .await?;
        Ok(res.table_hash)
    }

    /// Opens a session-sealed DEK. The nonce must be exactly 24 bytes.
    pub fn unseal(
        &self,
        sealed_b64: &str,
        nonce_b64: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_active()?;

        let sealed = B64
            .decode(sealed_b64)
            .map_err(|_| Error::Validation("invalid base64 sealed DEK".into()))?;
        let nonce = B64
            .decode(nonce_b64)
            .map_err(|_| Error::Validation("invalid base64 nonce".into()))?;
        if nonce.len() != XNONCE_SIZE {
            return Err(Error::Validation(format!(
                "nonce must be {XNONCE_SIZE} bytes, got {}",
                nonce.len()
            )));
        }

        let cipher = self.cipher()?;
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto("DEK unseal failed".into()))
    }

    /// Wipes the session key. Every later call fails.
    pub fn close(&mut self) {
        self.session_key.zeroize();
        self.closed = true;
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(self.session_key.as_ref())
            .map_err(|e| Error::Crypto(format!("AEAD init failed: {e}")))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Validation("session is closed".into()));
        }
        if Utc::now() >= self.expires_at {
            return Err(Error::Validation("session has expired".into()));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

/// Legacy single-DEK unwrap over the sessionless `decrypt` path.
pub async fn unwrap_single_dek(
    config: &SessionConfig,
    kms_wrapped_dek_b64: &str,
    request_nonce_b64: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let secret = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
    let body = proto::DecryptRequest {
        ciphertext: kms_wrapped_dek_b64.to_string(),
        client_ephemeral_public_key: B64.encode(secret.public_key().as_bytes()),
        nonce: request_nonce_b64.to_string(),
    };
    let res: proto::DecryptResponse =
        post_json(&client, config, "/encryption/decrypt", &body, None).await?;

    let enclave_pub: [u8; 32] = B64
        .decode(&res.enclave_public_key)
        .map_err(|_| Error::Validation("invalid enclave box public key".into()))?
        .try_into()
        .map_err(|_| Error::Validation("enclave box public key must be 32 bytes".into()))?;
    let nonce = B64
        .decode(&res.nonce)
        .map_err(|_| Error::Validation("invalid box nonce".into()))?;
    if nonce.len() != XNONCE_SIZE {
        return Err(Error::Validation("box nonce must be 24 bytes".into()));
    }
    let sealed = B64
        .decode(&res.ciphertext)
        .map_err(|_| Error::Validation("invalid box ciphertext".into()))?;

    let salsa = crypto_box::SalsaBox::new(&crypto_box::PublicKey::from(enclave_pub), &secret);
    salsa
        .decrypt(nonce.as_slice().into(), sealed.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| Error::Crypto("box open failed".into()))
}

async fn post_json<B, T>(
    client: &reqwest::Client,
    config: &SessionConfig,
    path: &str,
    body: &B,
    timeout: Option<Duration>,
) -> Result<T>
where
    B: serde::Serialize,
    T: serde::de::DeserializeOwned,
{
    let url = format!("{}{}", config.endpoint, path);
    let mut req = client
        .post(&url)
        .header(TENANT_HEADER, &config.tenant_id)
        .header(API_KEY_HEADER, &config.api_key)
        .json(body);
    if let Some(t) = timeout {
        req = req.timeout(t);
    }

    let res = req.send().await?;
    let status = res.status();
    if !status.is_success() {
        let detail = res.text().await.unwrap_or_default();
        return Err(match status.as_u16() {
            401 => Error::Auth,
            400 => Error::Validation(detail),
            404 => Error::NotFound(detail),
            429 | 503 => Error::Transient(detail),
            _ => Error::Enclave(format!("{path} failed with status {status}: {detail}")),
        });
    }
    Ok(res.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_session(key: [u8; KEY_SIZE]) -> Session {
        Session {
            session_id: "sid".into(),
            session_key: Zeroizing::new(key),
            expires_at: Utc::now() + chrono::Duration::minutes(60),
            verification: VerificationResult {
                document: crate::client::attestation::AttestationDocument {
                    module_id: "test".into(),
                    timestamp: Utc::now().timestamp_millis() as u64,
                    digest: "SHA384".into(),
                    pcrs: BTreeMap::new(),
                    certificate: serde_bytes::ByteBuf::new(),
                    cabundle: vec![],
                    public_key: None,
                    user_data: None,
                    nonce: None,
                },
                timestamp: Utc::now(),
                verified_steps: vec![],
            },
            client: reqwest::Client::new(),
            config: SessionConfig::new("http://localhost/api", "t1", "k1"),
            closed: false,
        }
    }

    fn seal_with(key: &[u8; KEY_SIZE], nonce: &[u8; XNONCE_SIZE], pt: &[u8], aad: &[u8]) -> String {
        let cipher = XChaCha20Poly1305::new_from_slice(key).unwrap();
        let ct = cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: pt, aad })
            .unwrap();
        B64.encode(ct)
    }

    #[test]
    fn unseal_round_trip() {
        let key = [0x42u8; KEY_SIZE];
        let session = test_session(key);
        let nonce = [0x07u8; XNONCE_SIZE];
        let sealed = seal_with(&key, &nonce, b"a dek", b"obj-1");

        let pt = session
            .unseal(&sealed, &B64.encode(nonce), b"obj-1")
            .unwrap();
        assert_eq!(pt.as_slice(), b"a dek");
    }

    #[test]
    fn unseal_rejects_wrong_aad() {
        let key = [0x42u8; KEY_SIZE];
        let session = test_session(key);
        let nonce = [0x07u8; XNONCE_SIZE];
        let sealed = seal_with(&key, &nonce, b"a dek", b"obj-1");

        assert!(session
            .unseal(&sealed, &B64.encode(nonce), b"obj-2")
            .is_err());
    }

    #[test]
    fn unseal_requires_24_byte_nonce() {
        let session = test_session([0u8; KEY_SIZE]);
        let err = session
            .unseal(&B64.encode(b"ct"), &B64.encode([0u8; 12]), &[])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn closed_session_refuses_everything() {
        let key = [0x42u8; KEY_SIZE];
        let mut session = test_session(key);
        let nonce = [0x07u8; XNONCE_SIZE];
        let sealed = seal_with(&key, &nonce, b"a dek", &[]);

        session.close();
        assert!(session.unseal(&sealed, &B64.encode(nonce), &[]).is_err());
        // The key buffer is wiped, not just flagged.
        assert_eq!(*session.session_key, [0u8; KEY_SIZE]);
    }

    #[test]
    fn expired_session_refuses_calls() {
        let mut session = test_session([1u8; KEY_SIZE]);
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(session.ensure_active().is_err());
    }

    #[test]
    fn boundary_expiry_counts_as_expired() {
        let mut session = test_session([1u8; KEY_SIZE]);
        session.expires_at = Utc::now();
        assert!(session.ensure_active().is_err());
    }
}
