//! Enclave request handlers.
//!
//! Every function here runs inside the trust boundary and may touch
//! plaintext key material. Plaintext buffers are wiped as soon as their
//! sealed counterparts exist; nothing sensitive reaches a response frame
//! or a log line.

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::Utc;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::keys;
use crate::crypto::{KEY_SIZE, XNONCE_SIZE};
use crate::enclave::session::SESSION_TTL;
use crate::enclave::EnclaveState;
use crate::error::{Error, Result};
use crate::proto::{
    DecryptRequest, DecryptResponse, GetAttestationResponse, HealthResponse, PrepareDekRequest,
    PrepareDekResponse, PreparedDek, SessionInitRequest, SessionInitResponse,
    SessionUnwrapItemResult, SessionUnwrapRequest, SessionUnwrapResponse, TableHashRequest,
    TableHashResponse,
};

/// Upper bound on the caller-supplied attestation nonce.
const MAX_NONCE_LEN: usize = 64;

pub fn get_attestation(state: &EnclaveState) -> Result<GetAttestationResponse> {
    let doc = state.cached_attestation()?;
    Ok(GetAttestationResponse {
        attestation: B64.encode(doc),
    })
}

pub fn health(state: &EnclaveState) -> HealthResponse {
    let uptime = Utc::now() - state.started_at();
    HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        uptime: format!("{}s", uptime.num_seconds()),
    }
}

/// Establishes a session: X25519 exchange against the client's ephemeral
/// key, HKDF-derived AEAD key, and a fresh attestation document binding the
/// enclave's ephemeral public key to the caller's nonce.
pub fn session_init(state: &EnclaveState, req: SessionInitRequest) -> Result<SessionInitResponse> {
    let client_pub_bytes = B64
        .decode(&req.client_ephemeral_public_key)
        .map_err(|_| Error::Validation("invalid client ephemeral key encoding".into()))?;
    let client_pub = keys::decode_public_key(&client_pub_bytes)?;

    let nonce = match req.nonce.as_str() {
        "" => None,
        encoded => {
            let nonce = B64
                .decode(encoded)
                .map_err(|_| Error::Validation("invalid nonce encoding".into()))?;
            if nonce.len() > MAX_NONCE_LEN {
                return Err(Error::Validation(format!(
                    "nonce exceeds {MAX_NONCE_LEN} bytes"
                )));
            }
            Some(nonce)
        }
    };

    let mut scalar = state.platform().rand_array::<32>()?;
    let (secret, eph_pub) = keys::keypair_from_scalar(scalar);
    scalar.zeroize();

    let session_key = keys::derive_session_key(&secret, &client_pub)?;

    let sid = B64.encode(state.platform().rand_array::<16>()?);
    let expires_at = Utc::now() + chrono::Duration::seconds(SESSION_TTL.as_secs() as i64);

    // The attestation binds the *ephemeral* key, not the long-lived one:
    // its purpose is to authenticate this session establishment.
    let attestation =
        state
            .platform()
            .attestation_document(eph_pub.as_bytes(), nonce.as_deref(), None)?;

    // Stored only after every fallible step; a failed init leaves no session.
    state.sessions.store(sid.clone(), session_key, expires_at);

    Ok(SessionInitResponse {
        session_id: sid,
        enclave_ephemeral_public_key: B64.encode(eph_pub.as_bytes()),
        attestation: B64.encode(attestation),
        expires_at: expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
}

/// Re-seals a batch of KMS-unwrapped DEKs under the session key. Failures
/// are per item; one bad item never aborts the batch.
pub fn session_unwrap(
    state: &EnclaveState,
    req: SessionUnwrapRequest,
) -> Result<SessionUnwrapResponse> {
    let (key, _) = state
        .sessions
        .get(&req.session_id)
        .ok_or_else(|| Error::Validation("invalid or expired session id".into()))?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| Error::Crypto(format!("AEAD init failed: {e}")))?;

    let mut results = Vec::with_capacity(req.items.len());
    for item in &req.items {
        match unwrap_item(state, &cipher, &item.object_id, &item.ciphertext) {
            Ok((sealed_dek, nonce)) => results.push(SessionUnwrapItemResult {
                object_id: item.object_id.clone(),
                sealed_dek,
                nonce,
                success: true,
                error: None,
            }),
            Err(e) => results.push(SessionUnwrapItemResult {
                object_id: item.object_id.clone(),
                sealed_dek: String::new(),
                nonce: String::new(),
                success: false,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(results)
}

fn unwrap_item(
    state: &EnclaveState,
    cipher: &XChaCha20Poly1305,
    object_id: &str,
    ciphertext: &str,
) -> Result<(String, String)> {
    if object_id.is_empty() {
        return Err(Error::Validation("missing object_id".into()));
    }
    if ciphertext.is_empty() {
        return Err(Error::Validation("missing ciphertext".into()));
    }
    let ct = B64
        .decode(ciphertext)
        .map_err(|e| Error::Validation(format!("invalid base64 ciphertext: {e}")))?;

    let dek = state.rsa_decrypt(&ct)?;
    if dek.len() != KEY_SIZE {
        return Err(Error::Crypto(format!("unexpected DEK length: {}", dek.len())));
    }

    let nonce = state.platform().rand_array::<XNONCE_SIZE>()?;
    let sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: dek.as_slice(),
                aad: object_id.as_bytes(),
            },
        )
        .map_err(|_| Error::Crypto("session seal failed".into()))?;

    Ok((B64.encode(sealed), B64.encode(nonce)))
}

/// Opens the tenant master key and a batch of fresh KMS DEKs, and emits
/// each DEK sealed both under the session key and under the master key.
/// Nonces are fresh per item.
pub fn session_prepare_dek(
    state: &EnclaveState,
    req: PrepareDekRequest,
) -> Result<PrepareDekResponse> {
    let (key, _) = state
        .sessions
        .get(&req.session_id)
        .ok_or_else(|| Error::Validation("invalid or expired session id".into()))?;
    let session_cipher = XChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| Error::Crypto(format!("AEAD init failed: {e}")))?;

    let master_ct = B64
        .decode(&req.wrapped_master_key)
        .map_err(|e| Error::Validation(format!("invalid wrapped master key: {e}")))?;
    let master_key = state.rsa_decrypt(&master_ct)?;
    if master_key.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "unexpected master key length: {}",
            master_key.len()
        )));
    }
    let master_cipher = XChaCha20Poly1305::new_from_slice(master_key.as_slice())
        .map_err(|e| Error::Crypto(format!("AEAD init failed: {e}")))?;

    let mut deks = Vec::with_capacity(req.deks.len());
    for entry in &req.deks {
        let ct = B64
            .decode(&entry.ciphertext_for_recipient)
            .map_err(|e| Error::Validation(format!("invalid ciphertext_for_recipient: {e}")))?;
        let dek = state.rsa_decrypt(&ct)?;
        if dek.len() != KEY_SIZE {
            return Err(Error::Crypto(format!("unexpected DEK length: {}", dek.len())));
        }

        let session_nonce = state.platform().rand_array::<XNONCE_SIZE>()?;
        let master_nonce = state.platform().rand_array::<XNONCE_SIZE>()?;

        let sealed = session_cipher
            .encrypt(XNonce::from_slice(&session_nonce), dek.as_slice())
            .map_err(|_| Error::Crypto("session seal failed".into()))?;
        let master_sealed = master_cipher
            .encrypt(XNonce::from_slice(&master_nonce), dek.as_slice())
            .map_err(|_| Error::Crypto("master seal failed".into()))?;

        deks.push(PreparedDek {
            sealed_dek: B64.encode(sealed),
            kms_encrypted_dek: entry.ciphertext_blob.clone(),
            master_encrypted_dek: B64.encode(master_sealed),
            session_nonce: B64.encode(session_nonce),
            master_key_nonce: B64.encode(master_nonce),
        });
    }

    Ok(PrepareDekResponse { deks })
}

/// Derives the deterministic table hash:
/// `base64url_nopad(SHA-256(table_name || salt))`.
pub fn session_generate_table_hash(
    state: &EnclaveState,
    req: TableHashRequest,
) -> Result<TableHashResponse> {
    let (key, _) = state
        .sessions
        .get(&req.session_id)
        .ok_or_else(|| Error::Validation("invalid or expired session id".into()))?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| Error::Crypto(format!("AEAD init failed: {e}")))?;

    let encrypted_name = B64
        .decode(&req.session_encrypted_table_name)
        .map_err(|e| Error::Validation(format!("invalid encrypted table name: {e}")))?;
    let nonce = B64
        .decode(&req.session_table_name_nonce)
        .map_err(|e| Error::Validation(format!("invalid table name nonce: {e}")))?;
    if nonce.len() != XNONCE_SIZE {
        return Err(Error::Validation(format!(
            "table name nonce must be {XNONCE_SIZE} bytes"
        )));
    }

    let table_name = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(&nonce), encrypted_name.as_slice())
            .map_err(|_| Error::Crypto("table name decryption failed".into()))?,
    );

    let salt_ct = B64
        .decode(&req.table_salt)
        .map_err(|e| Error::Validation(format!("invalid table salt: {e}")))?;
    let salt = state.rsa_decrypt(&salt_ct)?;
    if salt.len() != KEY_SIZE {
        return Err(Error::Crypto(format!("unexpected salt length: {}", salt.len())));
    }

    let mut hasher = Sha256::new();
    hasher.update(table_name.as_slice());
    hasher.update(salt.as_slice());
    let digest = hasher.finalize();

    Ok(TableHashResponse {
        table_hash: URL_SAFE_NO_PAD.encode(digest),
    })
}

/// Legacy single-DEK unwrap: seals the DEK in a NaCl box to the client's
/// ephemeral key. Kept for first-generation clients; sessionless.
pub fn decrypt(state: &EnclaveState, req: DecryptRequest) -> Result<DecryptResponse> {
    let client_pub_bytes = B64
        .decode(&req.client_ephemeral_public_key)
        .map_err(|_| Error::Validation("invalid client ephemeral key encoding".into()))?;
    let client_pub: [u8; 32] = client_pub_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Validation("client ephemeral key must be 32 bytes".into()))?;

    let ct = B64
        .decode(&req.ciphertext)
        .map_err(|e| Error::Validation(format!("invalid ciphertext encoding: {e}")))?;
    let dek = state.rsa_decrypt(&ct)?;

    let mut scalar = state.platform().rand_array::<32>()?;
    let secret = crypto_box::SecretKey::from(scalar);
    scalar.zeroize();
    let nonce = state.platform().rand_array::<XNONCE_SIZE>()?;

    let salsa = crypto_box::SalsaBox::new(&crypto_box::PublicKey::from(client_pub), &secret);
    let sealed = salsa
        .encrypt(nonce.as_slice().into(), dek.as_slice())
        .map_err(|_| Error::Crypto("box seal failed".into()))?;

    Ok(DecryptResponse {
        enclave_public_key: B64.encode(secret.public_key().as_bytes()),
        ciphertext: B64.encode(sealed),
        nonce: B64.encode(nonce),
        request_nonce: req.nonce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::test_state;
    use crate::proto::{DekToPrepare, SessionUnwrapItem};
    use rand::rngs::OsRng;
    use rsa::Oaep;

    /// Seals `plaintext` to the enclave's RSA key the way KMS produces a
    /// `CiphertextForRecipient`.
    fn seal_to_enclave(state: &EnclaveState, plaintext: &[u8]) -> String {
        let ct = state
            .rsa_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .unwrap();
        B64.encode(ct)
    }

    fn client_session(state: &EnclaveState) -> (String, Zeroizing<[u8; KEY_SIZE]>) {
        let (client_sk, client_pk) = keys::generate_ephemeral_keypair();
        let res = session_init(
            state,
            SessionInitRequest {
                client_ephemeral_public_key: B64.encode(client_pk.as_bytes()),
                nonce: B64.encode([0x42u8; 32]),
            },
        )
        .unwrap();

        let enclave_pub = B64.decode(&res.enclave_ephemeral_public_key).unwrap();
        let enclave_pub = keys::decode_public_key(&enclave_pub).unwrap();
        let session_key = keys::derive_session_key(&client_sk, &enclave_pub).unwrap();
        (res.session_id, session_key)
    }

    fn open_xchacha(key: &[u8], nonce_b64: &str, ct_b64: &str, aad: &[u8]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new_from_slice(key).unwrap();
        let nonce = B64.decode(nonce_b64).unwrap();
        let ct = B64.decode(ct_b64).unwrap();
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ct,
                    aad,
                },
            )
            .unwrap()
    }

    #[test]
    fn session_init_shares_a_key_with_the_client() {
        let state = test_state();
        let (sid, client_key) = client_session(&state);

        // The enclave stored the same key the client derived.
        let (stored, _) = state.sessions.get(&sid).unwrap();
        assert_eq!(*stored, *client_key);
    }

    #[test]
    fn session_init_expiry_is_about_an_hour_out() {
        let state = test_state();
        let (_, client_pk) = keys::generate_ephemeral_keypair();
        let res = session_init(
            &state,
            SessionInitRequest {
                client_ephemeral_public_key: B64.encode(client_pk.as_bytes()),
                nonce: String::new(),
            },
        )
        .unwrap();

        let expires = chrono::DateTime::parse_from_rfc3339(&res.expires_at).unwrap();
        let delta = expires.with_timezone(&Utc) - Utc::now();
        assert!(delta.num_seconds() > 59 * 60 && delta.num_seconds() <= 60 * 60 + 5);
    }

    #[test]
    fn session_init_rejects_bad_client_keys() {
        let state = test_state();
        // 31 bytes
        let err = session_init(
            &state,
            SessionInitRequest {
                client_ephemeral_public_key: B64.encode([1u8; 31]),
                nonce: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // all-zero point
        let err = session_init(
            &state,
            SessionInitRequest {
                client_ephemeral_public_key: B64.encode([0u8; 32]),
                nonce: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // not base64 at all
        let err = session_init(
            &state,
            SessionInitRequest {
                client_ephemeral_public_key: "!!!".into(),
                nonce: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn session_init_rejects_oversized_nonce() {
        let state = test_state();
        let (_, client_pk) = keys::generate_ephemeral_keypair();
        let err = session_init(
            &state,
            SessionInitRequest {
                client_ephemeral_public_key: B64.encode(client_pk.as_bytes()),
                nonce: B64.encode([0u8; 65]),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn prepare_dek_seals_the_same_dek_both_ways() {
        let state = test_state();
        let (sid, session_key) = client_session(&state);

        let master_key = [0xA5u8; KEY_SIZE];
        let deks: Vec<[u8; KEY_SIZE]> = (0..3).map(|i| [i as u8 + 1; KEY_SIZE]).collect();

        let req = PrepareDekRequest {
            session_id: sid,
            wrapped_master_key: seal_to_enclave(&state, &master_key),
            deks: deks
                .iter()
                .enumerate()
                .map(|(i, dek)| DekToPrepare {
                    ciphertext_blob: format!("kms-blob-{i}"),
                    ciphertext_for_recipient: seal_to_enclave(&state, dek),
                })
                .collect(),
        };

        let res = session_prepare_dek(&state, req).unwrap();
        assert_eq!(res.deks.len(), 3);

        for (i, prepared) in res.deks.iter().enumerate() {
            assert_eq!(prepared.kms_encrypted_dek, format!("kms-blob-{i}"));

            let via_session = open_xchacha(
                session_key.as_ref(),
                &prepared.session_nonce,
                &prepared.sealed_dek,
                &[],
            );
            let via_master = open_xchacha(
                &master_key,
                &prepared.master_key_nonce,
                &prepared.master_encrypted_dek,
                &[],
            );
            assert_eq!(via_session, via_master);
            assert_eq!(via_session.len(), KEY_SIZE);
            assert_eq!(via_session, deks[i]);
        }

        // Per-item nonces are fresh.
        assert_ne!(res.deks[0].session_nonce, res.deks[1].session_nonce);
        assert_ne!(res.deks[0].master_key_nonce, res.deks[1].master_key_nonce);
    }

    #[test]
    fn prepare_dek_unknown_session_fails() {
        let state = test_state();
        let err = session_prepare_dek(
            &state,
            PrepareDekRequest {
                session_id: "no-such-session".into(),
                wrapped_master_key: String::new(),
                deks: vec![],
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn unwrap_batch_survives_a_bad_item() {
        let state = test_state();
        let (sid, session_key) = client_session(&state);

        let dek = [0x77u8; KEY_SIZE];
        let good = seal_to_enclave(&state, &dek);

        let res = session_unwrap(
            &state,
            SessionUnwrapRequest {
                session_id: sid,
                items: vec![
                    SessionUnwrapItem {
                        object_id: "obj-0".into(),
                        ciphertext: good.clone(),
                    },
                    SessionUnwrapItem {
                        object_id: "obj-1".into(),
                        ciphertext: "not-base64!".into(),
                    },
                    SessionUnwrapItem {
                        object_id: "obj-2".into(),
                        ciphertext: good,
                    },
                ],
            },
        )
        .unwrap();

        assert_eq!(res.len(), 3);
        assert!(res[0].success);
        assert!(!res[1].success);
        assert!(res[1].error.as_deref().unwrap().contains("base64"));
        assert!(res[2].success);

        for ok in [&res[0], &res[2]] {
            let opened = open_xchacha(
                session_key.as_ref(),
                &ok.nonce,
                &ok.sealed_dek,
                ok.object_id.as_bytes(),
            );
            assert_eq!(opened, dek);
        }
    }

    #[test]
    fn unwrap_binds_the_object_id() {
        let state = test_state();
        let (sid, session_key) = client_session(&state);
        let dek = [0x11u8; KEY_SIZE];

        let res = session_unwrap(
            &state,
            SessionUnwrapRequest {
                session_id: sid,
                items: vec![SessionUnwrapItem {
                    object_id: "obj-a".into(),
                    ciphertext: seal_to_enclave(&state, &dek),
                }],
            },
        )
        .unwrap();

        let cipher = XChaCha20Poly1305::new_from_slice(session_key.as_ref()).unwrap();
        let nonce = B64.decode(&res[0].nonce).unwrap();
        let ct = B64.decode(&res[0].sealed_dek).unwrap();
        // Wrong AAD must fail.
        assert!(cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ct,
                    aad: b"obj-b"
                }
            )
            .is_err());
    }

    #[test]
    fn table_hash_is_deterministic_across_sessions() {
        let state = test_state();
        let salt = [0x5Au8; KEY_SIZE];

        let hash_for = |table_name: &[u8]| {
            let (sid, session_key) = client_session(&state);
            let cipher = XChaCha20Poly1305::new_from_slice(session_key.as_ref()).unwrap();
            let nonce = [0x01u8; XNONCE_SIZE];
            let sealed_name = cipher
                .encrypt(XNonce::from_slice(&nonce), table_name)
                .unwrap();

            session_generate_table_hash(
                &state,
                TableHashRequest {
                    session_id: sid,
                    session_encrypted_table_name: B64.encode(sealed_name),
                    session_table_name_nonce: B64.encode(nonce),
                    table_salt: seal_to_enclave(&state, &salt),
                },
            )
            .unwrap()
            .table_hash
        };

        let h1 = hash_for(b"customers");
        let h2 = hash_for(b"customers");
        let h3 = hash_for(b"customerz");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        // base64url without padding
        assert!(!h1.contains('='));
        assert!(!h1.contains('+'));
        assert!(!h1.contains('/'));

        // Matches the reference construction.
        let mut hasher = Sha256::new();
        hasher.update(b"customers");
        hasher.update(salt);
        assert_eq!(h1, URL_SAFE_NO_PAD.encode(hasher.finalize()));
    }

    #[test]
    fn table_hash_rejects_bad_nonce_length() {
        let state = test_state();
        let (sid, _) = client_session(&state);
        let err = session_generate_table_hash(
            &state,
            TableHashRequest {
                session_id: sid,
                session_encrypted_table_name: B64.encode(b"ct"),
                session_table_name_nonce: B64.encode([0u8; 12]),
                table_salt: B64.encode(b"salt"),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn legacy_decrypt_round_trip() {
        let state = test_state();
        let dek = [0x33u8; KEY_SIZE];

        let client_secret = crypto_box::SecretKey::generate(&mut OsRng);
        let res = decrypt(
            &state,
            DecryptRequest {
                ciphertext: seal_to_enclave(&state, &dek),
                client_ephemeral_public_key: B64.encode(client_secret.public_key().as_bytes()),
                nonce: B64.encode(b"request-nonce"),
            },
        )
        .unwrap();
        assert_eq!(res.request_nonce, B64.encode(b"request-nonce"));

        let enclave_pub: [u8; 32] = B64
            .decode(&res.enclave_public_key)
            .unwrap()
            .try_into()
            .unwrap();
        let salsa = crypto_box::SalsaBox::new(
            &crypto_box::PublicKey::from(enclave_pub),
            &client_secret,
        );
        let nonce = B64.decode(&res.nonce).unwrap();
        let ct = B64.decode(&res.ciphertext).unwrap();
        let opened = salsa.decrypt(nonce.as_slice().into(), ct.as_slice()).unwrap();
        assert_eq!(opened, dek);
    }

    #[test]
    fn get_attestation_returns_cached_document() {
        let state = test_state();
        let res = get_attestation(&state).unwrap();
        assert!(!res.attestation.is_empty());
        B64.decode(&res.attestation).unwrap();
    }

    #[test]
    fn health_reports_uptime() {
        let state = test_state();
        let res = health(&state);
        assert_eq!(res.status, "healthy");
        assert!(res.uptime.ends_with('s'));
    }
}
