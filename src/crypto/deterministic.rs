//! Deterministic object encryption with AES-256-GCM and HMAC-derived nonces.
//!
//! The nonce is `HMAC-SHA256(key, context_type || 0x00 || context)[..12]`
//! and the context doubles as AAD, so equal `(plaintext, context, key)`
//! always yields the same ciphertext and different contexts yield different
//! ciphertexts. Callers must keep contexts unique per plaintext; nonce
//! reuse across distinct plaintexts under the same key and context would
//! void AEAD confidentiality.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{GCM_NONCE_SIZE, KEY_SIZE};
use crate::error::{Error, Result};

const CONTEXT_DEK_ENCRYPTION: &str = "dek-encryption";
const CONTEXT_DATA_ENCRYPTION: &str = "data-encryption";

/// Deterministically encrypts a plaintext under a fresh random DEK, and the
/// DEK under the master key. Returns `(ciphertext, wrapped_dek)`. The
/// ciphertext is a pure function of `(plaintext, context, dek)`.
pub fn encrypt_object(
    master_key: &[u8],
    plaintext: &[u8],
    context: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    check_inputs(master_key, context)?;

    let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
    rand::thread_rng().fill_bytes(dek.as_mut());

    let ciphertext = seal(dek.as_ref(), plaintext, context, CONTEXT_DATA_ENCRYPTION)?;
    let dek_context = format!("{context}:dek");
    let wrapped_dek = seal(master_key, dek.as_ref(), &dek_context, CONTEXT_DEK_ENCRYPTION)?;

    Ok((ciphertext, wrapped_dek))
}

pub fn decrypt_object(
    master_key: &[u8],
    ciphertext: &[u8],
    wrapped_dek: &[u8],
    context: &str,
) -> Result<Vec<u8>> {
    check_inputs(master_key, context)?;

    let dek_context = format!("{context}:dek");
    let dek = Zeroizing::new(open(
        master_key,
        wrapped_dek,
        &dek_context,
        CONTEXT_DEK_ENCRYPTION,
    )?);
    open(&dek, ciphertext, context, CONTEXT_DATA_ENCRYPTION)
}

fn seal(key: &[u8], plaintext: &[u8], context: &str, context_type: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;
    let nonce = derive_nonce(key, context, context_type);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: context.as_bytes(),
            },
        )
        .map_err(|_| Error::Crypto("deterministic encryption failed".into()))
}

fn open(key: &[u8], ciphertext: &[u8], context: &str, context_type: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;
    let nonce = derive_nonce(key, context, context_type);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: context.as_bytes(),
            },
        )
        .map_err(|_| Error::Crypto("deterministic decryption failed".into()))
}

/// `HMAC-SHA256(key, context_type || 0x00 || context)` truncated to the
/// GCM nonce size.
fn derive_nonce(key: &[u8], context: &str, context_type: &str) -> [u8; GCM_NONCE_SIZE] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(context_type.as_bytes());
    mac.update(&[0x00]);
    mac.update(context.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; GCM_NONCE_SIZE];
    nonce.copy_from_slice(&digest[..GCM_NONCE_SIZE]);
    nonce
}

fn check_inputs(key: &[u8], context: &str) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "invalid key size: {} (want {KEY_SIZE})",
            key.len()
        )));
    }
    if context.is_empty() {
        return Err(Error::Validation(
            "context must not be empty for deterministic encryption".into(),
        ));
    }
    Ok(())
}
