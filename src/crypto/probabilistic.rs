//! Probabilistic object encryption with AES-256-GCM.
//!
//! Blob format: `nonce(12) || ct`. Each object gets a fresh random DEK;
//! the DEK is wrapped under the tenant master key in the same format.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{GCM_NONCE_SIZE, KEY_SIZE};
use crate::error::{Error, Result};

/// Encrypts a plaintext under a fresh random DEK and wraps the DEK under
/// the master key. Returns `(ciphertext, wrapped_dek)`.
pub fn encrypt_object(master_key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    check_key(master_key)?;

    let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
    rand::thread_rng().fill_bytes(dek.as_mut());

    let ciphertext = seal(dek.as_ref(), plaintext, &[])?;
    let wrapped_dek = seal(master_key, dek.as_ref(), &[])?;

    Ok((ciphertext, wrapped_dek))
}

/// Unwraps the DEK with the master key, then decrypts the object.
pub fn decrypt_object(master_key: &[u8], ciphertext: &[u8], wrapped_dek: &[u8]) -> Result<Vec<u8>> {
    check_key(master_key)?;
    let dek = Zeroizing::new(open(master_key, wrapped_dek, &[])?);
    open(&dek, ciphertext, &[])
}

/// AES-256-GCM seal with a random nonce, returning `nonce || ct`.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    let mut nonce = [0u8; GCM_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::Crypto("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(GCM_NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Opens a `nonce || ct` blob produced by [`seal`].
pub fn open(key: &[u8], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;
    if blob.len() < GCM_NONCE_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    let (nonce, ct) = blob.split_at(GCM_NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad })
        .map_err(|_| Error::Crypto("AES-GCM decryption failed".into()))
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "invalid key size: {} (want {KEY_SIZE})",
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn random_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
        key
    }

    #[test]
    fn object_round_trip() {
        let master = random_key();
        let (ct, wrapped) = encrypt_object(&master, b"the payload").unwrap();
        let pt = decrypt_object(&master, &ct, &wrapped).unwrap();
        assert_eq!(pt, b"the payload");
    }

    #[test]
    fn ciphertexts_differ_per_call() {
        let master = random_key();
        let (ct1, dek1) = encrypt_object(&master, b"same").unwrap();
        let (ct2, dek2) = encrypt_object(&master, b"same").unwrap();
        assert_ne!(ct1, ct2);
        assert_ne!(dek1, dek2);
    }

    #[test]
    fn wrong_master_key_fails() {
        let (ct, wrapped) = encrypt_object(&random_key(), b"data").unwrap();
        assert!(decrypt_object(&random_key(), &ct, &wrapped).is_err());
    }

    #[test]
    fn tampered_blob_fails() {
        let master = random_key();
        let (mut ct, wrapped) = encrypt_object(&master, b"data").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(decrypt_object(&master, &ct, &wrapped).is_err());
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(encrypt_object(&[0u8; 16], b"x").is_err());
        assert!(seal(&[0u8; 31], b"x", &[]).is_err());
    }

    #[test]
    fn rejects_truncated_blob() {
        let key = random_key();
        assert!(open(&key, &[0u8; 8], &[]).is_err());
    }

    #[test]
    fn aad_is_bound() {
        let key = random_key();
        let blob = seal(&key, b"bound", b"object-1").unwrap();
        assert!(open(&key, &blob, b"object-1").is_ok());
        assert!(open(&key, &blob, b"object-2").is_err());
    }

    proptest! {
        #[test]
        fn round_trips_any_plaintext(pt in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let master = random_key();
            let (ct, wrapped) = encrypt_object(&master, &pt).unwrap();
            prop_assert_eq!(decrypt_object(&master, &ct, &wrapped).unwrap(), pt);
        }
    }
}
