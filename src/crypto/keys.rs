//! Ephemeral key agreement and session-key derivation.
//!
//! Both ends of a secure session derive the same 32-byte XChaCha20-Poly1305
//! key: `HKDF-SHA256(ikm = X25519(priv, peer_pub), salt = ∅,
//! info = "gardbase-enclave-session-v1")`.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};

/// HKDF info string binding session keys to this protocol version.
pub const SESSION_KEY_INFO: &[u8] = b"gardbase-enclave-session-v1";

/// Generates an ephemeral X25519 keypair from the OS RNG.
///
/// Enclave-side code must not use this; it derives scalars from the
/// platform RNG and calls [`keypair_from_scalar`] instead.
pub fn generate_ephemeral_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Builds a keypair from raw scalar bytes (clamped on use).
pub fn keypair_from_scalar(scalar: [u8; 32]) -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::from(scalar);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Decodes and validates a peer public key: exactly 32 bytes, not the
/// all-zero point.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Validation(format!("public key must be 32 bytes, got {}", bytes.len())))?;
    if arr == [0u8; 32] {
        return Err(Error::Validation("public key is the all-zero point".into()));
    }
    Ok(PublicKey::from(arr))
}

/// Derives the shared session key. Rejects a non-contributory exchange
/// (all-zero shared secret). The intermediate secret is zeroed on drop.
pub fn derive_session_key(
    secret: &StaticSecret,
    peer_public: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let shared = secret.diffie_hellman(peer_public);
    if !shared.was_contributory() {
        return Err(Error::Crypto("non-contributory key exchange".into()));
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(SESSION_KEY_INFO, key.as_mut())
        .map_err(|e| Error::Crypto(format!("session key derivation failed: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let (client_sk, client_pk) = generate_ephemeral_keypair();
        let (enclave_sk, enclave_pk) = generate_ephemeral_keypair();

        let k1 = derive_session_key(&client_sk, &enclave_pk).unwrap();
        let k2 = derive_session_key(&enclave_sk, &client_pk).unwrap();
        assert_eq!(*k1, *k2);
        assert_eq!(k1.len(), KEY_SIZE);
    }

    #[test]
    fn different_peers_different_keys() {
        let (client_sk, _) = generate_ephemeral_keypair();
        let (_, pk_a) = generate_ephemeral_keypair();
        let (_, pk_b) = generate_ephemeral_keypair();

        let ka = derive_session_key(&client_sk, &pk_a).unwrap();
        let kb = derive_session_key(&client_sk, &pk_b).unwrap();
        assert_ne!(*ka, *kb);
    }

    #[test]
    fn rejects_short_public_key() {
        assert!(decode_public_key(&[0u8; 31]).is_err());
        assert!(decode_public_key(&[0u8; 33]).is_err());
    }

    #[test]
    fn rejects_zero_public_key() {
        assert!(decode_public_key(&[0u8; 32]).is_err());
    }

    #[test]
    fn rejects_low_order_peer() {
        let (sk, _) = generate_ephemeral_keypair();
        // The identity point produces an all-zero shared secret.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        let peer = PublicKey::from(identity);
        assert!(derive_session_key(&sk, &peer).is_err());
    }

    #[test]
    fn scalar_keypair_matches_dalek_derivation() {
        let scalar = [7u8; 32];
        let (sk, pk) = keypair_from_scalar(scalar);
        assert_eq!(pk.as_bytes(), PublicKey::from(&sk).as_bytes());
    }
}
