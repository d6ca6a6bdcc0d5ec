//! Order-preserving encryption for range-queryable numeric fields.
//!
//! SECURITY WARNING: the linear transform `c = a·p + b` leaks order,
//! approximate values, distribution and frequency, and is trivially broken
//! with two known plaintexts. It is therefore refused for any sensitivity
//! above `low`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{probabilistic, KEY_SIZE};
use crate::error::{Error, Result};
use crate::models::Sensitivity;

/// Ciphertext width: one u64, big-endian.
pub const OPE_CIPHERTEXT_SIZE: usize = 8;

/// Encrypts a u64 with the key-derived linear transform. Order is
/// preserved as long as `a·p + b` does not wrap.
pub fn encrypt(dek: &[u8], plaintext: u64, sensitivity: Sensitivity) -> Result<[u8; OPE_CIPHERTEXT_SIZE]> {
    check_key(dek)?;
    if sensitivity > Sensitivity::Low {
        return Err(Error::Validation(format!(
            "order-preserving encryption is limited to low sensitivity, got {}",
            sensitivity.as_str()
        )));
    }

    let (a, b) = derive_linear_params(dek);
    let c = a.wrapping_mul(plaintext).wrapping_add(b);
    Ok(c.to_be_bytes())
}

/// Unwraps the DEK with the master key, then inverts the linear transform.
pub fn decrypt_object(master_key: &[u8], ciphertext: &[u8], wrapped_dek: &[u8]) -> Result<u64> {
    if master_key.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "invalid master key size: {}",
            master_key.len()
        )));
    }
    let dek = Zeroizing::new(probabilistic::open(master_key, wrapped_dek, &[])?);
    decrypt(&dek, ciphertext)
}

/// Inverts `c = a·p + b` via the multiplicative inverse of `a` mod 2^64
/// (`a` is forced odd, so the inverse exists and round-trips exactly).
pub fn decrypt(dek: &[u8], ciphertext: &[u8]) -> Result<u64> {
    check_key(dek)?;
    let ct: [u8; OPE_CIPHERTEXT_SIZE] = ciphertext
        .try_into()
        .map_err(|_| Error::Crypto(format!("invalid OPE ciphertext size: {}", ciphertext.len())))?;

    let (a, b) = derive_linear_params(dek);
    let c = u64::from_be_bytes(ct);
    Ok(c.wrapping_sub(b).wrapping_mul(inverse_mod_2_64(a)))
}

/// Derives slope and intercept from the key. The slope is forced odd so it
/// is invertible mod 2^64.
fn derive_linear_params(key: &[u8]) -> (u64, u64) {
    let a = u64::from_be_bytes(hmac_prefix(key, b"linear-ope-slope")) | 1;
    let b = u64::from_be_bytes(hmac_prefix(key, b"linear-ope-intercept"));
    (a, b)
}

fn hmac_prefix(key: &[u8], label: &[u8]) -> [u8; 8] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Newton iteration for the inverse of an odd u64 modulo 2^64.
fn inverse_mod_2_64(a: u64) -> u64 {
    debug_assert!(a & 1 == 1);
    let mut x = a;
    for _ in 0..5 {
        x = x.wrapping_mul(2u64.wrapping_sub(a.wrapping_mul(x)));
    }
    x
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "invalid DEK size: {} (want {KEY_SIZE})",
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::RngCore;

    fn random_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn round_trip() {
        let dek = random_key();
        let ct = encrypt(&dek, 42, Sensitivity::Low).unwrap();
        assert_eq!(decrypt(&dek, &ct).unwrap(), 42);
    }

    #[test]
    fn refuses_medium_and_high_sensitivity() {
        let dek = random_key();
        assert!(encrypt(&dek, 1, Sensitivity::Medium).is_err());
        assert!(encrypt(&dek, 1, Sensitivity::High).is_err());
    }

    #[test]
    fn ciphertext_differences_are_linear() {
        // enc(p2) - enc(p1) ≡ a·(p2 - p1) mod 2^64, which is what makes
        // the scheme order-revealing (and breakable).
        let dek = random_key();
        let (a, _) = derive_linear_params(&dek);
        let (p1, p2) = (1_000u64, 9_000u64);
        let c1 = u64::from_be_bytes(encrypt(&dek, p1, Sensitivity::Low).unwrap());
        let c2 = u64::from_be_bytes(encrypt(&dek, p2, Sensitivity::Low).unwrap());
        assert_eq!(c2.wrapping_sub(c1), a.wrapping_mul(p2 - p1));
    }

    #[test]
    fn decrypt_via_master_key() {
        let master = random_key();
        let dek = random_key();
        let wrapped = probabilistic::seal(&master, &dek, &[]).unwrap();
        let ct = encrypt(&dek, 1_000_000, Sensitivity::Low).unwrap();
        assert_eq!(decrypt_object(&master, &ct, &wrapped).unwrap(), 1_000_000);
    }

    #[test]
    fn rejects_wrong_ciphertext_width() {
        let dek = random_key();
        assert!(decrypt(&dek, &[0u8; 7]).is_err());
        assert!(decrypt(&dek, &[0u8; 9]).is_err());
    }

    #[test]
    fn slope_is_odd() {
        for _ in 0..16 {
            let (a, _) = derive_linear_params(&random_key());
            assert_eq!(a & 1, 1);
        }
    }

    proptest! {
        #[test]
        fn round_trips_any_u64(p in any::<u64>()) {
            let dek = random_key();
            let ct = encrypt(&dek, p, Sensitivity::Low).unwrap();
            prop_assert_eq!(decrypt(&dek, &ct).unwrap(), p);
        }
    }
}
