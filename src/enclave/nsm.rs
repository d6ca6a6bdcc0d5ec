//! Platform adapter for the Nitro Secure Module.
//!
//! Inside an enclave this opens the NSM device and serves attestation
//! documents and attested randomness. Outside (development, tests) it falls
//! back to a local mode backed by the OS RNG and a placeholder document.

use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use rand::RngCore;
use serde_bytes::ByteBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// Placeholder document served in local mode, where no NSM device exists.
const LOCAL_MODE_DOCUMENT: &[u8] = b"GARDBASE_LOCAL_MODE_ATTESTATION";

/// Handle to the platform security module.
pub struct PlatformAdapter {
    /// NSM file descriptor; `None` in local mode.
    nsm_fd: Option<Mutex<i32>>,
}

impl PlatformAdapter {
    /// Opens the NSM session. Falls back to local mode when the device is
    /// unavailable (not running inside an enclave).
    pub fn open() -> Self {
        let fd = nsm_init();
        if fd < 0 {
            warn!("NSM device unavailable, running in local mode");
            return Self { nsm_fd: None };
        }
        tracing::info!(fd, "NSM session opened");
        Self {
            nsm_fd: Some(Mutex::new(fd)),
        }
    }

    /// Local-mode adapter for tests.
    pub fn local() -> Self {
        Self { nsm_fd: None }
    }

    pub fn is_local_mode(&self) -> bool {
        self.nsm_fd.is_none()
    }

    /// Returns `n` bytes from the attested RNG.
    pub fn rand(&self, n: usize) -> Result<Vec<u8>> {
        let Some(fd) = &self.nsm_fd else {
            let mut buf = vec![0u8; n];
            rand::thread_rng()
                .try_fill_bytes(&mut buf)
                .map_err(|e| Error::Nsm(format!("local RNG failure: {e}")))?;
            return Ok(buf);
        };

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let fd = fd.lock().expect("NSM fd lock poisoned");
            match nsm_process_request(*fd, Request::GetRandom) {
                Response::GetRandom { random } if !random.is_empty() => {
                    let take = random.len().min(n - out.len());
                    out.extend_from_slice(&random[..take]);
                }
                Response::Error(err) => {
                    return Err(Error::Nsm(format!("GetRandom failed: {err:?}")));
                }
                _ => return Err(Error::Nsm("GetRandom returned no entropy".into())),
            }
        }
        Ok(out)
    }

    /// Fixed-size attested randomness.
    pub fn rand_array<const N: usize>(&self) -> Result<[u8; N]> {
        let bytes = self.rand(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Requests a signed attestation document committing to the supplied
    /// public key and optional nonce / user data.
    pub fn attestation_document(
        &self,
        public_key: &[u8],
        nonce: Option<&[u8]>,
        user_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let Some(fd) = &self.nsm_fd else {
            return Ok(LOCAL_MODE_DOCUMENT.to_vec());
        };

        let request = Request::Attestation {
            public_key: Some(ByteBuf::from(public_key.to_vec())),
            nonce: nonce.map(|n| ByteBuf::from(n.to_vec())),
            user_data: user_data.map(|d| ByteBuf::from(d.to_vec())),
        };

        let fd = fd.lock().expect("NSM fd lock poisoned");
        match nsm_process_request(*fd, request) {
            Response::Attestation { document } if !document.is_empty() => Ok(document),
            Response::Attestation { .. } => {
                Err(Error::Attestation("NSM returned an empty document".into()))
            }
            Response::Error(err) => Err(Error::Attestation(format!(
                "attestation request failed: {err:?}"
            ))),
            _ => Err(Error::Attestation("unexpected NSM response".into())),
        }
    }
}

impl Drop for PlatformAdapter {
    fn drop(&mut self) {
        if let Some(fd) = &self.nsm_fd {
            if let Ok(fd) = fd.lock() {
                nsm_exit(*fd);
            }
        }
    }
}

/// `RngCore` adapter over the platform RNG, used for the startup RSA key
/// generation. A platform RNG failure here aborts startup, which is the
/// required behavior for the initialization sequence.
pub struct PlatformRng<'a> {
    adapter: &'a PlatformAdapter,
}

impl<'a> PlatformRng<'a> {
    pub fn new(adapter: &'a PlatformAdapter) -> Self {
        Self { adapter }
    }
}

impl rand::RngCore for PlatformRng<'_> {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest)
            .expect("platform RNG unavailable during startup")
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        let bytes = self
            .adapter
            .rand(dest.len())
            .map_err(|e| rand::Error::new(std::io::Error::other(e.to_string())))?;
        dest.copy_from_slice(&bytes);
        Ok(())
    }
}

impl rand::CryptoRng for PlatformRng<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mode_detected() {
        let adapter = PlatformAdapter::local();
        assert!(adapter.is_local_mode());
    }

    #[test]
    fn local_rand_yields_requested_length() {
        let adapter = PlatformAdapter::local();
        assert_eq!(adapter.rand(48).unwrap().len(), 48);
        let arr: [u8; 24] = adapter.rand_array().unwrap();
        assert_eq!(arr.len(), 24);
    }

    #[test]
    fn local_rand_is_not_constant() {
        let adapter = PlatformAdapter::local();
        let a = adapter.rand(32).unwrap();
        let b = adapter.rand(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn local_attestation_is_placeholder() {
        let adapter = PlatformAdapter::local();
        let doc = adapter
            .attestation_document(b"pubkey", Some(b"nonce"), None)
            .unwrap();
        assert_eq!(doc, LOCAL_MODE_DOCUMENT);
    }

    #[test]
    fn platform_rng_fills() {
        let adapter = PlatformAdapter::local();
        let mut rng = PlatformRng::new(&adapter);
        let mut buf = [0u8; 16];
        rng.fill_bytes(&mut buf);
        assert_ne!(buf, [0u8; 16]);
        let _ = rng.next_u64();
    }
}
