//! Attestation-document verification.
//!
//! A document is a COSE_Sign1 envelope whose payload carries the platform
//! measurements, a certificate chain, and the bytes the enclave asked the
//! platform to commit to (public key, nonce). Verification runs eight
//! ordered steps; the first failure aborts with the step number and name,
//! so the outcome is always total: fully verified or failed-at-step.

use chrono::{DateTime, TimeZone, Utc};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::time::Duration;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{Error, Result};

/// AWS Nitro Enclaves root certificate, the default trust anchor for
/// attestation certificate chains.
/// See <https://docs.aws.amazon.com/enclaves/latest/user/verify-root.html>.
const AWS_NITRO_ROOT_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIICETCCAZagAwIBAgIRAPkxdWgbkK/hHUbMtOTn+FYwCgYIKoZIzj0EAwMwSTEL
MAkGA1UEBhMCVVMxDzANBgNVBAoMBkFtYXpvbjEMMAoGA1UECwwDQVdTMRswGQYD
VQQDDBJhd3Mubml0cm8tZW5jbGF2ZXMwHhcNMTkxMDI4MTMyODA1WhcNNDkxMDI4
MTQyODA1WjBJMQswCQYDVQQGEwJVUzEPMA0GA1UECgwGQW1hem9uMQwwCgYDVQQL
DANBV1MxGzAZBgNVBAMMEmF3cy5uaXRyby1lbmNsYXZlczB2MBAGByqGSM49AgEG
BSuBBAAiA2IABPwCVOumCMHzaHDimtqQvkY4MpJzbolL//Zy2YlES1BR5TSksfbb
48C8WBoyt7F2Bw7eEtaaP+ohG2bnUs990d0JX28TcPQXCEPZ3BABIeTPYwEoCWZE
h8l5YoQwTcU/9KNCMEAwDwYDVR0TAQH/BAUwAwEB/zAdBgNVHQ4EFgQUkCW1DdkF
R+eWw5b6cp3PmanfS5YwDgYDVR0PAQH/BAQDAgGGMAoGCCqGSM49BAMDA2kAMGYC
MQCjfy+Rocm9Xue4YnwWmNJVA44fA0P5W2OpYow9OYCVRaEevL8uO1XYru5xtMPW
rfMCMQCi85sWBbJwKKXdS6BptQFuZbT73o/gBh1qUxl/nNr12UO8Yfwr6wPLb+6N
IwLz3/Y=
-----END CERTIFICATE-----";

const OID_EC_P256: &str = "1.2.840.10045.3.1.7";
const OID_EC_P384: &str = "1.3.132.0.34";

/// The inner attestation document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub module_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub digest: String,
    pub pcrs: BTreeMap<u32, ByteBuf>,
    /// Leaf certificate, DER.
    pub certificate: ByteBuf,
    /// Intermediate bundle, root first, DER.
    pub cabundle: Vec<ByteBuf>,
    #[serde(default)]
    pub public_key: Option<ByteBuf>,
    #[serde(default)]
    pub user_data: Option<ByteBuf>,
    #[serde(default)]
    pub nonce: Option<ByteBuf>,
}

/// COSE_Sign1: `[protected, unprotected, payload, signature]`.
#[derive(Debug, Deserialize)]
struct CoseSign1(ByteBuf, #[allow(dead_code)] Value, ByteBuf, ByteBuf);

/// Verifier configuration.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Expected PCR values, hex-encoded, by register index.
    pub expected_pcrs: BTreeMap<u32, String>,
    /// Whether to enforce PCR equality (step 8). Off for development
    /// builds whose measurements change constantly, on in production.
    pub verify_pcrs: bool,
    /// Maximum accepted document age.
    pub max_attestation_age: Duration,
    /// Replacement trust anchor (DER); defaults to the pinned AWS root.
    pub root_certificate_der: Option<Vec<u8>>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            expected_pcrs: BTreeMap::new(),
            verify_pcrs: false,
            max_attestation_age: Duration::from_secs(5 * 60),
            root_certificate_der: None,
        }
    }
}

/// A fully verified document plus the audit trail of completed steps.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub document: AttestationDocument,
    pub timestamp: DateTime<Utc>,
    pub verified_steps: Vec<&'static str>,
}

/// Runs the eight verification steps against `raw` (the CBOR document).
/// `expected_nonce` is the nonce supplied at session init and
/// `expected_public_key` the enclave ephemeral key from the same response.
pub fn verify(
    raw: &[u8],
    expected_nonce: &[u8],
    expected_public_key: &[u8],
    config: &VerifierConfig,
) -> Result<VerificationResult> {
    let mut steps: Vec<&'static str> = Vec::with_capacity(8);

    // Step 1: outer COSE_Sign1 structure.
    let cose: CoseSign1 = ciborium::de::from_reader(raw)
        .map_err(|e| step_error(1, "cose_sign1", format!("CBOR decode failed: {e}")))?;
    steps.push("cose_sign1_decoded");

    // Step 2: inner attestation document.
    let document: AttestationDocument = ciborium::de::from_reader(cose.2.as_slice())
        .map_err(|e| step_error(2, "document", format!("payload decode failed: {e}")))?;
    steps.push("document_decoded");

    // Step 3: certificate chain up to the trust anchor.
    let root_der = match &config.root_certificate_der {
        Some(der) => der.clone(),
        None => pinned_root_der()?,
    };
    verify_certificate_chain(&document.certificate, &document.cabundle, &root_der)
        .map_err(|reason| step_error(3, "certificate_chain", reason))?;
    steps.push("certificate_chain_verified");

    // Step 4: COSE signature against the leaf key.
    verify_cose_signature(&cose, &document.certificate)
        .map_err(|reason| step_error(4, "cose_signature", reason))?;
    steps.push("cose_signature_verified");

    // Step 5: freshness.
    let timestamp = Utc
        .timestamp_millis_opt(document.timestamp as i64)
        .single()
        .ok_or_else(|| step_error(5, "timestamp", "timestamp out of range".into()))?;
    let age = Utc::now() - timestamp;
    if age > chrono::Duration::from_std(config.max_attestation_age).unwrap_or(chrono::Duration::minutes(5)) {
        return Err(step_error(
            5,
            "timestamp",
            format!("document is {}s old", age.num_seconds()),
        ));
    }
    steps.push("timestamp_verified");

    // Step 6: nonce binding.
    let doc_nonce = document.nonce.as_deref().map(|v| v.as_slice()).unwrap_or_default();
    if doc_nonce != expected_nonce {
        return Err(step_error(6, "nonce", "nonce mismatch".into()));
    }
    steps.push("nonce_verified");

    // Step 7: public-key binding.
    let doc_key = document.public_key.as_deref().map(|v| v.as_slice()).unwrap_or_default();
    if doc_key != expected_public_key {
        return Err(step_error(7, "public_key", "public key mismatch".into()));
    }
    steps.push("public_key_verified");

    // Step 8: PCR measurements.
    if config.verify_pcrs && !config.expected_pcrs.is_empty() {
        verify_pcrs(&document.pcrs, &config.expected_pcrs)
            .map_err(|reason| step_error(8, "pcrs", reason))?;
        steps.push("pcrs_verified");
    }

    Ok(VerificationResult {
        timestamp,
        document,
        verified_steps: steps,
    })
}

fn step_error(step: u8, name: &'static str, reason: String) -> Error {
    Error::AttestationStep { step, name, reason }
}

fn pinned_root_der() -> Result<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(AWS_NITRO_ROOT_CA_PEM.as_bytes())
        .map_err(|e| Error::Attestation(format!("pinned root PEM invalid: {e}")))?;
    Ok(pem.contents)
}

/// Walks leaf → intermediates → anchor. The bundle arrives root-first, so
/// it is traversed in reverse; the terminal certificate must be byte-equal
/// to the trust anchor. Every certificate must be inside its validity
/// window and carry a signature its issuer verifies.
fn verify_certificate_chain(
    leaf_der: &[u8],
    cabundle: &[ByteBuf],
    root_der: &[u8],
) -> std::result::Result<(), String> {
    if cabundle.is_empty() {
        return Err("empty certificate bundle".into());
    }

    let mut chain_der: Vec<&[u8]> = Vec::with_capacity(cabundle.len() + 1);
    chain_der.push(leaf_der);
    chain_der.extend(cabundle.iter().rev().map(|c| c.as_slice()));

    let parsed: Vec<X509Certificate<'_>> = chain_der
        .iter()
        .enumerate()
        .map(|(i, der)| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| format!("certificate {i} parse failed: {e}"))
        })
        .collect::<std::result::Result<_, _>>()?;

    for (i, cert) in parsed.iter().enumerate() {
        if !cert.validity().is_valid() {
            return Err(format!("certificate {i} outside its validity window"));
        }
    }

    for i in 0..parsed.len() - 1 {
        let issuer = &parsed[i + 1];
        parsed[i]
            .verify_signature(Some(issuer.public_key()))
            .map_err(|e| format!("certificate {i} not signed by its issuer: {e}"))?;
        if parsed[i].issuer() != issuer.subject() {
            return Err(format!("certificate {i} issuer does not match the chain"));
        }
    }

    let anchor = chain_der.last().expect("chain is non-empty");
    if *anchor != root_der {
        return Err("chain does not terminate at the trust anchor".into());
    }
    let root = parsed.last().expect("chain is non-empty");
    root.verify_signature(Some(root.public_key()))
        .map_err(|e| format!("trust anchor self-signature invalid: {e}"))?;

    Ok(())
}

/// Rebuilds `Sig_structure = ["Signature1", protected, '', payload]` and
/// verifies the ECDSA signature against the leaf key. The curve picks the
/// digest (P-256/SHA-256 or P-384/SHA-384); both ASN.1 and raw `r||s`
/// signature encodings are accepted.
fn verify_cose_signature(
    cose: &CoseSign1,
    leaf_der: &[u8],
) -> std::result::Result<(), String> {
    let (_, leaf) =
        X509Certificate::from_der(leaf_der).map_err(|e| format!("leaf parse failed: {e}"))?;
    let spki = leaf.public_key();

    let curve_oid = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|p| p.as_oid().ok())
        .map(|oid| oid.to_id_string())
        .ok_or_else(|| "leaf public key has no named curve".to_string())?;
    let (asn1_alg, fixed_alg): (
        &'static ring::signature::EcdsaVerificationAlgorithm,
        &'static ring::signature::EcdsaVerificationAlgorithm,
    ) = match curve_oid.as_str() {
        OID_EC_P256 => (
            &ring::signature::ECDSA_P256_SHA256_ASN1,
            &ring::signature::ECDSA_P256_SHA256_FIXED,
        ),
        OID_EC_P384 => (
            &ring::signature::ECDSA_P384_SHA384_ASN1,
            &ring::signature::ECDSA_P384_SHA384_FIXED,
        ),
        other => return Err(format!("unsupported leaf curve: {other}")),
    };

    let sig_structure = (
        "Signature1",
        ByteBuf::from(cose.0.to_vec()),
        ByteBuf::new(),
        ByteBuf::from(cose.2.to_vec()),
    );
    let mut message = Vec::new();
    ciborium::ser::into_writer(&sig_structure, &mut message)
        .map_err(|e| format!("Sig_structure encoding failed: {e}"))?;

    let point = spki.subject_public_key.data.as_ref();
    let signature = cose.3.as_slice();

    let asn1 = ring::signature::UnparsedPublicKey::new(asn1_alg, point);
    if asn1.verify(&message, signature).is_ok() {
        return Ok(());
    }
    let fixed = ring::signature::UnparsedPublicKey::new(fixed_alg, point);
    fixed
        .verify(&message, signature)
        .map_err(|_| "ECDSA signature verification failed".to_string())
}

fn verify_pcrs(
    actual: &BTreeMap<u32, ByteBuf>,
    expected: &BTreeMap<u32, String>,
) -> std::result::Result<(), String> {
    for (index, expected_hex) in expected {
        let expected_bytes = hex::decode(expected_hex)
            .map_err(|e| format!("expected PCR {index} is not valid hex: {e}"))?;
        let actual_bytes = actual
            .get(index)
            .ok_or_else(|| format!("PCR {index} missing from document"))?;
        if actual_bytes.as_slice() != expected_bytes.as_slice() {
            return Err(format!("PCR {index} mismatch"));
        }
    }
    Ok(())
}
