//! Artifact verification.
//!
//! The verification discipline is deliberately narrow: size cap first,
//! then SHA-256 against the digest the manifest carried, then (when the
//! deployment signs) RSA-PKCS#1 v1.5 over that digest. Inputs come from
//! the manifest read in the same orchestration cycle, never from the
//! artifact itself or any side-file fetched next to it: a co-located
//! checksum file is an open tamper window.

use anyhow::{Context, Result};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("artifact is {size} bytes, over the {limit}-byte bound")]
    TooLarge { size: u64, limit: u64 },
    #[error("digest mismatch: manifest says {expected}, artifact hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("artifact signature does not verify")]
    SignatureInvalid,
    #[error("signature required but the manifest entry carries none")]
    SignatureMissing,
}

/// Stateless verifier configured once from the agent config.
pub struct Verifier {
    max_artifact_size: u64,
    signature_required: bool,
    public_key: Option<RsaPublicKey>,
}

impl Verifier {
    /// Build a verifier. `public_key_pem` accepts both SPKI
    /// (`BEGIN PUBLIC KEY`) and PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM.
    pub fn new(
        max_artifact_size: u64,
        signature_required: bool,
        public_key_pem: Option<&str>,
    ) -> Result<Self> {
        let public_key = match public_key_pem {
            Some(pem) => Some(parse_public_key(pem)?),
            None => None,
        };
        if signature_required && public_key.is_none() {
            anyhow::bail!("signature_required is set but no signing public key is configured");
        }

        Ok(Self {
            max_artifact_size,
            signature_required,
            public_key,
        })
    }

    /// Whether an update can be rejected before its artifact is even
    /// fetched: signatures are mandatory and this entry has none.
    pub fn rejects_unsigned(&self, signature: Option<&str>) -> bool {
        self.signature_required && signature.is_none()
    }

    /// Verify `bytes` against the manifest-supplied digest and optional
    /// signature.
    pub fn verify(
        &self,
        bytes: &[u8],
        expected_sha256: &str,
        signature_b64: Option<&str>,
    ) -> Result<(), VerifyError> {
        if bytes.len() as u64 > self.max_artifact_size {
            return Err(VerifyError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_artifact_size,
            });
        }

        let digest = Sha256::digest(bytes);
        let actual = hex::encode(digest);
        if actual != expected_sha256.to_ascii_lowercase() {
            return Err(VerifyError::DigestMismatch {
                expected: expected_sha256.to_ascii_lowercase(),
                actual,
            });
        }

        if let (Some(signature_b64), Some(key)) = (signature_b64, &self.public_key) {
            let signature = base64::engine::general_purpose::STANDARD
                .decode(signature_b64)
                .map_err(|_| VerifyError::SignatureInvalid)?;
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
                .map_err(|_| VerifyError::SignatureInvalid)?;
        } else if self.signature_required {
            return Err(VerifyError::SignatureMissing);
        }

        Ok(())
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .context("failed to parse signing public key PEM")
}
