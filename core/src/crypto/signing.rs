//! Signing provider
//!
//! Loads the ed25519 signing key and the certificate once and keeps them for
//! the lifetime of the process. The key is never logged and never written
//! anywhere by this crate. The provider is immutable after construction, so a
//! single instance behind an `Arc` is shared by all signing threads.

use std::fmt;
use std::fs;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::SigningConfig;
use crate::error::{to_signing_error, CoreError, Result};

/// Algorithm identifier carried in signature infos
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Metadata identifying the key that produced a signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub verification_key_id: String,
    pub verification_key_version: String,
    pub signature_algorithm: String,
}

/// Holds the private key and certificate used for every published signature
pub struct SigningProvider {
    key: SigningKey,
    certificate: Vec<u8>,
    info: SignatureInfo,
}

impl SigningProvider {
    /// Load key material as described by the configuration.
    ///
    /// A PEM key file takes precedence over a seed. Without a certificate path
    /// the public key is published as a PEM encoded SubjectPublicKeyInfo.
    pub fn from_config(config: &SigningConfig) -> Result<Self> {
        let key = if let Some(path) = &config.private_key_path {
            let pem = fs::read_to_string(path).map_err(|e| {
                CoreError::SigningError(format!("Cannot read private key {}: {}", path.display(), e))
            })?;
            SigningKey::from_pkcs8_pem(&pem).map_err(to_signing_error)?
        } else if let Some(seed) = &config.private_key_seed {
            Self::key_from_seed_base64(seed)?
        } else {
            return Err(CoreError::SigningError(
                "No private key configured".to_string(),
            ));
        };

        let certificate = match &config.certificate_path {
            Some(path) => fs::read(path).map_err(|e| {
                CoreError::SigningError(format!("Cannot read certificate {}: {}", path.display(), e))
            })?,
            None => key
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(to_signing_error)?
                .into_bytes(),
        };

        let provider = Self::new(
            key,
            certificate,
            &config.verification_key_id,
            &config.verification_key_version,
        );
        info!(
            "Loaded signing key {} version {}",
            provider.info.verification_key_id, provider.info.verification_key_version
        );
        Ok(provider)
    }

    pub fn new(key: SigningKey, certificate: Vec<u8>, key_id: &str, key_version: &str) -> Self {
        SigningProvider {
            key,
            certificate,
            info: SignatureInfo {
                verification_key_id: key_id.to_string(),
                verification_key_version: key_version.to_string(),
                signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
            },
        }
    }

    /// Build a provider from a raw seed, publishing the public key PEM as certificate
    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH], key_id: &str, key_version: &str) -> Result<Self> {
        let key = SigningKey::from_bytes(&seed);
        let certificate = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(to_signing_error)?
            .into_bytes();
        Ok(Self::new(key, certificate, key_id, key_version))
    }

    fn key_from_seed_base64(seed: &str) -> Result<SigningKey> {
        let bytes = STANDARD.decode(seed.trim()).map_err(to_signing_error)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            CoreError::SigningError(format!(
                "Seed must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                b.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Sign a payload. Ed25519 signatures are deterministic.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self.key.try_sign(payload).map_err(to_signing_error)?;
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a signature produced by this provider
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        verify_with(&self.verifying_key(), payload, signature)
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn signature_info(&self) -> &SignatureInfo {
        &self.info
    }
}

impl fmt::Debug for SigningProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningProvider")
            .field("key", &"<redacted>")
            .field("info", &self.info)
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

/// Verify a signature against a raw ed25519 public key
pub fn verify_with(public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(payload, &signature).is_ok()
}
