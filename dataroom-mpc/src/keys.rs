//! Coordinator key material for the masking-noise envelope.
//!
//! Participants encrypt their masking noise under the coordinator's public
//! key with RSA-OAEP (SHA-256); only the coordinator can strip the noise back
//! out of the reconstructed total.

use std::fmt;
use std::path::Path;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// Environment variable holding the coordinator private key as PEM.
pub const PRIVATE_KEY_ENV: &str = "DATAROOM_MPC_PRIVATE_KEY_PEM";

#[derive(Clone)]
pub struct CoordinatorKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl fmt::Debug for CoordinatorKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl CoordinatorKeyPair {
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|err| KeyError::Generation(err.to_string()))?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let private = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(pkcs8) => RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|_| KeyError::InvalidPrivateKey(pkcs8.to_string()))?,
        };
        Ok(Self::from_private(private))
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem(&pem)
    }

    /// Reads [`PRIVATE_KEY_ENV`]; `Ok(None)` when it is unset.
    pub fn from_env() -> Result<Option<Self>, KeyError> {
        match std::env::var(PRIVATE_KEY_ENV) {
            Ok(pem) => Self::from_pem(&pem).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn private_key_pem(&self) -> Result<String, KeyError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_owned())
            .map_err(|err| KeyError::InvalidPrivateKey(err.to_string()))
    }

    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeyError::InvalidPublicKey(err.to_string()))
    }

    /// SHA-256 over the DER public key, hex encoded. Empty if encoding fails.
    pub fn fingerprint(&self) -> String {
        self.public
            .to_public_key_der()
            .map(|der| hex::encode(Sha256::digest(der.as_bytes())))
            .unwrap_or_default()
    }

    pub fn decrypt_number(&self, ciphertext: &[u8]) -> Result<f64, KeyError> {
        decrypt_number(&self.private, ciphertext)
    }
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|err| KeyError::InvalidPublicKey(err.to_string()))
}

/// Encrypts the big-endian bytes of `value`.
pub fn encrypt_number(public: &RsaPublicKey, value: f64) -> Result<Vec<u8>, KeyError> {
    public
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<Sha256>(),
            &value.to_be_bytes(),
        )
        .map_err(|err| KeyError::Encrypt(err.to_string()))
}

pub fn decrypt_number(private: &RsaPrivateKey, ciphertext: &[u8]) -> Result<f64, KeyError> {
    let plain = private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|err| KeyError::Decrypt(err.to_string()))?;
    let bytes: [u8; 8] = plain
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::Payload(plain.len()))?;
    Ok(f64::from_be_bytes(bytes))
}
