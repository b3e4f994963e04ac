//! Encryption Services Module
//!
//! Two separate concerns live here. One-way primitives (Argon2id password
//! hashing, token digests, HMAC token signatures) are for credentials and
//! tokens. Reversible data protection uses AES-256-GCM authenticated
//! encryption and requires a configured key.

use crate::errors::{SecurityError, SecurityResult};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::{
    engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use gradmesh_shared::SecurityConfig;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// AES-256 key size in bytes
pub const AES_KEY_SIZE: usize = 32;
/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;
/// Default random token size in bytes
pub const DEFAULT_TOKEN_BYTES: usize = 32;

/// Key material, zeroized on drop
struct SecretKey(Vec<u8>);

impl Zeroize for SecretKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for SecretKey {}

/// Ciphertext with the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext including the GCM tag
    pub ciphertext: String,
}

/// Encryption manager
pub struct EncryptionManager {
    data_key: Option<SecretKey>,
    signing_key: SecretKey,
    min_password_length: usize,
}

impl EncryptionManager {
    /// Build from configuration; the data key is optional but must be valid when present
    pub fn new(config: &SecurityConfig) -> SecurityResult<Self> {
        let data_key = match &config.encryption_key {
            Some(encoded) => {
                let key = BASE64_STANDARD.decode(encoded.trim())?;
                if key.len() != AES_KEY_SIZE {
                    return Err(SecurityError::InvalidKeyFormat(format!(
                        "expected {} bytes, got {}",
                        AES_KEY_SIZE,
                        key.len()
                    )));
                }
                Some(SecretKey(key))
            }
            None => None,
        };

        // Signing keys derive from the data key so signatures survive restarts
        let signing_key = match &data_key {
            Some(key) => {
                let mut hasher = Sha256::new();
                hasher.update(b"gradmesh-token-signing");
                hasher.update(&key.0);
                SecretKey(hasher.finalize().to_vec())
            }
            None => SecretKey(random_bytes(AES_KEY_SIZE)),
        };

        Ok(Self {
            data_key,
            signing_key,
            min_password_length: config.min_password_length,
        })
    }

    /// Generate a fresh base64-encoded AES-256 key
    pub fn generate_key() -> String {
        BASE64_STANDARD.encode(random_bytes(AES_KEY_SIZE))
    }

    pub fn is_encryption_configured(&self) -> bool {
        self.data_key.is_some()
    }

    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }

    /// Check a candidate password against the password policy
    pub fn validate_password(&self, password: &str) -> SecurityResult<()> {
        if password.chars().count() < self.min_password_length {
            return Err(SecurityError::PasswordPolicy(format!(
                "must be at least {} characters",
                self.min_password_length
            )));
        }
        let has_upper = password.chars().any(|c| c.is_uppercase());
        let has_lower = password.chars().any(|c| c.is_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        if !(has_upper && has_lower && has_digit) {
            return Err(SecurityError::PasswordPolicy(
                "must mix upper case, lower case and digits".to_string(),
            ));
        }
        Ok(())
    }

    /// Hash a password using Argon2id after enforcing the policy
    pub fn hash_password(&self, password: &str) -> SecurityResult<String> {
        self.validate_password(password)?;
        let salt = argon2::password_hash::SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    /// Verify a password against a PHC-formatted hash
    pub fn verify_password(&self, password: &str, hash: &str) -> SecurityResult<bool> {
        let parsed = PasswordHash::new(hash)?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// URL-safe random token
    pub fn generate_token(&self, bytes: usize) -> String {
        URL_SAFE_NO_PAD.encode(random_bytes(bytes))
    }

    /// Hex SHA-256 digest for storing tokens at rest
    pub fn token_digest(&self, token: &str) -> String {
        Sha256::digest(token.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// HMAC-SHA256 signature of a token, URL-safe encoded
    pub fn sign_token(&self, token: &str) -> SecurityResult<String> {
        let mut mac = self.mac()?;
        mac.update(token.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time signature check
    pub fn verify_token_signature(&self, token: &str, signature: &str) -> SecurityResult<()> {
        let expected = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SecurityError::InvalidTokenSignature)?;
        let mut mac = self.mac()?;
        mac.update(token.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SecurityError::InvalidTokenSignature)
    }

    /// Seal plaintext with AES-256-GCM under a fresh nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> SecurityResult<EncryptedData> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        Ok(EncryptedData {
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    /// Open data sealed by [`EncryptionManager::encrypt`]
    pub fn decrypt(&self, encrypted: &EncryptedData) -> SecurityResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce_bytes = BASE64_STANDARD
            .decode(&encrypted.nonce)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(SecurityError::Decryption("invalid nonce length".to_string()));
        }
        let ciphertext = BASE64_STANDARD
            .decode(&encrypted.ciphertext)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| SecurityError::Decryption(e.to_string()))
    }

    /// Encrypt a string into a single base64 blob of nonce and ciphertext
    pub fn encrypt_string(&self, plaintext: &str) -> SecurityResult<String> {
        let sealed = self.encrypt(plaintext.as_bytes())?;
        let mut blob = BASE64_STANDARD.decode(&sealed.nonce)?;
        blob.extend(BASE64_STANDARD.decode(&sealed.ciphertext)?);
        Ok(BASE64_STANDARD.encode(blob))
    }

    pub fn decrypt_string(&self, blob: &str) -> SecurityResult<String> {
        let bytes = BASE64_STANDARD
            .decode(blob)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;
        if bytes.len() <= NONCE_SIZE {
            return Err(SecurityError::Decryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self.decrypt(&EncryptedData {
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })?;
        String::from_utf8(plaintext).map_err(|e| SecurityError::Decryption(e.to_string()))
    }

    fn cipher(&self) -> SecurityResult<Aes256Gcm> {
        let key = self.data_key.as_ref().ok_or(SecurityError::KeyNotConfigured)?;
        Aes256Gcm::new_from_slice(&key.0).map_err(|e| SecurityError::InvalidKeyFormat(e.to_string()))
    }

    fn mac(&self) -> SecurityResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.signing_key.0)
            .map_err(|e| SecurityError::Configuration(e.to_string()))
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
