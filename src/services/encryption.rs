use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;

use crate::db::{ProgressStore, StoreError};
use crate::models::BotId;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing of bot tokens at rest.
///
/// Stored form is base64 of `nonce (12 bytes) || ciphertext`.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Seal a plaintext token for storage.
    pub fn encrypt_token(&self, token: &str) -> Result<String, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut sealed = nonce.to_vec();
        sealed.extend(ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Open a stored token.
    pub fn decrypt_token(&self, sealed: &str) -> Result<String, EncryptionError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|_| EncryptionError::DecryptFailed)?;

        if data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}

/// Resolves the plaintext credential a job pings with.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential(&self, bot_id: BotId) -> Result<String, CredentialError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Bot {0} has no usable credential")]
    Missing(BotId),

    #[error("Stored credential for bot {0} could not be decrypted")]
    Undecryptable(BotId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CredentialError::Store(_))
    }
}

/// Reads `bots.token_encrypted` and opens it.
pub struct EncryptedCredentials {
    store: Arc<dyn ProgressStore>,
    encryption: Arc<EncryptionService>,
}

impl EncryptedCredentials {
    pub fn new(store: Arc<dyn ProgressStore>, encryption: Arc<EncryptionService>) -> Self {
        Self { store, encryption }
    }
}

#[async_trait]
impl CredentialSource for EncryptedCredentials {
    async fn credential(&self, bot_id: BotId) -> Result<String, CredentialError> {
        let sealed = self
            .store
            .bot_token(bot_id)
            .await?
            .ok_or(CredentialError::Missing(bot_id))?;

        self.encryption
            .decrypt_token(&sealed)
            .map_err(|_| CredentialError::Undecryptable(bot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            EncryptionService::new("c2hvcnQ="),
            Err(EncryptionError::InvalidKey)
        ));
    }

    #[test]
    fn test_sealed_token_opens_with_same_key() {
        let service = EncryptionService::new(KEY).unwrap();
        let sealed = service.encrypt_token("123456:ABC-DEF").unwrap();
        assert_ne!(sealed, "123456:ABC-DEF");
        assert_eq!(service.decrypt_token(&sealed).unwrap(), "123456:ABC-DEF");
    }

    #[test]
    fn test_tampered_token_fails() {
        let service = EncryptionService::new(KEY).unwrap();
        assert!(service.decrypt_token("bm90IGEgc2VhbGVkIHRva2VuIGF0IGFsbA==").is_err());
        assert!(service.decrypt_token("%%%").is_err());
    }

    #[tokio::test]
    async fn test_credentials_resolve_from_store() {
        let encryption = Arc::new(EncryptionService::new(KEY).unwrap());
        let store = Arc::new(MemoryStore::new());
        store.register_bot(7, encryption.encrypt_token("7:secret").unwrap());
        store.register_bot(8, "garbage");

        let credentials = EncryptedCredentials::new(store.clone(), encryption);
        assert_eq!(credentials.credential(7).await.unwrap(), "7:secret");
        assert!(matches!(
            credentials.credential(8).await,
            Err(CredentialError::Undecryptable(8))
        ));
        assert!(matches!(credentials.credential(9).await, Err(CredentialError::Missing(9))));
    }
}
