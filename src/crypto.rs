//! Token encryption module using AES-256-GCM
//!
//! Mailbox access and refresh tokens are encrypted at rest. Each ciphertext is
//! bound to its owner through additional authenticated data (`user_id|email`),
//! so a row copied onto another account fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::mailbox_account::Model as MailboxAccountModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // version || nonce || ciphertext+tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

fn account_aad(user_id: &Uuid, email: &str) -> String {
    format!("{}|{}", user_id, email)
}

/// Type alias for encrypted token result
type EncryptedTokens = Result<(Vec<u8>, Option<Vec<u8>>), CryptoError>;

/// Encrypt the token pair for a mailbox account
pub fn encrypt_mailbox_tokens(
    key: &CryptoKey,
    user_id: &Uuid,
    email: &str,
    access_token: &str,
    refresh_token: Option<&str>,
) -> EncryptedTokens {
    let aad = account_aad(user_id, email);

    let encrypted_access_token = encrypt_bytes(key, aad.as_bytes(), access_token.as_bytes())?;
    let encrypted_refresh_token = refresh_token
        .map(|token| encrypt_bytes(key, aad.as_bytes(), token.as_bytes()))
        .transpose()?;

    Ok((encrypted_access_token, encrypted_refresh_token))
}

/// Type alias for decrypted token result
type DecryptedTokens = Result<(String, Option<String>), CryptoError>;

/// Decrypt the token pair stored on a mailbox account
pub fn decrypt_mailbox_tokens(key: &CryptoKey, account: &MailboxAccountModel) -> DecryptedTokens {
    let aad = account_aad(&account.user_id, &account.email);

    let decrypt_string = |ciphertext: &[u8]| {
        decrypt_bytes(key, aad.as_bytes(), ciphertext).and_then(|bytes| {
            String::from_utf8(bytes)
                .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
        })
    };

    let access_token = decrypt_string(&account.access_token_ciphertext)?;
    let refresh_token = account
        .refresh_token_ciphertext
        .as_deref()
        .map(decrypt_string)
        .transpose()?;

    Ok((access_token, refresh_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    fn sample_account(key: &CryptoKey, refresh: Option<&str>) -> MailboxAccountModel {
        let user_id = Uuid::new_v4();
        let email = "buyer@example.com".to_string();
        let (access, refresh) =
            encrypt_mailbox_tokens(key, &user_id, &email, "access-token", refresh)
                .expect("encryption succeeds");

        MailboxAccountModel {
            user_id,
            email,
            access_token_ciphertext: access,
            refresh_token_ciphertext: refresh,
            expires_at: None,
            scope: None,
            last_history_id: None,
            last_sync_at: None,
            watch_expiration: None,
            watch_history_id: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad", b"secret message").expect("encrypts");
        let decrypted = decrypt_bytes(&key, b"aad", &encrypted).expect("decrypts");

        assert_eq!(decrypted, b"secret message");
    }

    #[test]
    fn test_different_aad_fails() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad-1", b"secret").expect("encrypts");

        assert!(decrypt_bytes(&key, b"aad-2", &encrypted).is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret message").expect("encrypts");
        encrypted[13] ^= 0x01;

        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key();
        let first = encrypt_bytes(&key, b"aad", b"secret").expect("encrypts");
        let second = encrypt_bytes(&key, b"aad", b"secret").expect("encrypts");

        assert_ne!(&first[1..13], &second[1..13]);
    }

    #[test]
    fn test_unversioned_payload_rejected() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"aad", b"plaintext-token-of-some-length!!");

        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_insufficient_ciphertext_length() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"aad", &[VERSION_ENCRYPTED, 0x02]);

        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_mailbox_tokens_roundtrip() {
        let key = test_key();
        let account = sample_account(&key, Some("refresh-token"));

        let (access, refresh) = decrypt_mailbox_tokens(&key, &account).expect("decrypts");
        assert_eq!(access, "access-token");
        assert_eq!(refresh.as_deref(), Some("refresh-token"));
    }

    #[test]
    fn test_mailbox_tokens_bound_to_owner() {
        let key = test_key();
        let mut account = sample_account(&key, None);
        account.email = "someone-else@example.com".to_string();

        assert!(decrypt_mailbox_tokens(&key, &account).is_err());
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }
}
