// ABOUTME: Cipher capability for credential blobs at rest.
// ABOUTME: The core treats encryption as opaque; a plaintext variant exists for dev.

use async_trait::async_trait;

use crate::error::CipherError;

/// Encrypts and decrypts session credential blobs.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    async fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Identity cipher. Stores credentials as given; for local runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

#[async_trait]
impl Cipher for PlaintextCipher {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    async fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(blob.to_vec())
    }
}
