use super::aead::{self, AeadKey, Region, SALT_LEN};
use super::keybag::Keybag;
use crate::error::{IbxError, Result};
use std::fmt;

/// Live decryption context of one unlocked backup. Never serialized.
#[derive(Clone)]
pub struct KeyContext {
    sealed: Option<(AeadKey, [u8; SALT_LEN])>,
}

impl KeyContext {
    /// Context for bundles stored without encryption.
    pub fn plain() -> Self {
        Self { sealed: None }
    }

    pub fn sealed(key: AeadKey, salt: [u8; SALT_LEN]) -> Self {
        Self {
            sealed: Some((key, salt)),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealed.is_some()
    }

    pub(crate) fn material(&self) -> Option<(&AeadKey, &[u8; SALT_LEN])> {
        self.sealed.as_ref().map(|(k, s)| (k, s))
    }
}

impl fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyContext")
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

/// Cryptographic capability behind unlock and blob reads.
pub trait Decryptor: Send + Sync {
    /// `keybag` is `None` for unencrypted bundles.
    fn derive_context(&self, keybag: Option<&[u8]>, password: &str) -> Result<KeyContext>;

    fn decrypt_blob(
        &self,
        ctx: &KeyContext,
        region: Region,
        ciphertext: &[u8],
        file_ref: &str,
    ) -> Result<Vec<u8>>;
}

/// Argon2id-wrapped keybag with XChaCha20-Poly1305 sealed blobs.
#[derive(Default, Clone, Copy)]
pub struct SealedBundleCrypto;

impl Decryptor for SealedBundleCrypto {
    fn derive_context(&self, keybag: Option<&[u8]>, password: &str) -> Result<KeyContext> {
        match keybag {
            None => Ok(KeyContext::plain()),
            Some(bytes) => {
                let bag = Keybag::from_cbor(bytes)?;
                let key = bag.unlock(password)?;
                Ok(KeyContext::sealed(key, bag.salt))
            }
        }
    }

    fn decrypt_blob(
        &self,
        ctx: &KeyContext,
        region: Region,
        ciphertext: &[u8],
        file_ref: &str,
    ) -> Result<Vec<u8>> {
        match ctx.material() {
            None => Ok(ciphertext.to_vec()),
            Some((key, salt)) => aead::open(key, salt, region, file_ref, ciphertext),
        }
    }
}

pub(crate) fn seal_with(
    ctx: &KeyContext,
    region: Region,
    file_ref: &str,
    plaintext: Vec<u8>,
) -> Result<Vec<u8>> {
    match ctx.material() {
        None => Ok(plaintext),
        Some((key, salt)) => aead::seal(key, salt, region, file_ref, &plaintext),
    }
}
