use crate::error::{IbxError, Result};
use blake3::Hasher;
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroizing;

pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 32;

/// Raw 32-byte backup key, wiped on drop.
#[derive(Clone)]
pub struct AeadKey(Zeroizing<[u8; 32]>);

impl AeadKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

/// Static region IDs (domain separation)
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    Keybag = 1,
    Manifest = 2,
    Blob = 3,
}

/// nonce = blake3(salt || region || file_ref).take(24)
pub fn derive_nonce(salt: &[u8; SALT_LEN], region: Region, file_ref: &str) -> XNonce {
    let mut h = Hasher::new();
    h.update(salt);
    h.update(&[region as u8]);
    h.update(file_ref.as_bytes());
    let out = h.finalize();
    XNonce::from_slice(&out.as_bytes()[..24]).to_owned()
}

/// Seal one buffer; `file_ref` is both nonce input and associated data.
pub fn seal(
    key: &AeadKey,
    salt: &[u8; SALT_LEN],
    region: Region,
    file_ref: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let aead = XChaCha20Poly1305::new(Key::from_slice(&key.0[..]));
    let nonce = derive_nonce(salt, region, file_ref);
    aead.encrypt(
        &nonce,
        Payload {
            msg: plaintext,
            aad: file_ref.as_bytes(),
        },
    )
    .map_err(|_| IbxError::format(format!("sealing {file_ref} failed")))
}

pub fn open(
    key: &AeadKey,
    salt: &[u8; SALT_LEN],
    region: Region,
    file_ref: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(IbxError::DecryptionFailed(format!(
            "{file_ref}: ciphertext shorter than tag"
        )));
    }
    let aead = XChaCha20Poly1305::new(Key::from_slice(&key.0[..]));
    let nonce = derive_nonce(salt, region, file_ref);
    aead.decrypt(
        &nonce,
        Payload {
            msg: ciphertext,
            aad: file_ref.as_bytes(),
        },
    )
    .map_err(|_| IbxError::DecryptionFailed(format!("{file_ref}: authentication failed")))
}
