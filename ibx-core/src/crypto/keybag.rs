use super::aead::{self, AeadKey, Region, SALT_LEN};
use crate::error::{IbxError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const KEYBAG_VERSION: u16 = 1;
const VERIFIER_REF: &str = "keybag";
const VERIFIER_PLAINTEXT: &[u8] = b"ibx keybag verifier v1";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub m_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for fixtures.
    pub fn fast() -> Self {
        Self {
            m_kib: 64,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

/// Password-wrapped key material stored as `Keybag.cbor`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keybag {
    pub version: u16,
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
    pub verifier: Vec<u8>,
}

impl Keybag {
    pub fn create(password: &str, kdf: KdfParams) -> Result<(Self, AeadKey)> {
        let mut salt = [0u8; SALT_LEN];
        getrandom::getrandom(&mut salt)
            .map_err(|e| std::io::Error::other(format!("getrandom: {e}")))?;
        let key = derive_key(password, &salt, &kdf)?;
        let verifier = aead::seal(&key, &salt, Region::Keybag, VERIFIER_REF, VERIFIER_PLAINTEXT)?;
        let bag = Self {
            version: KEYBAG_VERSION,
            salt,
            kdf,
            verifier,
        };
        Ok((bag, key))
    }

    /// Stretch `password` and prove it against the verifier.
    pub fn unlock(&self, password: &str) -> Result<AeadKey> {
        if self.version != KEYBAG_VERSION {
            return Err(IbxError::format(format!(
                "unsupported keybag version {}",
                self.version
            )));
        }
        let key = derive_key(password, &self.salt, &self.kdf)?;
        match aead::open(&key, &self.salt, Region::Keybag, VERIFIER_REF, &self.verifier) {
            Ok(pt) if pt == VERIFIER_PLAINTEXT => Ok(key),
            _ => Err(IbxError::InvalidCredentials),
        }
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|e| IbxError::format(format!("keybag encode: {e}")))?;
        Ok(out)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| IbxError::format(format!("keybag: {e}")))
    }
}

fn derive_key(password: &str, salt: &[u8; SALT_LEN], kdf: &KdfParams) -> Result<AeadKey> {
    let params = Params::new(kdf.m_kib, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| IbxError::format(format!("kdf params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| IbxError::format(format!("kdf: {e}")))?;
    Ok(AeadKey::from_bytes(*out))
}
