use std::fmt::{Debug, Formatter};

use openssl::symm::{Cipher, decrypt, encrypt};

use crate::common::error::CoreError;
use crate::crypto::{decode_hex, random_bytes};

pub const CIPHER_NAME: &str = "aes_256_cbc";
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// AES-256-CBC session key shared between one frontend and one factory.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl Debug for SymmetricKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<hidden>)")
    }
}

impl SymmetricKey {
    /// A fresh random key with a random IV.
    pub fn generate() -> crate::Result<Self> {
        Ok(SymmetricKey {
            key: random_bytes(KEY_LEN)?,
            iv: random_bytes(IV_LEN)?,
        })
    }

    /// A fresh random key with an all-zero IV.
    pub fn generate_zero_iv() -> crate::Result<Self> {
        Ok(SymmetricKey {
            key: random_bytes(KEY_LEN)?,
            iv: vec![0; IV_LEN],
        })
    }

    /// `cipher:aes_256_cbc,key:<hex>,iv:<hex>`
    pub fn serialize(&self) -> String {
        format!(
            "cipher:{CIPHER_NAME},key:{},iv:{}",
            hex::encode(&self.key),
            hex::encode(&self.iv)
        )
    }

    pub fn parse(code: &str) -> crate::Result<Self> {
        let mut cipher = None;
        let mut key = None;
        let mut iv = None;
        for part in code.trim().split(',') {
            let (name, value) = part
                .split_once(':')
                .ok_or_else(|| CoreError::credential("Malformed session key code"))?;
            match name.trim() {
                "cipher" => cipher = Some(value.trim()),
                "key" => key = Some(decode_hex(value)?),
                "iv" => iv = Some(decode_hex(value)?),
                other => {
                    return Err(CoreError::credential(format!(
                        "Unknown session key field {other}"
                    )));
                }
            }
        }
        if cipher != Some(CIPHER_NAME) {
            return Err(CoreError::credential(format!(
                "Unsupported cipher {}",
                cipher.unwrap_or("<missing>")
            )));
        }
        let (Some(key), Some(iv)) = (key, iv) else {
            return Err(CoreError::credential("Session key code misses key or iv"));
        };
        if key.len() != KEY_LEN || iv.len() != IV_LEN {
            return Err(CoreError::credential("Session key has wrong length"));
        }
        Ok(SymmetricKey { key, iv })
    }

    pub fn encrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(encrypt(Cipher::aes_256_cbc(), &self.key, Some(&self.iv), data)?)
    }

    pub fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        decrypt(Cipher::aes_256_cbc(), &self.key, Some(&self.iv), data)
            .map_err(|e| CoreError::credential(format!("Session decryption failed: {e}")))
    }

    pub fn encrypt_hex(&self, data: &[u8]) -> crate::Result<String> {
        Ok(hex::encode(self.encrypt(data)?))
    }

    pub fn decrypt_hex(&self, data: &str) -> crate::Result<Vec<u8>> {
        self.decrypt(&decode_hex(data)?)
    }

    /// Decrypts a value that is expected to be text.
    pub fn decrypt_hex_str(&self, data: &str) -> crate::Result<String> {
        String::from_utf8(self.decrypt_hex(data)?)
            .map_err(|_| CoreError::credential("Decrypted value is not UTF-8"))
    }
}
