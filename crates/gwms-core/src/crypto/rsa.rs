use std::fmt::{Debug, Formatter};

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};

use crate::common::error::CoreError;
use crate::crypto::{decode_hex, sha256_hex};

pub const DEFAULT_KEY_BITS: u32 = 2048;
/// Smallest key whose OAEP-SHA256 payload holds a serialized session key.
pub const MIN_KEY_BITS: u32 = 2048;
pub const PUB_KEY_TYPE: &str = "RSA";

/// Length of the published key identifier (hex characters).
const KEY_ID_LEN: usize = 32;

/// Undo the `\n` escaping applied when a PEM travels inside an attribute value.
fn normalize_pem(pem: &str) -> String {
    let mut pem = pem.replace("\\n", "\n");
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    pem
}

/// Public half of an RSA keypair together with its PEM form.
#[derive(Clone)]
pub struct RsaPublicKey {
    key: PKey<Public>,
    pem: String,
}

impl Debug for RsaPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPublicKey")
            .field("key_id", &self.key_id())
            .finish()
    }
}

impl RsaPublicKey {
    pub fn from_pem(pem: &str) -> crate::Result<Self> {
        let pem = normalize_pem(pem);
        let key = PKey::public_key_from_pem(pem.as_bytes())
            .map_err(|e| CoreError::credential(format!("Cannot parse RSA public key: {e}")))?;
        if key.rsa().is_err() {
            return Err(CoreError::credential("Public key is not an RSA key"));
        }
        Ok(RsaPublicKey { key, pem })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn key_id(&self) -> String {
        let mut id = sha256_hex(format!("{PUB_KEY_TYPE} {}", self.pem).as_bytes());
        id.truncate(KEY_ID_LEN);
        id
    }

    pub fn encrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        let mut encrypter = Encrypter::new(&self.key)?;
        encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
        encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
        encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
        let mut out = vec![0; encrypter.encrypt_len(data)?];
        let len = encrypter.encrypt(data, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    pub fn encrypt_hex(&self, data: &[u8]) -> crate::Result<String> {
        Ok(hex::encode(self.encrypt(data)?))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> crate::Result<bool> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.key)?;
        verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
        verifier.set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)?;
        verifier.set_rsa_mgf1_md(MessageDigest::sha256())?;
        verifier.update(data)?;
        Ok(verifier.verify(signature).unwrap_or(false))
    }
}

/// RSA keypair. The private half never leaves the process that loaded it.
pub struct RsaKey {
    key: PKey<Private>,
    public: RsaPublicKey,
}

impl RsaKey {
    pub fn generate(bits: u32) -> crate::Result<Self> {
        let rsa = Rsa::generate(bits)?;
        Self::from_pkey(PKey::from_rsa(rsa)?)
    }

    pub fn from_pem(pem: &[u8]) -> crate::Result<Self> {
        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| CoreError::credential(format!("Cannot parse RSA private key: {e}")))?;
        Self::from_pkey(key)
    }

    fn from_pkey(key: PKey<Private>) -> crate::Result<Self> {
        if key.rsa().is_err() {
            return Err(CoreError::credential("Private key is not an RSA key"));
        }
        let public_pem = String::from_utf8(key.public_key_to_pem()?)
            .map_err(|_| CoreError::credential("Public key PEM is not UTF-8"))?;
        let public = RsaPublicKey::from_pem(&public_pem)?;
        Ok(RsaKey { key, public })
    }

    pub fn private_pem(&self) -> crate::Result<Vec<u8>> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    fn decrypt_with(&self, data: &[u8], digest: MessageDigest) -> crate::Result<Vec<u8>> {
        let mut decrypter = Decrypter::new(&self.key)?;
        decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
        decrypter.set_rsa_oaep_md(digest)?;
        decrypter.set_rsa_mgf1_md(digest)?;
        let mut out = vec![0; decrypter.decrypt_len(data)?];
        let len = decrypter.decrypt(data, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decrypts OAEP-SHA256 ciphertext, falling back to OAEP-SHA1 used by older clients.
    pub fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        self.decrypt_with(data, MessageDigest::sha256())
            .or_else(|_| self.decrypt_with(data, MessageDigest::sha1()))
            .map_err(|e| CoreError::credential(format!("RSA decryption failed: {e}")))
    }

    pub fn decrypt_hex(&self, data: &str) -> crate::Result<Vec<u8>> {
        self.decrypt(&decode_hex(data)?)
    }

    pub fn sign(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)?;
        signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}
