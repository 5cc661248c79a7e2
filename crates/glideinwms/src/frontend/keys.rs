use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use gwms_core::classad::AdValue;
use gwms_core::crypto::{RsaPublicKey, SymmetricKey, sha256_hex};

const KEY_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(64).unwrap();

pub const ATTR_PUB_KEY_ID: &str = "ReqPubKeyID";
pub const ATTR_ENC_KEY_CODE: &str = "ReqEncKeyCode";
pub const ATTR_ENC_IDENTITY: &str = "ReqEncIdentity";

/// Session keys of the factories this group talks to, keyed by factory public key.
pub struct SessionKeys {
    cache: LruCache<String, SymmetricKey>,
}

impl Default for SessionKeys {
    fn default() -> Self {
        SessionKeys {
            cache: LruCache::new(KEY_CACHE_SIZE),
        }
    }
}

fn cache_key(key: &RsaPublicKey) -> String {
    sha256_hex(key.pem().as_bytes())
}

impl SessionKeys {
    /// Restores keys saved by [`SessionKeys::save`]; unreadable ones are regenerated later.
    pub fn restore(saved: &BTreeMap<String, String>) -> Self {
        let mut keys = SessionKeys::default();
        for (pem_hash, code) in saved {
            match SymmetricKey::parse(code) {
                Ok(key) => {
                    keys.cache.put(pem_hash.clone(), key);
                }
                Err(error) => log::warn!("Dropping saved session key: {error}"),
            }
        }
        keys
    }

    pub fn save(&self) -> BTreeMap<String, String> {
        self.cache
            .iter()
            .map(|(pem_hash, key)| (pem_hash.clone(), key.serialize()))
            .collect()
    }

    pub fn get_or_create(&mut self, factory_key: &RsaPublicKey) -> crate::Result<&SymmetricKey> {
        let key = self
            .cache
            .try_get_or_insert(cache_key(factory_key), || {
                log::debug!("New session key for factory key {}", factory_key.key_id());
                SymmetricKey::generate()
            })?;
        Ok(key)
    }

    pub fn invalidate(&mut self, factory_key: &RsaPublicKey) {
        self.cache.pop(&cache_key(factory_key));
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

/// Encryption context of all ads sent to one factory.
pub struct RequestEncryption<'a> {
    factory_key: &'a RsaPublicKey,
    session_key: &'a SymmetricKey,
}

impl<'a> RequestEncryption<'a> {
    pub fn new(factory_key: &'a RsaPublicKey, session_key: &'a SymmetricKey) -> Self {
        RequestEncryption {
            factory_key,
            session_key,
        }
    }

    /// `ReqPubKeyID`, `ReqEncKeyCode` and `ReqEncIdentity` for an ad published as `identity`.
    pub fn key_attrs(&self, identity: &str) -> crate::Result<Vec<(&'static str, AdValue)>> {
        Ok(vec![
            (ATTR_PUB_KEY_ID, self.factory_key.key_id().into()),
            (
                ATTR_ENC_KEY_CODE,
                self.factory_key
                    .encrypt_hex(self.session_key.serialize().as_bytes())?
                    .into(),
            ),
            (
                ATTR_ENC_IDENTITY,
                self.session_key.encrypt_hex(identity.as_bytes())?.into(),
            ),
        ])
    }

    /// Hex ciphertext of the textual form of `value`.
    pub fn encrypt(&self, value: &str) -> crate::Result<AdValue> {
        Ok(self.session_key.encrypt_hex(value.as_bytes())?.into())
    }

    pub fn encrypt_bytes(&self, value: &[u8]) -> crate::Result<AdValue> {
        Ok(self.session_key.encrypt_hex(value)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwms_core::crypto::RsaKey;

    #[test]
    fn keys_are_cached_per_factory_key() {
        let first = RsaKey::generate(2048).unwrap();
        let second = RsaKey::generate(2048).unwrap();
        let mut keys = SessionKeys::default();
        let code = keys.get_or_create(first.public_key()).unwrap().serialize();
        assert_eq!(
            keys.get_or_create(first.public_key()).unwrap().serialize(),
            code
        );
        assert_ne!(
            keys.get_or_create(second.public_key()).unwrap().serialize(),
            code
        );

        let restored = SessionKeys::restore(&keys.save());
        assert_eq!(restored.len(), 2);

        keys.invalidate(first.public_key());
        assert_ne!(
            keys.get_or_create(first.public_key()).unwrap().serialize(),
            code
        );
        keys.reset();
        assert_eq!(keys.len(), 0);
    }

    #[test]
    fn factory_decrypts_requests() {
        let factory = RsaKey::generate(2048).unwrap();
        let mut keys = SessionKeys::default();
        let session_key = keys.get_or_create(factory.public_key()).unwrap().clone();
        let encryption = RequestEncryption::new(factory.public_key(), &session_key);
        let attrs: BTreeMap<&str, AdValue> = encryption
            .key_attrs("vofrontend@factory.example.org")
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            attrs[ATTR_PUB_KEY_ID].as_str(),
            Some(factory.public_key().key_id().as_str())
        );

        let code = factory
            .decrypt_hex(attrs[ATTR_ENC_KEY_CODE].as_str().unwrap())
            .unwrap();
        let received = SymmetricKey::parse(std::str::from_utf8(&code).unwrap()).unwrap();
        assert_eq!(
            received
                .decrypt_hex_str(attrs[ATTR_ENC_IDENTITY].as_str().unwrap())
                .unwrap(),
            "vofrontend@factory.example.org"
        );
        let payload = "line1\n\"quoted\" \\ line2";
        let encrypted = encryption.encrypt(payload).unwrap();
        assert_eq!(
            received.decrypt_hex_str(encrypted.as_str().unwrap()).unwrap(),
            payload
        );
    }
}
