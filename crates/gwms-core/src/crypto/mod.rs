pub mod jwt;
pub mod rsa;
pub mod symmetric;
pub mod x509;

use sha2::{Digest, Sha256};

use crate::common::error::CoreError;

pub use jwt::JwtClaims;
pub use rsa::{RsaKey, RsaPublicKey};
pub use symmetric::SymmetricKey;
pub use x509::Certificate;

pub fn random_bytes(len: usize) -> crate::Result<Vec<u8>> {
    let mut buffer = vec![0; len];
    orion::util::secure_rand_bytes(&mut buffer)
        .map_err(|_| CoreError::GenericError("Cannot obtain random bytes".to_string()))?;
    Ok(buffer)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn decode_hex(data: &str) -> crate::Result<Vec<u8>> {
    hex::decode(data.trim()).map_err(|e| CoreError::credential(format!("Invalid hex data: {e}")))
}
