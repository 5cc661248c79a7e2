use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use orion::hazardous::mac::hmac::sha256::{HmacSha256, SecretKey};
use serde::{Deserialize, Serialize};

use crate::common::error::CoreError;

/// Claims read from a token. Signatures are never checked here: the services forward tokens
/// issued by others and only look at their shape and validity window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

fn decode_segment(segment: &str) -> crate::Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| CoreError::credential(format!("Invalid token encoding: {e}")))
}

/// Decodes the payload of a compact JWT without verifying its signature.
pub fn decode_unverified(token: &str) -> crate::Result<JwtClaims> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 {
        return Err(CoreError::credential(format!(
            "Token has {} segments, expected 3",
            parts.len()
        )));
    }
    // Header has to be valid JSON even though nothing in it is used
    serde_json::from_slice::<serde_json::Value>(&decode_segment(parts[0])?)
        .map_err(|e| CoreError::credential(format!("Invalid token header: {e}")))?;
    serde_json::from_slice(&decode_segment(parts[1])?)
        .map_err(|e| CoreError::credential(format!("Invalid token payload: {e}")))
}

/// Issues an HS256 token signed with `key`.
pub fn issue_hs256(claims: &JwtClaims, key: &[u8]) -> crate::Result<String> {
    let header = serde_json::json!({"alg": "HS256", "kid": "POOL", "typ": "JWT"});
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
    );
    let secret = SecretKey::from_slice(key)
        .map_err(|_| CoreError::credential("Token signing key has invalid length"))?;
    let tag = HmacSha256::hmac(&secret, signing_input.as_bytes())
        .map_err(|_| CoreError::credential("Token signing failed"))?;
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(tag.unprotected_as_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_decode() {
        let claims = JwtClaims {
            sub: Some("site@fe.host".into()),
            scope: Some("condor:/READ".into()),
            iat: Some(100),
            exp: Some(200),
            ..Default::default()
        };
        let token = issue_hs256(&claims, b"pool password").unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(decode_unverified(&token).unwrap(), claims);
    }

    #[test]
    fn malformed_tokens() {
        assert!(decode_unverified("abc").is_err());
        assert!(decode_unverified("a.b.c").is_err());
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        assert!(decode_unverified(&format!("{header}.{payload}.")).is_err());
    }

    #[test]
    fn signature_is_not_checked() {
        let token = issue_hs256(&JwtClaims::default(), b"key").unwrap();
        let (body, _) = token.rsplit_once('.').unwrap();
        assert!(decode_unverified(&format!("{body}.forged")).is_ok());
    }
}
