//! Bearer tokens for sync calls.
//!
//! A token is `hex(claims-json).hex(hmac-sha256)`. Claims embed the tenant,
//! the license key, and an absolute expiry; the signature covers the exact
//! claim bytes.

use crate::error::{ApiError, ApiResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Claims embedded in a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    /// The tenant this token is scoped to.
    pub tenant_id: String,
    /// The license the token was issued against.
    pub license_key: String,
    /// Unix millis at issue time.
    pub issued_at: u64,
    /// Unix millis after which the token is rejected.
    pub expires_at: u64,
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    /// Creates a signer with the given secret and token lifetime.
    pub fn new(secret: Vec<u8>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    /// Issues a token for a tenant/license pair.
    pub fn issue(&self, tenant_id: &str, license_key: &str) -> ApiResult<String> {
        let now = unix_millis();
        let claims = TokenClaims {
            tenant_id: tenant_id.into(),
            license_key: license_key.into(),
            issued_at: now,
            expires_at: now + self.ttl.as_millis() as u64,
        };
        let body = serde_json::to_vec(&claims)
            .map_err(|e| ApiError::Internal(format!("token encoding failed: {e}")))?;
        let signature = self.sign(&body);
        Ok(format!("{}.{}", hex::encode(&body), hex::encode(signature)))
    }

    /// Verifies a token and returns its claims.
    pub fn verify(&self, token: &str) -> ApiResult<TokenClaims> {
        let (body_hex, sig_hex) = token
            .split_once('.')
            .ok_or_else(|| ApiError::Authentication("invalid token".into()))?;

        let body = hex::decode(body_hex)
            .map_err(|_| ApiError::Authentication("invalid token".into()))?;
        let signature = hex::decode(sig_hex)
            .map_err(|_| ApiError::Authentication("invalid token".into()))?;

        let expected = self.sign(&body);
        if signature != expected {
            return Err(ApiError::Authentication("invalid token signature".into()));
        }

        let claims: TokenClaims = serde_json::from_slice(&body)
            .map_err(|_| ApiError::Authentication("invalid token claims".into()))?;

        if unix_millis() > claims.expires_at {
            return Err(ApiError::Authentication("token expired".into()));
        }

        Ok(claims)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test-secret".to_vec(), Duration::from_secs(3600))
    }

    #[test]
    fn issue_and_verify() {
        let signer = signer();
        let token = signer.issue("tenant-1", "KEY-1").unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.tenant_id, "tenant-1");
        assert_eq!(claims.license_key, "KEY-1");
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn reject_tampered_claims() {
        let signer = signer();
        let token = signer.issue("tenant-1", "KEY-1").unwrap();

        let (body, sig) = token.split_once('.').unwrap();
        let other = signer.issue("tenant-2", "KEY-2").unwrap();
        let (other_body, _) = other.split_once('.').unwrap();

        let spliced = format!("{other_body}.{sig}");
        assert!(signer.verify(&spliced).is_err());
        assert!(signer.verify(&format!("{body}.{body}")).is_err());
    }

    #[test]
    fn reject_wrong_secret() {
        let token = signer().issue("tenant-1", "KEY-1").unwrap();
        let other = TokenSigner::new(b"other-secret".to_vec(), Duration::from_secs(3600));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn reject_expired() {
        let signer = TokenSigner::new(b"test-secret".to_vec(), Duration::ZERO);
        let token = signer.issue("tenant-1", "KEY-1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn reject_garbage() {
        assert!(signer().verify("not-a-token").is_err());
        assert!(signer().verify("zz.zz").is_err());
    }
}
