//! Bearer token verification.
//!
//! Tokens are HS256 JWTs carrying `{sub, username, exp}`. The verifier is
//! built once at startup from the configured secret and shared through
//! [`AppState`](crate::api::AppState).

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shelfcast_realtime::RealtimeError;
use shelfcast_types::Identity;
use std::time::Duration;

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Display name.
    #[serde(default)]
    pub username: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies (and, for producers and tests, issues) identity tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.map(str::to_string),
        }
    }

    /// Checks signature and expiry, returning the caller's identity.
    pub fn verify(&self, token: &str) -> Result<Identity, RealtimeError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| RealtimeError::AuthFailure(e.to_string()))?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(RealtimeError::AuthFailure("empty subject".into()));
        }

        let username = if claims.username.is_empty() {
            claims.sub.clone()
        } else {
            claims.username
        };
        Ok(Identity::new(claims.sub, username))
    }

    /// Signs a token for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, RealtimeError> {
        let claims = Claims {
            sub: identity.user_id.clone(),
            username: identity.username.clone(),
            exp: jsonwebtoken::get_current_timestamp() + ttl.as_secs(),
            iss: self.issuer.clone(),
        };
        encode(&Header::new(ALGORITHM), &claims, &self.encoding)
            .map_err(|e| RealtimeError::AuthFailure(e.to_string()))
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("u-1", "alice")
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = TokenVerifier::new(b"secret", None);
        let token = verifier.issue(&alice(), Duration::from_secs(60)).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), alice());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenVerifier::new(b"secret", None);
        let verifier = TokenVerifier::new(b"other", None);
        let token = issuer.issue(&alice(), Duration::from_secs(60)).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(RealtimeError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_expired_rejected() {
        let verifier = TokenVerifier::new(b"secret", None);
        let claims = Claims {
            sub: "u-1".into(),
            username: "alice".into(),
            exp: jsonwebtoken::get_current_timestamp() - 3600,
            iss: None,
        };
        let token = encode(
            &Header::new(ALGORITHM),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_issuer_enforced() {
        let verifier = TokenVerifier::new(b"secret", Some("shelfcast"));
        let foreign = TokenVerifier::new(b"secret", Some("elsewhere"));
        let token = foreign.issue(&alice(), Duration::from_secs(60)).unwrap();
        assert!(verifier.verify(&token).is_err());

        let token = verifier.issue(&alice(), Duration::from_secs(60)).unwrap();
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn test_garbage_rejected() {
        let verifier = TokenVerifier::new(b"secret", None);
        assert!(verifier.verify("not-a-token").is_err());
        assert!(verifier.verify("").is_err());
    }
}
