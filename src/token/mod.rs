//! Bearer tokens handed to the host application after a login.
//!
//! The bridge does not own the session model; it mints a token naming the
//! resolved user and verifies tokens presented on the linking preflight.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;

/// Default access token lifetime in seconds (24 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

/// Mints and verifies the bearer tokens that carry a resolved user.
pub trait TokenService: Send + Sync {
    /// Mint a token for a user.
    fn issue(&self, user_id: Uuid) -> Result<String, AuthError>;

    /// Verify a token and return the user it names.
    fn verify(&self, token: &str) -> Result<Uuid, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    /// Issuer.
    iss: String,
    /// Subject: the user UUID.
    sub: String,
    /// Expiration time.
    exp: u64,
    /// Issued at.
    iat: u64,
    /// JWT ID.
    jti: String,
}

/// HS256 JWT token service.
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl_secs: u64,
}

impl JwtTokenService {
    pub fn new(secret: &[u8], issuer: String, ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer,
            ttl_secs,
        }
    }
}

impl TokenService for JwtTokenService {
    fn issue(&self, user_id: Uuid) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            exp: now + self.ttl_secs,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Token(format!("failed to encode token: {}", e)))?;

        debug!(sub = %claims.sub, exp = claims.exp, "Issued bearer token");
        Ok(token)
    }

    fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| AuthError::Token(format!("token rejected: {}", e)))?;

        data.claims
            .sub
            .parse()
            .map_err(|_| AuthError::Token("token subject is not a user id".to_string()))
    }
}
