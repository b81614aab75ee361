//! Error taxonomy for the federated-login core.
//!
//! Every user-visible failure in a login flow maps to one of these variants;
//! the HTTP layer decides how each is surfaced (404, error redirect, etc).

use thiserror::Error;

/// Error codes carried in the `authError` query parameter of failure
/// redirects, so the host application can show a provider-specific retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    /// A verified email record already belongs to a different local user.
    EmailConflict,
    /// The inbound assertion failed cryptographic or schema validation.
    AssertionInvalid,
    /// The linking auth code was missing, expired, or already redeemed.
    InvalidLinkCode,
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCode::EmailConflict => "email_conflict",
            AuthErrorCode::AssertionInvalid => "assertion_invalid",
            AuthErrorCode::InvalidLinkCode => "invalid_link_code",
        }
    }
}

impl std::fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Slug does not resolve to a tenant SAML configuration.
    #[error("no SAML configuration for provider '{0}'")]
    ConfigNotFound(String),

    /// Signed authentication requests are required but no usable signing
    /// key/certificate pair is configured. A deployment fault, not retried.
    #[error("signing configuration error: {0}")]
    SigningConfiguration(String),

    /// Cached IdP metadata could not be parsed or lacks an SSO endpoint.
    #[error("IdP metadata error for provider '{slug}': {reason}")]
    Metadata { slug: String, reason: String },

    /// The inbound assertion could not be validated or decoded.
    #[error("assertion validation failed: {0}")]
    AssertionValidation(String),

    /// Auth code missing, expired, or already redeemed.
    #[error("invalid, expired, or already redeemed auth code")]
    InvalidCode,

    /// Token could not be minted or verified.
    #[error("token service error: {0}")]
    Token(String),

    /// Underlying store failure.
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}
