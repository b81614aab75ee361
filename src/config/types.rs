//! Tenant and service configuration types.

use serde::{Deserialize, Serialize};

/// One IdP integration. The slug is the routing key for all per-tenant
/// endpoints and is immutable once routes are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Unique human-readable slug (e.g. "saml2.acme").
    pub slug: String,

    /// Where the IdP metadata was fetched from. Informational only during a
    /// login flow; metadata refresh happens out-of-band.
    #[serde(default)]
    pub metadata_conf_url: String,

    /// Cached IdP metadata XML. Parsed, never re-fetched, during a login.
    pub cached_metadata: String,

    /// Require cryptographically signed `<AuthnRequest>` documents.
    #[serde(default)]
    pub use_signed_authn_request: bool,
}

impl TenantConfig {
    /// Fingerprint over the fields that affect a constructed SP client.
    /// The client cache is keyed on this, so a metadata refresh invalidates
    /// the cached client without any explicit coordination.
    pub fn client_fingerprint(&self) -> String {
        let mut material = Vec::with_capacity(self.cached_metadata.len() + 1);
        material.extend_from_slice(self.cached_metadata.as_bytes());
        material.push(u8::from(self.use_signed_authn_request));
        let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), &material)
            .map(|d| d.to_vec())
            .unwrap_or_default();
        hex::encode(digest)
    }
}

/// Redirect targets of the host application the bridge hands sessions to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostApp {
    /// Where a successful login lands, with `authToken` appended.
    pub ui_login_redirect: String,

    /// Where a failed/conflicting login lands, with `authError` appended.
    pub ui_signup_failure_redirect: String,

    /// Where a successful account-linking flow lands. Falls back to the
    /// login redirect when unset.
    #[serde(default)]
    pub ui_connect_redirect: Option<String>,
}

impl HostApp {
    pub fn connect_redirect(&self) -> &str {
        self.ui_connect_redirect
            .as_deref()
            .unwrap_or(&self.ui_login_redirect)
    }
}

/// What to do when the assertion is valid but the linking auth code is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidLinkCodePolicy {
    /// Abort the whole flow with an error redirect.
    #[default]
    Fail,
    /// Drop the linking context and reconcile as a fresh login.
    Continue,
}

/// JSON service configuration file loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host_app: HostApp,

    /// Tenant configurations upserted into the config store at startup.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,

    #[serde(default)]
    pub on_invalid_link_code: InvalidLinkCodePolicy,
}
