//! Per-tenant SAML service provider client.
//!
//! A client is built from one tenant's cached IdP metadata and handles both
//! directions of the SP-initiated flow: rendering the self-submitting login
//! form that carries the `<samlp:AuthnRequest>` to the IdP, and validating
//! the `SAMLResponse` the IdP posts back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use samael::metadata::{EntityDescriptor, HTTP_POST_BINDING, HTTP_REDIRECT_BINDING};
use samael::service_provider::{ServiceProvider, ServiceProviderBuilder};
use std::sync::Arc;
use tracing::debug;

use super::signing::SigningKeypair;
use crate::config::TenantConfig;
use crate::error::AuthError;

/// Service-level settings shared by every tenant client.
#[derive(Clone)]
pub struct SpSettings {
    /// Entity ID this service presents to every IdP.
    pub sp_entity_id: String,

    /// External base URL; per-tenant ACS URLs are derived from it.
    pub acs_base_url: String,

    /// Signing material, present when any tenant requires signed requests.
    pub signing: Option<Arc<SigningKeypair>>,
}

impl SpSettings {
    pub fn acs_url_for(&self, slug: &str) -> String {
        format!(
            "{}/account/saml2/acs/{}/",
            self.acs_base_url.trim_end_matches('/'),
            slug
        )
    }
}

/// Identity attested by a validated assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertedIdentity {
    /// Stable subject identifier from the assertion NameID.
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

/// SAML SP client bound to one tenant configuration.
pub struct SpClient {
    slug: String,
    entity_id: String,
    acs_url: String,
    sso_location: String,
    sp: ServiceProvider,
    signing: Option<Arc<SigningKeypair>>,
    sign_requests: bool,
}

impl std::fmt::Debug for SpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpClient")
            .field("slug", &self.slug)
            .field("entity_id", &self.entity_id)
            .field("acs_url", &self.acs_url)
            .field("sso_location", &self.sso_location)
            .field("signing", &self.signing)
            .field("sign_requests", &self.sign_requests)
            .finish_non_exhaustive()
    }
}

const EMAIL_ATTRIBUTES: &[&str] = &[
    "urn:oid:0.9.2342.19200300.100.1.3",
    "mail",
    "email",
    "emailAddress",
    "EmailAddress",
];
const FIRST_NAME_ATTRIBUTES: &[&str] = &["urn:oid:2.5.4.42", "givenName", "FirstName", "first_name"];
const LAST_NAME_ATTRIBUTES: &[&str] = &["urn:oid:2.5.4.4", "sn", "surname", "LastName", "last_name"];

impl SpClient {
    /// Build a client from a tenant configuration.
    ///
    /// Fails fast when signed requests are required but no signing material
    /// is configured; a tenant demanding signatures must never fall back to
    /// unsigned requests.
    pub fn from_config(config: &TenantConfig, settings: &SpSettings) -> Result<Self, AuthError> {
        let metadata: EntityDescriptor =
            config
                .cached_metadata
                .parse()
                .map_err(|e| AuthError::Metadata {
                    slug: config.slug.clone(),
                    reason: format!("failed to parse metadata: {}", e),
                })?;

        let sso_location = resolve_sso_location(&metadata).ok_or_else(|| AuthError::Metadata {
            slug: config.slug.clone(),
            reason: "metadata has no SingleSignOnService endpoint".to_string(),
        })?;

        let signing = if config.use_signed_authn_request {
            match &settings.signing {
                Some(keypair) => Some(Arc::clone(keypair)),
                None => {
                    return Err(AuthError::SigningConfiguration(format!(
                        "tenant '{}' requires signed requests but no key/cert pair is configured",
                        config.slug
                    )))
                }
            }
        } else {
            None
        };

        let acs_url = settings.acs_url_for(&config.slug);
        // Request IDs are not retained across the IdP round trip, so
        // responses are accepted IdP-initiated.
        let sp = ServiceProviderBuilder::default()
            .entity_id(settings.sp_entity_id.clone())
            .acs_url(acs_url.clone())
            .allow_idp_initiated(true)
            .idp_metadata(metadata)
            .build()
            .map_err(|e| AuthError::Metadata {
                slug: config.slug.clone(),
                reason: format!("failed to build service provider: {}", e),
            })?;

        debug!(
            slug = %config.slug,
            sso = %sso_location,
            signed = config.use_signed_authn_request,
            "Built SAML SP client"
        );

        Ok(Self {
            slug: config.slug.clone(),
            entity_id: settings.sp_entity_id.clone(),
            acs_url,
            sso_location,
            sp,
            signing,
            sign_requests: config.use_signed_authn_request,
        })
    }

    pub fn sso_location(&self) -> &str {
        &self.sso_location
    }

    pub fn acs_url(&self) -> &str {
        &self.acs_url
    }

    /// Render the self-submitting POST form that starts a login.
    ///
    /// The form action is the IdP SSO endpoint from the tenant metadata; the
    /// hidden `SAMLRequest` field carries base64 of the (optionally signed)
    /// request. `relay_state` is echoed back by the IdP unchanged.
    pub fn login_form(&self, relay_state: Option<&str>) -> Result<String, AuthError> {
        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" AssertionConsumerServiceURL="{}"><saml:Issuer>{}</saml:Issuer></samlp:AuthnRequest>"#,
            request_id, issue_instant, self.sso_location, self.acs_url, self.entity_id
        );

        if self.sign_requests {
            let keypair = self.signing.as_ref().ok_or_else(|| {
                AuthError::SigningConfiguration("signing material missing".to_string())
            })?;
            let signature = keypair.signature_element(&request_id, &authn_request)?;
            let issuer_end = authn_request.find("</saml:Issuer>").map(|i| i + "</saml:Issuer>".len());
            match issuer_end {
                Some(pos) => authn_request.insert_str(pos, &signature),
                None => {
                    return Err(AuthError::SigningConfiguration(
                        "rendered request has no issuer element".to_string(),
                    ))
                }
            }
        }

        let encoded = BASE64.encode(authn_request.as_bytes());
        debug!(slug = %self.slug, request_id = %request_id, "Rendered SAML login form");

        let mut form = format!(
            concat!(
                "<!DOCTYPE html>\n",
                "<html>\n<body onload=\"document.forms[0].submit()\">\n",
                "<form action=\"{}\" method=\"post\">\n",
                "<input type=\"hidden\" name=\"SAMLRequest\" value=\"{}\"/>\n"
            ),
            html_escape::encode_double_quoted_attribute(&self.sso_location),
            html_escape::encode_double_quoted_attribute(&encoded),
        );
        if let Some(state) = relay_state {
            form.push_str(&format!(
                "<input type=\"hidden\" name=\"RelayState\" value=\"{}\"/>\n",
                html_escape::encode_double_quoted_attribute(state),
            ));
        }
        form.push_str(concat!(
            "<noscript><input type=\"submit\" value=\"Continue\"/></noscript>\n",
            "</form>\n</body>\n</html>\n"
        ));

        Ok(form)
    }

    /// Validate a base64 `SAMLResponse` and extract the asserted identity.
    pub fn consume(&self, saml_response_b64: &str) -> Result<AssertedIdentity, AuthError> {
        let assertion = self
            .sp
            .parse_base64_response(saml_response_b64, None)
            .map_err(|e| AuthError::AssertionValidation(e.to_string()))?;

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref())
            .map(|n| n.value.clone())
            .ok_or_else(|| {
                AuthError::AssertionValidation("assertion missing NameID".to_string())
            })?;

        // NameID doubles as the email for IdPs that send no attributes.
        let email = find_attribute(&assertion, EMAIL_ATTRIBUTES)
            .or_else(|| name_id.contains('@').then(|| name_id.clone()))
            .ok_or_else(|| {
                AuthError::AssertionValidation("assertion carries no email address".to_string())
            })?;

        let first_name = find_attribute(&assertion, FIRST_NAME_ATTRIBUTES).unwrap_or_default();
        let last_name = find_attribute(&assertion, LAST_NAME_ATTRIBUTES).unwrap_or_default();

        Ok(AssertedIdentity {
            external_id: name_id,
            email,
            first_name,
            last_name,
        })
    }
}

/// Pick the SSO endpoint from IdP metadata, preferring the POST binding.
fn resolve_sso_location(metadata: &EntityDescriptor) -> Option<String> {
    let descriptor = metadata.idp_sso_descriptors.as_ref()?.first()?;
    let services = &descriptor.single_sign_on_services;
    services
        .iter()
        .find(|s| s.binding == HTTP_POST_BINDING)
        .or_else(|| services.iter().find(|s| s.binding == HTTP_REDIRECT_BINDING))
        .or_else(|| services.first())
        .map(|s| s.location.clone())
}

fn find_attribute(assertion: &samael::schema::Assertion, names: &[&str]) -> Option<String> {
    let statements = assertion.attribute_statements.as_ref()?;
    for statement in statements {
        for attr in &statement.attributes {
            let matches = names.iter().any(|n| {
                attr.name.as_deref() == Some(n) || attr.friendly_name.as_deref() == Some(n)
            });
            if matches {
                if let Some(value) = attr.values.first().and_then(|v| v.value.clone()) {
                    return Some(value);
                }
            }
        }
    }
    None
}
