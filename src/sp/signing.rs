//! XML-DSig signing of outbound authentication requests.
//!
//! Produces an enveloped RSA-SHA256 signature inserted into the rendered
//! `<samlp:AuthnRequest>` directly after the issuer element, per the
//! xmldsig enveloped-signature profile. The digest covers the request
//! document without the signature element.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use std::path::Path;

use crate::error::AuthError;

const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// SP signing material loaded from PEM files at startup.
#[derive(Debug)]
pub struct SigningKeypair {
    key: PKey<Private>,
    cert: X509,
}

impl SigningKeypair {
    /// Load a private key and certificate pair from PEM files.
    pub fn from_pem_files(key_path: &Path, cert_path: &Path) -> Result<Self, AuthError> {
        let key_pem = std::fs::read(key_path).map_err(|e| {
            AuthError::SigningConfiguration(format!("cannot read key file {:?}: {}", key_path, e))
        })?;
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            AuthError::SigningConfiguration(format!("cannot read cert file {:?}: {}", cert_path, e))
        })?;
        Self::from_pem(&key_pem, &cert_pem)
    }

    /// Load a private key and certificate pair from PEM bytes.
    pub fn from_pem(key_pem: &[u8], cert_pem: &[u8]) -> Result<Self, AuthError> {
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| AuthError::SigningConfiguration(format!("invalid private key: {}", e)))?;
        let cert = X509::from_pem(cert_pem)
            .map_err(|e| AuthError::SigningConfiguration(format!("invalid certificate: {}", e)))?;
        Ok(Self { key, cert })
    }

    /// Base64 of the certificate DER, for `<ds:X509Certificate>`.
    fn cert_base64(&self) -> Result<String, AuthError> {
        let der = self
            .cert
            .to_der()
            .map_err(|e| AuthError::SigningConfiguration(format!("certificate encode: {}", e)))?;
        Ok(BASE64.encode(der))
    }

    fn rsa_sha256(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)
            .map_err(|e| AuthError::SigningConfiguration(format!("signer init: {}", e)))?;
        signer
            .update(data)
            .map_err(|e| AuthError::SigningConfiguration(format!("signer update: {}", e)))?;
        signer
            .sign_to_vec()
            .map_err(|e| AuthError::SigningConfiguration(format!("sign: {}", e)))
    }

    /// Build the enveloped `<ds:Signature>` element for a rendered request.
    ///
    /// `request_xml` is the full request document without a signature; the
    /// reference digest is computed over it.
    pub fn signature_element(
        &self,
        request_id: &str,
        request_xml: &str,
    ) -> Result<String, AuthError> {
        let digest = openssl::hash::hash(MessageDigest::sha256(), request_xml.as_bytes())
            .map_err(|e| AuthError::SigningConfiguration(format!("digest: {}", e)))?;
        let digest_value = BASE64.encode(digest.as_ref());

        let signed_info = format!(
            r##"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="{EXC_C14N}"/><ds:SignatureMethod Algorithm="{RSA_SHA256}"/><ds:Reference URI="#{request_id}"><ds:Transforms><ds:Transform Algorithm="{ENVELOPED}"/><ds:Transform Algorithm="{EXC_C14N}"/></ds:Transforms><ds:DigestMethod Algorithm="{SHA256_DIGEST}"/><ds:DigestValue>{digest_value}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##
        );

        let signature_value = BASE64.encode(self.rsa_sha256(signed_info.as_bytes())?);
        let certificate = self.cert_base64()?;

        Ok(format!(
            r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#
        ))
    }
}
