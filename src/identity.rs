//! Identity-provider bootstrap support.
//!
//! The provider serves its signing certificate as PEM over HTTPS at the
//! tenant host. The controller re-encodes that certificate's public key as a
//! `PUBLIC KEY` PEM block (PKIX DER) and registers it as an RS256 JWT
//! credential on the gateway, so tokens issued by the provider verify at the
//! edge.

use std::time::Duration;

use async_trait::async_trait;
use x509_parser::pem::parse_x509_pem;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Request timeout for certificate fetches
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the identity provider's PEM certificate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fetch the PEM-encoded X.509 certificate from `https://{host}/`.
    async fn fetch_certificate_pem(&self, host: &str) -> Result<String>;
}

/// HTTPS implementation of [`IdentityProvider`].
pub struct HttpIdentityProvider {
    http: reqwest::Client,
}

impl HttpIdentityProvider {
    /// Build the provider client.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::identity_provider(format!("building client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn fetch_certificate_pem(&self, host: &str) -> Result<String> {
        let url = format!("https://{host}/");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::identity_provider(format!("fetching {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::identity_provider(format!(
                "fetching {url}: status {status}"
            )));
        }
        resp.text()
            .await
            .map_err(|e| Error::identity_provider(format!("reading {url}: {e}")))
    }
}

/// Extract the certificate's public key as a `PUBLIC KEY` PEM block.
///
/// The SubjectPublicKeyInfo is carried over byte-for-byte, which is exactly
/// the PKIX DER encoding the gateway expects for `rsa_public_key`.
pub fn public_key_pem(cert_pem: &str) -> Result<String> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::identity_provider(format!("parsing certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::identity_provider(format!("parsing X.509 certificate: {e}")))?;
    let spki = cert.tbs_certificate.subject_pki.raw;
    let block = ::pem::Pem::new("PUBLIC KEY", spki.to_vec());
    Ok(::pem::encode(&block))
}

/// Issuer key for a tenant host. The trailing slash is load-bearing: it has
/// to match the `iss` claim the provider writes into its tokens.
pub fn issuer_key(host: &str) -> String {
    format!("https://{host}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (rcgen::KeyPair, String) {
        let key = rcgen::KeyPair::generate().expect("keygen");
        let cert = rcgen::CertificateParams::new(vec!["tenant.example.com".to_string()])
            .expect("params")
            .self_signed(&key)
            .expect("self-sign");
        (key, cert.pem())
    }

    #[test]
    fn re_encodes_the_certificates_public_key() {
        let (key, cert_pem) = self_signed();
        let pubkey_pem = public_key_pem(&cert_pem).expect("extract");

        assert!(pubkey_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        let parsed = ::pem::parse(pubkey_pem.as_bytes()).expect("valid pem");
        assert_eq!(parsed.tag(), "PUBLIC KEY");
        // The block must be the certificate's SPKI, i.e. the key pair's
        // public half in PKIX DER.
        assert_eq!(parsed.contents(), key.public_key_der().as_slice());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let err = public_key_pem("not a certificate").unwrap_err();
        assert!(matches!(err, Error::IdentityProvider(_)));
    }

    #[test]
    fn issuer_key_keeps_the_trailing_slash() {
        assert_eq!(issuer_key("tenant.example.com"), "https://tenant.example.com/");
    }
}
