//! # TLS Client Configuration
//!
//! Purpose: Build a rustls client config from the typed `ssl_*` options of a
//! `rediss://` connection.
//!
//! ## Notes
//! - `ssl_cert_reqs=none` installs a verifier that accepts any certificate.
//! - `ssl_check_hostname=false` still verifies the chain but tolerates a name
//!   mismatch.
//! - Without `ssl_ca_certs` the Mozilla root set from `webpki-roots` is used.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::CertReqs;
use crate::error::{Error, Result};

/// Typed TLS options.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Certificate verification level.
    pub cert_reqs: CertReqs,
    /// Whether the certificate must match the host name.
    pub check_hostname: bool,
    /// PEM bundle of trusted roots.
    pub ca_certs: Option<PathBuf>,
    /// PEM client certificate chain.
    pub certfile: Option<PathBuf>,
    /// PEM client private key; defaults to `certfile`.
    pub keyfile: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            cert_reqs: CertReqs::Required,
            check_hostname: true,
            ca_certs: None,
            certfile: None,
            keyfile: None,
        }
    }
}

/// Builds the shared client config for one connection.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let verifier: Arc<dyn ServerCertVerifier> = match options.cert_reqs {
        CertReqs::None => Arc::new(AcceptAnyCertificate {
            provider: Arc::clone(&provider),
        }),
        CertReqs::Optional | CertReqs::Required => {
            let roots = load_roots(options.ca_certs.as_deref())?;
            let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|err| Error::Config(format!("invalid TLS trust roots: {err}")))?;
            if options.check_hostname {
                webpki
            } else {
                Arc::new(IgnoreHostname { inner: webpki })
            }
        }
    };

    let builder = builder.dangerous().with_custom_certificate_verifier(verifier);
    let config = match &options.certfile {
        Some(certfile) => {
            let chain = load_certs(certfile)?;
            let key = load_key(options.keyfile.as_deref().unwrap_or(certfile))?;
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Converts a host into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("invalid TLS server name {host:?}")))
}

fn load_roots(ca_certs: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_certs {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_config() {
        assert!(client_config(&TlsOptions::default()).is_ok());
    }

    #[test]
    fn builds_permissive_config() {
        let options = TlsOptions {
            cert_reqs: CertReqs::None,
            check_hostname: false,
            ..TlsOptions::default()
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn missing_ca_file_fails() {
        let options = TlsOptions {
            ca_certs: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsOptions::default()
        };
        assert!(client_config(&options).is_err());
    }

    #[test]
    fn server_names() {
        assert!(server_name("redis.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
