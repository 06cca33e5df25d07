//! Per-request upstream TLS policy selection

mod verifier;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

use crate::error::{Error, Result};
pub use verifier::{NoVerifier, RelaxedVerifier};

/// The set of TLS verification checks a request asked to skip.
///
/// Behavior depends on the set, not on token order. Unknown tokens are
/// ignored; `all` (and the boolean spellings `true`/`1`/`yes`) implies the
/// full set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipTlsChecks {
    pub all: bool,
    pub expired_cert: bool,
    pub self_signed: bool,
    pub hostname_mismatch: bool,
    pub cert_authority: bool,
    pub weak_cipher: bool,
}

impl SkipTlsChecks {
    /// Parse a comma-separated token list.
    pub fn parse(raw: &str) -> Self {
        let mut set = Self::default();
        for token in raw.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "all" | "true" | "1" | "yes" => set.all = true,
                "expired_cert" => set.expired_cert = true,
                "self_signed" => set.self_signed = true,
                "hostname_mismatch" => set.hostname_mismatch = true,
                "cert_authority" => set.cert_authority = true,
                "weak_cipher" => set.weak_cipher = true,
                "" => {}
                other => {
                    tracing::debug!(token = %other, "Ignoring unknown skip_tls_checks token");
                }
            }
        }
        if set.all {
            set.expired_cert = true;
            set.self_signed = true;
            set.hostname_mismatch = true;
            set.cert_authority = true;
            set.weak_cipher = true;
        }
        set
    }

    /// True when no token was present at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn relaxes_verification(&self) -> bool {
        self.all
            || self.expired_cert
            || self.self_signed
            || self.hostname_mismatch
            || self.cert_authority
    }
}

/// Selects the upstream TLS client configuration for each request.
///
/// The strict configuration is built once and shared across requests. Any
/// request that skips checks gets a freshly built configuration that is
/// dropped with the request, so permissive settings never leak into later
/// calls.
pub struct TlsSelector {
    strict: Arc<ClientConfig>,
    roots: Arc<RootCertStore>,
    webpki: Arc<WebPkiServerVerifier>,
}

impl TlsSelector {
    /// Build the selector from the system trust anchors plus optional extra
    /// roots (testing override).
    pub fn new(extra_roots: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in extra_roots {
            root_store
                .add(cert)
                .map_err(|e| Error::config(format!("Invalid upstream trust root: {}", e)))?;
        }
        let roots = Arc::new(root_store);

        let webpki = WebPkiServerVerifier::builder(roots.clone())
            .build()
            .map_err(|e| Error::config(format!("Failed to build certificate verifier: {}", e)))?;

        let strict = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots.clone())
                .with_no_client_auth(),
        );

        Ok(Self {
            strict,
            roots,
            webpki,
        })
    }

    /// The client configuration for a request with the given skip set.
    pub fn client_config(&self, skip: SkipTlsChecks) -> Arc<ClientConfig> {
        if skip.is_empty() {
            return self.strict.clone();
        }

        // Fresh configuration per request once any token is present.
        let builder = ClientConfig::builder();
        let config = if skip.all {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else if skip.relaxes_verification() {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(RelaxedVerifier::new(
                    self.webpki.clone(),
                    skip,
                )))
                .with_no_client_auth()
        } else {
            // weak_cipher only: rustls ships no deprecated suites, so the
            // handshake configuration stays strict.
            builder
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        };
        Arc::new(config)
    }
}
