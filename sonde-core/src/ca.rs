//! Per-run certificate authority for mutual TLS between the aggregation
//! server and dispatched workloads.
//!
//! A fresh root key and self-signed root certificate are minted for every
//! run and never written anywhere. The server leaf and each plugin's client
//! leaf are signed by that root, so both ends of a submission verify each
//! other against the same trust anchor. Nothing is revoked; identities die
//! with the process.

use std::{fmt, net::SocketAddr, sync::Arc};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::{
    RootCertStore, ServerConfig,
    crypto::{CryptoProvider, ring},
    server::WebPkiClientVerifier,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

const ROOT_COMMON_NAME: &str = "sonde-ca";
const ORGANIZATION: &str = "sonde";

/// Failures minting the run's identities. All of them are fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    /// Key pair generation failed.
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    /// A certificate could not be built or signed.
    #[error("failed to generate certificate for {subject:?}: {source}")]
    CertGeneration {
        /// Common name of the certificate being issued.
        subject: String,
        /// rcgen failure.
        #[source]
        source: rcgen::Error,
    },

    /// The rustls server configuration was rejected.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Client certificate and key issued to one plugin's workload, together with
/// the root it chains to.
#[derive(Clone)]
pub struct ClientCredential {
    name: String,
    cert_pem: String,
    key_pem: String,
    ca_cert_pem: String,
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("name", &self.name)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl ClientCredential {
    /// Plugin the certificate was issued to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PEM client certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM PKCS#8 private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Root certificate the workload must trust to reach the server.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

/// Root identity of one run.
pub struct CertificateAuthority {
    root_cert: Certificate,
    root_key: KeyPair,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_common_name", &ROOT_COMMON_NAME)
            .field("root_der_len", &self.root_cert.der().len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Mint a new root identity for this run.
    pub fn new() -> Result<Self, CaError> {
        let root_key = KeyPair::generate().map_err(CaError::KeyGeneration)?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let root_cert = params.self_signed(&root_key).map_err(|source| {
            CaError::CertGeneration {
                subject: ROOT_COMMON_NAME.to_string(),
                source,
            }
        })?;

        Ok(Self {
            root_cert,
            root_key,
            provider: Arc::new(ring::default_provider()),
        })
    }

    /// Root certificate, for embedding in workload environments.
    pub fn root_cert_pem(&self) -> String {
        self.root_cert.pem()
    }

    /// DER form of the root certificate.
    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        self.root_cert.der()
    }

    /// Build a server configuration for `advertise_address` that demands a
    /// client certificate signed by this run's root.
    ///
    /// Any port suffix on the address is ignored; the leaf is issued for the
    /// bare host, as an IP SAN when the host parses as one.
    pub fn make_server_config(
        &self,
        advertise_address: &str,
    ) -> Result<Arc<ServerConfig>, CaError> {
        let host = advertise_host(advertise_address);
        let (leaf, leaf_key) = self.issue(
            &host,
            vec![host.clone()],
            ExtendedKeyUsagePurpose::ServerAuth,
        )?;

        let mut roots = RootCertStore::empty();
        roots.add(self.root_cert.der().clone()).map_err(|err| {
            CaError::TlsConfig(format!("failed to add root certificate: {err}"))
        })?;

        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            self.provider.clone(),
        )
        .build()
        .map_err(|err| {
            CaError::TlsConfig(format!("client verifier error: {err}"))
        })?;

        let chain = vec![leaf.der().clone(), self.root_cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            leaf_key.serialize_der(),
        ));

        let mut config = ServerConfig::builder_with_provider(
            self.provider.clone(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|err| CaError::TlsConfig(err.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|err| {
            CaError::TlsConfig(format!("server config error: {err}"))
        })?;

        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        debug!(host = %host, "issued aggregation server certificate");
        Ok(Arc::new(config))
    }

    /// Issue a client certificate bound to a plugin name.
    pub fn client_key_pair(
        &self,
        name: &str,
    ) -> Result<ClientCredential, CaError> {
        let (cert, key) =
            self.issue(name, Vec::new(), ExtendedKeyUsagePurpose::ClientAuth)?;

        debug!(plugin = name, "issued plugin client certificate");
        Ok(ClientCredential {
            name: name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_cert_pem: self.root_cert.pem(),
        })
    }

    fn issue(
        &self,
        common_name: &str,
        subject_alt_names: Vec<String>,
        usage: ExtendedKeyUsagePurpose,
    ) -> Result<(Certificate, KeyPair), CaError> {
        let cert_error = |source| CaError::CertGeneration {
            subject: common_name.to_string(),
            source,
        };

        let mut params =
            CertificateParams::new(subject_alt_names).map_err(cert_error)?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORGANIZATION);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];

        let key = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let cert = params
            .signed_by(&key, &self.root_cert, &self.root_key)
            .map_err(cert_error)?;

        Ok((cert, key))
    }
}

/// Strip a `:port` suffix, handling bracketed IPv6 literals.
fn advertise_host(address: &str) -> String {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }

    match address.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host.to_string()
        }
        _ => address.trim_matches(|c| c == '[' || c == ']').to_string(),
    }
}
