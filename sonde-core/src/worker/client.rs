use std::time::Duration;

use reqwest::{Certificate, Client, Identity};

use super::request::SubmitError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client that trusts only the run's root and presents the plugin's
/// client certificate.
pub fn mtls_client(
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Result<Client, SubmitError> {
    let root = Certificate::from_pem(ca_cert_pem.as_bytes())
        .map_err(SubmitError::Transport)?;

    // rustls identities are read from one PEM holding key and chain.
    let mut identity_pem = String::with_capacity(
        client_key_pem.len() + client_cert_pem.len() + 1,
    );
    identity_pem.push_str(client_key_pem);
    if !client_key_pem.ends_with('\n') {
        identity_pem.push('\n');
    }
    identity_pem.push_str(client_cert_pem);

    let identity = Identity::from_pem(identity_pem.as_bytes())
        .map_err(SubmitError::Transport)?;

    Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(root)
        .identity(identity)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(SubmitError::Transport)
}
