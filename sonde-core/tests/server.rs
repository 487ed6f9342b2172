mod support;

use std::{net::SocketAddr, sync::Arc};

use reqwest::{Certificate, Client, StatusCode};
use sonde_core::{
    AggregationServer, Aggregator, CertificateAuthority, mtls_client,
};
use sonde_model::ExpectedResult;
use support::free_port;

struct Harness {
    authority: CertificateAuthority,
    server: AggregationServer,
    addr: SocketAddr,
    output: tempfile::TempDir,
}

async fn serve(expected: &[ExpectedResult]) -> Harness {
    let authority = CertificateAuthority::new().unwrap();
    let tls = authority.make_server_config("127.0.0.1").unwrap();
    let output = tempfile::tempdir().unwrap();
    let aggregator = Arc::new(Aggregator::new(output.path(), expected));

    let addr: SocketAddr = ([127, 0, 0, 1], free_port()).into();
    let server = AggregationServer::spawn(addr, tls, aggregator);
    let addr = server.listening().await.expect("server should bind");

    Harness {
        authority,
        server,
        addr,
        output,
    }
}

#[tokio::test]
async fn issued_client_certificate_is_accepted() {
    let harness = serve(&[ExpectedResult::global("e2e")]).await;
    let credential = harness.authority.client_key_pair("e2e").unwrap();
    let client = mtls_client(
        credential.ca_cert_pem(),
        credential.cert_pem(),
        credential.key_pem(),
    )
    .unwrap();

    let response = client
        .post(format!("https://{}/api/v1/results/global/e2e", harness.addr))
        .header("content-type", "application/gzip")
        .body("tarball")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        std::fs::read(harness.output.path().join("global/e2e")).unwrap(),
        b"tarball"
    );
    harness.server.shutdown();
}

#[tokio::test]
async fn client_without_certificate_is_refused() {
    let harness = serve(&[ExpectedResult::global("e2e")]).await;
    let root =
        Certificate::from_pem(harness.authority.root_cert_pem().as_bytes())
            .unwrap();
    let client = Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(root)
        .build()
        .unwrap();

    let sent = client
        .post(format!("https://{}/api/v1/results/global/e2e", harness.addr))
        .body("tarball")
        .send()
        .await;

    assert!(sent.is_err());
    assert!(!harness.output.path().join("global/e2e").exists());
}

#[tokio::test]
async fn certificate_from_another_run_is_refused() {
    let harness = serve(&[ExpectedResult::global("e2e")]).await;
    let stranger = CertificateAuthority::new().unwrap();
    let credential = stranger.client_key_pair("e2e").unwrap();
    let client = mtls_client(
        &harness.authority.root_cert_pem(),
        credential.cert_pem(),
        credential.key_pem(),
    )
    .unwrap();

    let sent = client
        .post(format!("https://{}/api/v1/results/global/e2e", harness.addr))
        .body("tarball")
        .send()
        .await;

    assert!(sent.is_err());
    assert!(!harness.output.path().join("global/e2e").exists());
}
