//! End-to-end TLS tests.
//!
//! A throwaway CA signs the controller and device certificates; devices
//! connect with mutual TLS.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{port, start_controller, test_config, wait_connected, FakeSwitch};
use ofctl::codec::OfVersion;
use ofctl::{Dpid, TlsConfig, TlsMode};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

struct Pki {
    dir: TempDir,
    ca: Certificate,
    ca_key: KeyPair,
}

struct Identity {
    cert: Certificate,
    key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            ca,
            ca_key,
        }
    }

    fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> Identity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        Identity { cert, key }
    }

    fn write(&self, file: &str, contents: String) -> std::path::PathBuf {
        let path = self.dir.path().join(file);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// TLS section for the controller, optionally pinning device certs.
    fn controller_tls(&self, mode: TlsMode, pinned: &[(&str, &Identity)]) -> TlsConfig {
        let server = self.issue("localhost", ExtendedKeyUsagePurpose::ServerAuth);
        let keystore = self.write(
            "keystore.pem",
            format!("{}{}", server.cert.pem(), server.key.serialize_pem()),
        );
        let truststore = self.write("truststore.pem", self.ca.pem());
        let pinned_certificates: HashMap<String, std::path::PathBuf> = pinned
            .iter()
            .enumerate()
            .map(|(i, (dpid, id))| {
                let path = self.write(&format!("pinned-{i}.pem"), id.cert.pem());
                ((*dpid).to_string(), path)
            })
            .collect();
        TlsConfig {
            mode,
            keystore: Some(keystore),
            keystore_password: Some("changeit".into()),
            truststore: Some(truststore),
            truststore_password: Some("changeit".into()),
            pinned_certificates,
        }
    }

    fn client(&self, identity: Option<&Identity>) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.der().clone()).unwrap();
        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match identity {
            Some(id) => {
                let chain: Vec<CertificateDer<'static>> = vec![id.cert.der().clone()];
                let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(id.key.serialize_der()));
                builder.with_client_auth_cert(chain, key).unwrap()
            }
            None => builder.with_no_client_auth(),
        };
        TlsConnector::from(Arc::new(config))
    }
}

async fn tls_device(
    connector: &TlsConnector,
    addr: std::net::SocketAddr,
) -> FakeSwitch<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    FakeSwitch::over(stream, OfVersion::Of13)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutual_tls_handshake() {
    let pki = Pki::new();
    let device_id = pki.issue("device-a", ExtendedKeyUsagePurpose::ClientAuth);

    let mut config = test_config().await;
    config.tls = pki.controller_tls(TlsMode::Enabled, &[]);
    assert_eq!(config.tls.effective_mode(), TlsMode::Enabled);
    let mut controller = start_controller(config);
    assert!(controller.tls_signature().is_some());
    let registry = controller.registry();

    let connector = pki.client(Some(&device_id));
    let mut device = tls_device(&connector, controller.local_addrs()[0]).await;
    device.handshake_of13(0x20, vec![port(1)]).await;
    wait_connected(&registry, Dpid(0x20)).await;
    controller.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_without_certificate_rejected() {
    let pki = Pki::new();
    let mut config = test_config().await;
    config.tls = pki.controller_tls(TlsMode::Enabled, &[]);
    let mut controller = start_controller(config);

    let tcp = TcpStream::connect(controller.local_addrs()[0])
        .await
        .unwrap();
    let result = pki
        .client(None)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await;
    // TLS 1.3 clients learn of the rejection on first read.
    if let Ok(stream) = result {
        let mut device = FakeSwitch::over(stream, OfVersion::Of13);
        assert!(device.recv().await.is_none());
    }
    assert!(controller.registry().connected_dpids().is_empty());
    controller.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strict_mode_checks_pinned_certificate() {
    let pki = Pki::new();
    let device_id = pki.issue("device-b", ExtendedKeyUsagePurpose::ClientAuth);

    let mut config = test_config().await;
    config.tls = pki.controller_tls(TlsMode::Strict, &[("00:00:00:00:00:00:00:30", &device_id)]);
    let mut controller = start_controller(config);
    let registry = controller.registry();
    let addr = controller.local_addrs()[0];
    let connector = pki.client(Some(&device_id));

    // Same certificate, but claiming another dpid.
    let mut impostor = tls_device(&connector, addr).await;
    impostor.hello().await;
    impostor.features(0x31, 256, Vec::new()).await;
    impostor.expect_closed().await;
    assert!(registry.get_switch(Dpid(0x31)).is_none());

    let mut device = tls_device(&connector, addr).await;
    device.handshake_of13(0x30, Vec::new()).await;
    wait_connected(&registry, Dpid(0x30)).await;
    controller.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_password_falls_back_to_plain_tcp() {
    let pki = Pki::new();
    let mut config = test_config().await;
    config.tls = pki.controller_tls(TlsMode::Enabled, &[]);
    config.tls.truststore_password = Some("short".into());
    let mut controller = start_controller(config);
    assert!(controller.tls_signature().is_none());

    let registry = controller.registry();
    let mut device = FakeSwitch::connect(controller.local_addrs()[0], OfVersion::Of13).await;
    device.handshake_of13(0x40, Vec::new()).await;
    wait_connected(&registry, Dpid(0x40)).await;
    controller.stop();
}
