//! TLS for the OpenFlow listeners.
//!
//! Mutual TLS only: devices must present a certificate that chains to the
//! truststore. In strict mode the certificate must also be the one pinned
//! for the dpid the device announces in its features reply, which is
//! checked later by the handshake through [`DeviceCertificates`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use tokio_rustls::TlsAcceptor;

use crate::config::{TlsConfig, TlsMode};
use crate::error::{OfError, Result};
use crate::switch::Dpid;

/// Per-dpid certificate check applied after the features reply.
#[derive(Debug, Clone, Default)]
pub struct DeviceCertificates {
    strict: bool,
    pinned: HashMap<Dpid, Vec<u8>>,
}

impl DeviceCertificates {
    /// Accept any device (TLS disabled or not strict).
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Require the DER certificate pinned for each dpid.
    pub fn strict(pinned: HashMap<Dpid, Vec<u8>>) -> Self {
        Self {
            strict: true,
            pinned,
        }
    }

    /// Whether `peer` (DER) may speak for `dpid`.
    pub fn is_valid(&self, dpid: Dpid, peer: Option<&[u8]>) -> bool {
        if !self.strict {
            return true;
        }
        match (self.pinned.get(&dpid), peer) {
            (Some(expected), Some(presented)) => expected.as_slice() == presented,
            _ => false,
        }
    }
}

/// TLS material resolved from configuration.
#[derive(Clone)]
pub struct TlsSettings {
    mode: TlsMode,
    acceptor: Option<TlsAcceptor>,
    signature: Option<String>,
    certificates: Arc<DeviceCertificates>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("mode", &self.mode)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Plain TCP.
    pub fn disabled() -> Self {
        Self {
            mode: TlsMode::Disabled,
            acceptor: None,
            signature: None,
            certificates: Arc::new(DeviceCertificates::permissive()),
        }
    }

    /// Load keystore, truststore and pinned certificates.
    ///
    /// Incomplete parameters disable TLS with a warning. Unreadable or
    /// malformed material is an error.
    pub fn load(config: &TlsConfig) -> Result<Self> {
        let mode = config.effective_mode();
        if mode == TlsMode::Disabled {
            return Ok(Self::disabled());
        }
        let (Some(keystore_path), Some(truststore_path)) = (&config.keystore, &config.truststore)
        else {
            return Ok(Self::disabled());
        };

        let keystore = read_pem(keystore_path)?;
        let truststore = read_pem(truststore_path)?;

        let mut roots = RootCertStore::empty();
        for cert in parse_certificates(&truststore)? {
            roots
                .add(cert)
                .map_err(|e| OfError::Tls(format!("failed to add CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(OfError::Tls("truststore holds no CA certificates".into()));
        }

        let chain = parse_certificates(&keystore)?;
        if chain.is_empty() {
            return Err(OfError::Tls("keystore holds no certificate".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(&keystore)
            .map_err(|e| OfError::Tls(format!("failed to parse private key: {e}")))?;

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| OfError::Tls(format!("client verifier error: {e}")))?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;

        let certificates = if mode == TlsMode::Strict {
            DeviceCertificates::strict(load_pinned(&config.pinned_certificates)?)
        } else {
            DeviceCertificates::permissive()
        };

        let signature = signature(&keystore, &truststore);
        tracing::info!("TLS {:?} enabled, material signature {}", mode, signature);

        Ok(Self {
            mode,
            acceptor: Some(TlsAcceptor::from(Arc::new(server_config))),
            signature: Some(signature),
            certificates: Arc::new(certificates),
        })
    }

    /// Mode in effect.
    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    /// Acceptor, `None` for plain TCP.
    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    /// SHA-256 over keystore and truststore contents.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Per-dpid check for the handshake.
    pub fn certificates(&self) -> Arc<DeviceCertificates> {
        self.certificates.clone()
    }
}

/// Hex SHA-256 over keystore then truststore bytes.
pub fn signature(keystore: &[u8], truststore: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(keystore);
    hasher.update(truststore);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| OfError::Tls(format!("cannot read {}: {e}", path.display())))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| OfError::Tls(format!("failed to parse certificates: {e}")))
}

fn load_pinned(pinned: &HashMap<String, std::path::PathBuf>) -> Result<HashMap<Dpid, Vec<u8>>> {
    let mut out = HashMap::with_capacity(pinned.len());
    for (dpid, path) in pinned {
        let dpid: Dpid = dpid.parse()?;
        let cert = parse_certificates(&read_pem(path)?)?
            .into_iter()
            .next()
            .ok_or_else(|| OfError::Tls(format!("no certificate in {}", path.display())))?;
        out.insert(dpid, cert.as_ref().to_vec());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_permissive_accepts_anything() {
        let certs = DeviceCertificates::permissive();
        assert!(certs.is_valid(Dpid(1), None));
        assert!(certs.is_valid(Dpid(1), Some(b"whatever")));
    }

    #[test]
    fn test_strict_requires_pinned_match() {
        let mut pinned = HashMap::new();
        pinned.insert(Dpid(1), b"cert-one".to_vec());
        let certs = DeviceCertificates::strict(pinned);

        assert!(certs.is_valid(Dpid(1), Some(b"cert-one")));
        assert!(!certs.is_valid(Dpid(1), Some(b"cert-two")));
        assert!(!certs.is_valid(Dpid(1), None));
        assert!(!certs.is_valid(Dpid(2), Some(b"cert-one")));
    }

    #[test]
    fn test_signature_tracks_content() {
        let a = signature(b"ks", b"ts");
        assert_eq!(a.len(), 64);
        assert_eq!(a, signature(b"ks", b"ts"));
        assert_ne!(a, signature(b"ks", b"ts2"));
    }

    #[test]
    fn test_incomplete_material_disables() {
        let config = TlsConfig {
            mode: TlsMode::Enabled,
            keystore: Some(PathBuf::from("/nonexistent/ks.pem")),
            keystore_password: Some("short".into()),
            truststore: Some(PathBuf::from("/nonexistent/ts.pem")),
            truststore_password: Some("long-enough".into()),
            ..TlsConfig::default()
        };
        let settings = TlsSettings::load(&config).unwrap();
        assert_eq!(settings.mode(), TlsMode::Disabled);
        assert!(settings.acceptor().is_none());
    }

    #[test]
    fn test_unreadable_material_is_error() {
        let config = TlsConfig {
            mode: TlsMode::Enabled,
            keystore: Some(PathBuf::from("/nonexistent/ks.pem")),
            keystore_password: Some("password".into()),
            truststore: Some(PathBuf::from("/nonexistent/ts.pem")),
            truststore_password: Some("password".into()),
            ..TlsConfig::default()
        };
        assert!(matches!(TlsSettings::load(&config), Err(OfError::Tls(_))));
    }

    #[test]
    fn test_load_generated_material() {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&key, &ca, &ca_key)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ks = dir.path().join("keystore.pem");
        let ts = dir.path().join("truststore.pem");
        let pin = dir.path().join("device.pem");
        let mut f = std::fs::File::create(&ks).unwrap();
        write!(f, "{}{}", cert.pem(), key.serialize_pem()).unwrap();
        std::fs::write(&ts, ca.pem()).unwrap();
        std::fs::write(&pin, cert.pem()).unwrap();

        let mut pinned = HashMap::new();
        pinned.insert("00:00:00:00:00:00:00:01".to_string(), pin);
        let config = TlsConfig {
            mode: TlsMode::Strict,
            keystore: Some(ks),
            keystore_password: Some("password".into()),
            truststore: Some(ts),
            truststore_password: Some("password".into()),
            pinned_certificates: pinned,
        };
        let settings = TlsSettings::load(&config).unwrap();
        assert_eq!(settings.mode(), TlsMode::Strict);
        assert!(settings.acceptor().is_some());
        assert!(settings.signature().is_some());
        assert!(settings
            .certificates()
            .is_valid(Dpid(1), Some(cert.der().as_ref())));
        assert!(!settings.certificates().is_valid(Dpid(2), Some(cert.der().as_ref())));
    }
}
