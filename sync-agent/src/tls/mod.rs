//! Self-signed client TLS material and the pinned `rustls::ClientConfig`
//! for C6/C7's agent side. The agent generates its own client certificate
//! on first start, the same way the primary generates a server one; trust
//! of the *primary's* certificate is a fingerprint decision, not a chain
//! validation, handled by [`FileBackedTrust`] below.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sync_protocol::tls::FingerprintTrust;

const CERT_FILE: &str = "client.crt";
const KEY_FILE: &str = "client.key";
const FINGERPRINT_FILE: &str = "server.fp";

pub fn ensure_self_signed_cert(tls_dir: &Path) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    std::fs::create_dir_all(tls_dir)?;
    let cert_path = tls_dir.join(CERT_FILE);
    let key_path = tls_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return Ok((std::fs::read(cert_path)?, std::fs::read(key_path)?));
    }

    tracing::info!("generating self-signed client certificate in {:?}", tls_dir);
    let cert = rcgen::generate_simple_self_signed(vec!["gohook-sync-agent".to_string()])?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(&cert_path, &cert_pem)?;
    std::fs::write(&key_path, &key_pem)?;

    Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
}

/// TOFU-pins the primary's certificate fingerprint in
/// `<data_dir>/tls/server.fp`. A CLI/config `--server-fingerprint` value
/// pre-seeds the pin and is then enforced as an exact match rather than
/// accepted on trust.
#[derive(Debug)]
pub struct FileBackedTrust {
    path: PathBuf,
    pinned: Mutex<Option<String>>,
}

impl FileBackedTrust {
    pub fn new(tls_dir: &Path, override_fingerprint: Option<String>) -> Self {
        let path = tls_dir.join(FINGERPRINT_FILE);
        let pinned = override_fingerprint
            .map(|fp| fp.to_lowercase())
            .or_else(|| std::fs::read_to_string(&path).ok().map(|s| s.trim().to_lowercase()))
            .filter(|s| !s.is_empty());
        Self {
            path,
            pinned: Mutex::new(pinned),
        }
    }
}

impl FingerprintTrust for FileBackedTrust {
    fn accept(&self, fingerprint: &str) -> bool {
        let mut guard = self.pinned.lock().unwrap();
        match guard.as_deref() {
            Some(pinned) => pinned == fingerprint,
            None => {
                if let Err(e) = std::fs::write(&self.path, fingerprint) {
                    tracing::warn!("failed to persist pinned server fingerprint: {}", e);
                }
                tracing::info!(fingerprint, "pairing with primary on first contact (TOFU)");
                *guard = Some(fingerprint.to_string());
                true
            }
        }
    }
}

pub fn build_client_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    trust: Arc<dyn FingerprintTrust>,
) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| anyhow::anyhow!("no private key found in client key material"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = sync_protocol::tls::client::PinnedServerCert::new(trust, provider);

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn override_fingerprint_rejects_a_different_one() {
        let dir = TempDir::new().unwrap();
        let trust = FileBackedTrust::new(dir.path(), Some("a".repeat(64)));
        assert!(trust.accept(&"a".repeat(64)));
        assert!(!trust.accept(&"b".repeat(64)));
    }

    #[test]
    fn first_contact_pins_and_persists() {
        let dir = TempDir::new().unwrap();
        let trust = FileBackedTrust::new(dir.path(), None);
        assert!(trust.accept(&"c".repeat(64)));
        assert!(!trust.accept(&"d".repeat(64)));
        let persisted = std::fs::read_to_string(dir.path().join(FINGERPRINT_FILE)).unwrap();
        assert_eq!(persisted, "c".repeat(64));
    }
}
