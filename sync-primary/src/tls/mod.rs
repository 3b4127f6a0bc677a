//! Self-signed TLS material and the `rustls::ServerConfig` for C6. The
//! primary generates its own certificate on first start; it never trusts a
//! shared CA for client certificates (accept-any + application-layer TOFU).

use std::path::Path;
use std::sync::Arc;

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";

pub fn ensure_self_signed_cert(tls_dir: &Path) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    std::fs::create_dir_all(tls_dir)?;
    let cert_path = tls_dir.join(CERT_FILE);
    let key_path = tls_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return Ok((std::fs::read(cert_path)?, std::fs::read(key_path)?));
    }

    tracing::info!("generating self-signed server certificate in {:?}", tls_dir);
    let cert = rcgen::generate_simple_self_signed(vec!["gohook-sync-primary".to_string()])?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(&cert_path, &cert_pem)?;
    std::fs::write(&key_path, &key_pem)?;

    Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
}

pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| anyhow::anyhow!("no private key found in server key material"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = sync_protocol::tls::server::AcceptAnyClientCert::new(provider);

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
