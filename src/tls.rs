use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::digest::to_hex;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Tortuga");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("tortuga");
    }
    PathBuf::from(".tortuga")
}

pub fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

fn resolve_cert_paths(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<(PathBuf, PathBuf)> {
    match (cert, key) {
        (Some(c), Some(k)) => Ok((c, k)),
        (None, None) => Ok(default_server_cert_paths()),
        _ => Err(anyhow!("--tls-cert requires --tls-key")),
    }
}

/// Generate a self-signed certificate at the given paths unless both exist.
pub fn ensure_server_cert(cert_path: &Path, key_path: &Path) -> Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    for p in [cert_path, key_path] {
        if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }
    let cert = rcgen::generate_simple_self_signed(vec!["tortugad.local".to_string()])
        .context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(key_path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

pub fn load_certs(cert_path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(fs::File::open(cert_path).context("open cert")?);
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificate found in {}", cert_path.display()));
    }
    Ok(out)
}

fn load_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
    let pkcs8: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut rd).collect();
    if let Some(k) = pkcs8.into_iter().next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    let mut rd2 = BufReader::new(fs::File::open(key_path).context("reopen key")?);
    let rsa: Vec<_> = rustls_pemfile::rsa_private_keys(&mut rd2).collect();
    let k = rsa.into_iter().next().context("rsa key not found")??;
    Ok(PrivateKeyDer::from(k))
}

/// Server TLS config from explicit PEM paths, or a persisted self-signed pair
/// under `config_dir()` that is generated on first use.
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = resolve_cert_paths(cert, key)?;
    ensure_server_cert(&cert_path, &key_path)?;
    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")
}

/// SHA-256 of the DER certificate, lowercase hex. This is the host identity
/// devices pin.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    to_hex(&h.finalize())
}

/// Fingerprint of the first certificate in a PEM file
pub fn fingerprint_of_pem(cert_path: &Path) -> Result<String> {
    let certs = load_certs(cert_path)?;
    Ok(fingerprint(&certs[0]))
}

/// Accept "AB:CD:..." or "abcd..." spellings
pub fn normalize_fingerprint(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn supported_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Fail-closed verifier: the end-entity certificate must hash to the pinned
/// fingerprint exactly. There is no first-use trust and no fallback.
#[derive(Debug)]
struct PinnedVerifier {
    expected: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(end_entity);
        if fp == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "host identity mismatch: pinned {}, presented {}",
                self.expected, fp
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Records whatever certificate the server presents. Only used to discover a
/// fingerprint for pinning; never for a data session.
#[derive(Debug)]
struct CaptureVerifier {
    seen: Arc<Mutex<Option<String>>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for CaptureVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        *self.seen.lock() = Some(fingerprint(end_entity));
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub fn build_client_config_pinned(pinned_fingerprint: &str) -> rustls::ClientConfig {
    let verifier = PinnedVerifier {
        expected: normalize_fingerprint(pinned_fingerprint),
        algorithms: supported_algorithms(),
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

/// Client config that accepts any certificate and reports its fingerprint
pub fn build_client_config_capture() -> (rustls::ClientConfig, Arc<Mutex<Option<String>>>) {
    let seen = Arc::new(Mutex::new(None));
    let verifier = CaptureVerifier {
        seen: seen.clone(),
        algorithms: supported_algorithms(),
    };
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    (cfg, seen)
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ServerName::IpAddress(ip.into());
    }
    ServerName::try_from(host.to_string())
        .unwrap_or_else(|_| ServerName::IpAddress(IpAddr::from([127, 0, 0, 1]).into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn self_signed_der() -> CertificateDer<'static> {
        let cert = rcgen::generate_simple_self_signed(vec!["tortugad.local".to_string()]).unwrap();
        CertificateDer::from(cert.serialize_der().unwrap())
    }

    fn check(verifier: &dyn ServerCertVerifier, cert: &CertificateDer<'_>) -> bool {
        let name = ServerName::try_from("tortugad.local").unwrap();
        verifier
            .verify_server_cert(cert, &[], &name, &[], UnixTime::now())
            .is_ok()
    }

    #[test]
    fn test_pinned_verifier_accepts_exact_fingerprint() {
        let cert = self_signed_der();
        let v = PinnedVerifier {
            expected: fingerprint(&cert),
            algorithms: supported_algorithms(),
        };
        assert!(check(&v, &cert));
    }

    #[test]
    fn test_pinned_verifier_rejects_other_certificate() {
        let pinned = self_signed_der();
        let presented = self_signed_der();
        let v = PinnedVerifier {
            expected: fingerprint(&pinned),
            algorithms: supported_algorithms(),
        };
        assert!(!check(&v, &presented));
    }

    #[test]
    fn test_capture_verifier_records_fingerprint() {
        let cert = self_signed_der();
        let (_cfg, seen) = build_client_config_capture();
        let v = CaptureVerifier {
            seen: seen.clone(),
            algorithms: supported_algorithms(),
        };
        assert!(check(&v, &cert));
        assert_eq!(seen.lock().clone(), Some(fingerprint(&cert)));
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("AB:cd:0F"), "abcd0f");
        assert_eq!(normalize_fingerprint(" abcd0f \n"), "abcd0f");
    }

    #[test]
    fn test_generated_cert_is_stable_on_reload() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("tls/cert.pem");
        let key = dir.path().join("tls/key.pem");
        load_or_generate_server_config(Some(cert.clone()), Some(key.clone())).unwrap();
        let first = fingerprint_of_pem(&cert).unwrap();
        load_or_generate_server_config(Some(cert.clone()), Some(key)).unwrap();
        assert_eq!(fingerprint_of_pem(&cert).unwrap(), first);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(load_or_generate_server_config(Some(dir.path().join("c.pem")), None).is_err());
    }
}
