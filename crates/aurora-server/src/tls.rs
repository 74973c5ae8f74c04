//! TLS acceptor construction from [`TlsMaterial`]
//!
//! Key material is read from PEM (certificate chain and private key in one
//! file) or PKCS#12. Protocol pinning and the cipher allow-list are applied
//! to the `ring` crypto provider before the server config is built.

use aurora_core::config::{KeyStoreType, TlsMaterial};
use aurora_core::{AuroraError, Result};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::version::{TLS12, TLS13};
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Builds the acceptor, failing eagerly on unreadable or invalid material.
pub fn build_tls_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor> {
    let mut provider = ring::default_provider();
    if !material.cipher_suites.is_empty() {
        provider.cipher_suites =
            select_cipher_suites(&provider.cipher_suites, &material.cipher_suites)?;
    }
    let provider = Arc::new(provider);

    let (certs, key) = load_key_store(material)?;
    info!(
        key_store = %material.key_store_path,
        key_store_type = %material.key_store_type,
        chain_len = certs.len(),
        client_auth = material.client_auth_required,
        "Building TLS server configuration"
    );

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(protocol_versions(material.protocol.as_deref())?)
        .map_err(|e| AuroraError::tls(format!("Unsupported protocol/cipher combination: {e}")))?;

    let builder = if material.client_auth_required {
        let roots = load_trust_store(material)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| AuroraError::tls(format!("Failed to build client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| AuroraError::tls(format!("Invalid certificate or key: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Canonical IANA form: upper case, `TLS13_` spelled `TLS_`.
fn normalize_suite_name(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    match upper.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{rest}"),
        None => upper,
    }
}

fn select_cipher_suites(
    available: &[SupportedCipherSuite],
    allowed: &[String],
) -> Result<Vec<SupportedCipherSuite>> {
    let allowed: Vec<String> = allowed.iter().map(|s| normalize_suite_name(s)).collect();
    let selected: Vec<SupportedCipherSuite> = available
        .iter()
        .filter(|suite| {
            let name = normalize_suite_name(&format!("{:?}", suite.suite()));
            allowed.contains(&name)
        })
        .copied()
        .collect();

    if selected.is_empty() {
        return Err(AuroraError::tls(format!(
            "None of the configured cipher suites are supported: {}",
            allowed.join(",")
        )));
    }
    debug!(count = selected.len(), "Restricted TLS cipher suites");
    Ok(selected)
}

fn protocol_versions(
    protocol: Option<&str>,
) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];
    static ALL: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

    match protocol.map(str::trim) {
        None | Some("") | Some("TLS") => Ok(ALL),
        Some("TLSv1.2") => Ok(TLS12_ONLY),
        Some("TLSv1.3") => Ok(TLS13_ONLY),
        Some(other) => Err(AuroraError::tls(format!("Unsupported TLS protocol '{other}'"))),
    }
}

fn read_file(path: &str, what: &str) -> Result<Vec<u8>> {
    if !Path::new(path).is_file() {
        return Err(AuroraError::tls(format!("{what} not found: {path}")));
    }
    std::fs::read(path).map_err(|e| AuroraError::tls(format!("Failed to read {what} {path}: {e}")))
}

type KeyPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_key_store(material: &TlsMaterial) -> Result<KeyPair> {
    let path = material.key_store_path.as_str();
    let bytes = read_file(path, "key store")?;

    let (certs, key) = match material.key_store_type {
        KeyStoreType::Pem => {
            let certs = rustls_pemfile::certs(&mut bytes.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    AuroraError::tls(format!("Failed to parse certificates in {path}: {e}"))
                })?;
            let key = rustls_pemfile::private_key(&mut bytes.as_slice())
                .map_err(|e| {
                    AuroraError::tls(format!("Failed to parse private key in {path}: {e}"))
                })?
                .ok_or_else(|| AuroraError::tls(format!("No private key found in {path}")))?;
            (certs, key)
        }
        KeyStoreType::Pkcs12 => {
            let pfx = parse_pkcs12(&bytes, path, &material.key_store_password)?;
            let certs = pkcs12_certs(&pfx, path, &material.key_store_password)?;
            let key = [&material.key_manager_password, &material.key_store_password]
                .into_iter()
                .find_map(|password| pfx.key_bags(password).ok()?.into_iter().next())
                .map(|der| PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)))
                .ok_or_else(|| AuroraError::tls(format!("No private key found in {path}")))?;
            (certs, key)
        }
    };

    if certs.is_empty() {
        return Err(AuroraError::tls(format!("No certificates found in {path}")));
    }
    Ok((certs, key))
}

fn load_trust_store(material: &TlsMaterial) -> Result<RootCertStore> {
    let path = material
        .trust_store_path
        .as_deref()
        .ok_or_else(|| AuroraError::tls("Client authentication requires a trust store"))?;
    let bytes = read_file(path, "trust store")?;

    let certs = match material.trust_store_type {
        KeyStoreType::Pem => rustls_pemfile::certs(&mut bytes.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AuroraError::tls(format!("Failed to parse certificates in {path}: {e}")))?,
        KeyStoreType::Pkcs12 => {
            let password = material.trust_store_password.as_deref().unwrap_or_default();
            let pfx = parse_pkcs12(&bytes, path, password)?;
            pkcs12_certs(&pfx, path, password)?
        }
    };

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!(path, added, ignored, "Loaded trust store");
    if added == 0 {
        return Err(AuroraError::tls(format!("No usable CA certificates in {path}")));
    }
    Ok(roots)
}

fn parse_pkcs12(bytes: &[u8], path: &str, password: &str) -> Result<p12::PFX> {
    let pfx = p12::PFX::parse(bytes)
        .map_err(|e| AuroraError::tls(format!("Failed to parse PKCS#12 file {path}: {e:?}")))?;
    if !pfx.verify_mac(password) {
        return Err(AuroraError::tls(format!("Wrong password for PKCS#12 file {path}")));
    }
    Ok(pfx)
}

fn pkcs12_certs(
    pfx: &p12::PFX,
    path: &str,
    password: &str,
) -> Result<Vec<CertificateDer<'static>>> {
    let bags = pfx
        .cert_x509_bags(password)
        .map_err(|e| AuroraError::tls(format!("Failed to read certificates in {path}: {e:?}")))?;
    Ok(bags.into_iter().map(CertificateDer::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn self_signed() -> (String, String, Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (
            cert.cert.pem(),
            cert.key_pair.serialize_pem(),
            cert.cert.der().to_vec(),
            cert.key_pair.serialize_der(),
        )
    }

    fn write(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    fn material(path: &str, key_store_type: KeyStoreType) -> TlsMaterial {
        TlsMaterial {
            key_store_path: path.to_string(),
            key_store_password: "secret".to_string(),
            key_manager_password: "secret".to_string(),
            key_store_type,
            protocol: None,
            cipher_suites: Vec::new(),
            client_auth_required: false,
            trust_store_path: None,
            trust_store_password: None,
            trust_store_type: KeyStoreType::Pem,
        }
    }

    #[test]
    fn test_pem_key_store() {
        let (cert, key, _, _) = self_signed();
        let file = write(format!("{cert}{key}").as_bytes());
        let material = material(file.path().to_str().unwrap(), KeyStoreType::Pem);
        assert!(build_tls_acceptor(&material).is_ok());
    }

    #[test]
    fn test_pkcs12_key_store() {
        let (_, _, cert_der, key_der) = self_signed();
        let pfx = p12::PFX::new(&cert_der, &key_der, None, "secret", "aurora").unwrap();
        let file = write(&pfx.to_der());
        let material = material(file.path().to_str().unwrap(), KeyStoreType::Pkcs12);
        assert!(build_tls_acceptor(&material).is_ok());

        let mut wrong = material.clone();
        wrong.key_store_password = "nope".to_string();
        wrong.key_manager_password = "nope".to_string();
        let err = build_tls_acceptor(&wrong).err().unwrap();
        assert!(err.to_string().contains("Wrong password"), "{err}");
    }

    #[test]
    fn test_missing_key_store() {
        let material = material("/definitely/not/here.pem", KeyStoreType::Pem);
        let err = build_tls_acceptor(&material).err().unwrap();
        assert!(matches!(err, AuroraError::TlsConfiguration { .. }));
    }

    #[test]
    fn test_pem_without_key() {
        let (cert, _, _, _) = self_signed();
        let file = write(cert.as_bytes());
        let material = material(file.path().to_str().unwrap(), KeyStoreType::Pem);
        let err = build_tls_acceptor(&material).err().unwrap();
        assert!(err.to_string().contains("No private key"), "{err}");
    }

    #[test]
    fn test_cipher_allow_list() {
        let available = ring::default_provider().cipher_suites;
        let selected = select_cipher_suites(
            &available,
            &["tls_aes_128_gcm_sha256".to_string(), "TLS13_AES_256_GCM_SHA384".to_string()],
        )
        .unwrap();
        assert_eq!(selected.len(), 2);

        let err = select_cipher_suites(&available, &["TLS_NULL_WITH_NULL_NULL".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, AuroraError::TlsConfiguration { .. }));
    }

    #[test]
    fn test_protocol_pinning() {
        assert_eq!(protocol_versions(None).unwrap().len(), 2);
        assert_eq!(protocol_versions(Some("TLSv1.3")).unwrap().len(), 1);
        assert!(protocol_versions(Some("SSLv3")).is_err());
    }

    #[test]
    fn test_tls13_only_with_tls12_ciphers_fails() {
        let (cert, key, _, _) = self_signed();
        let file = write(format!("{cert}{key}").as_bytes());
        let mut material = material(file.path().to_str().unwrap(), KeyStoreType::Pem);
        material.protocol = Some("TLSv1.3".to_string());
        material.cipher_suites = vec!["TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".to_string()];
        assert!(build_tls_acceptor(&material).is_err());
    }

    #[test]
    fn test_client_auth_requires_trust_store_file() {
        let (cert, key, _, _) = self_signed();
        let file = write(format!("{cert}{key}").as_bytes());
        let mut material = material(file.path().to_str().unwrap(), KeyStoreType::Pem);
        material.client_auth_required = true;
        material.trust_store_path = Some("/missing/ca.pem".to_string());
        let err = build_tls_acceptor(&material).err().unwrap();
        assert!(err.to_string().contains("trust store not found"), "{err}");

        let ca = write(cert.as_bytes());
        material.trust_store_path = Some(ca.path().to_str().unwrap().to_string());
        assert!(build_tls_acceptor(&material).is_ok());
    }
}
