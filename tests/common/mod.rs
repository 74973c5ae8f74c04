//! Common test utilities for integration tests: a throwaway PKI written to
//! a temp dir and a blocking HTTP/1.1 client over plain TCP or rustls.

#![allow(dead_code)]

use aurora_core::config::Properties;
use aurora_core::IcebergServerConfig;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Properties for a plaintext server on an ephemeral loopback port.
pub fn base_properties() -> Properties {
    Properties::new()
        .with("host", "127.0.0.1")
        .with("http.port", "0")
        .with("https.port", "0")
        .with("min.threads", "1")
        .with("max.threads", "4")
        .with("thread.pool.work.queue.size", "8")
        .with("stop.timeout", "1000")
        .with("iceberg.metrics.store", "memory")
}

pub fn config(props: Properties) -> IcebergServerConfig {
    IcebergServerConfig::from_properties(props).unwrap()
}

// ============================================================================
// PKI
// ============================================================================

pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

impl Identity {
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// A CA plus a server and a client certificate issued by it.
pub struct TestPki {
    dir: TempDir,
    pub ca: Identity,
    pub server: Identity,
    pub client: Identity,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = named("Aurora Test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server = issue("localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca_cert, &ca_key);
        let client = issue("aurora-client", ExtendedKeyUsagePurpose::ClientAuth, &ca_cert, &ca_key);

        Self {
            dir: TempDir::new().unwrap(),
            ca: identity(&ca_cert, &ca_key),
            server,
            client,
        }
    }

    /// PEM key store holding the server certificate and its key.
    pub fn write_server_key_store(&self) -> PathBuf {
        let contents = format!("{}{}", self.server.cert_pem, self.server.key_pem);
        self.write("server.pem", contents.as_bytes())
    }

    /// PKCS#12 key store holding the server certificate and its key.
    pub fn write_server_pkcs12(&self, password: &str) -> PathBuf {
        let pfx = p12_der(&self.server, password);
        self.write("server.p12", &pfx)
    }

    pub fn write_ca_trust_store(&self) -> PathBuf {
        self.write("ca.pem", self.ca.cert_pem.as_bytes())
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Properties enabling HTTPS with the PEM server key store.
    pub fn https_properties(&self) -> Properties {
        let key_store = self.write_server_key_store();
        base_properties()
            .with("enable.https", "true")
            .with("keystore.path", key_store.to_str().unwrap())
            .with("keystore.password", "changeit")
            .with("keystore.manager.password", "changeit")
    }
}

fn named(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

fn issue(
    common_name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> Identity {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
    params.distinguished_name = named(common_name);
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
    identity(&cert, &key)
}

fn identity(cert: &Certificate, key: &KeyPair) -> Identity {
    Identity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: key.serialize_der(),
    }
}

fn p12_der(identity: &Identity, password: &str) -> Vec<u8> {
    p12::PFX::new(&identity.cert_der, &identity.key_der, None, password, "aurora")
        .unwrap()
        .to_der()
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

fn request_bytes(method: &str, path: &str, body: Option<&str>) -> Vec<u8> {
    let body = body.unwrap_or_default();
    format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn read_response<S: Read>(stream: &mut S) -> io::Result<HttpResponse> {
    let mut raw = Vec::new();
    match stream.read_to_end(&mut raw) {
        Ok(_) => {}
        // peers may close without close_notify once the response is out
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !raw.is_empty() => {}
        Err(e) => return Err(e),
    }
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> io::Result<HttpResponse> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "incomplete response"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing status line"))?;
    Ok(HttpResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    })
}

/// Sends one request over plain TCP.
pub fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> io::Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.write_all(&request_bytes(method, path, body))?;
    read_response(&mut stream)
}

pub fn get(addr: SocketAddr, path: &str) -> io::Result<HttpResponse> {
    http_request(addr, "GET", path, None)
}

/// TLS client trusting `ca`, optionally presenting `identity`.
pub fn tls_client(ca: &Identity, identity: Option<&Identity>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(ca.cert_der.clone()).unwrap();

    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain(), identity.private_key())
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

/// Sends one GET over TLS, verifying the server as `localhost`.
pub fn https_get(
    addr: SocketAddr,
    client: Arc<ClientConfig>,
    path: &str,
) -> io::Result<HttpResponse> {
    let server_name = ServerName::try_from("localhost")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let connection = ClientConnection::new(client, server_name)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let socket = TcpStream::connect(addr)?;
    socket.set_read_timeout(Some(IO_TIMEOUT))?;
    socket.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut stream = StreamOwned::new(connection, socket);
    stream.write_all(&request_bytes("GET", path, None))?;
    stream.flush()?;
    read_response(&mut stream)
}
