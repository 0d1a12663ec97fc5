//! TLS tunnel engine for EAP-TTLS and PEAP
//!
//! A [`TlsTunnel`] is a rustls server connection driven entirely from
//! memory: ciphertext taken out of EAP frames is fed in, and the engine
//! reports what happened as a list of [`TunnelEvent`]s. There is no
//! socket; the EAP exchange is the transport.

use crate::cache::TtlCache;
use pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::server::StoresServerSessions;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, HandshakeKind, ServerConfig,
    ServerConnection, SignatureScheme, version,
};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// RFC 5281 Section 8 exporter label.
pub const TTLS_KEYING_LABEL: &[u8] = b"ttls keying material";

/// How long a finished TLS session can be resumed.
pub const SESSION_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("TLS configuration error: {0}")]
    Config(rustls::Error),
    #[error("TLS protocol error: {0}")]
    Protocol(rustls::Error),
    #[error("Keying material export failed: {0}")]
    KeyExport(rustls::Error),
    #[error("Keying material differs between the tunnel ends")]
    KeyMismatch,
    #[error("Loopback handshake did not complete")]
    HandshakeIncomplete,
}

/// Server-side resumption cache keyed by TLS session id.
pub struct ResumptionStore {
    sessions: TtlCache<Vec<u8>, Vec<u8>>,
}

impl ResumptionStore {
    pub fn new(ttl: Duration) -> Self {
        ResumptionStore {
            sessions: TtlCache::new(ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl fmt::Debug for ResumptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl StoresServerSessions for ResumptionStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.sessions.set(key, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.sessions.get(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.sessions.take(key)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

/// Process-wide server certificate and session cache.
pub struct TlsContext {
    config: Arc<ServerConfig>,
    sessions: Arc<ResumptionStore>,
}

impl TlsContext {
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut cert_reader = BufReader::new(std::fs::File::open(cert_path).map_err(|e| {
            TlsError::Certificate(format!("Failed to open certificate file '{}': {}", cert_path.display(), e))
        })?);
        let mut key_reader = BufReader::new(std::fs::File::open(key_path).map_err(|e| {
            TlsError::Certificate(format!("Failed to open key file '{}': {}", key_path.display(), e))
        })?);

        let certs = load_certificates(&mut cert_reader)?;
        let key = load_private_key(&mut key_reader)?;
        info!(
            cert = %cert_path.display(),
            chain_length = certs.len(),
            "Loaded tunnel server certificate"
        );
        Self::build(certs, key)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certs = load_certificates(&mut &cert_pem[..])?;
        let key = load_private_key(&mut &key_pem[..])?;
        Self::build(certs, key)
    }

    fn build(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self, TlsError> {
        validate_certificate(&certs[0])?;

        let sessions = Arc::new(ResumptionStore::new(SESSION_CACHE_TTL));
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&version::TLS12])
            .map_err(TlsError::Config)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Config)?;
        config.session_storage = sessions.clone();

        Ok(TlsContext {
            config: Arc::new(config),
            sessions,
        })
    }

    pub fn open_tunnel(&self) -> Result<TlsTunnel, TlsError> {
        let conn = ServerConnection::new(Arc::clone(&self.config)).map_err(TlsError::Config)?;
        Ok(TlsTunnel {
            conn,
            secured: false,
            closed: false,
        })
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Runs a loopback handshake against this context and exports keying
    /// material on both ends. MPPE keys cannot be produced without this,
    /// so a failure here must stop the server from starting.
    pub fn check_key_export(&self) -> Result<(), TlsError> {
        let mut client = LoopbackClient::new(LoopbackClient::config()?)?;
        let mut tunnel = self.open_tunnel()?;

        for _ in 0..8 {
            let outgoing = client.take_output()?;
            if outgoing.is_empty() && !client.is_handshaking() && tunnel.is_secured() {
                break;
            }
            let events = tunnel.feed_ciphertext(&outgoing)?;
            client.feed(&TunnelEvent::responses(&events))?;
        }
        if client.is_handshaking() || !tunnel.is_secured() {
            return Err(TlsError::HandshakeIncomplete);
        }

        let server_keys = tunnel.export_keying_material()?;
        let client_keys = client.export_keying_material()?;
        if server_keys.as_bytes() != client_keys.as_bytes() {
            return Err(TlsError::KeyMismatch);
        }
        debug!("Keying material export verified");
        Ok(())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn load_certificates(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("No certificates found".to_string()));
    }
    Ok(certs)
}

fn load_private_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| TlsError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::Certificate("No private key found".to_string()))
}

/// Rejects certificates that do not parse or are outside their validity window.
fn validate_certificate(cert: &CertificateDer<'_>) -> Result<(), TlsError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| TlsError::Certificate(format!("Invalid X.509 certificate: {}", e)))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| TlsError::Certificate(format!("System time error: {}", e)))?
        .as_secs() as i64;

    let validity = parsed.validity();
    if now < validity.not_before.timestamp() {
        return Err(TlsError::Certificate(format!(
            "Certificate is not yet valid (not before: {})",
            validity.not_before
        )));
    }
    if now > validity.not_after.timestamp() {
        return Err(TlsError::Certificate(format!(
            "Certificate has expired (not after: {})",
            validity.not_after
        )));
    }
    Ok(())
}

/// Something the tunnel produced while consuming input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Decrypted application data from the peer.
    Incoming(Vec<u8>),
    /// Ciphertext to send to the peer.
    Response(Vec<u8>),
    /// Handshake finished; emitted once per tunnel.
    Secured { session_reused: bool },
    /// The peer closed the TLS session.
    End,
}

impl TunnelEvent {
    /// All `Response` ciphertext, concatenated.
    pub fn responses(events: &[TunnelEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                TunnelEvent::Response(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// All `Incoming` plaintext, concatenated.
    #[cfg(test)]
    pub(crate) fn incoming(events: &[TunnelEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                TunnelEvent::Incoming(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

pub struct TlsTunnel {
    conn: ServerConnection,
    secured: bool,
    closed: bool,
}

impl TlsTunnel {
    /// Pushes peer ciphertext through the engine.
    pub fn feed_ciphertext(&mut self, mut data: &[u8]) -> Result<Vec<TunnelEvent>, TlsError> {
        let mut events = Vec::new();

        while !data.is_empty() {
            if self.conn.read_tls(&mut data)? == 0 {
                break;
            }
            let state = self.conn.process_new_packets().map_err(|e| {
                debug!(error = %e, "TLS record processing failed");
                TlsError::Protocol(e)
            })?;

            if !self.secured && !self.conn.is_handshaking() {
                self.secured = true;
                let session_reused = self.conn.handshake_kind() == Some(HandshakeKind::Resumed);
                debug!(session_reused, "TLS tunnel secured");
                events.push(TunnelEvent::Secured { session_reused });
            }

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut plaintext = vec![0u8; pending];
                self.conn.reader().read_exact(&mut plaintext)?;
                events.push(TunnelEvent::Incoming(plaintext));
            }

            if state.peer_has_closed() && !self.closed {
                self.closed = true;
                events.push(TunnelEvent::End);
            }
        }

        self.flush(&mut events)?;
        Ok(events)
    }

    /// Encrypts application data for the peer.
    pub fn feed_plaintext(&mut self, data: &[u8]) -> Result<Vec<TunnelEvent>, TlsError> {
        self.conn.writer().write_all(data)?;
        let mut events = Vec::new();
        self.flush(&mut events)?;
        Ok(events)
    }

    fn flush(&mut self, events: &mut Vec<TunnelEvent>) -> Result<(), TlsError> {
        let mut ciphertext = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut ciphertext)?;
        }
        if !ciphertext.is_empty() {
            events.push(TunnelEvent::Response(ciphertext));
        }
        Ok(())
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn export_keying_material(&self) -> Result<KeyingMaterial, TlsError> {
        export(|output| self.conn.export_keying_material(output, TTLS_KEYING_LABEL, None))
    }
}

fn export(
    exporter: impl FnOnce([u8; 128]) -> Result<[u8; 128], rustls::Error>,
) -> Result<KeyingMaterial, TlsError> {
    exporter([0u8; 128]).map(KeyingMaterial).map_err(TlsError::KeyExport)
}

/// 128 octets exported with [`TTLS_KEYING_LABEL`].
#[derive(Clone, PartialEq, Eq)]
pub struct KeyingMaterial([u8; 128]);

impl KeyingMaterial {
    /// Octets 0..64: MS-MPPE-Recv-Key.
    pub fn recv_key(&self) -> &[u8] {
        &self.0[..64]
    }

    /// Octets 64..128: MS-MPPE-Send-Key.
    pub fn send_key(&self) -> &[u8] {
        &self.0[64..]
    }

    pub fn as_bytes(&self) -> &[u8; 128] {
        &self.0
    }
}

impl fmt::Debug for KeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyingMaterial(..)")
    }
}

/// In-memory TLS 1.2 client that accepts any server certificate.
///
/// Used for the startup key-export check and to play the supplicant side
/// of a tunnel in tests.
pub struct LoopbackClient {
    conn: ClientConnection,
}

impl LoopbackClient {
    /// A client configuration; reuse it across connections to resume sessions.
    pub fn config() -> Result<Arc<ClientConfig>, TlsError> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&version::TLS12])
            .map_err(TlsError::Config)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    pub fn new(config: Arc<ClientConfig>) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from("localhost")
            .map_err(|e| TlsError::Certificate(format!("Invalid server name: {}", e)))?;
        let conn = ClientConnection::new(config, server_name).map_err(TlsError::Config)?;
        Ok(LoopbackClient { conn })
    }

    /// Ciphertext the client wants to send.
    pub fn take_output(&mut self) -> Result<Vec<u8>, TlsError> {
        let mut ciphertext = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut ciphertext)?;
        }
        Ok(ciphertext)
    }

    /// Consumes server ciphertext and returns any decrypted plaintext.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<u8>, TlsError> {
        let mut plaintext = Vec::new();
        while !data.is_empty() {
            if self.conn.read_tls(&mut data)? == 0 {
                break;
            }
            let state = self.conn.process_new_packets().map_err(TlsError::Protocol)?;
            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = plaintext.len();
                plaintext.resize(start + pending, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
        }
        Ok(plaintext)
    }

    pub fn send(&mut self, plaintext: &[u8]) -> Result<(), TlsError> {
        self.conn.writer().write_all(plaintext)?;
        Ok(())
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    #[cfg(test)]
    pub(crate) fn is_resumed(&self) -> bool {
        self.conn.handshake_kind() == Some(HandshakeKind::Resumed)
    }

    pub fn export_keying_material(&self) -> Result<KeyingMaterial, TlsError> {
        export(|output| self.conn.export_keying_material(output, TTLS_KEYING_LABEL, None))
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::TlsContext;

    pub fn self_signed_pem() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("certificate");
        (cert.pem(), key_pair.serialize_pem())
    }

    pub fn tls_context() -> TlsContext {
        let (cert, key) = self_signed_pem();
        TlsContext::from_pem(cert.as_bytes(), key.as_bytes()).expect("tls context")
    }
}
