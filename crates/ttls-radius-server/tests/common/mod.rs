//! Shared fixtures: a live server on 127.0.0.1 and a scripted supplicant

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use ttls_radius_proto::auth::{generate_request_authenticator, verify_response_authenticator};
use ttls_radius_proto::eap::avp::{decode_avps, encode_avps};
use ttls_radius_proto::eap::{EapCode, EapHeader, EapType, FragmentAssembler, eap_message_attributes};
use ttls_radius_proto::message_auth::encode_with_message_authenticator;
use ttls_radius_proto::{Attribute, AttributeType, Avp, Code, Packet};
use ttls_radius_server::eap::outer_chain;
use ttls_radius_server::{
    Config, LoopbackClient, RadiusServer, ServerConfig, TlsContext, User, backend_from_users,
};

pub const SECRET: &[u8] = b"testing123";

pub struct TestServer {
    pub addr: SocketAddr,
    _certs: TempDir,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts a server with alice/password, a fresh self-signed certificate
/// and no retransmissions unless `configure` says otherwise.
pub async fn start_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let certs = tempfile::tempdir().expect("temp dir");
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("certificate");
    let cert_path = certs.path().join("server.pem");
    let key_path = certs.path().join("server-key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let mut config = Config {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        users: vec![User {
            username: "alice".to_string(),
            password: "password".to_string(),
        }],
        ..Config::default()
    };
    config.tls.cert_path = cert_path;
    config.tls.key_path = key_path;
    config.retransmit.max_retries = 0;
    configure(&mut config);

    let tls = TlsContext::from_pem_files(&config.tls.cert_path, &config.tls.key_path).expect("tls context");
    tls.check_key_export().expect("key export");
    let backend = backend_from_users(&config.users, &config.auth_cache);
    let chain = outer_chain(&config, backend, Some(Arc::new(tls)));

    let server = RadiusServer::new(ServerConfig::from_config(config, Arc::new(chain)).unwrap())
        .await
        .expect("server binds");
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        addr,
        _certs: certs,
        handle,
    }
}

pub fn eap_response(identifier: u8, eap_type: u8, data: &[u8]) -> Vec<u8> {
    let length = (5 + data.len()) as u16;
    let mut frame = vec![EapCode::Response.as_u8(), identifier];
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(eap_type);
    frame.extend_from_slice(data);
    frame
}

/// Tunneled response with a zero flags octet.
pub fn tunneled(identifier: u8, eap_type: EapType, data: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8];
    body.extend_from_slice(data);
    eap_response(identifier, eap_type.as_u8(), &body)
}

/// A NAS relaying one supplicant's EAP conversation.
pub struct Supplicant {
    pub socket: UdpSocket,
    pub server: SocketAddr,
    pub user_name: String,
    pub state: Option<Vec<u8>>,
    pub radius_id: u8,
    /// Request Authenticator of the last request sent
    pub last_authenticator: [u8; 16],
}

impl Supplicant {
    pub async fn new(server: SocketAddr, user_name: &str) -> Self {
        Supplicant {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            user_name: user_name.to_string(),
            state: None,
            radius_id: 0,
            last_authenticator: [0u8; 16],
        }
    }

    /// Sends one EAP frame in a signed Access-Request and returns the
    /// verified reply.
    pub async fn send_eap(&mut self, frame: &[u8]) -> Packet {
        let authenticator = generate_request_authenticator();
        self.radius_id = self.radius_id.wrapping_add(1);
        let mut request = Packet::new(Code::AccessRequest, self.radius_id, authenticator);
        request.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), self.user_name.clone()).unwrap());
        for attribute in eap_message_attributes(frame).unwrap() {
            request.add_attribute(attribute);
        }
        if let Some(state) = &self.state {
            request.add_attribute(Attribute::new(AttributeType::State.as_u8(), state.clone()).unwrap());
        }
        let bytes = encode_with_message_authenticator(&request, SECRET).unwrap();

        let reply = self.round_trip(&bytes).await.expect("server replied");
        assert!(verify_response_authenticator(&reply, &authenticator, SECRET));
        assert!(reply.find_attribute(AttributeType::MessageAuthenticator.as_u8()).is_some());
        self.last_authenticator = authenticator;
        if let Some(state) = reply.find_attribute(AttributeType::State.as_u8()) {
            self.state = Some(state.value.clone());
        }
        reply
    }

    /// Sends raw bytes and waits for the reply with the same identifier.
    pub async fn round_trip(&self, bytes: &[u8]) -> Option<Packet> {
        self.socket.send_to(bytes, self.server).await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, _) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .unwrap();
            let reply = Packet::decode(&buf[..len]).unwrap();
            if reply.identifier == bytes[1] {
                return Some(reply);
            }
        }
    }

    pub async fn identity(&mut self) -> Packet {
        let frame = eap_response(0, EapType::Identity.as_u8(), self.user_name.as_bytes());
        self.send_eap(&frame).await
    }
}

pub fn eap_of(reply: &Packet) -> EapHeader {
    EapHeader::decode(&reply.eap_message().expect("EAP-Message")).unwrap()
}

/// Drives a TTLS or PEAP tunnel from the supplicant side.
pub struct TunnelPeer {
    pub nas: Supplicant,
    pub client: LoopbackClient,
    pub eap_type: EapType,
    pub identifier: u8,
}

impl TunnelPeer {
    pub fn new(nas: Supplicant, client: LoopbackClient, eap_type: EapType, start: &EapHeader) -> Self {
        assert_eq!(start.eap_type(), Some(eap_type));
        assert!(start.flags.unwrap().is_start());
        TunnelPeer {
            nas,
            client,
            eap_type,
            identifier: start.identifier,
        }
    }

    /// Sends tunneled data, acknowledging server fragments, and returns the
    /// final reply plus the reassembled server payload.
    pub async fn send(&mut self, data: &[u8]) -> (Packet, Vec<u8>) {
        let mut frame = tunneled(self.identifier, self.eap_type, data);
        let mut assembler = FragmentAssembler::new();
        loop {
            let reply = self.nas.send_eap(&frame).await;
            if reply.code != Code::AccessChallenge {
                return (reply, Vec::new());
            }
            let header = eap_of(&reply);
            self.identifier = header.identifier;
            if let Some(payload) = assembler.push(&header).unwrap() {
                return (reply, payload);
            }
            frame = tunneled(self.identifier, self.eap_type, &[]);
        }
    }

    pub async fn handshake(&mut self) -> Packet {
        let mut last = None;
        for _ in 0..4 {
            let outgoing = self.client.take_output().unwrap();
            if outgoing.is_empty() && !self.client.is_handshaking() {
                break;
            }
            let (reply, payload) = self.send(&outgoing).await;
            if reply.code != Code::AccessChallenge {
                return reply;
            }
            self.client.feed(&payload).unwrap();
            last = Some(reply);
        }
        last.expect("handshake exchanged messages")
    }

    /// Sends an inner EAP frame; returns the reply and the inner frame the
    /// server answered with, if the exchange continues.
    pub async fn inner(&mut self, frame: Vec<u8>) -> (Packet, Option<Vec<u8>>) {
        self.client.send(&encode_avps(&[Avp::eap_message(frame)]).unwrap()).unwrap();
        let ciphertext = self.client.take_output().unwrap();
        let (reply, payload) = self.send(&ciphertext).await;
        if payload.is_empty() {
            return (reply, None);
        }
        let plaintext = self.client.feed(&payload).unwrap();
        let avps = decode_avps(&plaintext).unwrap();
        (reply, avps.into_iter().next().map(|avp| avp.data))
    }
}

/// MS-MPPE (vendor type, encrypted blob) pairs of a reply.
pub fn mppe_attributes(reply: &Packet) -> Vec<(u8, Vec<u8>)> {
    reply
        .find_all_attributes(AttributeType::VendorSpecific.as_u8())
        .into_iter()
        .map(|attribute| attribute.as_vendor_specific().unwrap())
        .filter(|vsa| vsa.vendor_id == ttls_radius_proto::mppe::MICROSOFT_VENDOR_ID)
        .map(|vsa| (vsa.vendor_type, vsa.data))
        .collect()
}
