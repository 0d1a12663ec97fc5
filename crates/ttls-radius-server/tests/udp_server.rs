//! End-to-end tests over a real UDP socket
//!
//! Covers:
//! - PAP accept/reject with Proxy-State echo
//! - silent drops (unknown client, unsigned EAP)
//! - challenge retransmission and its cancellation

mod common;

use common::*;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use ttls_radius_proto::auth::{encrypt_user_password, generate_request_authenticator};
use ttls_radius_proto::eap::EapType;
use ttls_radius_proto::message_auth::encode_with_message_authenticator;
use ttls_radius_proto::{Attribute, AttributeType, Code, Packet};
use ttls_radius_server::Client;

fn create_access_request(username: &str, password: &str, identifier: u8) -> Packet {
    let authenticator = generate_request_authenticator();
    let mut packet = Packet::new(Code::AccessRequest, identifier, authenticator);
    packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), username).unwrap());
    packet.add_attribute(
        Attribute::new(
            AttributeType::UserPassword.as_u8(),
            encrypt_user_password(password.as_bytes(), SECRET, &authenticator),
        )
        .unwrap(),
    );
    packet
}

async fn expect_silence(socket: &UdpSocket, wait: Duration) {
    let mut buf = vec![0u8; 4096];
    let received = timeout(wait, socket.recv_from(&mut buf)).await;
    assert!(received.is_err(), "server should not have replied");
}

#[tokio::test]
async fn test_pap_accept_over_udp() {
    let server = start_server(|_| {}).await;
    let nas = Supplicant::new(server.addr, "alice").await;

    let mut request = create_access_request("alice", "password", 42);
    request.add_attribute(Attribute::new(AttributeType::ProxyState.as_u8(), b"hop-1".to_vec()).unwrap());
    let reply = nas.round_trip(&request.encode().unwrap()).await.expect("reply");

    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(reply.identifier, 42);
    assert_eq!(
        reply.find_attribute(AttributeType::ProxyState.as_u8()).unwrap().value,
        b"hop-1".to_vec()
    );
}

#[tokio::test]
async fn test_pap_reject_over_udp() {
    let server = start_server(|_| {}).await;
    let nas = Supplicant::new(server.addr, "alice").await;

    let request = create_access_request("alice", "wrong", 7);
    let reply = nas.round_trip(&request.encode().unwrap()).await.expect("reply");
    assert_eq!(reply.code, Code::AccessReject);
}

#[tokio::test]
async fn test_unknown_client_gets_no_reply() {
    let server = start_server(|config| {
        config.clients = vec![Client {
            address: "10.0.0.0/8".to_string(),
            secret: None,
            name: None,
            enabled: true,
        }];
    })
    .await;
    let nas = Supplicant::new(server.addr, "alice").await;

    let request = create_access_request("alice", "password", 1);
    nas.socket.send_to(&request.encode().unwrap(), server.addr).await.unwrap();
    expect_silence(&nas.socket, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_unsigned_eap_request_dropped() {
    let server = start_server(|_| {}).await;
    let nas = Supplicant::new(server.addr, "alice").await;

    let mut request = Packet::new(Code::AccessRequest, 9, generate_request_authenticator());
    let identity = eap_response(0, EapType::Identity.as_u8(), b"alice");
    request.add_attribute(Attribute::new(AttributeType::EapMessage.as_u8(), identity).unwrap());
    nas.socket.send_to(&request.encode().unwrap(), server.addr).await.unwrap();
    expect_silence(&nas.socket, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_challenge_is_retransmitted() {
    let server = start_server(|config| {
        config.retransmit.max_retries = 2;
        config.retransmit.base_delay_ms = 50;
    })
    .await;
    let nas = Supplicant::new(server.addr, "alice").await;

    let mut request = Packet::new(Code::AccessRequest, 5, generate_request_authenticator());
    let identity = eap_response(0, EapType::Identity.as_u8(), b"alice");
    request.add_attribute(Attribute::new(AttributeType::EapMessage.as_u8(), identity).unwrap());
    let bytes = encode_with_message_authenticator(&request, SECRET).unwrap();
    nas.socket.send_to(&bytes, server.addr).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let mut copies = Vec::new();
    for _ in 0..3 {
        let (len, _) = timeout(Duration::from_secs(2), nas.socket.recv_from(&mut buf))
            .await
            .expect("challenge copy arrives")
            .unwrap();
        copies.push(buf[..len].to_vec());
    }
    assert_eq!(Packet::decode(&copies[0]).unwrap().code, Code::AccessChallenge);
    assert!(copies.iter().all(|copy| copy == &copies[0]));

    // Retries are exhausted
    expect_silence(&nas.socket, Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_next_request_cancels_retransmission() {
    let server = start_server(|config| {
        config.retransmit.max_retries = 3;
        config.retransmit.base_delay_ms = 150;
    })
    .await;
    let mut nas = Supplicant::new(server.addr, "alice").await;

    let start = nas.identity().await;
    assert_eq!(start.code, Code::AccessChallenge);

    // Any datagram from the same address counts as an answer
    let reply = nas
        .round_trip(&create_access_request("alice", "password", 99).encode().unwrap())
        .await
        .expect("reply");
    assert_eq!(reply.code, Code::AccessAccept);
    expect_silence(&nas.socket, Duration::from_millis(500)).await;
}
