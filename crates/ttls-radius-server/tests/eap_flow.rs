//! Complete EAP conversations against a live server
//!
//! Each test plays a NAS relaying one supplicant: Message-Authenticator
//! signed requests, State echoed back, replies checked against the
//! Request Authenticator.

mod common;

use common::*;
use ttls_radius_proto::eap::eap_md5::compute_response_hash;
use ttls_radius_proto::eap::{EapCode, EapHeader, EapType};
use ttls_radius_proto::mppe::{MS_MPPE_RECV_KEY, MS_MPPE_SEND_KEY, decrypt_key};
use ttls_radius_proto::{AttributeType, Code};
use ttls_radius_server::{LoopbackClient, MethodKind};

const NAK: u8 = 3;

fn md5_answer(request: &EapHeader, password: &[u8]) -> Vec<u8> {
    assert_eq!(request.eap_type(), Some(EapType::Md5Challenge));
    let (&size, value) = request.data.split_first().unwrap();
    assert_eq!(size as usize, value.len());
    let hash = compute_response_hash(request.identifier, password, value);
    let mut data = vec![16u8];
    data.extend_from_slice(&hash);
    eap_response(request.identifier, EapType::Md5Challenge.as_u8(), &data)
}

#[tokio::test]
async fn test_md5_after_nak() {
    let server = start_server(|_| {}).await;
    let mut nas = Supplicant::new(server.addr, "alice").await;

    let offer = eap_of(&nas.identity().await);
    assert_eq!(offer.eap_type(), Some(EapType::Ttls));

    let challenge = nas.send_eap(&eap_response(offer.identifier, NAK, &[4])).await;
    assert_eq!(challenge.code, Code::AccessChallenge);
    let challenge = eap_of(&challenge);

    let reply = nas.send_eap(&md5_answer(&challenge, b"password")).await;
    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(eap_of(&reply).code, EapCode::Success);
    assert_eq!(
        reply.find_attribute(AttributeType::UserName.as_u8()).unwrap().value,
        b"alice".to_vec()
    );
}

#[tokio::test]
async fn test_md5_wrong_password() {
    let server = start_server(|config| config.eap_methods = vec![MethodKind::Md5]).await;
    let mut nas = Supplicant::new(server.addr, "alice").await;

    let challenge = eap_of(&nas.identity().await);
    let reply = nas.send_eap(&md5_answer(&challenge, b"guess")).await;
    assert_eq!(reply.code, Code::AccessReject);
    assert_eq!(eap_of(&reply).code, EapCode::Failure);
}

#[tokio::test]
async fn test_gtc_only_server() {
    let server = start_server(|config| config.eap_methods = vec![MethodKind::Gtc]).await;
    let mut nas = Supplicant::new(server.addr, "alice").await;

    let prompt = eap_of(&nas.identity().await);
    assert_eq!(prompt.eap_type(), Some(EapType::GenericTokenCard));

    let reply = nas
        .send_eap(&eap_response(prompt.identifier, EapType::GenericTokenCard.as_u8(), b"password"))
        .await;
    assert_eq!(reply.code, Code::AccessAccept);
}

#[tokio::test]
async fn test_nak_without_alternatives_fails() {
    let server = start_server(|config| config.eap_methods = vec![MethodKind::Gtc]).await;
    let mut nas = Supplicant::new(server.addr, "alice").await;

    let prompt = eap_of(&nas.identity().await);
    let reply = nas.send_eap(&eap_response(prompt.identifier, NAK, &[4])).await;
    assert_eq!(reply.code, Code::AccessReject);
    assert_eq!(eap_of(&reply).code, EapCode::Failure);
}

#[tokio::test]
async fn test_ttls_gtc_with_keys_and_vlan() {
    let server = start_server(|config| {
        config.vlan = Some(100);
        config.fragment_size = 300;
    })
    .await;
    let mut nas = Supplicant::new(server.addr, "anonymous").await;
    let start = eap_of(&nas.identity().await);

    let client = LoopbackClient::new(LoopbackClient::config().unwrap()).unwrap();
    let mut peer = TunnelPeer::new(nas, client, EapType::Ttls, &start);
    assert_eq!(peer.handshake().await.code, Code::AccessChallenge);
    assert!(!peer.client.is_handshaking());

    let (reply, prompt) = peer.inner(eap_response(1, EapType::Identity.as_u8(), b"alice")).await;
    assert_eq!(reply.code, Code::AccessChallenge);
    let prompt = EapHeader::decode(&prompt.expect("inner prompt")).unwrap();
    assert_eq!(prompt.eap_type(), Some(EapType::GenericTokenCard));

    let (reply, _) = peer
        .inner(eap_response(prompt.identifier, EapType::GenericTokenCard.as_u8(), b"password"))
        .await;
    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(eap_of(&reply).code, EapCode::Success);
    assert_eq!(
        reply.find_attribute(AttributeType::UserName.as_u8()).unwrap().value,
        b"alice".to_vec()
    );
    assert_eq!(
        reply.find_attribute(AttributeType::TunnelPrivateGroupId.as_u8()).unwrap().value,
        b"100".to_vec()
    );

    let keys = peer.client.export_keying_material().unwrap();
    let mppe = mppe_attributes(&reply);
    assert_eq!(mppe.len(), 2);
    for (vendor_type, blob) in mppe {
        let key = decrypt_key(&blob, SECRET, &peer.nas.last_authenticator).unwrap();
        match vendor_type {
            MS_MPPE_SEND_KEY => assert_eq!(key, keys.send_key()),
            MS_MPPE_RECV_KEY => assert_eq!(key, keys.recv_key()),
            other => panic!("unexpected vendor type {other}"),
        }
    }
}

#[tokio::test]
async fn test_ttls_wrong_password_rejected_without_keys() {
    let server = start_server(|_| {}).await;
    let mut nas = Supplicant::new(server.addr, "anonymous").await;
    let start = eap_of(&nas.identity().await);

    let client = LoopbackClient::new(LoopbackClient::config().unwrap()).unwrap();
    let mut peer = TunnelPeer::new(nas, client, EapType::Ttls, &start);
    peer.handshake().await;

    let (_, prompt) = peer.inner(eap_response(1, EapType::Identity.as_u8(), b"alice")).await;
    let prompt = EapHeader::decode(&prompt.unwrap()).unwrap();
    let (reply, _) = peer
        .inner(eap_response(prompt.identifier, EapType::GenericTokenCard.as_u8(), b"nope"))
        .await;
    assert_eq!(reply.code, Code::AccessReject);
    assert!(mppe_attributes(&reply).is_empty());
}

#[tokio::test]
async fn test_peap_with_inner_md5() {
    let server = start_server(|_| {}).await;
    let mut nas = Supplicant::new(server.addr, "anonymous").await;
    let offer = eap_of(&nas.identity().await);
    assert_eq!(offer.eap_type(), Some(EapType::Ttls));

    let start = eap_of(&nas.send_eap(&eap_response(offer.identifier, NAK, &[EapType::Peap.as_u8()])).await);
    let client = LoopbackClient::new(LoopbackClient::config().unwrap()).unwrap();
    let mut peer = TunnelPeer::new(nas, client, EapType::Peap, &start);
    peer.handshake().await;

    let (_, prompt) = peer.inner(eap_response(1, EapType::Identity.as_u8(), b"alice")).await;
    let prompt = EapHeader::decode(&prompt.unwrap()).unwrap();
    assert_eq!(prompt.eap_type(), Some(EapType::GenericTokenCard));

    let (_, challenge) = peer.inner(eap_response(prompt.identifier, NAK, &[4])).await;
    let challenge = EapHeader::decode(&challenge.expect("inner MD5 challenge")).unwrap();

    let (reply, _) = peer.inner(md5_answer(&challenge, b"password")).await;
    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(mppe_attributes(&reply).len(), 2);
}

#[tokio::test]
async fn test_ttls_session_resumption() {
    let server = start_server(|_| {}).await;
    let client_config = LoopbackClient::config().unwrap();

    let mut nas = Supplicant::new(server.addr, "anonymous").await;
    let start = eap_of(&nas.identity().await);
    let mut peer = TunnelPeer::new(nas, LoopbackClient::new(client_config.clone()).unwrap(), EapType::Ttls, &start);
    peer.handshake().await;
    let (_, prompt) = peer.inner(eap_response(1, EapType::Identity.as_u8(), b"alice")).await;
    let prompt = EapHeader::decode(&prompt.unwrap()).unwrap();
    let (first, _) = peer
        .inner(eap_response(prompt.identifier, EapType::GenericTokenCard.as_u8(), b"password"))
        .await;
    assert_eq!(first.code, Code::AccessAccept);

    let mut nas = Supplicant::new(server.addr, "anonymous").await;
    let start = eap_of(&nas.identity().await);
    let mut peer = TunnelPeer::new(nas, LoopbackClient::new(client_config).unwrap(), EapType::Ttls, &start);
    let resumed = peer.handshake().await;
    assert_eq!(resumed.code, Code::AccessAccept);
    assert_eq!(mppe_attributes(&resumed).len(), 2);
}
