//! Packet handlers
//!
//! Every authentication mechanism is a [`PacketHandler`]: it looks at a
//! decoded Access-Request and either produces a reply or declines with an
//! empty [`PacketResult`] so the next handler in a [`HandlerChain`] can try.

use crate::backend::{AuthBackend, check_password};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use ttls_radius_proto::auth::decrypt_user_password;
use ttls_radius_proto::eap::EapType;
use ttls_radius_proto::packet::concat_attribute_values;
use ttls_radius_proto::{Attribute, AttributeType, Code, Packet, PacketError};

/// Access-Request as seen by handlers.
///
/// User-Password is already revealed (padding included). Tunnel methods
/// build nested requests from the AVPs they decrypt, reusing the outer
/// authenticator and secret so that keys can be encrypted for the NAS.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub attributes: Vec<Attribute>,
    pub authenticator: [u8; 16],
    pub secret: Arc<[u8]>,
}

impl AuthRequest {
    pub fn new(attributes: Vec<Attribute>, authenticator: [u8; 16], secret: Arc<[u8]>) -> Self {
        AuthRequest {
            attributes,
            authenticator,
            secret,
        }
    }

    /// Takes over a decoded packet, revealing its User-Password.
    pub fn from_packet(packet: Packet, secret: Arc<[u8]>) -> Result<Self, PacketError> {
        let mut attributes = packet.attributes;
        for attr in attributes
            .iter_mut()
            .filter(|a| a.attr_type == AttributeType::UserPassword.as_u8())
        {
            attr.value = decrypt_user_password(&attr.value, &secret, &packet.authenticator)?;
        }
        Ok(Self::new(attributes, packet.authenticator, secret))
    }

    /// Nested request sharing this request's authenticator and secret.
    pub fn nested(&self, attributes: Vec<Attribute>) -> Self {
        Self::new(attributes, self.authenticator, Arc::clone(&self.secret))
    }

    pub fn attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type.as_u8())
    }

    pub fn user_name(&self) -> Option<String> {
        self.attribute(AttributeType::UserName)
            .map(|a| String::from_utf8_lossy(&a.value).into_owned())
    }

    pub fn state(&self) -> Option<&[u8]> {
        self.attribute(AttributeType::State).map(|a| a.value.as_slice())
    }

    pub fn eap_message(&self) -> Option<Vec<u8>> {
        concat_attribute_values(&self.attributes, AttributeType::EapMessage.as_u8())
    }
}

/// Outcome of a handler. No code means "not mine, ignore".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketResult {
    pub code: Option<Code>,
    pub attributes: Vec<Attribute>,
}

impl PacketResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn challenge(attributes: Vec<Attribute>) -> Self {
        Self::with_code(Code::AccessChallenge, attributes)
    }

    pub fn accept(attributes: Vec<Attribute>) -> Self {
        Self::with_code(Code::AccessAccept, attributes)
    }

    pub fn reject(attributes: Vec<Attribute>) -> Self {
        Self::with_code(Code::AccessReject, attributes)
    }

    fn with_code(code: Code, attributes: Vec<Attribute>) -> Self {
        PacketResult {
            code: Some(code),
            attributes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_some_and(Code::is_terminal)
    }

    pub fn attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type.as_u8())
    }

    pub fn eap_message(&self) -> Option<Vec<u8>> {
        concat_attribute_values(&self.attributes, AttributeType::EapMessage.as_u8())
    }
}

#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// `handling_type` is the tunnel method this request was decrypted by,
    /// if any, so that the method is not offered again inside itself.
    async fn handle_packet(&self, request: &AuthRequest, handling_type: Option<EapType>) -> PacketResult;
}

/// Runs handlers in order; the first result with a code wins.
#[derive(Default, Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn PacketHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl PacketHandler for HandlerChain {
    async fn handle_packet(&self, request: &AuthRequest, handling_type: Option<EapType>) -> PacketResult {
        for handler in &self.handlers {
            let result = handler.handle_packet(request, handling_type).await;
            if !result.is_empty() {
                return result;
            }
        }
        PacketResult::empty()
    }
}

/// Plain User-Name/User-Password authentication (PAP, and TTLS-PAP
/// inside a tunnel).
pub struct PapHandler {
    backend: Arc<dyn AuthBackend>,
}

impl PapHandler {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        PapHandler { backend }
    }
}

#[async_trait]
impl PacketHandler for PapHandler {
    async fn handle_packet(&self, request: &AuthRequest, _handling_type: Option<EapType>) -> PacketResult {
        let Some(user_name) = request.attribute(AttributeType::UserName) else {
            return PacketResult::empty();
        };
        let Some(password) = request.attribute(AttributeType::UserPassword) else {
            return PacketResult::empty();
        };

        let password = until_nul(&password.value);
        let username = String::from_utf8_lossy(&user_name.value);
        if username.is_empty() || password.is_empty() {
            debug!("PAP request without username or password");
            return PacketResult::empty();
        }

        if check_password(self.backend.as_ref(), &username, password).await {
            info!(username = %username, "PAP authentication succeeded");
            PacketResult::accept(vec![user_name.clone()])
        } else {
            info!(username = %username, "PAP authentication failed");
            PacketResult::reject(Vec::new())
        }
    }
}

/// Prefix of `bytes` before the first NUL.
pub(crate) fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticBackend;
    use ttls_radius_proto::auth::encrypt_user_password;

    fn pap_handler() -> PapHandler {
        let mut backend = StaticBackend::new();
        backend.add_user("alice", "password");
        PapHandler::new(Arc::new(backend))
    }

    fn request(attributes: Vec<Attribute>) -> AuthRequest {
        AuthRequest::new(attributes, [0u8; 16], Arc::from(&b"testing123"[..]))
    }

    fn user(name: &str) -> Attribute {
        Attribute::string(AttributeType::UserName.as_u8(), name).unwrap()
    }

    fn password(value: &[u8]) -> Attribute {
        Attribute::new(AttributeType::UserPassword.as_u8(), value.to_vec()).unwrap()
    }

    struct Fixed(PacketResult);

    #[async_trait]
    impl PacketHandler for Fixed {
        async fn handle_packet(&self, _request: &AuthRequest, _handling_type: Option<EapType>) -> PacketResult {
            self.0.clone()
        }
    }

    #[test]
    fn test_from_packet_reveals_password() {
        let authenticator = [5u8; 16];
        let mut packet = Packet::new(Code::AccessRequest, 1, authenticator);
        packet.add_attribute(user("alice"));
        packet.add_attribute(password(&encrypt_user_password(b"password", b"testing123", &authenticator)));

        let request = AuthRequest::from_packet(packet, Arc::from(&b"testing123"[..])).unwrap();
        let revealed = &request.attribute(AttributeType::UserPassword).unwrap().value;
        assert_eq!(until_nul(revealed), b"password");
        assert_eq!(request.user_name().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_pap_accept_strips_padding() {
        let result = pap_handler()
            .handle_packet(&request(vec![user("alice"), password(b"password\0\0\0\0\0\0\0\0")]), None)
            .await;
        assert_eq!(result.code, Some(Code::AccessAccept));
        assert_eq!(result.attributes, vec![user("alice")]);
    }

    #[tokio::test]
    async fn test_pap_reject() {
        let result = pap_handler()
            .handle_packet(&request(vec![user("alice"), password(b"nope")]), None)
            .await;
        assert_eq!(result, PacketResult::reject(Vec::new()));
    }

    #[tokio::test]
    async fn test_pap_declines_without_credentials() {
        let handler = pap_handler();
        assert!(handler.handle_packet(&request(vec![user("alice")]), None).await.is_empty());
        assert!(handler.handle_packet(&request(vec![password(b"x")]), None).await.is_empty());
        assert!(handler
            .handle_packet(&request(vec![user("alice"), password(b"\0\0\0")]), None)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_chain_first_code_wins() {
        let chain = HandlerChain::new()
            .with(Arc::new(Fixed(PacketResult::empty())))
            .with(Arc::new(Fixed(PacketResult::reject(Vec::new()))))
            .with(Arc::new(Fixed(PacketResult::accept(Vec::new()))));
        assert_eq!(chain.len(), 3);

        let result = chain.handle_packet(&request(Vec::new()), None).await;
        assert_eq!(result.code, Some(Code::AccessReject));
    }

    #[tokio::test]
    async fn test_empty_chain_declines() {
        assert!(HandlerChain::new().handle_packet(&request(Vec::new()), None).await.is_empty());
    }
}
