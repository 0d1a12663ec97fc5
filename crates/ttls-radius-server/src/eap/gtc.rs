//! EAP-GTC (RFC 3748 Section 5.6): a prompt and a cleartext token

use super::{Exchange, MethodError, challenge, succeed, terminate};
use crate::backend::{AuthBackend, check_password};
use crate::handler::{PacketResult, until_nul};
use std::sync::Arc;
use tracing::{debug, info};
use ttls_radius_proto::eap::{EapType, FrameParams, encode_frame};
use ttls_radius_proto::{Attribute, AttributeType};

pub const GTC_PROMPT: &[u8] = b"Password: ";

pub struct GtcMethod {
    backend: Arc<dyn AuthBackend>,
}

impl GtcMethod {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        GtcMethod { backend }
    }

    pub fn identify(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        let params = FrameParams::request(exchange.header.identifier, EapType::GenericTokenCard);
        challenge(&encode_frame(&params, GTC_PROMPT).frame, &exchange.state)
    }

    pub async fn handle_message(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        let identifier = exchange.header.identifier;
        let Some(username) = exchange.username() else {
            debug!(state = %exchange.state, "GTC response without a known identity");
            return terminate(identifier);
        };
        let token = until_nul(&exchange.header.data);

        if check_password(self.backend.as_ref(), &username, token).await {
            info!(username = %username, "EAP-GTC authentication succeeded");
            let user_name = Attribute::string(AttributeType::UserName.as_u8(), username)?;
            succeed(identifier, Some(user_name), Vec::new())
        } else {
            info!(username = %username, "EAP-GTC authentication failed");
            terminate(identifier)
        }
    }
}
