//! EAP-MD5 Challenge (RFC 3748 Section 5.4)

use super::{Exchange, MethodError, SHORT_TTL, StateToken, challenge, succeed, terminate};
use crate::backend::{AuthBackend, check_md5_challenge};
use crate::cache::TtlCache;
use crate::handler::PacketResult;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};
use ttls_radius_proto::eap::eap_md5::{MD5_CHALLENGE_SIZE, challenge_data, parse_response};
use ttls_radius_proto::eap::{EapType, FrameParams, encode_frame};
use ttls_radius_proto::{Attribute, AttributeType};

pub struct Md5Method {
    backend: Arc<dyn AuthBackend>,
    challenges: TtlCache<StateToken, [u8; MD5_CHALLENGE_SIZE]>,
}

impl Md5Method {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Md5Method {
            backend,
            challenges: TtlCache::new(SHORT_TTL),
        }
    }

    pub fn identify(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        let mut value = [0u8; MD5_CHALLENGE_SIZE];
        rand::rng().fill(&mut value);
        self.issue_challenge(exchange, value)
    }

    /// Sends `value` as the challenge for this exchange.
    pub fn issue_challenge(
        &self,
        exchange: &Exchange<'_>,
        value: [u8; MD5_CHALLENGE_SIZE],
    ) -> Result<PacketResult, MethodError> {
        self.challenges.set(exchange.state.clone(), value);
        let params = FrameParams::request(exchange.header.identifier, EapType::Md5Challenge);
        challenge(&encode_frame(&params, &challenge_data(&value)).frame, &exchange.state)
    }

    pub async fn handle_message(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        let header = exchange.header;
        let Some(value) = self.challenges.get(&exchange.state) else {
            debug!(state = %exchange.state, "MD5 response without an outstanding challenge");
            return terminate(header.identifier);
        };
        let (response, name) = parse_response(&header.data)?;

        let username = exchange
            .username()
            .or_else(|| (!name.is_empty()).then(|| String::from_utf8_lossy(name).into_owned()));
        let Some(username) = username else {
            debug!(state = %exchange.state, "MD5 response without a known identity");
            return terminate(header.identifier);
        };

        let accepted =
            check_md5_challenge(self.backend.as_ref(), header.identifier, &username, &value, response).await;
        self.challenges.delete(&exchange.state);

        if accepted {
            info!(username = %username, "EAP-MD5 authentication succeeded");
            let user_name = Attribute::string(AttributeType::UserName.as_u8(), username)?;
            succeed(header.identifier, Some(user_name), Vec::new())
        } else {
            info!(username = %username, "EAP-MD5 authentication failed");
            terminate(header.identifier)
        }
    }
}
