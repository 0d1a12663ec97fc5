//! EAP method negotiation
//!
//! The [`EapDispatcher`] is a [`PacketHandler`] that owns the per-exchange
//! session state and decides which registered [`EapMethod`] handles each
//! inbound EAP Response:
//!
//! - Identity: remember the identity, then offer the first acceptable method
//! - NAK: narrow the acceptable methods to what the peer listed
//! - anything else: hand the message to the matching method
//!
//! Exchanges are correlated by a state token carried in the RADIUS State
//! attribute. Every per-token structure lives in its own [`TtlCache`] and
//! expires independently.

pub mod gtc;
pub mod md5;
pub mod tunnel;

pub use gtc::GtcMethod;
pub use md5::Md5Method;
pub use tunnel::{TunnelKind, TunnelMethod, TunnelSettings};

use crate::backend::AuthBackend;
use crate::cache::TtlCache;
use crate::config::{Config, MethodKind};
use crate::handler::{AuthRequest, HandlerChain, PacketHandler, PacketResult, PapHandler, until_nul};
use crate::tls::{TlsContext, TlsError};
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};
use ttls_radius_proto::eap::{
    EapCode, EapError, EapHeader, EapType, FrameParams, challenge_attributes, completion_attributes,
    encode_frame,
};
use ttls_radius_proto::{Attribute, MppeError, PacketError};

pub const SESSION_TTL: Duration = Duration::from_secs(3600);
pub const SHORT_TTL: Duration = Duration::from_secs(60);
pub const STATE_TOKEN_LENGTH: usize = 16;

#[derive(Error, Debug)]
pub enum MethodError {
    #[error("EAP error: {0}")]
    Eap(#[from] EapError),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("MPPE error: {0}")]
    Mppe(#[from] MppeError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Opaque exchange correlator carried in the RADIUS State attribute.
///
/// Kept as the raw octets the peer sent so it is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateToken(Vec<u8>);

impl StateToken {
    /// [`STATE_TOKEN_LENGTH`] random alphanumeric characters.
    pub fn generate() -> Self {
        StateToken(rand::rng().sample_iter(&Alphanumeric).take(STATE_TOKEN_LENGTH).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Token of the nested exchange run inside a tunnel.
    pub fn inner(&self) -> StateToken {
        let mut token = self.0.clone();
        token.extend_from_slice(b"-inner");
        StateToken(token)
    }
}

impl<T: AsRef<[u8]> + ?Sized> From<&T> for StateToken {
    fn from(value: &T) -> Self {
        StateToken(value.as_ref().to_vec())
    }
}

impl AsRef<[u8]> for StateToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for StateToken {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// One inbound EAP message and what is known about its exchange.
pub struct Exchange<'a> {
    pub state: StateToken,
    pub request: &'a AuthRequest,
    pub header: &'a EapHeader,
    identity: Option<Vec<u8>>,
}

impl<'a> Exchange<'a> {
    pub fn new(
        state: impl Into<StateToken>,
        request: &'a AuthRequest,
        header: &'a EapHeader,
        identity: Option<Vec<u8>>,
    ) -> Self {
        Exchange {
            state: state.into(),
            request,
            header,
            identity,
        }
    }

    /// The EAP identity of the peer, or the request's User-Name once the
    /// identity has expired from the cache.
    pub fn username(&self) -> Option<String> {
        self.identity
            .as_deref()
            .map(until_nul)
            .filter(|identity| !identity.is_empty())
            .map(|identity| String::from_utf8_lossy(identity).into_owned())
            .or_else(|| self.request.user_name().filter(|name| !name.is_empty()))
    }
}

/// The EAP methods a dispatcher can offer.
pub enum EapMethod {
    Gtc(GtcMethod),
    Md5(Md5Method),
    Ttls(TunnelMethod),
    Peap(TunnelMethod),
}

impl EapMethod {
    pub fn eap_type(&self) -> EapType {
        match self {
            EapMethod::Gtc(_) => EapType::GenericTokenCard,
            EapMethod::Md5(_) => EapType::Md5Challenge,
            EapMethod::Ttls(_) => EapType::Ttls,
            EapMethod::Peap(_) => EapType::Peap,
        }
    }

    /// First Request of the method, sent in answer to an Identity or NAK.
    pub fn identify(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        match self {
            EapMethod::Gtc(method) => method.identify(exchange),
            EapMethod::Md5(method) => method.identify(exchange),
            EapMethod::Ttls(method) | EapMethod::Peap(method) => method.identify(exchange),
        }
    }

    pub async fn handle_message(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        match self {
            EapMethod::Gtc(method) => method.handle_message(exchange).await,
            EapMethod::Md5(method) => method.handle_message(exchange).await,
            EapMethod::Ttls(method) | EapMethod::Peap(method) => method.handle_message(exchange).await,
        }
    }
}

/// Negotiation state of one exchange.
///
/// There is no last-processed identifier: GTC continuations legitimately
/// repeat an identifier, so duplicates are caught by [`InFlightGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Methods still acceptable to offer, in preference order.
    pub valid_methods: Vec<EapType>,
}

/// Drops retransmissions of a message that is still being processed.
pub struct InFlightGuard {
    pending: TtlCache<StateToken, u8>,
}

impl InFlightGuard {
    pub fn new(ttl: Duration) -> Self {
        InFlightGuard {
            pending: TtlCache::new(ttl),
        }
    }

    /// Marks `identifier` as in flight for `state`. Returns `None` when the
    /// same identifier is already being processed.
    pub fn begin(&self, state: &StateToken, identifier: u8) -> Option<InFlightTicket<'_>> {
        let admitted = self
            .pending
            .set_if(state.clone(), identifier, |current| current != Some(&identifier));
        admitted.then(|| InFlightTicket {
            guard: self,
            state: state.clone(),
            identifier,
        })
    }

    pub fn is_in_flight(&self, state: impl AsRef<[u8]>, identifier: u8) -> bool {
        self.pending.get(state.as_ref()) == Some(identifier)
    }
}

/// Clears the in-flight mark when dropped, whatever the outcome.
pub struct InFlightTicket<'a> {
    guard: &'a InFlightGuard,
    state: StateToken,
    identifier: u8,
}

impl Drop for InFlightTicket<'_> {
    fn drop(&mut self) {
        let identifier = self.identifier;
        self.guard.pending.delete_if(&self.state, |current| *current == identifier);
    }
}

pub struct EapDispatcher {
    methods: Vec<EapMethod>,
    sessions: TtlCache<StateToken, SessionState>,
    identities: TtlCache<StateToken, Vec<u8>>,
    in_flight: InFlightGuard,
}

impl EapDispatcher {
    pub fn new(methods: Vec<EapMethod>) -> Self {
        EapDispatcher {
            methods,
            sessions: TtlCache::new(SESSION_TTL),
            identities: TtlCache::new(SHORT_TTL),
            in_flight: InFlightGuard::new(SHORT_TTL),
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = EapType> + '_ {
        self.methods.iter().map(EapMethod::eap_type)
    }

    pub fn session(&self, state: impl AsRef<[u8]>) -> Option<SessionState> {
        self.sessions.get(state.as_ref())
    }

    fn method(&self, eap_type: EapType) -> Option<&EapMethod> {
        self.methods.iter().find(|method| method.eap_type() == eap_type)
    }

    fn first_valid(&self, session: &SessionState) -> Option<&EapMethod> {
        session
            .valid_methods
            .first()
            .and_then(|eap_type| self.method(*eap_type))
    }

    fn load_session(&self, state: &StateToken, handling_type: Option<EapType>) -> SessionState {
        if let Some(session) = self.sessions.get(state) {
            return session;
        }
        let session = SessionState {
            valid_methods: self
                .methods()
                .filter(|eap_type| Some(*eap_type) != handling_type)
                .collect(),
        };
        self.sessions.set(state.clone(), session.clone());
        session
    }

    fn finish(&self, state: &StateToken) {
        self.sessions.delete(state);
        self.identities.delete(state);
    }

    async fn dispatch(
        &self,
        state: &StateToken,
        request: &AuthRequest,
        message: &[u8],
        handling_type: Option<EapType>,
    ) -> Result<PacketResult, MethodError> {
        let header = EapHeader::decode(message)?;
        trace!(
            state = %state,
            code = ?header.code,
            identifier = header.identifier,
            eap_type = ?header.type_code,
            length = header.length,
            "EAP message"
        );

        let mut session = self.load_session(state, handling_type);
        if header.code != EapCode::Response {
            debug!(state = %state, code = ?header.code, "Ignoring non-Response EAP message");
            return Ok(PacketResult::empty());
        }
        let Some(type_code) = header.type_code else {
            return Ok(PacketResult::empty());
        };

        match EapType::from_u8(type_code) {
            Some(EapType::Identity) => {
                self.identities.set(state.clone(), header.data.clone());
                debug!(
                    state = %state,
                    identity = %String::from_utf8_lossy(until_nul(&header.data)),
                    "EAP identity received"
                );
                let exchange = Exchange::new(state, request, &header, Some(header.data.clone()));
                match self.first_valid(&session) {
                    Some(method) => method.identify(&exchange),
                    None => nak(header.identifier, &[], state),
                }
            }
            Some(EapType::Nak) => {
                session
                    .valid_methods
                    .retain(|eap_type| header.data.contains(&eap_type.as_u8()));
                self.sessions.set(state.clone(), session.clone());
                debug!(
                    state = %state,
                    requested = ?header.data,
                    remaining = ?session.valid_methods,
                    "EAP NAK narrowed method list"
                );

                let exchange = Exchange::new(state, request, &header, self.identities.get(state));
                match self.first_valid(&session) {
                    Some(method) => method.identify(&exchange),
                    None => {
                        debug!(state = %state, "No acceptable EAP method left");
                        terminate(header.identifier)
                    }
                }
            }
            Some(EapType::Notification | EapType::Expanded) => Ok(PacketResult::empty()),
            _ => {
                let method = EapType::from_u8(type_code).and_then(|eap_type| self.method(eap_type));
                let Some(method) = method else {
                    debug!(state = %state, eap_type = type_code, "Response for unregistered EAP method");
                    if session.valid_methods.is_empty() {
                        return terminate(header.identifier);
                    }
                    let offered: Vec<u8> = session.valid_methods.iter().map(|t| t.as_u8()).collect();
                    return nak(header.identifier, &offered, state);
                };

                let Some(_ticket) = self.in_flight.begin(state, header.identifier) else {
                    debug!(
                        state = %state,
                        identifier = header.identifier,
                        "Dropping retransmission of a message still in flight"
                    );
                    return Ok(PacketResult::empty());
                };
                let exchange = Exchange::new(state, request, &header, self.identities.get(state));
                method.handle_message(&exchange).await
            }
        }
    }
}

#[async_trait]
impl PacketHandler for EapDispatcher {
    async fn handle_packet(&self, request: &AuthRequest, handling_type: Option<EapType>) -> PacketResult {
        let Some(message) = request.eap_message() else {
            return PacketResult::empty();
        };
        let state = state_token(request);

        match self.dispatch(&state, request, &message, handling_type).await {
            Ok(result) => {
                if result.is_terminal() {
                    self.finish(&state);
                }
                result
            }
            Err(e) => {
                warn!(state = %state, error = %e, "Dropping undecodable EAP message");
                PacketResult::empty()
            }
        }
    }
}

/// State token echoed by the peer, or a fresh one.
fn state_token(request: &AuthRequest) -> StateToken {
    match request.state() {
        Some(state) if !state.is_empty() => StateToken::from(state),
        _ => StateToken::generate(),
    }
}

/// Access-Challenge carrying `frame` and the state token.
pub(crate) fn challenge(frame: &[u8], state: &StateToken) -> Result<PacketResult, MethodError> {
    Ok(PacketResult::challenge(challenge_attributes(frame, state.as_bytes())?))
}

/// Server NAK listing the types it would still accept. An empty list
/// tells the peer there is nothing left to negotiate.
fn nak(identifier: u8, methods: &[u8], state: &StateToken) -> Result<PacketResult, MethodError> {
    let frame = encode_frame(&FrameParams::request(identifier, EapType::Nak), methods);
    challenge(&frame.frame, state)
}

/// Access-Reject with an EAP-Failure frame.
pub(crate) fn terminate(identifier: u8) -> Result<PacketResult, MethodError> {
    Ok(PacketResult::reject(completion_attributes(false, identifier, None, Vec::new())?))
}

/// Access-Accept with an EAP-Success frame.
pub(crate) fn succeed(
    identifier: u8,
    user_name: Option<Attribute>,
    extra: Vec<Attribute>,
) -> Result<PacketResult, MethodError> {
    Ok(PacketResult::accept(completion_attributes(true, identifier, user_name, extra)?))
}

/// Methods offered inside a TLS tunnel, followed by PAP for TTLS-PAP.
pub fn inner_chain(backend: Arc<dyn AuthBackend>) -> HandlerChain {
    let dispatcher = EapDispatcher::new(vec![
        EapMethod::Gtc(GtcMethod::new(Arc::clone(&backend))),
        EapMethod::Md5(Md5Method::new(Arc::clone(&backend))),
    ]);
    HandlerChain::new()
        .with(Arc::new(dispatcher))
        .with(Arc::new(PapHandler::new(backend)))
}

/// The outer handler chain: the configured EAP methods, then PAP.
///
/// `tls` must be present when a tunneled method is configured; otherwise
/// those methods are left out.
pub fn outer_chain(config: &Config, backend: Arc<dyn AuthBackend>, tls: Option<Arc<TlsContext>>) -> HandlerChain {
    let inner: Arc<dyn PacketHandler> = Arc::new(inner_chain(Arc::clone(&backend)));
    let settings = TunnelSettings {
        vlan: config.vlan,
        fragment_size: config.fragment_size,
    };

    let methods = config
        .eap_methods
        .iter()
        .filter_map(|kind| {
            let tunnel = |tunnel_kind| {
                let tls = tls.clone()?;
                Some(TunnelMethod::new(tunnel_kind, tls, Arc::clone(&inner), settings.clone()))
            };
            match kind {
                MethodKind::Ttls => tunnel(TunnelKind::Ttls).map(EapMethod::Ttls),
                MethodKind::Peap => tunnel(TunnelKind::Peap).map(EapMethod::Peap),
                MethodKind::Gtc => Some(EapMethod::Gtc(GtcMethod::new(Arc::clone(&backend)))),
                MethodKind::Md5 => Some(EapMethod::Md5(Md5Method::new(Arc::clone(&backend)))),
            }
        })
        .collect();

    HandlerChain::new()
        .with(Arc::new(EapDispatcher::new(methods)))
        .with(Arc::new(PapHandler::new(backend)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ttls_radius_proto::AttributeType;
    use ttls_radius_proto::eap::eap_message_attributes;

    pub const SECRET: &[u8] = b"testing123";

    /// EAP Response frame of `eap_type` with raw type data.
    pub fn response(identifier: u8, eap_type: u8, data: &[u8]) -> Vec<u8> {
        let length = (5 + data.len()) as u16;
        let mut frame = vec![EapCode::Response.as_u8(), identifier];
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(eap_type);
        frame.extend_from_slice(data);
        frame
    }

    pub fn request(state: Option<&str>, frame: &[u8], extra: Vec<Attribute>) -> AuthRequest {
        let mut attributes = eap_message_attributes(frame).unwrap();
        if let Some(state) = state {
            attributes.push(Attribute::string(AttributeType::State.as_u8(), state).unwrap());
        }
        attributes.extend(extra);
        AuthRequest::new(attributes, [0u8; 16], Arc::from(SECRET))
    }

    pub fn state_of(result: &PacketResult) -> String {
        let state = result.attribute(AttributeType::State).expect("state attribute");
        String::from_utf8(state.value.clone()).unwrap()
    }

    pub fn decoded(result: &PacketResult) -> EapHeader {
        EapHeader::decode(&result.eap_message().expect("EAP-Message")).unwrap()
    }
}
