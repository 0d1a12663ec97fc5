//! EAP-TTLS and PEAP
//!
//! Both methods carry a TLS session inside EAP frames. Handshake records
//! travel as tunneled type data; once the session is secured the peer sends
//! AVPs whose contents are replayed as a nested Access-Request through the
//! inner handler chain. An inner Accept or Reject ends the outer exchange;
//! on success the session keys go back to the NAS as MS-MPPE attributes.

use super::{Exchange, MethodError, SESSION_TTL, SHORT_TTL, StateToken, challenge, succeed, terminate};
use crate::cache::TtlCache;
use crate::handler::{PacketHandler, PacketResult};
use crate::tls::{KeyingMaterial, TlsContext, TlsTunnel, TunnelEvent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ttls_radius_proto::eap::avp::{decode_avps, encode_avps};
use ttls_radius_proto::eap::{
    DEFAULT_FRAGMENT_SIZE, EapFlags, EapFrame, EapType, FragmentAssembler, FrameParams,
    eap_message_attributes, encode_frame,
};
use ttls_radius_proto::mppe::{recv_key_attribute, send_key_attribute};
use ttls_radius_proto::{Attribute, AttributeType, Avp, Code};

/// RFC 2868 Tunnel-Type VLAN
const TUNNEL_TYPE_VLAN: u32 = 13;
/// RFC 2868 Tunnel-Medium-Type IEEE-802
const TUNNEL_MEDIUM_802: u32 = 6;
const FRAMED_PROTOCOL_PPP: u32 = 1;
const SERVICE_TYPE_FRAMED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Ttls,
    Peap,
}

impl TunnelKind {
    pub fn eap_type(self) -> EapType {
        match self {
            TunnelKind::Ttls => EapType::Ttls,
            TunnelKind::Peap => EapType::Peap,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TunnelKind::Ttls => "EAP-TTLS",
            TunnelKind::Peap => "PEAP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// VLAN assigned on success, if any.
    pub vlan: Option<u16>,
    /// Largest TLS payload per EAP frame.
    pub fragment_size: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            vlan: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

pub struct TunnelMethod {
    kind: TunnelKind,
    tls: Arc<TlsContext>,
    inner: Arc<dyn PacketHandler>,
    settings: TunnelSettings,
    /// Outbound data that did not fit in the last frame.
    fragments: TtlCache<StateToken, Vec<u8>>,
    /// Inbound fragments waiting for the frame without the M bit.
    reassembly: TtlCache<StateToken, FragmentAssembler>,
    tunnels: TtlCache<StateToken, Arc<Mutex<TlsTunnel>>>,
}

impl TunnelMethod {
    pub fn new(
        kind: TunnelKind,
        tls: Arc<TlsContext>,
        inner: Arc<dyn PacketHandler>,
        settings: TunnelSettings,
    ) -> Self {
        TunnelMethod {
            kind,
            tls,
            inner,
            settings,
            fragments: TtlCache::new(SHORT_TTL),
            reassembly: TtlCache::new(SHORT_TTL),
            tunnels: TtlCache::new(SESSION_TTL),
        }
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// Number of live TLS tunnels.
    pub fn open_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Opens a fresh tunnel for the exchange and sends the Start frame.
    pub fn identify(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        self.close(&exchange.state);
        let tunnel = self.tls.open_tunnel()?;
        self.tunnels
            .set(exchange.state.clone(), Arc::new(Mutex::new(tunnel)));

        debug!(state = %exchange.state, method = self.kind.name(), "Starting TLS tunnel");
        let params = self.params(exchange.header.identifier).with_flags(EapFlags::start());
        challenge(&encode_frame(&params, &[]).frame, &exchange.state)
    }

    pub async fn handle_message(&self, exchange: &Exchange<'_>) -> Result<PacketResult, MethodError> {
        let header = exchange.header;
        let state = &exchange.state;

        if header.more_fragments() {
            let mut assembler = self.reassembly.get(state).unwrap_or_default();
            assembler.push(header)?;
            self.reassembly.set(state.clone(), assembler);
            debug!(state = %state, received = header.data.len(), "Acknowledging inbound fragment");
            return self.emit(self.params(header.identifier), &[], state);
        }

        let payload = self
            .reassembly
            .take(state)
            .unwrap_or_default()
            .push(header)?
            .unwrap_or_default();

        if payload.is_empty() {
            return match self.fragments.take(state) {
                Some(rest) => {
                    debug!(state = %state, remaining = rest.len(), "Sending queued fragment");
                    self.emit(self.params(header.identifier).continuation(), &rest, state)
                }
                None => self.emit(self.params(header.identifier), &[], state),
            };
        }

        let tunnel = self.tunnel(state)?;
        let mut tunnel = tunnel.lock().await;
        let events = match tunnel.feed_ciphertext(&payload) {
            Ok(events) => events,
            Err(e) => {
                warn!(state = %state, method = self.kind.name(), error = %e, "TLS tunnel failed");
                self.close(state);
                return terminate(header.identifier);
            }
        };

        let mut outgoing = Vec::new();
        for event in events {
            match event {
                TunnelEvent::Response(ciphertext) => outgoing.extend(ciphertext),
                TunnelEvent::Secured { session_reused } => {
                    debug!(state = %state, session_reused, "TLS tunnel secured");
                    if session_reused {
                        let keys = tunnel.export_keying_material()?;
                        info!(state = %state, method = self.kind.name(), "Resumed TLS session accepted");
                        return self.complete(exchange, Some(keys), None);
                    }
                }
                TunnelEvent::Incoming(plaintext) => {
                    let inner = self.route_inner(exchange, &plaintext).await?;
                    match inner.code {
                        Some(Code::AccessAccept) => {
                            let keys = tunnel.export_keying_material()?;
                            let user_name = inner.attribute(AttributeType::UserName).cloned();
                            return self.complete(exchange, Some(keys), user_name);
                        }
                        Some(Code::AccessReject) => return self.complete(exchange, None, None),
                        _ => match inner.eap_message() {
                            Some(message) => {
                                let avps = encode_avps(&[Avp::eap_message(message)])?;
                                let encrypted = tunnel.feed_plaintext(&avps)?;
                                outgoing.extend(TunnelEvent::responses(&encrypted));
                            }
                            None => debug!(state = %state, "Inner handler had nothing to say"),
                        },
                    }
                }
                TunnelEvent::End => {
                    debug!(state = %state, "Peer closed the TLS tunnel");
                    self.close(state);
                    return terminate(header.identifier);
                }
            }
        }

        self.emit(self.params(header.identifier), &outgoing, state)
    }

    /// Replays decrypted AVPs through the inner handler chain.
    async fn route_inner(&self, exchange: &Exchange<'_>, plaintext: &[u8]) -> Result<PacketResult, MethodError> {
        let state_type = AttributeType::State.as_u8();
        let mut attributes = Vec::new();
        for avp in decode_avps(plaintext)? {
            let Some(attr_type) = avp.radius_type() else {
                debug!(code = avp.code, vendor_id = ?avp.vendor_id, "Skipping AVP without a RADIUS mapping");
                continue;
            };
            if attr_type == AttributeType::EapMessage.as_u8() {
                attributes.extend(eap_message_attributes(&avp.data)?);
            } else if attr_type != state_type && avp.data.len() <= Attribute::MAX_VALUE_LENGTH {
                attributes.push(Attribute::new(attr_type, avp.data)?);
            }
        }
        attributes.push(Attribute::new(state_type, exchange.state.inner().as_bytes().to_vec())?);

        let request = exchange.request.nested(attributes);
        Ok(self.inner.handle_packet(&request, Some(self.kind.eap_type())).await)
    }

    /// Builds the terminal response. Keys are present only on success.
    fn complete(
        &self,
        exchange: &Exchange<'_>,
        keys: Option<KeyingMaterial>,
        inner_user: Option<Attribute>,
    ) -> Result<PacketResult, MethodError> {
        let identifier = exchange.header.identifier;
        self.close(&exchange.state);

        let Some(keys) = keys else {
            info!(state = %exchange.state, method = self.kind.name(), "Inner authentication rejected");
            return terminate(identifier);
        };

        let request = exchange.request;
        let user_name = inner_user.or_else(|| request.attribute(AttributeType::UserName).cloned());
        let mut extra = self.vlan_attributes()?;
        extra.push(send_key_attribute(keys.send_key(), &request.secret, &request.authenticator)?);
        extra.push(recv_key_attribute(keys.recv_key(), &request.secret, &request.authenticator)?);

        info!(
            state = %exchange.state,
            method = self.kind.name(),
            username = %user_name.as_ref().map(|a| String::from_utf8_lossy(&a.value).into_owned()).unwrap_or_default(),
            "Tunnel authentication succeeded"
        );
        succeed(identifier, user_name, extra)
    }

    fn vlan_attributes(&self) -> Result<Vec<Attribute>, MethodError> {
        let Some(vlan) = self.settings.vlan else {
            return Ok(Vec::new());
        };
        Ok(vec![
            Attribute::integer(AttributeType::TunnelType.as_u8(), TUNNEL_TYPE_VLAN)?,
            Attribute::integer(AttributeType::TunnelMediumType.as_u8(), TUNNEL_MEDIUM_802)?,
            Attribute::string(AttributeType::TunnelPrivateGroupId.as_u8(), vlan.to_string())?,
            Attribute::integer(AttributeType::FramedProtocol.as_u8(), FRAMED_PROTOCOL_PPP)?,
            Attribute::integer(AttributeType::ServiceType.as_u8(), SERVICE_TYPE_FRAMED)?,
        ])
    }

    fn params(&self, identifier: u8) -> FrameParams {
        FrameParams::request(identifier, self.kind.eap_type()).max_fragment_size(self.settings.fragment_size)
    }

    /// Sends `data` as a challenge, queueing what does not fit.
    fn emit(&self, params: FrameParams, data: &[u8], state: &StateToken) -> Result<PacketResult, MethodError> {
        let EapFrame { frame, remainder } = encode_frame(&params, data);
        match remainder {
            Some(rest) => {
                debug!(state = %state, queued = rest.len(), "Queueing outbound fragment");
                self.fragments.set(state.clone(), rest);
            }
            None => {
                self.fragments.delete(state);
            }
        }
        challenge(&frame, state)
    }

    fn tunnel(&self, state: &StateToken) -> Result<Arc<Mutex<TlsTunnel>>, MethodError> {
        if let Some(tunnel) = self.tunnels.get(state) {
            return Ok(tunnel);
        }
        debug!(state = %state, "No tunnel for exchange, opening one");
        let tunnel = Arc::new(Mutex::new(self.tls.open_tunnel()?));
        self.tunnels.set(state.clone(), Arc::clone(&tunnel));
        Ok(tunnel)
    }

    fn close(&self, state: &StateToken) {
        self.tunnels.delete(state);
        self.fragments.delete(state);
        self.reassembly.delete(state);
    }
}
