use crate::config::{Config, ConfigError};
use crate::handler::{AuthRequest, PacketHandler};
use crate::retransmit::{OutboundResponse, Retransmitter, RetryPolicy};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use ttls_radius_proto::auth::encode_response;
use ttls_radius_proto::message_auth::verify_packet_message_authenticator;
use ttls_radius_proto::{AttributeType, Code, Packet, PacketError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Invalid client: {0}")]
    InvalidClient(IpAddr),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Everything a running server needs
pub struct ServerConfig {
    /// Bind address for the server
    pub bind_addr: SocketAddr,
    /// Secrets, client list and protocol switches
    pub config: Arc<Config>,
    /// Handler chain answering Access-Requests
    pub handler: Arc<dyn PacketHandler>,
    pub retry: RetryPolicy,
}

impl ServerConfig {
    pub fn from_config(config: Config, handler: Arc<dyn PacketHandler>) -> Result<Self, ServerError> {
        Ok(ServerConfig {
            bind_addr: config.socket_addr()?,
            retry: RetryPolicy::from(&config.retransmit),
            config: Arc::new(config),
            handler,
        })
    }
}

/// RADIUS Server
pub struct RadiusServer {
    config: Arc<ServerConfig>,
    socket: Arc<UdpSocket>,
    retransmitter: Arc<Retransmitter>,
}

impl RadiusServer {
    /// Create a new RADIUS server
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!(bind_addr = %socket.local_addr()?, "RADIUS server listening");

        let retransmitter = Arc::new(Retransmitter::new(Arc::clone(&socket), config.retry));
        Ok(RadiusServer {
            config: Arc::new(config),
            socket,
            retransmitter,
        })
    }

    /// Get the local address the server is listening on
    ///
    /// This is useful for testing when binding to port 0 (OS-assigned port)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.socket.local_addr().map_err(ServerError::from)
    }

    /// Receive datagrams forever, one task per datagram.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; 4096];

        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            let data = buf[..len].to_vec();

            if self.retransmitter.acknowledge(addr) {
                debug!(client_addr = %addr, "Client answered, retransmission cancelled");
            }

            let config = Arc::clone(&self.config);
            let retransmitter = Arc::clone(&self.retransmitter);
            tokio::spawn(async move {
                match Self::handle_message(&data, addr, &config).await {
                    Ok(Some(response)) => {
                        if let Err(e) = retransmitter.send(response, addr).await {
                            warn!(client_addr = %addr, error = %e, "Failed to send response");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(client_addr = %addr, error = %e, "Dropped request");
                    }
                }
            });
        }
    }

    /// Turns one datagram into the reply to send, if any.
    pub async fn handle_message(
        data: &[u8],
        addr: SocketAddr,
        config: &ServerConfig,
    ) -> Result<Option<OutboundResponse>, ServerError> {
        // RFC 2865 Section 3: unknown clients are silently discarded
        let Some(secret) = config.config.secret_for(addr.ip()) else {
            let request_id = data.get(1).copied().unwrap_or(0);
            warn!(
                client_ip = %addr.ip(),
                request_id = request_id,
                "Rejected request from unauthorized client"
            );
            return Err(ServerError::InvalidClient(addr.ip()));
        };

        let request = Packet::decode(data)?;
        debug!(
            packet_type = ?request.code,
            client_addr = %addr,
            request_id = request.identifier,
            "Received RADIUS packet"
        );

        if request.code != Code::AccessRequest {
            warn!(packet_type = ?request.code, client_addr = %addr, "Unsupported packet type");
            return Ok(None);
        }

        match verify_packet_message_authenticator(data, secret) {
            Some(false) => {
                warn!(
                    client_ip = %addr.ip(),
                    request_id = request.identifier,
                    "Invalid Message-Authenticator"
                );
                return Ok(None);
            }
            None if config.config.require_message_authenticator && request.eap_message().is_some() => {
                warn!(
                    client_ip = %addr.ip(),
                    request_id = request.identifier,
                    "EAP request without Message-Authenticator"
                );
                return Ok(None);
            }
            _ => {}
        }

        let identifier = request.identifier;
        let authenticator = request.authenticator;
        let proxy_states: Vec<_> = request
            .find_all_attributes(AttributeType::ProxyState.as_u8())
            .into_iter()
            .cloned()
            .collect();

        let auth_request = AuthRequest::from_packet(request, Arc::from(secret))?;
        let result = config.handler.handle_packet(&auth_request, None).await;
        let Some(code) = result.code else {
            debug!(client_addr = %addr, request_id = identifier, "No handler answered the request");
            return Ok(None);
        };

        let mut response = Packet::new(code, identifier, [0u8; 16]);
        for attribute in result.attributes.into_iter().chain(proxy_states) {
            response.add_attribute(attribute);
        }
        let data = encode_response(&response, &authenticator, secret).inspect_err(|e| {
            warn!(
                client_addr = %addr,
                request_id = identifier,
                error = %e,
                "Failed to encode response"
            );
        })?;

        debug!(
            response_type = ?code,
            client_addr = %addr,
            request_id = identifier,
            "Sending RADIUS response"
        );
        Ok(Some(OutboundResponse {
            data,
            expect_acknowledgment: code == Code::AccessChallenge,
        }))
    }
}
