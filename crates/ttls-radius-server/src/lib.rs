//! RADIUS authentication server with tunneled EAP
//!
//! This crate builds on `ttls-radius-proto` to answer Access-Requests with
//! PAP, EAP-GTC, EAP-MD5, EAP-TTLS and PEAP, handing MS-MPPE session keys
//! to the NAS when a tunnel method succeeds.
//!
//! # Features
//!
//! - Async UDP server with Access-Challenge retransmission
//! - EAP method negotiation with NAK handling
//! - In-memory TLS 1.2 tunnels with session resumption
//! - Pluggable credential backends
//! - JSON configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ttls_radius_server::eap::outer_chain;
//! use ttls_radius_server::{Config, RadiusServer, ServerConfig, TlsContext, backend_from_users};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let tls = Arc::new(TlsContext::from_pem_files(&config.tls.cert_path, &config.tls.key_path)?);
//!     tls.check_key_export()?;
//!
//!     let backend = backend_from_users(&config.users, &config.auth_cache);
//!     let chain = outer_chain(&config, backend, Some(tls));
//!
//!     let server = RadiusServer::new(ServerConfig::from_config(config, Arc::new(chain))?).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod eap;
pub mod handler;
pub mod retransmit;
pub mod server;
pub mod tls;

pub use backend::{AuthBackend, BackendError, CachingBackend, StaticBackend, backend_from_users};
pub use cache::TtlCache;
pub use config::{Client, Config, ConfigError, MethodKind, User};
pub use eap::{EapDispatcher, EapMethod, MethodError};
pub use handler::{AuthRequest, HandlerChain, PacketHandler, PacketResult, PapHandler};
pub use retransmit::{OutboundResponse, Retransmitter, RetryPolicy};
pub use server::{RadiusServer, ServerConfig, ServerError};
pub use tls::{KeyingMaterial, LoopbackClient, TlsContext, TlsError, TlsTunnel, TunnelEvent};
