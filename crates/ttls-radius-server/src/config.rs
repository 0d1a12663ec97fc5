use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use ttls_radius_proto::eap::{DEFAULT_FRAGMENT_SIZE, EapType, MAX_FRAGMENT_SIZE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Entry of the static credential list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// RADIUS client (NAS) allowed to talk to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Single address or CIDR network
    pub address: String,
    /// Overrides the global secret for this client
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Client {
    pub fn parse_network(&self) -> Result<IpNetwork, ConfigError> {
        if let Ok(network) = self.address.parse::<IpNetwork>() {
            return Ok(network);
        }
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(IpNetwork::from(ip));
        }
        Err(ConfigError::Invalid(format!(
            "Invalid client address: {}",
            self.address
        )))
    }

    pub fn matches(&self, source_ip: IpAddr) -> Result<bool, ConfigError> {
        Ok(self.parse_network()?.contains(source_ip))
    }
}

/// Server certificate used by the TTLS/PEAP tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            cert_path: PathBuf::from("certs/server.pem"),
            key_path: PathBuf::from("certs/server-key.pem"),
        }
    }
}

/// Access-Challenge retransmission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetransmitSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry `n` (0-based) waits `base_delay_ms * (n + 1)`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    600
}

impl Default for RetransmitSettings {
    fn default() -> Self {
        RetransmitSettings {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetransmitSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Credential result caching in front of the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthCacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_success_ttl")]
    pub success_ttl_secs: u64,
    #[serde(default = "default_failure_ttl")]
    pub failure_ttl_secs: u64,
}

fn default_success_ttl() -> u64 {
    86_400
}

fn default_failure_ttl() -> u64 {
    60
}

impl Default for AuthCacheSettings {
    fn default() -> Self {
        AuthCacheSettings {
            enabled: false,
            success_ttl_secs: default_success_ttl(),
            failure_ttl_secs: default_failure_ttl(),
        }
    }
}

/// Outer EAP methods that can be offered, in configuration order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    Ttls,
    Peap,
    Gtc,
    Md5,
}

impl MethodKind {
    pub fn eap_type(self) -> EapType {
        match self {
            MethodKind::Ttls => EapType::Ttls,
            MethodKind::Peap => EapType::Peap,
            MethodKind::Gtc => EapType::GenericTokenCard,
            MethodKind::Md5 => EapType::Md5Challenge,
        }
    }

    pub fn is_tunneled(self) -> bool {
        matches!(self, MethodKind::Ttls | MethodKind::Peap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Shared secret for clients without their own
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Authorized clients; when empty every source uses `secret`
    #[serde(default)]
    pub clients: Vec<Client>,

    #[serde(default)]
    pub users: Vec<User>,

    /// "trace", "debug", "info", "warn" or "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub tls: TlsSettings,

    /// VLAN assigned on successful tunneled authentication
    #[serde(default)]
    pub vlan: Option<u16>,

    #[serde(default = "default_eap_methods")]
    pub eap_methods: Vec<MethodKind>,

    /// Largest tunneled payload per EAP frame
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    #[serde(default)]
    pub retransmit: RetransmitSettings,

    #[serde(default)]
    pub auth_cache: AuthCacheSettings,

    /// Drop EAP requests without a valid Message-Authenticator
    #[serde(default = "default_true")]
    pub require_message_authenticator: bool,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    1812
}

fn default_secret() -> String {
    "testing123".to_string()
}

fn default_eap_methods() -> Vec<MethodKind> {
    vec![MethodKind::Ttls, MethodKind::Peap, MethodKind::Gtc, MethodKind::Md5]
}

fn default_fragment_size() -> usize {
    DEFAULT_FRAGMENT_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            secret: default_secret(),
            clients: Vec::new(),
            users: Vec::new(),
            log_level: None,
            tls: TlsSettings::default(),
            vlan: None,
            eap_methods: default_eap_methods(),
            fragment_size: default_fragment_size(),
            retransmit: RetransmitSettings::default(),
            auth_cache: AuthCacheSettings::default(),
            require_message_authenticator: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr: IpAddr = self.listen_address.parse().map_err(|_| {
            ConfigError::Invalid(format!("Invalid IP address: {}", self.listen_address))
        })?;
        Ok(SocketAddr::new(addr, self.listen_port))
    }

    /// First enabled client whose network contains `source_ip`.
    pub fn find_client(&self, source_ip: IpAddr) -> Option<&Client> {
        self.clients
            .iter()
            .filter(|client| client.enabled)
            .find(|client| matches!(client.matches(source_ip), Ok(true)))
    }

    /// Shared secret for a request source, or `None` when clients are
    /// configured and none matches.
    pub fn secret_for(&self, source_ip: IpAddr) -> Option<&[u8]> {
        if self.clients.is_empty() {
            return Some(self.secret.as_bytes());
        }
        let client = self.find_client(source_ip)?;
        Some(client.secret.as_deref().unwrap_or(&self.secret).as_bytes())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;

        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("Port cannot be 0".to_string()));
        }
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("Secret cannot be empty".to_string()));
        }

        for client in &self.clients {
            if client.secret.as_deref() == Some("") {
                return Err(ConfigError::Invalid(format!(
                    "Client {} has empty secret",
                    client.address
                )));
            }
            client.parse_network()?;
        }

        if self.users.iter().any(|user| user.username.is_empty()) {
            return Err(ConfigError::Invalid("User has empty username".to_string()));
        }

        if self.eap_methods.is_empty() {
            return Err(ConfigError::Invalid("At least one EAP method must be enabled".to_string()));
        }
        for (index, method) in self.eap_methods.iter().enumerate() {
            if self.eap_methods[..index].contains(method) {
                return Err(ConfigError::Invalid(format!("EAP method {:?} listed twice", method)));
            }
        }

        // Larger fragments make Access-Challenges that exceed 4096 octets
        if !(64..=MAX_FRAGMENT_SIZE).contains(&self.fragment_size) {
            return Err(ConfigError::Invalid(format!(
                "fragment_size must be between 64 and {}, got {}",
                MAX_FRAGMENT_SIZE,
                self.fragment_size
            )));
        }

        if let Some(vlan) = self.vlan
            && !(1..=4094).contains(&vlan)
        {
            return Err(ConfigError::Invalid(format!("VLAN id {} outside 1..=4094", vlan)));
        }

        Ok(())
    }

    pub fn uses_tls(&self) -> bool {
        self.eap_methods.iter().any(|m| m.is_tunneled())
    }

    pub fn example() -> Self {
        Config {
            clients: vec![
                Client {
                    address: "192.168.1.0/24".to_string(),
                    secret: Some("client_secret_1".to_string()),
                    name: Some("Wireless controllers".to_string()),
                    enabled: true,
                },
                Client {
                    address: "127.0.0.1".to_string(),
                    secret: None,
                    name: Some("Local testing".to_string()),
                    enabled: true,
                },
            ],
            users: vec![
                User {
                    username: "admin".to_string(),
                    password: "admin123".to_string(),
                },
                User {
                    username: "user1".to_string(),
                    password: "password1".to_string(),
                },
            ],
            log_level: Some("info".to_string()),
            vlan: Some(100),
            ..Config::default()
        }
    }
}
