//! WireGuard gateway interface and client configuration rendering

use crate::error::Result;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Keepalive interval written into client configs, in seconds
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// Key material for one client peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    /// Client private key (base64)
    pub client_private_key: String,
    /// Server public key (base64)
    pub server_public_key: String,
}

/// The WireGuard endpoint of the agent host
///
/// One interface exists per environment, addressed with the environment's
/// VPN endpoint address.
#[async_trait]
pub trait VpnGateway: Send + Sync {
    /// Bring up the interface for an environment
    async fn open_interface(&self, event_tag: &str, address: Ipv4Net, port: u16) -> Result<()>;

    /// Register a client peer and return its key material
    async fn register_peer(&self, event_tag: &str, client_ip: Ipv4Addr) -> Result<PeerCredentials>;

    /// Remove a client peer
    async fn remove_peer(&self, event_tag: &str, client_ip: Ipv4Addr) -> Result<()>;

    /// Tear down an environment's interface
    async fn close_interface(&self, event_tag: &str) -> Result<()>;
}

/// A rendered-on-demand WireGuard client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Client tunnel address
    pub address: Ipv4Addr,
    /// Client private key
    pub private_key: String,
    /// DNS server inside the lab, if any
    pub dns: Option<Ipv4Addr>,
    /// Server public key
    pub server_public_key: String,
    /// Networks routed through the tunnel
    pub allowed_ips: Vec<Ipv4Net>,
    /// `host:port` of the agent endpoint
    pub endpoint: String,
    /// Keepalive interval in seconds
    pub keepalive: u16,
}

impl ClientConfig {
    /// Build a client config for one team member of a lab
    pub fn new(
        address: Ipv4Addr,
        credentials: PeerCredentials,
        host: &str,
        port: u16,
        vpn_subnet: Ipv4Net,
        lab_subnet: Ipv4Net,
    ) -> Self {
        Self {
            address,
            private_key: credentials.client_private_key,
            dns: None,
            server_public_key: credentials.server_public_key,
            allowed_ips: vec![vpn_subnet.trunc(), lab_subnet.trunc()],
            endpoint: format!("{}:{}", host, port),
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    /// Set the DNS server pushed to the client
    pub fn with_dns(mut self, dns: Ipv4Addr) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Render the config file contents
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        writeln!(f, "Address = {}/32", self.address)?;
        writeln!(f, "PrivateKey = {}", self.private_key)?;
        if let Some(dns) = self.dns {
            writeln!(f, "DNS = {}", dns)?;
        }
        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", self.server_public_key)?;
        let allowed: Vec<String> = self.allowed_ips.iter().map(|net| net.to_string()).collect();
        writeln!(f, "AllowedIPs = {}", allowed.join(", "))?;
        writeln!(f, "Endpoint = {}", self.endpoint)?;
        writeln!(f, "PersistentKeepalive = {}", self.keepalive)
    }
}
