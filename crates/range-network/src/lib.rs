//! Networking for range agent labs
//!
//! This crate owns the scarce network resources of an agent host:
//!
//! - [`VpnAddressPool`] hands out one VPN endpoint subnet per environment
//! - [`IpAllocator`] hands out VPN client addresses inside that subnet
//! - [`NetworkRuleManager`] isolates each VPN lab behind three firewall rules
//! - [`ClientConfig`] renders WireGuard client configs for lab participants
//!
//! Installing rules and peers is delegated to [`FirewallBackend`] and
//! [`VpnGateway`] implementations supplied by the agent.

#![warn(missing_docs)]

pub mod error;
pub mod firewall;
pub mod ip_allocator;
pub mod vpn_pool;
pub mod wireguard;

pub use error::{Error, Result};
pub use firewall::{
    FirewallBackend, FirewallRule, IsolationRule, NetworkRuleManager, RuleId, RuleTable,
};
pub use ip_allocator::IpAllocator;
pub use vpn_pool::{VpnAddressPool, host_range};
pub use wireguard::{ClientConfig, PeerCredentials, VpnGateway};
