//! Error types for range networking

use std::net::Ipv4Addr;
use thiserror::Error;

/// Range networking error type
#[derive(Error, Debug)]
pub enum Error {
    /// Every VPN endpoint subnet in the pool is held
    #[error("VPN address pool exhausted: no free subnet left in {0}")]
    AddressPoolExhausted(String),

    /// Address or subnet lies outside the managed range
    #[error("Address {address} is not in range {range}")]
    AddressNotInRange {
        /// Offending address
        address: String,
        /// Managed range
        range: String,
    },

    /// Address already held by someone else
    #[error("Address {address} already allocated to {owner}")]
    AddressInUse {
        /// Contested address
        address: Ipv4Addr,
        /// Current holder
        owner: String,
    },

    /// No host addresses left in a subnet
    #[error("No available addresses in subnet {0}")]
    SubnetExhausted(String),

    /// Isolation rules were already issued for the lab
    #[error("Isolation rules already issued for lab {0}")]
    RuleAlreadyIssued(String),

    /// No isolation rules recorded for the lab
    #[error("No isolation rules recorded for lab {0}")]
    RuleNotFound(String),

    /// Firewall backend failure
    #[error("Firewall error: {0}")]
    Firewall(String),

    /// VPN gateway failure
    #[error("VPN gateway error: {0}")]
    Gateway(String),

    /// Invalid network configuration
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
