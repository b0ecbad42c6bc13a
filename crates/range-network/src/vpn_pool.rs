//! VPN endpoint address pool
//!
//! Every environment on an agent gets its own VPN endpoint subnet. The pool
//! carves those subnets out of one host-scoped range and hands out the first
//! host address of each (e.g. `10.17.3.1/24`) as the endpoint address.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Default prefix length of a single environment's VPN subnet
pub const DEFAULT_SUBNET_PREFIX: u8 = 24;

/// Pool of VPN endpoint addresses for one agent process
///
/// `get` and `release` are atomic with respect to each other, so two callers
/// never hold the same subnet at the same time.
#[derive(Debug)]
pub struct VpnAddressPool {
    /// Range the subnets are carved from
    range: Ipv4Net,

    /// Prefix length of each handed out subnet
    prefix_len: u8,

    /// Network addresses of the subnets currently held
    held: Mutex<BTreeSet<Ipv4Net>>,
}

impl VpnAddressPool {
    /// Create a pool handing out `/prefix_len` subnets of `range`
    pub fn new(range: Ipv4Net, prefix_len: u8) -> Result<Self> {
        if prefix_len < range.prefix_len() || prefix_len > 30 {
            return Err(Error::InvalidConfig(format!(
                "subnet prefix /{} does not fit range {}",
                prefix_len, range
            )));
        }

        Ok(Self {
            range: range.trunc(),
            prefix_len,
            held: Mutex::new(BTreeSet::new()),
        })
    }

    /// Create a pool over the range derived from the agent's host name
    pub fn for_host(host: &str) -> Self {
        let range = host_range(host);
        Self {
            range,
            prefix_len: DEFAULT_SUBNET_PREFIX,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Take a free endpoint address
    ///
    /// Fails immediately with [`Error::AddressPoolExhausted`] when every
    /// subnet is held.
    pub fn get(&self) -> Result<Ipv4Net> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        let subnet = self
            .subnets()
            .find(|subnet| !held.contains(subnet))
            .ok_or_else(|| Error::AddressPoolExhausted(self.range.to_string()))?;

        held.insert(subnet);
        debug!("Allocated VPN subnet {} ({} held)", subnet, held.len());
        Ok(endpoint_of(subnet))
    }

    /// Return an endpoint address to the pool
    ///
    /// Returns false if the address was not held.
    pub fn release(&self, address: Ipv4Net) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let released = held.remove(&address.trunc());
        if released {
            debug!("Released VPN subnet {}", address.trunc());
        }
        released
    }

    /// Mark a specific endpoint address as held, e.g. when restoring state
    pub fn reserve(&self, address: Ipv4Net) -> Result<()> {
        if address.prefix_len() != self.prefix_len || !self.range.contains(&address) {
            return Err(Error::AddressNotInRange {
                address: address.to_string(),
                range: self.range.to_string(),
            });
        }

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(address.trunc()) {
            return Err(Error::AddressInUse {
                address: address.addr(),
                owner: "another environment".to_string(),
            });
        }
        Ok(())
    }

    /// Number of subnets currently held
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Total number of subnets the pool can hand out
    pub fn capacity(&self) -> usize {
        1usize << (self.prefix_len - self.range.prefix_len())
    }

    /// The managed range
    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    fn subnets(&self) -> impl Iterator<Item = Ipv4Net> {
        // prefix_len is validated against the range on construction
        self.range
            .subnets(self.prefix_len)
            .into_iter()
            .flatten()
    }
}

/// Derive the default `/16` range for a host: `10.<h>.0.0/16`
///
/// `h` is a stable hash of the host name kept out of 0 and 255.
pub fn host_range(host: &str) -> Ipv4Net {
    let hash = host
        .bytes()
        .fold(2166136261u32, |acc, b| (acc ^ u32::from(b)).wrapping_mul(16777619));
    let octet = (hash % 254) as u8 + 1;
    Ipv4Net::new(Ipv4Addr::new(10, octet, 0, 0), 16)
        .unwrap_or_else(|_| unreachable!("/16 is a valid IPv4 prefix"))
}

/// First host address of a subnet, keeping the subnet's prefix
fn endpoint_of(subnet: Ipv4Net) -> Ipv4Net {
    let first = Ipv4Addr::from(u32::from(subnet.network()) + 1);
    Ipv4Net::new(first, subnet.prefix_len())
        .unwrap_or_else(|_| unreachable!("prefix taken from an existing subnet"))
}
