//! Client address allocation inside an environment's VPN subnet

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

/// Owner name recorded for the reserved gateway address
const GATEWAY_OWNER: &str = "gateway";

/// Allocates VPN client addresses to labs
///
/// Addresses are handed out in blocks, one block per lab, so a lab's whole
/// team either gets addresses or nothing is allocated.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    /// The subnet to allocate from
    subnet: Ipv4Net,

    /// Allocated addresses by owner (lab tag)
    allocations: BTreeMap<String, Vec<Ipv4Addr>>,

    /// Reverse mapping of address to owner
    ip_to_owner: HashMap<Ipv4Addr, String>,
}

impl IpAllocator {
    /// Create a new allocator for the given subnet
    pub fn new(subnet: Ipv4Net) -> Self {
        let mut allocator = Self {
            subnet: subnet.trunc(),
            allocations: BTreeMap::new(),
            ip_to_owner: HashMap::new(),
        };

        // Reserve gateway IP (.1), it is the environment's VPN endpoint
        allocator
            .ip_to_owner
            .insert(allocator.gateway(), GATEWAY_OWNER.to_string());
        allocator
    }

    /// Gateway address of the subnet
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }

    /// Allocate `count` addresses for an owner
    ///
    /// Allocating again for the same owner returns the existing block.
    pub fn allocate_block(&mut self, owner: &str, count: usize) -> Result<Vec<Ipv4Addr>> {
        if let Some(existing) = self.allocations.get(owner) {
            return Ok(existing.clone());
        }

        let block: Vec<Ipv4Addr> = self
            .subnet
            .hosts()
            .filter(|ip| !self.ip_to_owner.contains_key(ip))
            .take(count)
            .collect();

        if block.len() < count {
            return Err(Error::SubnetExhausted(self.subnet.to_string()));
        }

        for ip in &block {
            self.ip_to_owner.insert(*ip, owner.to_string());
        }
        self.allocations.insert(owner.to_string(), block.clone());

        Ok(block)
    }

    /// Record a known block for an owner, e.g. when restoring state
    pub fn allocate_specific(&mut self, owner: &str, ips: &[Ipv4Addr]) -> Result<()> {
        for ip in ips {
            // Check if IP is in subnet
            if !self.subnet.contains(ip) {
                return Err(Error::AddressNotInRange {
                    address: ip.to_string(),
                    range: self.subnet.to_string(),
                });
            }

            // Check if already allocated to somebody else
            if let Some(existing) = self.ip_to_owner.get(ip) {
                if existing != owner {
                    return Err(Error::AddressInUse {
                        address: *ip,
                        owner: existing.clone(),
                    });
                }
            }
        }

        for ip in ips {
            self.ip_to_owner.insert(*ip, owner.to_string());
        }
        self.allocations
            .entry(owner.to_string())
            .or_default()
            .extend(ips.iter().copied());

        Ok(())
    }

    /// Release an owner's block
    pub fn release(&mut self, owner: &str) -> Vec<Ipv4Addr> {
        let released = self.allocations.remove(owner).unwrap_or_default();
        for ip in &released {
            self.ip_to_owner.remove(ip);
        }
        released
    }

    /// Get the block allocated to an owner
    pub fn get_allocation(&self, owner: &str) -> Option<&[Ipv4Addr]> {
        self.allocations.get(owner).map(|ips| ips.as_slice())
    }

    /// Get the owner of a specific address
    pub fn get_owner_by_ip(&self, ip: &Ipv4Addr) -> Option<&str> {
        self.ip_to_owner.get(ip).map(|s| s.as_str())
    }

    /// Get all allocations
    pub fn all_allocations(&self) -> &BTreeMap<String, Vec<Ipv4Addr>> {
        &self.allocations
    }

    /// Get number of allocated addresses, gateway included
    pub fn allocated_count(&self) -> usize {
        self.ip_to_owner.len()
    }

    /// Get the subnet
    pub fn subnet(&self) -> &Ipv4Net {
        &self.subnet
    }
}
