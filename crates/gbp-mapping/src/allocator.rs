//! Implicit subnet allocation
//!
//! Walks an L3 context's pool in prefix-length blocks, in address order,
//! and claims the first block that the provider accepts both as a subnet
//! and as a router interface. There is no reservation table: the provider's
//! overlap checks are what make concurrent allocations safe.

use crate::gateway::ProvisioningGateway;
use crate::provider::{Subnet, SubnetRequest};
use gbp_common::{GbpError, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, error, warn};

/// Whether two networks share any address
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.contains(b.network()) || b.contains(a.network()))
}

/// Consecutive blocks of one prefix length covering a pool
#[derive(Debug, Clone)]
pub struct SubnetBlocks {
    next: u128,
    step: u128,
    remaining: u128,
    prefix: u8,
    v4: bool,
}

impl SubnetBlocks {
    pub fn new(pool: IpNetwork, prefix: u8) -> Result<Self> {
        let width: u8 = if pool.is_ipv4() { 32 } else { 128 };
        if prefix < pool.prefix() || prefix > width {
            return Err(GbpError::InvalidRequest(format!(
                "prefix /{} does not fit pool {}",
                prefix, pool
            )));
        }
        let base = match pool {
            IpNetwork::V4(net) => u32::from(net.network()) as u128,
            IpNetwork::V6(net) => u128::from(net.network()),
        };
        // a /0 block spans the whole address space; the step is never used
        let step = 1u128.checked_shl((width - prefix) as u32).unwrap_or(0);
        let remaining = 1u128
            .checked_shl((prefix - pool.prefix()) as u32)
            .unwrap_or(u128::MAX);
        Ok(Self {
            next: base,
            step,
            remaining,
            prefix,
            v4: pool.is_ipv4(),
        })
    }
}

impl Iterator for SubnetBlocks {
    type Item = IpNetwork;

    fn next(&mut self) -> Option<IpNetwork> {
        if self.remaining == 0 {
            return None;
        }
        let block = if self.v4 {
            Ipv4Network::new(Ipv4Addr::from(self.next as u32), self.prefix)
                .ok()
                .map(IpNetwork::V4)
        } else {
            Ipv6Network::new(Ipv6Addr::from(self.next), self.prefix)
                .ok()
                .map(IpNetwork::V6)
        };
        self.remaining -= 1;
        self.next = self.next.wrapping_add(self.step);
        block
    }
}

/// Inputs of one allocation
#[derive(Debug, Clone)]
pub struct AllocationRequest<'a> {
    pub tenant_id: &'a str,
    pub name: &'a str,
    pub network_id: &'a str,
    pub router_id: &'a str,
    pub l3_context_id: &'a str,
    pub ip_version: u8,
    pub pool: IpNetwork,
    pub prefix_length: u8,
    /// CIDRs already bound to groups of the same L3 context
    pub in_use: &'a [IpNetwork],
}

pub struct SubnetAllocator<'a> {
    gateway: &'a ProvisioningGateway,
}

impl<'a> SubnetAllocator<'a> {
    pub fn new(gateway: &'a ProvisioningGateway) -> Self {
        Self { gateway }
    }

    /// Create and attach the first free block. The returned subnet is owned.
    pub async fn allocate(&self, request: AllocationRequest<'_>) -> Result<Subnet> {
        for cidr in SubnetBlocks::new(request.pool, request.prefix_length)? {
            if request.in_use.iter().any(|used| overlaps(used, &cidr)) {
                debug!(%cidr, "block already in use");
                continue;
            }
            let subnet = match self
                .gateway
                .create_owned_subnet(SubnetRequest {
                    tenant_id: request.tenant_id.to_string(),
                    name: request.name.to_string(),
                    network_id: request.network_id.to_string(),
                    ip_version: request.ip_version,
                    cidr,
                    enable_dhcp: true,
                })
                .await
            {
                Ok(subnet) => subnet,
                Err(e) => {
                    debug!(%cidr, error = %e, "subnet create failed, trying next block");
                    continue;
                }
            };
            match self
                .gateway
                .add_router_interface(request.router_id, &subnet.id)
                .await
            {
                Ok(()) => return Ok(subnet),
                Err(e) => {
                    warn!(%cidr, subnet_id = %subnet.id, error = %e, "router attach failed, releasing subnet");
                    if let Err(e) = self.gateway.delete_subnet_if_owned(&subnet.id).await {
                        error!(subnet_id = %subnet.id, error = %e, "failed to release subnet");
                    }
                }
            }
        }
        Err(GbpError::NoSubnetAvailable {
            l3_context_id: request.l3_context_id.to_string(),
        })
    }
}
