//! Concrete resource provider seams
//!
//! The engine never talks to the networking backend directly. Core
//! resources (networks, subnets, ports, security groups) go through a
//! [`ResourceProvider`]; routers and firewalls belong to optional services
//! resolved at call time through the [`ServiceDirectory`].

pub mod memory;

use async_trait::async_trait;
use gbp_common::{GbpError, ProviderError, Protocol, Result, ServiceCapability};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Provider result type
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
    pub shared: bool,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub network_id: String,
    pub ip_version: u8,
    pub cidr: IpNetwork,
    pub enable_dhcp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRequest {
    pub tenant_id: String,
    pub name: String,
    pub network_id: String,
    pub ip_version: u8,
    pub cidr: IpNetwork,
    pub enable_dhcp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub network_id: String,
    pub admin_state_up: bool,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub tenant_id: String,
    pub name: String,
    pub network_id: String,
    pub admin_state_up: bool,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
    /// Attached subnet ids
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterRequest {
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
}

/// Direction of an access rule, seen from the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtherType {
    IPv4,
    IPv6,
}

impl EtherType {
    pub fn of(network: &IpNetwork) -> Self {
        if network.is_ipv4() {
            Self::IPv4
        } else {
            Self::IPv6
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub tenant_id: String,
    pub security_group_id: String,
    pub direction: RuleDirection,
    pub ethertype: EtherType,
    pub protocol: Option<Protocol>,
    pub port_range_min: Option<u16>,
    pub port_range_max: Option<u16>,
    pub remote_ip_prefix: Option<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityGroupRuleRequest {
    pub tenant_id: String,
    pub security_group_id: String,
    pub direction: RuleDirection,
    pub ethertype: EtherType,
    pub protocol: Option<Protocol>,
    pub port_range_min: Option<u16>,
    pub port_range_max: Option<u16>,
    pub remote_ip_prefix: Option<IpNetwork>,
}

impl SecurityGroupRuleRequest {
    /// Whether an existing rule permits exactly what this request asks for
    pub fn matches(&self, rule: &SecurityGroupRule) -> bool {
        rule.security_group_id == self.security_group_id
            && rule.direction == self.direction
            && rule.ethertype == self.ethertype
            && rule.protocol == self.protocol
            && rule.port_range_min == self.port_range_min
            && rule.port_range_max == self.port_range_max
            && rule.remote_ip_prefix == self.remote_ip_prefix
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firewall {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallUpdate {
    pub admin_state_up: Option<bool>,
}

/// Core networking resources
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create_network(&self, request: NetworkRequest) -> ProviderResult<Network>;
    async fn get_network(&self, id: &str) -> ProviderResult<Network>;
    async fn delete_network(&self, id: &str) -> ProviderResult<()>;

    /// Fails with `Conflict` when the CIDR overlaps a subnet of the network
    async fn create_subnet(&self, request: SubnetRequest) -> ProviderResult<Subnet>;
    async fn get_subnet(&self, id: &str) -> ProviderResult<Subnet>;
    async fn delete_subnet(&self, id: &str) -> ProviderResult<()>;

    async fn create_port(&self, request: PortRequest) -> ProviderResult<Port>;
    async fn get_port(&self, id: &str) -> ProviderResult<Port>;
    async fn delete_port(&self, id: &str) -> ProviderResult<()>;
    /// Replace the security groups bound to a port
    async fn update_port_security_groups(
        &self,
        id: &str,
        security_groups: Vec<String>,
    ) -> ProviderResult<Port>;

    async fn create_security_group(
        &self,
        request: SecurityGroupRequest,
    ) -> ProviderResult<SecurityGroup>;
    async fn get_security_group(&self, id: &str) -> ProviderResult<SecurityGroup>;
    /// Deletes the group's rules with it
    async fn delete_security_group(&self, id: &str) -> ProviderResult<()>;

    async fn create_security_group_rule(
        &self,
        request: SecurityGroupRuleRequest,
    ) -> ProviderResult<SecurityGroupRule>;
    async fn list_security_group_rules(
        &self,
        security_group_id: &str,
    ) -> ProviderResult<Vec<SecurityGroupRule>>;
    async fn delete_security_group_rule(&self, id: &str) -> ProviderResult<()>;
}

/// Optional L3 routing service
#[async_trait]
pub trait L3RouterService: Send + Sync {
    async fn create_router(&self, request: RouterRequest) -> ProviderResult<Router>;
    async fn get_router(&self, id: &str) -> ProviderResult<Router>;
    async fn delete_router(&self, id: &str) -> ProviderResult<()>;
    /// Fails with `Conflict` when the subnet overlaps one already attached
    async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> ProviderResult<()>;
    async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> ProviderResult<()>;
}

/// Optional firewall service, target of redirect actions
#[async_trait]
pub trait FirewallService: Send + Sync {
    async fn get_firewall(&self, id: &str) -> ProviderResult<Firewall>;
    async fn update_firewall(&self, id: &str, update: FirewallUpdate) -> ProviderResult<Firewall>;
}

/// Optional services known to this deployment. Lookups happen per call so
/// services may be registered after the engine starts.
#[derive(Default)]
pub struct ServiceDirectory {
    l3: RwLock<Option<Arc<dyn L3RouterService>>>,
    firewall: RwLock<Option<Arc<dyn FirewallService>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_l3_router(self, service: Arc<dyn L3RouterService>) -> Self {
        self.register_l3_router(service);
        self
    }

    pub fn with_firewall(self, service: Arc<dyn FirewallService>) -> Self {
        self.register_firewall(service);
        self
    }

    pub fn register_l3_router(&self, service: Arc<dyn L3RouterService>) {
        *self.l3.write() = Some(service);
    }

    pub fn register_firewall(&self, service: Arc<dyn FirewallService>) {
        *self.firewall.write() = Some(service);
    }

    /// L3 routing service, or `GroupPolicyDeploymentError` when absent
    pub fn l3_router(&self) -> Result<Arc<dyn L3RouterService>> {
        self.l3
            .read()
            .clone()
            .ok_or(GbpError::GroupPolicyDeploymentError {
                service: ServiceCapability::L3Routing,
            })
    }

    /// Firewall service, or `GroupPolicyDeploymentError` when absent
    pub fn firewall(&self) -> Result<Arc<dyn FirewallService>> {
        self.firewall
            .read()
            .clone()
            .ok_or(GbpError::GroupPolicyDeploymentError {
                service: ServiceCapability::Firewall,
            })
    }
}

impl fmt::Debug for ServiceDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDirectory")
            .field("l3_router", &self.l3.read().is_some())
            .field("firewall", &self.firewall.read().is_some())
            .finish()
    }
}
