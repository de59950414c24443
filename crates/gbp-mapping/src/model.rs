//! Abstract policy objects and the requests that create and update them

use gbp_common::{ActionType, Direction, GbpError, PortRange, Protocol, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP version of an L3 context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    /// IPv4
    #[default]
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    /// Version of a network
    pub fn of(network: &IpNetwork) -> Self {
        if network.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }

    /// Address width in bits
    pub const fn width(&self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    /// Network matching any address of this version
    pub fn any(&self) -> IpNetwork {
        let addr: IpAddr = match self {
            Self::V4 => Ipv4Addr::UNSPECIFIED.into(),
            Self::V6 => Ipv6Addr::UNSPECIFIED.into(),
        };
        // prefix 0 is valid for both families
        IpNetwork::new(addr, 0).unwrap_or_else(|_| IpNetwork::from(addr))
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = GbpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(Self::V4),
            6 => Ok(Self::V6),
            other => Err(GbpError::InvalidRequest(format!("unsupported IP version {}", other))),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(value: IpVersion) -> Self {
        match value {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

// === Objects ===

/// Workload reference, optionally bound to a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub endpoint_group_id: Option<String>,
    pub port_id: Option<String>,
}

/// Named set of endpoints sharing contracts and subnets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub l2_context_id: Option<String>,
    /// Bound subnets in attachment order. Only ever grows.
    pub subnets: Vec<String>,
    pub provided_contracts: BTreeSet<String>,
    pub consumed_contracts: BTreeSet<String>,
    /// Maintained by the store
    pub endpoints: Vec<String>,
}

impl EndpointGroup {
    /// Contracts the group provides or consumes
    pub fn contracts(&self) -> impl Iterator<Item = &String> {
        self.provided_contracts.union(&self.consumed_contracts)
    }
}

/// Broadcast domain, rendered as a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Context {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub l3_context_id: Option<String>,
    pub network_id: Option<String>,
    /// Maintained by the store
    pub endpoint_groups: Vec<String>,
}

/// Routing domain, rendered as a router plus a subnet pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3Context {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub ip_version: IpVersion,
    pub ip_pool: IpNetwork,
    pub subnet_prefix_length: u8,
    pub routers: Vec<String>,
    /// Maintained by the store
    pub l2_contexts: Vec<String>,
}

/// Ordered list of policy rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub policy_rules: Vec<String>,
}

/// Classifier plus ordered actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub policy_classifier_id: String,
    pub policy_actions: Vec<String>,
}

/// Traffic match: protocol, ports and direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyClassifier {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub protocol: Option<Protocol>,
    pub port_range: Option<PortRange>,
    pub direction: Direction,
}

/// What to do with classified traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAction {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub action_type: ActionType,
    /// Redirect target (firewall id)
    pub action_value: Option<String>,
}

// === Requests ===

/// Create an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub endpoint_group_id: Option<String>,
    pub port_id: Option<String>,
}

/// Update an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Create an endpoint group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointGroupRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub l2_context_id: Option<String>,
    pub subnets: Vec<String>,
    pub provided_contracts: Vec<String>,
    pub consumed_contracts: Vec<String>,
}

/// Update an endpoint group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointGroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Full new subnet list; must keep every current subnet
    pub subnets: Option<Vec<String>>,
    pub provided_contracts: Option<Vec<String>>,
    pub consumed_contracts: Option<Vec<String>>,
}

/// Create an L2 context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L2ContextRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub l3_context_id: Option<String>,
    pub network_id: Option<String>,
}

/// Update an L2 context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L2ContextUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Create an L3 context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L3ContextRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    /// Inferred from the pool when absent
    pub ip_version: Option<u8>,
    pub ip_pool: String,
    pub subnet_prefix_length: u8,
    pub routers: Vec<String>,
}

impl Default for L3ContextRequest {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            name: String::new(),
            description: String::new(),
            ip_version: None,
            ip_pool: String::new(),
            subnet_prefix_length: 24,
            routers: Vec::new(),
        }
    }
}

/// Update an L3 context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L3ContextUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Must equal the current router list
    pub routers: Option<Vec<String>>,
}

/// Create a contract
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub policy_rules: Vec<String>,
}

/// Update a contract
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub policy_rules: Option<Vec<String>>,
}

/// Create a policy rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRuleRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub policy_classifier_id: String,
    pub policy_actions: Vec<String>,
}

impl Default for PolicyRuleRequest {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            name: String::new(),
            description: String::new(),
            enabled: true,
            policy_classifier_id: String::new(),
            policy_actions: Vec::new(),
        }
    }
}

/// Update a policy rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub policy_classifier_id: Option<String>,
    pub policy_actions: Option<Vec<String>>,
}

/// Create a policy classifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyClassifierRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub protocol: Option<Protocol>,
    /// `"80"` or `"min:max"`
    pub port_range: Option<String>,
    pub direction: Option<Direction>,
}

/// Update a policy classifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyClassifierUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: Option<Protocol>,
    pub port_range: Option<String>,
    pub direction: Option<Direction>,
}

/// Create a policy action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyActionRequest {
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub action_type: ActionType,
    pub action_value: Option<String>,
}

/// Update a policy action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyActionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub action_value: Option<String>,
}

// === Request -> object ===

fn require_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(GbpError::InvalidRequest("tenant_id is required".into()));
    }
    Ok(())
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

impl EndpointRequest {
    pub(crate) fn build(self, id: String) -> Result<Endpoint> {
        require_tenant(&self.tenant_id)?;
        Ok(Endpoint {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            endpoint_group_id: self.endpoint_group_id,
            port_id: self.port_id,
        })
    }
}

impl EndpointUpdate {
    pub(crate) fn apply(self, original: &Endpoint) -> Result<Endpoint> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        Ok(current)
    }
}

impl EndpointGroupRequest {
    pub(crate) fn build(self, id: String) -> Result<EndpointGroup> {
        require_tenant(&self.tenant_id)?;
        Ok(EndpointGroup {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            l2_context_id: self.l2_context_id,
            subnets: dedup(self.subnets),
            provided_contracts: self.provided_contracts.into_iter().collect(),
            consumed_contracts: self.consumed_contracts.into_iter().collect(),
            endpoints: Vec::new(),
        })
    }
}

impl EndpointGroupUpdate {
    pub(crate) fn apply(self, original: &EndpointGroup) -> Result<EndpointGroup> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(subnets) = self.subnets {
            current.subnets = dedup(subnets);
        }
        if let Some(provided) = self.provided_contracts {
            current.provided_contracts = provided.into_iter().collect();
        }
        if let Some(consumed) = self.consumed_contracts {
            current.consumed_contracts = consumed.into_iter().collect();
        }
        Ok(current)
    }
}

impl L2ContextRequest {
    pub(crate) fn build(self, id: String) -> Result<L2Context> {
        require_tenant(&self.tenant_id)?;
        Ok(L2Context {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            l3_context_id: self.l3_context_id,
            network_id: self.network_id,
            endpoint_groups: Vec::new(),
        })
    }
}

impl L2ContextUpdate {
    pub(crate) fn apply(self, original: &L2Context) -> Result<L2Context> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        Ok(current)
    }
}

impl L3ContextRequest {
    pub(crate) fn build(self, id: String) -> Result<L3Context> {
        require_tenant(&self.tenant_id)?;
        let pool: IpNetwork = self
            .ip_pool
            .trim()
            .parse()
            .map_err(|e| GbpError::InvalidRequest(format!("ip_pool '{}': {}", self.ip_pool, e)))?;
        if pool.network() != pool.ip() {
            return Err(GbpError::InvalidRequest(format!(
                "ip_pool {} has host bits set",
                pool
            )));
        }
        let ip_version = match self.ip_version {
            Some(v) => IpVersion::try_from(v)?,
            None => IpVersion::of(&pool),
        };
        if ip_version != IpVersion::of(&pool) {
            return Err(GbpError::InvalidRequest(format!(
                "ip_pool {} is not an IPv{} network",
                pool, ip_version
            )));
        }
        let prefix = self.subnet_prefix_length;
        if prefix < pool.prefix() || prefix > ip_version.width() {
            return Err(GbpError::InvalidRequest(format!(
                "subnet_prefix_length {} must be between {} and {}",
                prefix,
                pool.prefix(),
                ip_version.width()
            )));
        }
        Ok(L3Context {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            ip_version,
            ip_pool: pool,
            subnet_prefix_length: prefix,
            routers: dedup(self.routers),
            l2_contexts: Vec::new(),
        })
    }
}

impl L3ContextUpdate {
    pub(crate) fn apply(self, original: &L3Context) -> Result<L3Context> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(routers) = self.routers {
            current.routers = dedup(routers);
        }
        Ok(current)
    }
}

impl ContractRequest {
    pub(crate) fn build(self, id: String) -> Result<Contract> {
        require_tenant(&self.tenant_id)?;
        Ok(Contract {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            policy_rules: dedup(self.policy_rules),
        })
    }
}

impl ContractUpdate {
    pub(crate) fn apply(self, original: &Contract) -> Result<Contract> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(rules) = self.policy_rules {
            current.policy_rules = dedup(rules);
        }
        Ok(current)
    }
}

impl PolicyRuleRequest {
    pub(crate) fn build(self, id: String) -> Result<PolicyRule> {
        require_tenant(&self.tenant_id)?;
        if self.policy_classifier_id.is_empty() {
            return Err(GbpError::InvalidRequest("policy_classifier_id is required".into()));
        }
        Ok(PolicyRule {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            policy_classifier_id: self.policy_classifier_id,
            policy_actions: dedup(self.policy_actions),
        })
    }
}

impl PolicyRuleUpdate {
    pub(crate) fn apply(self, original: &PolicyRule) -> Result<PolicyRule> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(enabled) = self.enabled {
            current.enabled = enabled;
        }
        if let Some(classifier) = self.policy_classifier_id {
            current.policy_classifier_id = classifier;
        }
        if let Some(actions) = self.policy_actions {
            current.policy_actions = dedup(actions);
        }
        Ok(current)
    }
}

fn parse_port_range(raw: Option<String>) -> Result<Option<PortRange>> {
    raw.map(|r| r.parse::<PortRange>()).transpose()
}

impl PolicyClassifierRequest {
    pub(crate) fn build(self, id: String) -> Result<PolicyClassifier> {
        require_tenant(&self.tenant_id)?;
        Ok(PolicyClassifier {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            protocol: self.protocol,
            port_range: parse_port_range(self.port_range)?,
            direction: self.direction.unwrap_or_default(),
        })
    }
}

impl PolicyClassifierUpdate {
    pub(crate) fn apply(self, original: &PolicyClassifier) -> Result<PolicyClassifier> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(protocol) = self.protocol {
            current.protocol = Some(protocol);
        }
        if self.port_range.is_some() {
            current.port_range = parse_port_range(self.port_range)?;
        }
        if let Some(direction) = self.direction {
            current.direction = direction;
        }
        Ok(current)
    }
}

impl PolicyActionRequest {
    pub(crate) fn build(self, id: String) -> Result<PolicyAction> {
        require_tenant(&self.tenant_id)?;
        Ok(PolicyAction {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            action_type: self.action_type,
            action_value: self.action_value,
        })
    }
}

impl PolicyActionUpdate {
    pub(crate) fn apply(self, original: &PolicyAction) -> Result<PolicyAction> {
        let mut current = original.clone();
        if let Some(name) = self.name {
            current.name = name;
        }
        if let Some(description) = self.description {
            current.description = description;
        }
        if let Some(value) = self.action_value {
            current.action_value = Some(value);
        }
        Ok(current)
    }
}
