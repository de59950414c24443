//! In-memory provider
//!
//! Implements the resource provider and both optional services against
//! process-local tables. Overlapping subnets are rejected per network and
//! per router, which is what keeps concurrent allocators from colliding.
//! Failures can be injected per operation or per CIDR.

use super::*;
use crate::allocator::overlaps;
use gbp_common::{new_id, ResourceKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// Operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateNetwork,
    CreatePort,
    CreateRouter,
    CreateSecurityGroup,
    CreateSecurityGroupRule,
    DeleteSubnet,
    UpdatePort,
}

#[derive(Debug, Default)]
struct State {
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    ports: BTreeMap<String, Port>,
    routers: BTreeMap<String, Router>,
    security_groups: BTreeMap<String, SecurityGroup>,
    rules: BTreeMap<String, SecurityGroupRule>,
    firewalls: BTreeMap<String, Firewall>,
    faults: HashSet<FaultPoint>,
    subnet_faults: HashSet<IpNetwork>,
    interface_faults: HashSet<IpNetwork>,
    security_group_faults: HashSet<String>,
}

fn not_found(kind: ResourceKind, id: &str) -> ProviderError {
    ProviderError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl State {
    fn check_fault(&self, point: FaultPoint) -> ProviderResult<()> {
        if self.faults.contains(&point) {
            return Err(ProviderError::Backend(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn subnet(&self, id: &str) -> ProviderResult<&Subnet> {
        self.subnets.get(id).ok_or_else(|| not_found(ResourceKind::Subnet, id))
    }

    fn require_security_groups(&self, ids: &[String]) -> ProviderResult<()> {
        for id in ids {
            if !self.security_groups.contains_key(id) {
                return Err(not_found(ResourceKind::SecurityGroup, id));
            }
        }
        Ok(())
    }

    fn attached_router(&self, subnet_id: &str) -> Option<&Router> {
        self.routers
            .values()
            .find(|r| r.interfaces.iter().any(|s| s == subnet_id))
    }
}

/// Process-local networking backend
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation fail until cleared
    pub fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().faults.insert(point);
    }

    pub fn clear_fault(&self, point: FaultPoint) {
        self.state.lock().faults.remove(&point);
    }

    /// Make subnet creation fail for one CIDR
    pub fn fail_subnet_create(&self, cidr: IpNetwork) {
        self.state.lock().subnet_faults.insert(cidr);
    }

    /// Make security group creation fail for one name
    pub fn fail_security_group_create(&self, name: impl Into<String>) {
        self.state.lock().security_group_faults.insert(name.into());
    }

    /// Make router attachment fail for subnets with this CIDR
    pub fn fail_router_interface(&self, cidr: IpNetwork) {
        self.state.lock().interface_faults.insert(cidr);
    }

    /// Seed a firewall
    pub fn add_firewall(&self, firewall: Firewall) {
        self.state.lock().firewalls.insert(firewall.id.clone(), firewall);
    }

    pub fn networks(&self) -> Vec<Network> {
        self.state.lock().networks.values().cloned().collect()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().subnets.values().cloned().collect()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.state.lock().ports.values().cloned().collect()
    }

    pub fn routers(&self) -> Vec<Router> {
        self.state.lock().routers.values().cloned().collect()
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state.lock().security_groups.values().cloned().collect()
    }

    pub fn security_group_rules(&self) -> Vec<SecurityGroupRule> {
        self.state.lock().rules.values().cloned().collect()
    }

    pub fn firewalls(&self) -> Vec<Firewall> {
        self.state.lock().firewalls.values().cloned().collect()
    }
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    async fn create_network(&self, request: NetworkRequest) -> ProviderResult<Network> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreateNetwork)?;
        let network = Network {
            id: new_id(),
            tenant_id: request.tenant_id,
            name: request.name,
            admin_state_up: request.admin_state_up,
            shared: request.shared,
            subnets: Vec::new(),
        };
        state.networks.insert(network.id.clone(), network.clone());
        Ok(network)
    }

    async fn get_network(&self, id: &str) -> ProviderResult<Network> {
        self.state
            .lock()
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Network, id))
    }

    async fn delete_network(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let network = state
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Network, id))?;
        if state.ports.values().any(|p| p.network_id == id) {
            return Err(ProviderError::Conflict(format!("network {} has ports", id)));
        }
        if let Some(subnet) = network.subnets.iter().find(|s| state.attached_router(s).is_some()) {
            return Err(ProviderError::Conflict(format!(
                "subnet {} of network {} is attached to a router",
                subnet, id
            )));
        }
        for subnet in &network.subnets {
            state.subnets.remove(subnet);
        }
        state.networks.remove(id);
        Ok(())
    }

    async fn create_subnet(&self, request: SubnetRequest) -> ProviderResult<Subnet> {
        let mut state = self.state.lock();
        if state.subnet_faults.contains(&request.cidr) {
            return Err(ProviderError::Backend(format!("injected failure for {}", request.cidr)));
        }
        let network = state
            .networks
            .get(&request.network_id)
            .ok_or_else(|| not_found(ResourceKind::Network, &request.network_id))?;
        for existing in &network.subnets {
            let existing = state.subnet(existing)?;
            if overlaps(&existing.cidr, &request.cidr) {
                return Err(ProviderError::Conflict(format!(
                    "{} overlaps {} on network {}",
                    request.cidr, existing.cidr, request.network_id
                )));
            }
        }
        let subnet = Subnet {
            id: new_id(),
            tenant_id: request.tenant_id,
            name: request.name,
            network_id: request.network_id,
            ip_version: request.ip_version,
            cidr: request.cidr,
            enable_dhcp: request.enable_dhcp,
        };
        if let Some(network) = state.networks.get_mut(&subnet.network_id) {
            network.subnets.push(subnet.id.clone());
        }
        state.subnets.insert(subnet.id.clone(), subnet.clone());
        Ok(subnet)
    }

    async fn get_subnet(&self, id: &str) -> ProviderResult<Subnet> {
        self.state.lock().subnet(id).cloned()
    }

    async fn delete_subnet(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::DeleteSubnet)?;
        let subnet = state.subnet(id)?.clone();
        if let Some(router) = state.attached_router(id) {
            return Err(ProviderError::Conflict(format!(
                "subnet {} is attached to router {}",
                id, router.id
            )));
        }
        if let Some(network) = state.networks.get_mut(&subnet.network_id) {
            network.subnets.retain(|s| s != id);
        }
        state.subnets.remove(id);
        Ok(())
    }

    async fn create_port(&self, request: PortRequest) -> ProviderResult<Port> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreatePort)?;
        if !state.networks.contains_key(&request.network_id) {
            return Err(not_found(ResourceKind::Network, &request.network_id));
        }
        state.require_security_groups(&request.security_groups)?;
        let port = Port {
            id: new_id(),
            tenant_id: request.tenant_id,
            name: request.name,
            network_id: request.network_id,
            admin_state_up: request.admin_state_up,
            security_groups: request.security_groups,
        };
        state.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    async fn get_port(&self, id: &str) -> ProviderResult<Port> {
        self.state
            .lock()
            .ports
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Port, id))
    }

    async fn delete_port(&self, id: &str) -> ProviderResult<()> {
        self.state
            .lock()
            .ports
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::Port, id))
    }

    async fn update_port_security_groups(
        &self,
        id: &str,
        security_groups: Vec<String>,
    ) -> ProviderResult<Port> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::UpdatePort)?;
        state.require_security_groups(&security_groups)?;
        let port = state
            .ports
            .get_mut(id)
            .ok_or_else(|| not_found(ResourceKind::Port, id))?;
        port.security_groups = security_groups;
        Ok(port.clone())
    }

    async fn create_security_group(
        &self,
        request: SecurityGroupRequest,
    ) -> ProviderResult<SecurityGroup> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreateSecurityGroup)?;
        if state.security_group_faults.contains(&request.name) {
            return Err(ProviderError::Backend(format!("injected failure for {}", request.name)));
        }
        let group = SecurityGroup {
            id: new_id(),
            tenant_id: request.tenant_id,
            name: request.name,
            description: request.description,
            rules: Vec::new(),
        };
        state.security_groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn get_security_group(&self, id: &str) -> ProviderResult<SecurityGroup> {
        self.state
            .lock()
            .security_groups
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::SecurityGroup, id))
    }

    async fn delete_security_group(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        if !state.security_groups.contains_key(id) {
            return Err(not_found(ResourceKind::SecurityGroup, id));
        }
        if let Some(port) = state
            .ports
            .values()
            .find(|p| p.security_groups.iter().any(|sg| sg == id))
        {
            return Err(ProviderError::Conflict(format!(
                "security group {} is in use by port {}",
                id, port.id
            )));
        }
        state.rules.retain(|_, rule| rule.security_group_id != id);
        state.security_groups.remove(id);
        Ok(())
    }

    async fn create_security_group_rule(
        &self,
        request: SecurityGroupRuleRequest,
    ) -> ProviderResult<SecurityGroupRule> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreateSecurityGroupRule)?;
        if !state.security_groups.contains_key(&request.security_group_id) {
            return Err(not_found(ResourceKind::SecurityGroup, &request.security_group_id));
        }
        if state.rules.values().any(|r| request.matches(r)) {
            return Err(ProviderError::Conflict(format!(
                "rule already exists in security group {}",
                request.security_group_id
            )));
        }
        let rule = SecurityGroupRule {
            id: new_id(),
            tenant_id: request.tenant_id,
            security_group_id: request.security_group_id,
            direction: request.direction,
            ethertype: request.ethertype,
            protocol: request.protocol,
            port_range_min: request.port_range_min,
            port_range_max: request.port_range_max,
            remote_ip_prefix: request.remote_ip_prefix,
        };
        if let Some(group) = state.security_groups.get_mut(&rule.security_group_id) {
            group.rules.push(rule.id.clone());
        }
        state.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn list_security_group_rules(
        &self,
        security_group_id: &str,
    ) -> ProviderResult<Vec<SecurityGroupRule>> {
        let state = self.state.lock();
        if !state.security_groups.contains_key(security_group_id) {
            return Err(not_found(ResourceKind::SecurityGroup, security_group_id));
        }
        Ok(state
            .rules
            .values()
            .filter(|r| r.security_group_id == security_group_id)
            .cloned()
            .collect())
    }

    async fn delete_security_group_rule(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let rule = state
            .rules
            .remove(id)
            .ok_or_else(|| not_found(ResourceKind::SecurityGroupRule, id))?;
        if let Some(group) = state.security_groups.get_mut(&rule.security_group_id) {
            group.rules.retain(|r| r != id);
        }
        Ok(())
    }
}

#[async_trait]
impl L3RouterService for InMemoryProvider {
    async fn create_router(&self, request: RouterRequest) -> ProviderResult<Router> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreateRouter)?;
        let router = Router {
            id: new_id(),
            tenant_id: request.tenant_id,
            name: request.name,
            admin_state_up: request.admin_state_up,
            interfaces: Vec::new(),
        };
        state.routers.insert(router.id.clone(), router.clone());
        Ok(router)
    }

    async fn get_router(&self, id: &str) -> ProviderResult<Router> {
        self.state
            .lock()
            .routers
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Router, id))
    }

    async fn delete_router(&self, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let router = state
            .routers
            .get(id)
            .ok_or_else(|| not_found(ResourceKind::Router, id))?;
        if !router.interfaces.is_empty() {
            return Err(ProviderError::Conflict(format!("router {} still has interfaces", id)));
        }
        state.routers.remove(id);
        Ok(())
    }

    async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let cidr = state.subnet(subnet_id)?.cidr;
        if state.interface_faults.contains(&cidr) {
            return Err(ProviderError::Backend(format!("injected interface failure for {}", cidr)));
        }
        let router = state
            .routers
            .get(router_id)
            .ok_or_else(|| not_found(ResourceKind::Router, router_id))?;
        for attached in &router.interfaces {
            if attached == subnet_id {
                return Err(ProviderError::Conflict(format!(
                    "subnet {} is already attached to router {}",
                    subnet_id, router_id
                )));
            }
            let existing = state.subnet(attached)?;
            if overlaps(&existing.cidr, &cidr) {
                return Err(ProviderError::Conflict(format!(
                    "{} overlaps {} on router {}",
                    cidr, existing.cidr, router_id
                )));
            }
        }
        if let Some(router) = state.routers.get_mut(router_id) {
            router.interfaces.push(subnet_id.to_string());
        }
        Ok(())
    }

    async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let router = state
            .routers
            .get_mut(router_id)
            .ok_or_else(|| not_found(ResourceKind::Router, router_id))?;
        if !router.interfaces.iter().any(|s| s == subnet_id) {
            return Err(ProviderError::Conflict(format!(
                "subnet {} is not attached to router {}",
                subnet_id, router_id
            )));
        }
        router.interfaces.retain(|s| s != subnet_id);
        Ok(())
    }
}

#[async_trait]
impl FirewallService for InMemoryProvider {
    async fn get_firewall(&self, id: &str) -> ProviderResult<Firewall> {
        self.state
            .lock()
            .firewalls
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Firewall, id))
    }

    async fn update_firewall(&self, id: &str, update: FirewallUpdate) -> ProviderResult<Firewall> {
        let mut state = self.state.lock();
        let firewall = state
            .firewalls
            .get_mut(id)
            .ok_or_else(|| not_found(ResourceKind::Firewall, id))?;
        if let Some(up) = update.admin_state_up {
            firewall.admin_state_up = up;
        }
        Ok(firewall.clone())
    }
}
