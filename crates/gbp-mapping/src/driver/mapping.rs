//! Resource mapping driver
//!
//! Renders abstract policy onto concrete resources:
//!
//! - L3 context -> router
//! - L2 context -> network
//! - endpoint group -> subnet carved from the L3 pool, attached to the router
//! - endpoint -> port on the L2 network
//! - contract -> pair of security groups plus egress rules
//! - redirect action -> enabled firewall
//!
//! Anything the user supplied explicitly is used as is and never deleted.

use super::PolicyDriver;
use crate::allocator::{AllocationRequest, SubnetAllocator};
use crate::config::MappingConfig;
use crate::event::{Change, PolicyEvent};
use crate::gateway::ProvisioningGateway;
use crate::model::*;
use crate::plugin::GroupPolicyPlugin;
use crate::provider::{NetworkRequest, PortRequest, RouterRequest};
use crate::render::ContractRenderer;
use crate::store::{PolicyStore, PolicyTables, Query};
use async_trait::async_trait;
use gbp_common::{ActionType, GbpError, PolicyKind, Result};
use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn unbound(kind: PolicyKind, id: &str, binding: &'static str) -> GbpError {
    GbpError::Unbound {
        kind,
        id: id.to_string(),
        binding,
    }
}

pub struct MappingDriver {
    gateway: Arc<ProvisioningGateway>,
    renderer: ContractRenderer,
    config: MappingConfig,
}

impl MappingDriver {
    pub fn new(gateway: Arc<ProvisioningGateway>, config: MappingConfig) -> Self {
        Self {
            renderer: ContractRenderer::new(gateway.clone()),
            gateway,
            config,
        }
    }

    pub fn renderer(&self) -> &ContractRenderer {
        &self.renderer
    }

    // === Lookups ===

    fn group_contexts(&self, store: &PolicyStore, group: &EndpointGroup) -> Result<(L2Context, L3Context)> {
        let l2_id = group
            .l2_context_id
            .as_deref()
            .ok_or_else(|| unbound(PolicyKind::EndpointGroup, &group.id, "l2_context"))?;
        let l2: L2Context = store.get(l2_id)?;
        let l3_id = l2
            .l3_context_id
            .as_deref()
            .ok_or_else(|| unbound(PolicyKind::L2Context, &l2.id, "l3_context"))?;
        let l3: L3Context = store.get(l3_id)?;
        Ok((l2, l3))
    }

    fn router_of(l3: &L3Context) -> Result<&str> {
        l3.routers
            .first()
            .map(String::as_str)
            .ok_or_else(|| unbound(PolicyKind::L3Context, &l3.id, "router"))
    }

    fn group_ip_version(&self, store: &PolicyStore, group: &EndpointGroup) -> IpVersion {
        self.group_contexts(store, group)
            .map(|(_, l3)| l3.ip_version)
            .unwrap_or_default()
    }

    /// CIDRs of subnets bound to other groups of the same L3 context
    async fn cidrs_in_use(&self, store: &PolicyStore, l3: &L3Context, exclude: &str) -> Vec<IpNetwork> {
        let mut subnet_ids = Vec::new();
        for l2_id in &l3.l2_contexts {
            let Ok(l2) = store.get::<L2Context>(l2_id) else { continue };
            for group_id in l2.endpoint_groups.iter().filter(|g| *g != exclude) {
                if let Ok(group) = store.get::<EndpointGroup>(group_id) {
                    subnet_ids.extend(group.subnets);
                }
            }
        }
        let mut cidrs = Vec::with_capacity(subnet_ids.len());
        for subnet_id in subnet_ids {
            match self.gateway.get_subnet(&subnet_id).await {
                Ok(subnet) => cidrs.push(subnet.cidr),
                Err(e) => debug!(subnet_id = %subnet_id, error = %e, "skipping unreadable subnet"),
            }
        }
        cidrs
    }

    async fn default_l3_context(&self, plugin: &GroupPolicyPlugin, tenant_id: &str) -> Result<L3Context> {
        let query = Query::new()
            .tenant(tenant_id)
            .filter("name", self.config.default_l3_context_name.clone());
        if let Some(existing) = plugin.store().list::<L3Context>(&query)?.into_iter().next() {
            return Ok(existing);
        }
        info!(tenant_id, name = %self.config.default_l3_context_name, "creating default L3 context");
        plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: tenant_id.to_string(),
                name: self.config.default_l3_context_name.clone(),
                description: "Implicitly created L3 context".into(),
                ip_version: Some(self.config.default_ip_version),
                ip_pool: self.config.default_ip_pool.to_string(),
                subnet_prefix_length: self.config.default_subnet_prefix_length,
                routers: Vec::new(),
            })
            .await
    }

    // === Endpoints ===

    async fn endpoint_created(&self, plugin: &GroupPolicyPlugin, endpoint: &Endpoint) -> Result<()> {
        let store = plugin.store();
        let group_id = endpoint
            .endpoint_group_id
            .as_deref()
            .ok_or(GbpError::EndpointRequiresEndpointGroup)?;
        let group: EndpointGroup = store.get(group_id)?;

        let port_id = match &endpoint.port_id {
            Some(port_id) => port_id.clone(),
            None => {
                let (l2, _) = self.group_contexts(store, &group)?;
                let network_id = l2
                    .network_id
                    .clone()
                    .ok_or_else(|| unbound(PolicyKind::L2Context, &l2.id, "network"))?;
                let port = self
                    .gateway
                    .create_owned_port(PortRequest {
                        tenant_id: endpoint.tenant_id.clone(),
                        name: format!("ep_{}", endpoint.name),
                        network_id,
                        admin_state_up: true,
                        security_groups: Vec::new(),
                    })
                    .await?;
                if let Err(e) = store.bind_endpoint_port(&endpoint.id, &port.id) {
                    self.release_port(&port.id).await;
                    return Err(e);
                }
                port.id
            }
        };
        self.renderer.bind_port(&group, &port_id).await
    }

    async fn release_port(&self, port_id: &str) {
        if let Err(e) = self.gateway.delete_port_if_owned(port_id).await {
            warn!(port_id, error = %e, "failed to release port");
        }
    }

    async fn endpoint_deleted(&self, plugin: &GroupPolicyPlugin, endpoint: &Endpoint) -> Result<()> {
        let Some(port_id) = &endpoint.port_id else {
            return Ok(());
        };
        if self.gateway.delete_port_if_owned(port_id).await? {
            return Ok(());
        }
        // explicit port: leave it, minus the contract groups we put on it
        let group = match endpoint.endpoint_group_id.as_deref() {
            Some(group_id) => plugin.store().get::<EndpointGroup>(group_id).ok(),
            None => None,
        };
        if let Some(group) = group {
            let contracts: Vec<String> = group.contracts().cloned().collect();
            self.renderer
                .unbind_contracts(&contracts, std::slice::from_ref(port_id))
                .await?;
        }
        Ok(())
    }

    // === Endpoint groups ===

    async fn group_created(&self, plugin: &GroupPolicyPlugin, group: &EndpointGroup) -> Result<()> {
        let store = plugin.store();
        let group = match group.l2_context_id {
            Some(_) => group.clone(),
            None => {
                let l2 = plugin
                    .create_l2_context(L2ContextRequest {
                        tenant_id: group.tenant_id.clone(),
                        name: group.name.clone(),
                        description: "Implicitly created L2 context".into(),
                        ..Default::default()
                    })
                    .await?;
                store.bind_group_l2_context(&group.id, &l2.id)?
            }
        };

        let (l2, l3) = self.group_contexts(store, &group)?;
        let router_id = Self::router_of(&l3)?;

        if group.subnets.is_empty() {
            let network_id = l2
                .network_id
                .as_deref()
                .ok_or_else(|| unbound(PolicyKind::L2Context, &l2.id, "network"))?;
            let in_use = self.cidrs_in_use(store, &l3, &group.id).await;
            let name = format!("epg_{}", group.name);
            let subnet = SubnetAllocator::new(&self.gateway)
                .allocate(AllocationRequest {
                    tenant_id: &group.tenant_id,
                    name: &name,
                    network_id,
                    router_id,
                    l3_context_id: &l3.id,
                    ip_version: l3.ip_version.into(),
                    pool: l3.ip_pool,
                    prefix_length: l3.subnet_prefix_length,
                    in_use: &in_use,
                })
                .await?;
            info!(group_id = %group.id, cidr = %subnet.cidr, "allocated group subnet");
            store.add_group_subnet(&group.id, &subnet.id)?;
        } else {
            for subnet_id in &group.subnets {
                self.gateway.add_router_interface(router_id, subnet_id).await?;
            }
        }

        let group: EndpointGroup = store.get(&group.id)?;
        self.renderer.render_group(store, &group, l3.ip_version).await
    }

    async fn group_updated(
        &self,
        plugin: &GroupPolicyPlugin,
        original: &EndpointGroup,
        current: &EndpointGroup,
    ) -> Result<()> {
        let store = plugin.store();
        let added: Vec<&String> = current
            .subnets
            .iter()
            .filter(|s| !original.subnets.contains(s))
            .collect();
        if !added.is_empty() {
            let (_, l3) = self.group_contexts(store, current)?;
            let router_id = Self::router_of(&l3)?;
            for subnet_id in added {
                self.gateway.add_router_interface(router_id, subnet_id).await?;
            }
        }

        self.renderer.unbind_stale(store, original, current).await?;
        let group: EndpointGroup = store.get(&current.id)?;
        let ip_version = self.group_ip_version(store, &group);
        self.renderer.render_group(store, &group, ip_version).await
    }

    async fn group_deleted(&self, plugin: &GroupPolicyPlugin, group: &EndpointGroup) -> Result<()> {
        self.renderer.withdraw_group(group).await?;
        if group.subnets.is_empty() {
            return Ok(());
        }
        let router_id = self
            .group_contexts(plugin.store(), group)
            .ok()
            .and_then(|(_, l3)| l3.routers.first().cloned());

        let mut first_error = None;
        for subnet_id in &group.subnets {
            if let Some(router_id) = &router_id {
                if let Err(e) = self.gateway.remove_router_interface(router_id, subnet_id).await {
                    warn!(subnet_id = %subnet_id, error = %e, "failed to detach subnet");
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            if let Err(e) = self.gateway.delete_subnet_if_owned(subnet_id).await {
                warn!(subnet_id = %subnet_id, error = %e, "failed to delete subnet");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // === L2 / L3 contexts ===

    async fn l2_created(&self, plugin: &GroupPolicyPlugin, l2: &L2Context) -> Result<()> {
        let store = plugin.store();
        if l2.l3_context_id.is_none() {
            let l3 = self.default_l3_context(plugin, &l2.tenant_id).await?;
            store.bind_l2_l3_context(&l2.id, &l3.id)?;
        }
        if l2.network_id.is_none() {
            let network = self
                .gateway
                .create_owned_network(NetworkRequest {
                    tenant_id: l2.tenant_id.clone(),
                    name: format!("l2p_{}", l2.name),
                    admin_state_up: true,
                    shared: false,
                })
                .await?;
            if let Err(e) = store.bind_l2_network(&l2.id, &network.id) {
                if let Err(cleanup) = self.gateway.delete_network_if_owned(&network.id).await {
                    warn!(network_id = %network.id, error = %cleanup, "failed to release network");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn l2_deleted(&self, l2: &L2Context) -> Result<()> {
        if let Some(network_id) = &l2.network_id {
            self.gateway.delete_network_if_owned(network_id).await?;
        }
        Ok(())
    }

    async fn l3_created(&self, plugin: &GroupPolicyPlugin, l3: &L3Context) -> Result<()> {
        if !l3.routers.is_empty() {
            return Ok(());
        }
        let router = self
            .gateway
            .create_owned_router(RouterRequest {
                tenant_id: l3.tenant_id.clone(),
                name: format!("l3p_{}", l3.name),
                admin_state_up: true,
            })
            .await?;
        if let Err(e) = plugin.store().add_l3_router(&l3.id, &router.id) {
            if let Err(cleanup) = self.gateway.delete_router_if_owned(&router.id).await {
                warn!(router_id = %router.id, error = %cleanup, "failed to release router");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn l3_deleted(&self, l3: &L3Context) -> Result<()> {
        let mut first_error = None;
        for router_id in &l3.routers {
            if let Err(e) = self.gateway.delete_router_if_owned(router_id).await {
                warn!(router_id = %router_id, error = %e, "failed to delete router");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // === Contracts and actions ===

    async fn contract_updated(&self, plugin: &GroupPolicyPlugin, contract: &Contract) -> Result<()> {
        let store = plugin.store();
        let groups: Vec<EndpointGroup> = store
            .list::<EndpointGroup>(&Query::new())?
            .into_iter()
            .filter(|g| g.provided_contracts.contains(&contract.id) || g.consumed_contracts.contains(&contract.id))
            .collect();
        for group in groups {
            let ip_version = self.group_ip_version(store, &group);
            self.renderer.render_group(store, &group, ip_version).await?;
        }
        Ok(())
    }

    async fn action_applied(&self, action: &PolicyAction) -> Result<()> {
        if action.action_type != ActionType::Redirect {
            return Ok(());
        }
        let target = action
            .action_value
            .as_deref()
            .ok_or_else(|| GbpError::InvalidRequest("redirect action requires action_value".into()))?;
        self.gateway.activate_firewall(target).await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyDriver for MappingDriver {
    fn name(&self) -> &str {
        "mapping"
    }

    fn precommit(&self, _tables: &PolicyTables, event: &PolicyEvent) -> Result<()> {
        match event {
            PolicyEvent::Endpoint(Change::Created(endpoint)) => {
                if endpoint.endpoint_group_id.is_none() {
                    return Err(GbpError::EndpointRequiresEndpointGroup);
                }
            }
            PolicyEvent::EndpointGroup(Change::Updated { original, current }) => {
                if original.subnets.iter().any(|s| !current.subnets.contains(s)) {
                    return Err(GbpError::EndpointGroupSubnetRemovalNotSupported);
                }
            }
            PolicyEvent::L3Context(Change::Created(l3)) => {
                if l3.routers.len() > 1 {
                    return Err(GbpError::L3PolicyMultipleRoutersNotSupported);
                }
            }
            PolicyEvent::L3Context(Change::Updated { original, current }) => {
                let before: BTreeSet<&String> = original.routers.iter().collect();
                let after: BTreeSet<&String> = current.routers.iter().collect();
                if before != after {
                    return Err(GbpError::L3PolicyRoutersUpdateNotSupported);
                }
            }
            PolicyEvent::PolicyAction(Change::Created(action))
            | PolicyEvent::PolicyAction(Change::Updated { current: action, .. }) => {
                let has_target = action.action_value.as_deref().is_some_and(|v| !v.trim().is_empty());
                if action.action_type == ActionType::Redirect && !has_target {
                    return Err(GbpError::InvalidRequest(
                        "redirect action requires action_value".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn postcommit(&self, plugin: &GroupPolicyPlugin, event: &PolicyEvent) -> Result<()> {
        match event {
            PolicyEvent::Endpoint(change) => match change {
                Change::Created(endpoint) => self.endpoint_created(plugin, endpoint).await,
                Change::Updated { .. } => Ok(()),
                Change::Deleted(endpoint) => self.endpoint_deleted(plugin, endpoint).await,
            },
            PolicyEvent::EndpointGroup(change) => match change {
                Change::Created(group) => self.group_created(plugin, group).await,
                Change::Updated { original, current } => {
                    self.group_updated(plugin, original, current).await
                }
                Change::Deleted(group) => self.group_deleted(plugin, group).await,
            },
            PolicyEvent::L2Context(change) => match change {
                Change::Created(l2) => self.l2_created(plugin, l2).await,
                Change::Updated { .. } => Ok(()),
                Change::Deleted(l2) => self.l2_deleted(l2).await,
            },
            PolicyEvent::L3Context(change) => match change {
                Change::Created(l3) => self.l3_created(plugin, l3).await,
                Change::Updated { .. } => Ok(()),
                Change::Deleted(l3) => self.l3_deleted(l3).await,
            },
            PolicyEvent::Contract(change) => match change {
                Change::Created(contract) => {
                    self.renderer.create_contract_groups(contract).await.map(|_| ())
                }
                Change::Updated { current, .. } => self.contract_updated(plugin, current).await,
                Change::Deleted(contract) => self.renderer.delete_contract_groups(&contract.id).await,
            },
            PolicyEvent::PolicyAction(change) => match change {
                Change::Created(action) | Change::Updated { current: action, .. } => {
                    self.action_applied(action).await
                }
                Change::Deleted(_) => Ok(()),
            },
            PolicyEvent::PolicyRule(_) | PolicyEvent::PolicyClassifier(_) => Ok(()),
        }
    }
}
