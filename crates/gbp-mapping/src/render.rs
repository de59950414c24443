//! Contract rendering
//!
//! Each contract maps to a pair of security groups. Groups consuming the
//! contract bind the consumed-side group to their ports. Groups providing it
//! bind the provided-side group and render the contract's allow rules:
//!
//! | classifier direction | rule placed in      | remote prefix            |
//! |----------------------|---------------------|--------------------------|
//! | `in`                 | consumed-side group | each provider subnet     |
//! | `out`                | provided-side group | any (`0.0.0.0/0`, `::/0`)|
//! | `bi`                 | both                | both                     |
//!
//! Rules already rendered for a contract are not created again. Each
//! rendered rule remembers the providing groups that asked for it and is
//! deleted once the last of them withdraws.

use crate::gateway::ProvisioningGateway;
use crate::model::*;
use crate::provider::{EtherType, RuleDirection, SecurityGroupRequest, SecurityGroupRuleRequest};
use crate::store::PolicyStore;
use dashmap::DashMap;
use gbp_common::{ActionType, Direction, GbpError, PortRange, ProviderError, Result};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Security groups backing one contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractSecurityGroups {
    pub provided_sg_id: String,
    pub consumed_sg_id: String,
}

#[derive(Debug)]
struct RenderedRule {
    rule_id: String,
    /// Providing groups the rule was rendered for
    providers: BTreeSet<String>,
}

#[derive(Debug)]
struct Mapping {
    groups: ContractSecurityGroups,
    rendered: HashMap<SecurityGroupRuleRequest, RenderedRule>,
}

/// Where a classifier's permits go: (security group, remote prefix)
pub fn plan_rules(
    direction: Direction,
    groups: &ContractSecurityGroups,
    provider_cidrs: &[IpNetwork],
    any: IpNetwork,
) -> Vec<(String, IpNetwork)> {
    let mut plan = Vec::new();
    if direction.outbound() {
        plan.push((groups.provided_sg_id.clone(), any));
    }
    if direction.inbound() {
        for cidr in provider_cidrs {
            plan.push((groups.consumed_sg_id.clone(), *cidr));
        }
    }
    plan
}

pub struct ContractRenderer {
    gateway: Arc<ProvisioningGateway>,
    mappings: DashMap<String, Mapping>,
}

impl ContractRenderer {
    pub fn new(gateway: Arc<ProvisioningGateway>) -> Self {
        Self {
            gateway,
            mappings: DashMap::new(),
        }
    }

    /// Security groups of a contract, or `ContractMappingMissing`
    pub fn mapping(&self, contract_id: &str) -> Result<ContractSecurityGroups> {
        self.mappings
            .get(contract_id)
            .map(|m| m.groups.clone())
            .ok_or_else(|| GbpError::ContractMappingMissing(contract_id.to_string()))
    }

    /// Ids of the rules rendered for a contract on behalf of one providing
    /// group, sorted
    pub fn rendered_rules(&self, contract_id: &str, group_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .mappings
            .get(contract_id)
            .map(|m| {
                m.rendered
                    .values()
                    .filter(|r| r.providers.contains(group_id))
                    .map(|r| r.rule_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Create the consumed-side and provided-side groups of a new contract
    pub async fn create_contract_groups(&self, contract: &Contract) -> Result<ContractSecurityGroups> {
        let consumed = self
            .gateway
            .create_owned_security_group(SecurityGroupRequest {
                tenant_id: contract.tenant_id.clone(),
                name: format!("consumed_{}", contract.name),
                description: String::new(),
            })
            .await?;
        let provided = match self
            .gateway
            .create_owned_security_group(SecurityGroupRequest {
                tenant_id: contract.tenant_id.clone(),
                name: format!("provided_{}", contract.name),
                description: String::new(),
            })
            .await
        {
            Ok(sg) => sg,
            Err(e) => {
                if let Err(cleanup) = self.gateway.delete_security_group_if_owned(&consumed.id).await {
                    warn!(security_group_id = %consumed.id, error = %cleanup, "failed to release security group");
                }
                return Err(e);
            }
        };
        let groups = ContractSecurityGroups {
            provided_sg_id: provided.id,
            consumed_sg_id: consumed.id,
        };
        self.mappings.insert(
            contract.id.clone(),
            Mapping {
                groups: groups.clone(),
                rendered: HashMap::new(),
            },
        );
        Ok(groups)
    }

    /// Delete a contract's owned groups and forget the mapping
    pub async fn delete_contract_groups(&self, contract_id: &str) -> Result<()> {
        let Some((_, mapping)) = self.mappings.remove(contract_id) else {
            debug!(contract_id, "no security groups to delete");
            return Ok(());
        };
        self.gateway
            .delete_security_group_if_owned(&mapping.groups.consumed_sg_id)
            .await?;
        self.gateway
            .delete_security_group_if_owned(&mapping.groups.provided_sg_id)
            .await?;
        Ok(())
    }

    /// Security groups a group's ports carry for its contracts
    pub fn security_groups_for(&self, group: &EndpointGroup) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        for contract_id in &group.consumed_contracts {
            groups.push(self.mapping(contract_id)?.consumed_sg_id);
        }
        for contract_id in &group.provided_contracts {
            groups.push(self.mapping(contract_id)?.provided_sg_id);
        }
        Ok(groups)
    }

    /// Ports of a group's endpoints
    pub fn group_ports(&self, store: &PolicyStore, group: &EndpointGroup) -> Result<Vec<String>> {
        let mut ports = Vec::new();
        for endpoint_id in &group.endpoints {
            let endpoint: Endpoint = store.get(endpoint_id)?;
            if let Some(port_id) = endpoint.port_id {
                ports.push(port_id);
            }
        }
        Ok(ports)
    }

    /// Bind one port to every contract group of its endpoint group
    pub async fn bind_port(&self, group: &EndpointGroup, port_id: &str) -> Result<()> {
        let groups = self.security_groups_for(group)?;
        if groups.is_empty() {
            return Ok(());
        }
        self.gateway.bind_security_groups(port_id, &groups).await?;
        Ok(())
    }

    /// Detach the groups of the given contracts from ports. Contracts without
    /// a mapping are skipped.
    pub async fn unbind_contracts(&self, contract_ids: &[String], ports: &[String]) -> Result<()> {
        let mut stale = Vec::new();
        for contract_id in contract_ids {
            if let Ok(groups) = self.mapping(contract_id) {
                stale.push(groups.consumed_sg_id);
                stale.push(groups.provided_sg_id);
            }
        }
        self.unbind(&stale, ports).await
    }

    async fn unbind(&self, groups: &[String], ports: &[String]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        for port_id in ports {
            match self.gateway.unbind_security_groups(port_id, groups).await {
                Ok(_) => {}
                Err(GbpError::Provider(ProviderError::NotFound { .. })) => {
                    debug!(port_id = %port_id, "port gone, nothing to unbind");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop what a group update made stale: bindings of contracts the group
    /// no longer provides or consumes in the same role, and the rules it
    /// contributed to contracts it stopped providing
    pub async fn unbind_stale(
        &self,
        store: &PolicyStore,
        original: &EndpointGroup,
        current: &EndpointGroup,
    ) -> Result<()> {
        let mut stale = Vec::new();
        for contract_id in original.consumed_contracts.difference(&current.consumed_contracts) {
            if let Ok(groups) = self.mapping(contract_id) {
                stale.push(groups.consumed_sg_id);
            }
        }
        for contract_id in original.provided_contracts.difference(&current.provided_contracts) {
            if let Ok(groups) = self.mapping(contract_id) {
                stale.push(groups.provided_sg_id);
            }
        }
        let ports = self.group_ports(store, current)?;
        self.unbind(&stale, &ports).await?;

        for contract_id in original.provided_contracts.difference(&current.provided_contracts) {
            self.withdraw_provider(contract_id, &original.id).await?;
        }
        Ok(())
    }

    /// Withdraw the rules a group contributed as provider of every contract
    /// it provides
    pub async fn withdraw_group(&self, group: &EndpointGroup) -> Result<()> {
        for contract_id in &group.provided_contracts {
            self.withdraw_provider(contract_id, &group.id).await?;
        }
        Ok(())
    }

    /// Withdraw the rules one group contributed to a contract. Rules still
    /// wanted by another providing group stay.
    pub async fn withdraw_provider(&self, contract_id: &str, group_id: &str) -> Result<()> {
        let requests = self.requests_of(contract_id, group_id);
        self.release_rules(contract_id, group_id, &requests).await
    }

    fn requests_of(&self, contract_id: &str, group_id: &str) -> Vec<SecurityGroupRuleRequest> {
        self.mappings
            .get(contract_id)
            .map(|m| {
                m.rendered
                    .iter()
                    .filter(|(_, r)| r.providers.contains(group_id))
                    .map(|(request, _)| request.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop one provider from a rendered rule; returns the rule id when no
    /// provider is left
    fn forget_provider(
        &self,
        contract_id: &str,
        group_id: &str,
        request: &SecurityGroupRuleRequest,
    ) -> Option<String> {
        let mut mapping = self.mappings.get_mut(contract_id)?;
        let rendered = mapping.rendered.get_mut(request)?;
        rendered.providers.remove(group_id);
        if !rendered.providers.is_empty() {
            return None;
        }
        mapping.rendered.remove(request).map(|r| r.rule_id)
    }

    async fn release_rules(
        &self,
        contract_id: &str,
        group_id: &str,
        requests: &[SecurityGroupRuleRequest],
    ) -> Result<()> {
        for request in requests {
            let Some(rule_id) = self.forget_provider(contract_id, group_id, request) else {
                continue;
            };
            self.gateway.delete_security_group_rule(&rule_id).await?;
            debug!(contract_id, group_id, rule_id = %rule_id, "withdrew rule");
        }
        Ok(())
    }

    /// Render every contract of a group and bind its ports
    pub async fn render_group(
        &self,
        store: &PolicyStore,
        group: &EndpointGroup,
        ip_version: IpVersion,
    ) -> Result<()> {
        let ports = self.group_ports(store, group)?;

        if !group.provided_contracts.is_empty() {
            let mut cidrs = Vec::with_capacity(group.subnets.len());
            for subnet_id in &group.subnets {
                cidrs.push(self.gateway.get_subnet(subnet_id).await?.cidr);
            }
            for contract_id in &group.provided_contracts {
                let groups = self.mapping(contract_id)?;
                self.render_contract_rules(store, contract_id, &group.id, &groups, &cidrs, ip_version.any())
                    .await?;
            }
        }

        let groups = self.security_groups_for(group)?;
        if groups.is_empty() {
            return Ok(());
        }
        for port_id in &ports {
            self.gateway.bind_security_groups(port_id, &groups).await?;
        }
        debug!(group_id = %group.id, ports = ports.len(), "rendered contracts");
        Ok(())
    }

    /// Bring a provider's rules for one contract in line with the contract:
    /// render what is missing, withdraw what it no longer asks for
    async fn render_contract_rules(
        &self,
        store: &PolicyStore,
        contract_id: &str,
        group_id: &str,
        groups: &ContractSecurityGroups,
        provider_cidrs: &[IpNetwork],
        any: IpNetwork,
    ) -> Result<()> {
        let wanted = Self::wanted_rules(store, contract_id, groups, provider_cidrs, any)?;
        for request in &wanted {
            self.ensure_rule(contract_id, group_id, request.clone()).await?;
        }
        let stale: Vec<_> = self
            .requests_of(contract_id, group_id)
            .into_iter()
            .filter(|request| !wanted.contains(request))
            .collect();
        self.release_rules(contract_id, group_id, &stale).await
    }

    fn wanted_rules(
        store: &PolicyStore,
        contract_id: &str,
        groups: &ContractSecurityGroups,
        provider_cidrs: &[IpNetwork],
        any: IpNetwork,
    ) -> Result<Vec<SecurityGroupRuleRequest>> {
        let mut wanted = Vec::new();
        let contract: Contract = store.get(contract_id)?;
        for rule_id in &contract.policy_rules {
            let rule: PolicyRule = store.get(rule_id)?;
            if !rule.enabled {
                continue;
            }
            let mut allows = false;
            for action_id in &rule.policy_actions {
                let action: PolicyAction = store.get(action_id)?;
                allows |= action.action_type == ActionType::Allow;
            }
            if !allows {
                debug!(rule_id = %rule.id, "rule has no allow action, nothing to permit");
                continue;
            }
            let classifier: PolicyClassifier = store.get(&rule.policy_classifier_id)?;
            let (port_range_min, port_range_max) = PortRange::split(classifier.port_range.as_ref());
            for (security_group_id, prefix) in plan_rules(classifier.direction, groups, provider_cidrs, any) {
                let request = SecurityGroupRuleRequest {
                    tenant_id: contract.tenant_id.clone(),
                    security_group_id,
                    direction: RuleDirection::Egress,
                    ethertype: EtherType::of(&prefix),
                    protocol: classifier.protocol,
                    port_range_min,
                    port_range_max,
                    remote_ip_prefix: Some(prefix),
                };
                if !wanted.contains(&request) {
                    wanted.push(request);
                }
            }
        }
        Ok(wanted)
    }

    /// Record `group_id` as provider of a rule, creating the rule the first
    /// time any provider asks for it
    async fn ensure_rule(
        &self,
        contract_id: &str,
        group_id: &str,
        request: SecurityGroupRuleRequest,
    ) -> Result<()> {
        if self.add_provider(contract_id, group_id, &request) {
            return Ok(());
        }
        let rule_id = match self.gateway.create_security_group_rule(request.clone()).await {
            Ok(rule) => rule.id,
            Err(GbpError::Provider(ProviderError::Conflict(reason))) => {
                debug!(security_group_id = %request.security_group_id, "rule already present");
                self.gateway
                    .list_security_group_rules(&request.security_group_id)
                    .await?
                    .into_iter()
                    .find(|rule| request.matches(rule))
                    .map(|rule| rule.id)
                    .ok_or(GbpError::Provider(ProviderError::Conflict(reason)))?
            }
            Err(e) => return Err(e),
        };
        if let Some(mut mapping) = self.mappings.get_mut(contract_id) {
            mapping
                .rendered
                .entry(request)
                .or_insert_with(|| RenderedRule {
                    rule_id,
                    providers: BTreeSet::new(),
                })
                .providers
                .insert(group_id.to_string());
        }
        Ok(())
    }

    /// Returns whether the rule was already rendered
    fn add_provider(&self, contract_id: &str, group_id: &str, request: &SecurityGroupRuleRequest) -> bool {
        let Some(mut mapping) = self.mappings.get_mut(contract_id) else {
            return false;
        };
        match mapping.rendered.get_mut(request) {
            Some(rendered) => {
                rendered.providers.insert(group_id.to_string());
                true
            }
            None => false,
        }
    }
}
