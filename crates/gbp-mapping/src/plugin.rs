//! Group policy plugin
//!
//! Front door for abstract policy CRUD. Each mutation stages the change,
//! runs driver precommit hooks under the store's write lock, applies it,
//! then awaits driver postcommit hooks with the lock released. A postcommit
//! failure is returned to the caller but the object stays committed.

use crate::config::Config;
use crate::driver::DriverManager;
use crate::event::PolicyEvent;
use crate::gateway::ProvisioningGateway;
use crate::model::*;
use crate::store::{PolicyObject, PolicyStore, Query};
use gbp_common::{new_id, Result};
use std::sync::Arc;
use tracing::debug;

pub struct GroupPolicyPlugin {
    store: PolicyStore,
    drivers: DriverManager,
}

impl GroupPolicyPlugin {
    pub fn new(drivers: DriverManager) -> Self {
        Self {
            store: PolicyStore::new(),
            drivers,
        }
    }

    /// Plugin with the drivers named in the configuration
    pub fn build(config: &Config, gateway: Arc<ProvisioningGateway>) -> Result<Self> {
        let drivers = DriverManager::from_config(config, gateway)?;
        debug!(drivers = ?drivers.names(), "policy drivers loaded");
        Ok(Self::new(drivers))
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn drivers(&self) -> &DriverManager {
        &self.drivers
    }

    // === Generic operations ===

    async fn create<T: PolicyObject>(&self, object: T) -> Result<T> {
        let id = object.id().to_string();
        let event = {
            let tx = self.store.begin();
            let event = tx.stage_create(object)?;
            self.drivers.precommit(tx.tables(), &event)?;
            tx.apply(&event);
            event
        };
        self.postcommit(&event).await?;
        self.store.get(&id)
    }

    async fn update<T: PolicyObject>(
        &self,
        id: &str,
        update: impl FnOnce(&T) -> Result<T> + Send,
    ) -> Result<T> {
        let event = {
            let tx = self.store.begin();
            let event = tx.stage_update::<T>(id, update)?;
            self.drivers.precommit(tx.tables(), &event)?;
            tx.apply(&event);
            event
        };
        self.postcommit(&event).await?;
        self.store.get(id)
    }

    /// Delete an object of any kind. Missing ids raise `NotFound`.
    pub async fn delete<T: PolicyObject>(&self, id: &str) -> Result<()> {
        let event = {
            let tx = self.store.begin();
            let event = tx.stage_delete::<T>(id)?;
            self.drivers.precommit(tx.tables(), &event)?;
            tx.apply(&event);
            event
        };
        self.postcommit(&event).await
    }

    async fn postcommit(&self, event: &PolicyEvent) -> Result<()> {
        self.drivers.postcommit(self, event).await
    }

    pub fn get<T: PolicyObject>(&self, id: &str) -> Result<T> {
        self.store.get(id)
    }

    pub fn list<T: PolicyObject>(&self, query: &Query) -> Result<Vec<T>> {
        self.store.list(query)
    }

    /// Like [`list`](Self::list) but projected to the query's fields
    pub fn list_fields<T: PolicyObject>(&self, query: &Query) -> Result<Vec<serde_json::Value>> {
        self.store.list_fields::<T>(query)
    }

    pub fn count<T: PolicyObject>(&self, query: &Query) -> Result<usize> {
        self.store.count::<T>(query)
    }

    // === Endpoints ===

    pub async fn create_endpoint(&self, request: EndpointRequest) -> Result<Endpoint> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_endpoint(&self, id: &str, update: EndpointUpdate) -> Result<Endpoint> {
        self.update(id, move |ep| update.apply(ep)).await
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<()> {
        self.delete::<Endpoint>(id).await
    }

    // === Endpoint groups ===

    pub async fn create_endpoint_group(&self, request: EndpointGroupRequest) -> Result<EndpointGroup> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_endpoint_group(
        &self,
        id: &str,
        update: EndpointGroupUpdate,
    ) -> Result<EndpointGroup> {
        self.update(id, move |group| update.apply(group)).await
    }

    pub async fn delete_endpoint_group(&self, id: &str) -> Result<()> {
        self.delete::<EndpointGroup>(id).await
    }

    // === L2 contexts ===

    pub async fn create_l2_context(&self, request: L2ContextRequest) -> Result<L2Context> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_l2_context(&self, id: &str, update: L2ContextUpdate) -> Result<L2Context> {
        self.update(id, move |l2| update.apply(l2)).await
    }

    pub async fn delete_l2_context(&self, id: &str) -> Result<()> {
        self.delete::<L2Context>(id).await
    }

    // === L3 contexts ===

    pub async fn create_l3_context(&self, request: L3ContextRequest) -> Result<L3Context> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_l3_context(&self, id: &str, update: L3ContextUpdate) -> Result<L3Context> {
        self.update(id, move |l3| update.apply(l3)).await
    }

    pub async fn delete_l3_context(&self, id: &str) -> Result<()> {
        self.delete::<L3Context>(id).await
    }

    // === Contracts ===

    pub async fn create_contract(&self, request: ContractRequest) -> Result<Contract> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_contract(&self, id: &str, update: ContractUpdate) -> Result<Contract> {
        self.update(id, move |contract| update.apply(contract)).await
    }

    pub async fn delete_contract(&self, id: &str) -> Result<()> {
        self.delete::<Contract>(id).await
    }

    // === Policy rules ===

    pub async fn create_policy_rule(&self, request: PolicyRuleRequest) -> Result<PolicyRule> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_policy_rule(&self, id: &str, update: PolicyRuleUpdate) -> Result<PolicyRule> {
        self.update(id, move |rule| update.apply(rule)).await
    }

    pub async fn delete_policy_rule(&self, id: &str) -> Result<()> {
        self.delete::<PolicyRule>(id).await
    }

    // === Policy classifiers ===

    pub async fn create_policy_classifier(
        &self,
        request: PolicyClassifierRequest,
    ) -> Result<PolicyClassifier> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_policy_classifier(
        &self,
        id: &str,
        update: PolicyClassifierUpdate,
    ) -> Result<PolicyClassifier> {
        self.update(id, move |classifier| update.apply(classifier)).await
    }

    pub async fn delete_policy_classifier(&self, id: &str) -> Result<()> {
        self.delete::<PolicyClassifier>(id).await
    }

    // === Policy actions ===

    pub async fn create_policy_action(&self, request: PolicyActionRequest) -> Result<PolicyAction> {
        self.create(request.build(new_id())?).await
    }

    pub async fn update_policy_action(&self, id: &str, update: PolicyActionUpdate) -> Result<PolicyAction> {
        self.update(id, move |action| update.apply(action)).await
    }

    pub async fn delete_policy_action(&self, id: &str) -> Result<()> {
        self.delete::<PolicyAction>(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use crate::driver::{MappingDriver, PolicyDriver};
    use crate::event::{Change, PolicyEvent};
    use crate::ledger::OwnershipLedger;
    use crate::notify::BroadcastNotifier;
    use crate::provider::memory::{FaultPoint, InMemoryProvider};
    use crate::provider::{
        Firewall, ResourceProvider, RuleDirection, ServiceDirectory, SubnetRequest,
    };
    use async_trait::async_trait;
    use gbp_common::{
        ActionType, Direction, GbpError, PolicyKind, Protocol, ProviderError, ResourceKind,
        ServiceCapability,
    };
    use ipnetwork::IpNetwork;

    struct Harness {
        provider: Arc<InMemoryProvider>,
        gateway: Arc<ProvisioningGateway>,
        driver: Arc<MappingDriver>,
        plugin: GroupPolicyPlugin,
        notifier: BroadcastNotifier,
    }

    fn harness_with(services: ServiceDirectory, provider: Arc<InMemoryProvider>) -> Harness {
        harness_chained(services, provider, Vec::new())
    }

    /// Harness whose mapping driver runs after `before`
    fn harness_chained(
        services: ServiceDirectory,
        provider: Arc<InMemoryProvider>,
        before: Vec<Arc<dyn PolicyDriver>>,
    ) -> Harness {
        let notifier = BroadcastNotifier::new(256);
        let gateway = Arc::new(ProvisioningGateway::new(
            provider.clone(),
            Arc::new(services),
            Arc::new(OwnershipLedger::new()),
            Arc::new(notifier.clone()),
        ));
        let driver = Arc::new(MappingDriver::new(gateway.clone(), MappingConfig::default()));
        let mut drivers = before;
        drivers.push(driver.clone());
        let plugin = GroupPolicyPlugin::new(DriverManager::new(drivers));
        Harness {
            provider,
            gateway,
            driver,
            plugin,
            notifier,
        }
    }

    fn harness() -> Harness {
        let provider = Arc::new(InMemoryProvider::new());
        let services = ServiceDirectory::new()
            .with_l3_router(provider.clone())
            .with_firewall(provider.clone());
        harness_with(services, provider)
    }

    fn cidr(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    async fn l3(h: &Harness) -> L3Context {
        h.plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: "t1".into(),
                name: "l3".into(),
                ip_pool: "10.0.0.0/16".into(),
                subnet_prefix_length: 24,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn l2(h: &Harness, l3: &L3Context) -> L2Context {
        h.plugin
            .create_l2_context(L2ContextRequest {
                tenant_id: "t1".into(),
                name: "l2".into(),
                l3_context_id: Some(l3.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn group(h: &Harness, name: &str, l2: &L2Context) -> EndpointGroup {
        h.plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: name.into(),
                l2_context_id: Some(l2.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn endpoint(h: &Harness, name: &str, group: &EndpointGroup) -> Endpoint {
        h.plugin
            .create_endpoint(EndpointRequest {
                tenant_id: "t1".into(),
                name: name.into(),
                endpoint_group_id: Some(group.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn subnet_cidr(h: &Harness, id: &str) -> IpNetwork {
        h.provider
            .subnets()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.cidr)
            .unwrap()
    }

    #[tokio::test]
    async fn test_implicit_chain() {
        let h = harness();
        let l3 = l3(&h).await;
        assert_eq!(l3.routers.len(), 1);
        assert!(h.gateway.ledger().is_owned(ResourceKind::Router, &l3.routers[0]));

        let l2 = l2(&h, &l3).await;
        let network_id = l2.network_id.clone().unwrap();
        assert!(h.gateway.ledger().is_owned(ResourceKind::Network, &network_id));

        let group = group(&h, "web", &l2).await;
        assert_eq!(group.subnets.len(), 1);
        let subnet_id = &group.subnets[0];
        assert_eq!(subnet_cidr(&h, subnet_id), cidr("10.0.0.0/24"));
        assert!(h.gateway.ledger().is_owned(ResourceKind::Subnet, subnet_id));
        let router = &h.provider.routers()[0];
        assert_eq!(router.interfaces, vec![subnet_id.clone()]);

        let ep = endpoint(&h, "vm1", &group).await;
        let port_id = ep.port_id.clone().unwrap();
        assert!(h.gateway.ledger().is_owned(ResourceKind::Port, &port_id));
        let port = h.provider.ports().into_iter().find(|p| p.id == port_id).unwrap();
        assert_eq!(port.network_id, network_id);
        assert_eq!(port.name, "ep_vm1");

        let group: EndpointGroup = h.plugin.get(&group.id).unwrap();
        assert_eq!(group.endpoints, vec![ep.id.clone()]);
    }

    #[tokio::test]
    async fn test_second_group_gets_next_block() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let a = group(&h, "a", &l2).await;
        let b = group(&h, "b", &l2).await;
        assert_eq!(subnet_cidr(&h, &a.subnets[0]), cidr("10.0.0.0/24"));
        assert_eq!(subnet_cidr(&h, &b.subnets[0]), cidr("10.0.1.0/24"));
    }

    #[tokio::test]
    async fn test_multiple_routers_rejected_and_nothing_persisted() {
        let h = harness();
        let err = h
            .plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: "t1".into(),
                name: "l3".into(),
                ip_pool: "10.0.0.0/16".into(),
                routers: vec!["r1".into(), "r2".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, GbpError::L3PolicyMultipleRoutersNotSupported);
        assert_eq!(h.plugin.count::<L3Context>(&Query::new()).unwrap(), 0);
        assert!(h.provider.routers().is_empty());
    }

    #[tokio::test]
    async fn test_router_update_rejected() {
        let h = harness();
        let l3 = l3(&h).await;
        let err = h
            .plugin
            .update_l3_context(
                &l3.id,
                L3ContextUpdate {
                    routers: Some(vec!["other".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, GbpError::L3PolicyRoutersUpdateNotSupported);

        // same set is fine
        let renamed = h
            .plugin
            .update_l3_context(
                &l3.id,
                L3ContextUpdate {
                    name: Some("renamed".into()),
                    routers: Some(l3.routers.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "renamed");
    }

    #[tokio::test]
    async fn test_subnet_removal_rejected() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let group = group(&h, "web", &l2).await;

        let err = h
            .plugin
            .update_endpoint_group(
                &group.id,
                EndpointGroupUpdate {
                    subnets: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, GbpError::EndpointGroupSubnetRemovalNotSupported);
        let stored: EndpointGroup = h.plugin.get(&group.id).unwrap();
        assert_eq!(stored.subnets, group.subnets);
    }

    #[tokio::test]
    async fn test_endpoint_requires_group() {
        let h = harness();
        let err = h
            .plugin
            .create_endpoint(EndpointRequest {
                tenant_id: "t1".into(),
                name: "orphan".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, GbpError::EndpointRequiresEndpointGroup);
        assert_eq!(h.plugin.count::<Endpoint>(&Query::new()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_delete_keeps_explicit_subnets() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let implicit = group(&h, "implicit", &l2).await;
        let owned_subnet = implicit.subnets[0].clone();

        let explicit_subnet = h
            .provider
            .create_subnet(SubnetRequest {
                tenant_id: "t1".into(),
                name: "mine".into(),
                network_id: l2.network_id.clone().unwrap(),
                ip_version: 4,
                cidr: cidr("10.0.5.0/24"),
                enable_dhcp: true,
            })
            .await
            .unwrap();
        let explicit = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "explicit".into(),
                l2_context_id: Some(l2.id.clone()),
                subnets: vec![explicit_subnet.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(explicit.subnets, vec![explicit_subnet.id.clone()]);
        assert!(h.provider.routers()[0].interfaces.contains(&explicit_subnet.id));

        h.plugin.delete_endpoint_group(&implicit.id).await.unwrap();
        assert!(!h.provider.subnets().iter().any(|s| s.id == owned_subnet));
        assert!(!h.gateway.ledger().is_owned(ResourceKind::Subnet, &owned_subnet));

        h.plugin.delete_endpoint_group(&explicit.id).await.unwrap();
        assert!(h.provider.subnets().iter().any(|s| s.id == explicit_subnet.id));
        assert!(h.provider.routers()[0].interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_contract_rendering() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;

        let classifier = h
            .plugin
            .create_policy_classifier(PolicyClassifierRequest {
                tenant_id: "t1".into(),
                name: "http".into(),
                protocol: Some(Protocol::Tcp),
                port_range: Some("80".into()),
                direction: Some(Direction::In),
                ..Default::default()
            })
            .await
            .unwrap();
        let allow = h
            .plugin
            .create_policy_action(PolicyActionRequest {
                tenant_id: "t1".into(),
                name: "allow".into(),
                action_type: ActionType::Allow,
                ..Default::default()
            })
            .await
            .unwrap();
        let rule = h
            .plugin
            .create_policy_rule(PolicyRuleRequest {
                tenant_id: "t1".into(),
                name: "web".into(),
                policy_classifier_id: classifier.id.clone(),
                policy_actions: vec![allow.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        let contract = h
            .plugin
            .create_contract(ContractRequest {
                tenant_id: "t1".into(),
                name: "web".into(),
                policy_rules: vec![rule.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        let groups = h.driver.renderer().mapping(&contract.id).unwrap();
        assert!(h.gateway.ledger().is_owned(ResourceKind::SecurityGroup, &groups.consumed_sg_id));
        assert!(h.gateway.ledger().is_owned(ResourceKind::SecurityGroup, &groups.provided_sg_id));

        let provider_group = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "a".into(),
                l2_context_id: Some(l2.id.clone()),
                provided_contracts: vec![contract.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        let consumer_group = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "b".into(),
                l2_context_id: Some(l2.id.clone()),
                consumed_contracts: vec![contract.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        let ep = endpoint(&h, "client", &consumer_group).await;

        let port_id = ep.port_id.unwrap();
        let port = h.provider.ports().into_iter().find(|p| p.id == port_id).unwrap();
        assert_eq!(port.security_groups, vec![groups.consumed_sg_id.clone()]);

        let provider_cidr = subnet_cidr(&h, &provider_group.subnets[0]);
        let rules: Vec<_> = h
            .provider
            .security_group_rules()
            .into_iter()
            .filter(|r| r.security_group_id == groups.consumed_sg_id)
            .collect();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].direction, RuleDirection::Egress);
        assert_eq!(rules[0].protocol, Some(Protocol::Tcp));
        assert_eq!((rules[0].port_range_min, rules[0].port_range_max), (Some(80), Some(80)));
        assert_eq!(rules[0].remote_ip_prefix, Some(provider_cidr));

        // re-rendering on contract update does not duplicate rules
        h.plugin
            .update_contract(
                &contract.id,
                ContractUpdate {
                    description: Some("http".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(h.provider.security_group_rules().len(), 1);

        let err = h.plugin.delete_contract(&contract.id).await.unwrap_err();
        assert!(matches!(err, GbpError::InUse { kind: PolicyKind::Contract, .. }));
    }

    #[tokio::test]
    async fn test_redirect_enables_firewall() {
        let h = harness();
        h.provider.add_firewall(Firewall {
            id: "fw1".into(),
            tenant_id: "t1".into(),
            name: "edge".into(),
            admin_state_up: false,
        });
        h.plugin
            .create_policy_action(PolicyActionRequest {
                tenant_id: "t1".into(),
                name: "redirect".into(),
                action_type: ActionType::Redirect,
                action_value: Some("fw1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(h.provider.firewalls()[0].admin_state_up);
    }

    #[tokio::test]
    async fn test_redirect_failures() {
        let h = harness();
        let request = PolicyActionRequest {
            tenant_id: "t1".into(),
            name: "redirect".into(),
            action_type: ActionType::Redirect,
            action_value: Some("missing".into()),
            ..Default::default()
        };
        let err = h.plugin.create_policy_action(request.clone()).await.unwrap_err();
        assert_eq!(err, GbpError::FirewallNotFound("missing".into()));

        let err = h
            .plugin
            .create_policy_action(PolicyActionRequest {
                action_value: None,
                ..request.clone()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::InvalidRequest(_)));

        let provider = Arc::new(InMemoryProvider::new());
        let no_firewall = harness_with(ServiceDirectory::new().with_l3_router(provider.clone()), provider);
        let err = no_firewall.plugin.create_policy_action(request).await.unwrap_err();
        assert_eq!(
            err,
            GbpError::GroupPolicyDeploymentError {
                service: ServiceCapability::Firewall
            }
        );
    }

    #[tokio::test]
    async fn test_implicit_l2_and_default_l3() {
        let h = harness();
        let first = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "web".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let l2: L2Context = h.plugin.get(first.l2_context_id.as_deref().unwrap()).unwrap();
        assert_eq!(l2.name, "web");
        let default_l3: L3Context = h.plugin.get(l2.l3_context_id.as_deref().unwrap()).unwrap();
        assert_eq!(default_l3.name, "default");
        assert_eq!(default_l3.ip_pool, cidr("172.16.0.0/12"));
        assert_eq!(subnet_cidr(&h, &first.subnets[0]), cidr("172.16.0.0/26"));

        let second = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "db".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let l2: L2Context = h.plugin.get(second.l2_context_id.as_deref().unwrap()).unwrap();
        assert_eq!(l2.l3_context_id.as_deref(), Some(default_l3.id.as_str()));
        assert_eq!(h.plugin.count::<L3Context>(&Query::new()).unwrap(), 1);
        assert_eq!(subnet_cidr(&h, &second.subnets[0]), cidr("172.16.0.64/26"));
    }

    #[tokio::test]
    async fn test_delete_checks() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;

        let err = h.plugin.delete_l3_context(&l3.id).await.unwrap_err();
        assert!(matches!(err, GbpError::InUse { kind: PolicyKind::L3Context, .. }));

        let err = h.plugin.delete_endpoint("nope").await.unwrap_err();
        assert_eq!(err, GbpError::not_found(PolicyKind::Endpoint, "nope"));

        h.plugin.delete_l2_context(&l2.id).await.unwrap();
        assert!(h.provider.networks().is_empty());
        h.plugin.delete_l3_context(&l3.id).await.unwrap();
        assert!(h.provider.routers().is_empty());
        assert!(h.gateway.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_delete_releases_owned_port() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let group = group(&h, "web", &l2).await;
        let ep = endpoint(&h, "vm1", &group).await;

        h.plugin.delete_endpoint(&ep.id).await.unwrap();
        assert!(h.provider.ports().is_empty());
        let group: EndpointGroup = h.plugin.get(&group.id).unwrap();
        assert!(group.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_list_pages_through_plugin() {
        let h = harness();
        for name in ["c", "a", "b"] {
            h.plugin
                .create_policy_action(PolicyActionRequest {
                    tenant_id: "t1".into(),
                    name: name.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let page: Vec<PolicyAction> = h
            .plugin
            .list(&Query::new().tenant("t1").sort("name", true).limit(2))
            .unwrap();
        let names: Vec<_> = page.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let rest: Vec<PolicyAction> = h
            .plugin
            .list(&Query::new().tenant("t1").sort("name", true).marker(page[1].id.clone()))
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "c");

        let projected = h
            .plugin
            .list_fields::<PolicyAction>(&Query::new().fields(&["name"]).sort("name", false))
            .unwrap();
        assert_eq!(projected[0], serde_json::json!({"name": "c"}));
    }

    #[tokio::test]
    async fn test_provisioning_is_notified() {
        let h = harness();
        let mut rx = h.notifier.subscribe();
        l3(&h).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "router.create.end");
    }

    async fn http_contract(h: &Harness, direction: Direction) -> Contract {
        let classifier = h
            .plugin
            .create_policy_classifier(PolicyClassifierRequest {
                tenant_id: "t1".into(),
                name: "http".into(),
                protocol: Some(Protocol::Tcp),
                port_range: Some("80".into()),
                direction: Some(direction),
                ..Default::default()
            })
            .await
            .unwrap();
        let allow = h
            .plugin
            .create_policy_action(PolicyActionRequest {
                tenant_id: "t1".into(),
                name: "allow".into(),
                action_type: ActionType::Allow,
                ..Default::default()
            })
            .await
            .unwrap();
        let rule = h
            .plugin
            .create_policy_rule(PolicyRuleRequest {
                tenant_id: "t1".into(),
                name: "http".into(),
                policy_classifier_id: classifier.id,
                policy_actions: vec![allow.id],
                ..Default::default()
            })
            .await
            .unwrap();
        h.plugin
            .create_contract(ContractRequest {
                tenant_id: "t1".into(),
                name: "web".into(),
                policy_rules: vec![rule.id],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn providing_group(h: &Harness, name: &str, l2: &L2Context, contract: &Contract) -> EndpointGroup {
        h.plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: name.into(),
                l2_context_id: Some(l2.id.clone()),
                provided_contracts: vec![contract.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn consuming_group(h: &Harness, name: &str, l2: &L2Context, contract: &Contract) -> EndpointGroup {
        h.plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: name.into(),
                l2_context_id: Some(l2.id.clone()),
                consumed_contracts: vec![contract.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Remote prefixes permitted by a security group, sorted
    fn permits(h: &Harness, security_group_id: &str) -> Vec<String> {
        let mut prefixes: Vec<String> = h
            .provider
            .security_group_rules()
            .into_iter()
            .filter(|r| r.security_group_id == security_group_id)
            .map(|r| r.remote_ip_prefix.map_or_else(|| "any".to_string(), |p| p.to_string()))
            .collect();
        prefixes.sort();
        prefixes
    }

    fn stops_providing() -> EndpointGroupUpdate {
        EndpointGroupUpdate {
            provided_contracts: Some(Vec::new()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deleted_provider_withdraws_permits() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let contract = http_contract(&h, Direction::In).await;
        let sgs = h.driver.renderer().mapping(&contract.id).unwrap();

        let a = providing_group(&h, "a", &l2, &contract).await;
        consuming_group(&h, "b", &l2, &contract).await;
        let a_cidr = subnet_cidr(&h, &a.subnets[0]);
        assert_eq!(permits(&h, &sgs.consumed_sg_id), vec![a_cidr.to_string()]);
        assert_eq!(h.driver.renderer().rendered_rules(&contract.id, &a.id).len(), 1);

        h.plugin.delete_endpoint_group(&a.id).await.unwrap();
        assert!(permits(&h, &sgs.consumed_sg_id).is_empty());
        assert!(h.driver.renderer().rendered_rules(&contract.id, &a.id).is_empty());

        // the freed block goes to an unrelated group; consumers must not reach it
        let d = group(&h, "d", &l2).await;
        assert_eq!(subnet_cidr(&h, &d.subnets[0]), a_cidr);
        assert!(permits(&h, &sgs.consumed_sg_id).is_empty());
    }

    #[tokio::test]
    async fn test_provider_update_withdraws_only_its_rules() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let contract = http_contract(&h, Direction::Bi).await;
        let sgs = h.driver.renderer().mapping(&contract.id).unwrap();

        let a = providing_group(&h, "a", &l2, &contract).await;
        let c = providing_group(&h, "c", &l2, &contract).await;
        let a_cidr = subnet_cidr(&h, &a.subnets[0]).to_string();
        let c_cidr = subnet_cidr(&h, &c.subnets[0]).to_string();
        assert_eq!(permits(&h, &sgs.consumed_sg_id), vec![a_cidr, c_cidr.clone()]);
        assert_eq!(permits(&h, &sgs.provided_sg_id), vec!["0.0.0.0/0"]);

        // the shared any-prefix rule stays while another provider wants it
        h.plugin.update_endpoint_group(&a.id, stops_providing()).await.unwrap();
        assert_eq!(permits(&h, &sgs.consumed_sg_id), vec![c_cidr]);
        assert_eq!(permits(&h, &sgs.provided_sg_id), vec!["0.0.0.0/0"]);
        assert!(h.driver.renderer().rendered_rules(&contract.id, &a.id).is_empty());

        h.plugin.update_endpoint_group(&c.id, stops_providing()).await.unwrap();
        assert!(h.provider.security_group_rules().is_empty());
    }

    #[tokio::test]
    async fn test_contract_rule_removal_withdraws_permits() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let contract = http_contract(&h, Direction::In).await;
        let a = providing_group(&h, "a", &l2, &contract).await;
        assert_eq!(h.provider.security_group_rules().len(), 1);

        h.plugin
            .update_contract(
                &contract.id,
                ContractUpdate {
                    policy_rules: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(h.provider.security_group_rules().is_empty());
        assert!(h.driver.renderer().rendered_rules(&contract.id, &a.id).is_empty());
    }

    // === Postcommit failures ===

    fn backend_failure(err: &GbpError) -> bool {
        matches!(err, GbpError::Provider(ProviderError::Backend(_)))
    }

    #[tokio::test]
    async fn test_router_failure_keeps_l3_context() {
        let h = harness();
        h.provider.inject_fault(FaultPoint::CreateRouter);
        let err = h
            .plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: "t1".into(),
                name: "l3".into(),
                ip_pool: "10.0.0.0/16".into(),
                subnet_prefix_length: 24,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        let stored: Vec<L3Context> = h.plugin.list(&Query::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].routers.is_empty());
        assert!(h.gateway.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_l2_context() {
        let h = harness();
        let l3 = l3(&h).await;
        h.provider.inject_fault(FaultPoint::CreateNetwork);
        let err = h
            .plugin
            .create_l2_context(L2ContextRequest {
                tenant_id: "t1".into(),
                name: "l2".into(),
                l3_context_id: Some(l3.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        let stored: Vec<L2Context> = h.plugin.list(&Query::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].network_id, None);
        assert!(h.provider.networks().is_empty());
        // the router of the L3 context is untouched
        assert_eq!(h.provider.routers().len(), 1);
    }

    #[tokio::test]
    async fn test_port_failure_keeps_endpoint() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let group = group(&h, "web", &l2).await;
        h.provider.inject_fault(FaultPoint::CreatePort);
        let err = h
            .plugin
            .create_endpoint(EndpointRequest {
                tenant_id: "t1".into(),
                name: "vm1".into(),
                endpoint_group_id: Some(group.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        let stored: Vec<Endpoint> = h.plugin.list(&Query::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].port_id, None);
        assert!(h.provider.ports().is_empty());
        assert!(h.gateway.ledger().owned(ResourceKind::Port).is_empty());
    }

    #[tokio::test]
    async fn test_port_binding_failure_keeps_port() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let contract = http_contract(&h, Direction::In).await;
        let consumers = consuming_group(&h, "b", &l2, &contract).await;
        h.provider.inject_fault(FaultPoint::UpdatePort);
        let err = h
            .plugin
            .create_endpoint(EndpointRequest {
                tenant_id: "t1".into(),
                name: "vm1".into(),
                endpoint_group_id: Some(consumers.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        // only the binding failed: the port stays created, owned and bound
        let stored: Vec<Endpoint> = h.plugin.list(&Query::new()).unwrap();
        let port_id = stored[0].port_id.clone().unwrap();
        let port = h.provider.ports().into_iter().find(|p| p.id == port_id).unwrap();
        assert!(port.security_groups.is_empty());
        assert!(h.gateway.ledger().is_owned(ResourceKind::Port, &port_id));
    }

    #[tokio::test]
    async fn test_second_security_group_failure_releases_first() {
        let h = harness();
        h.provider.fail_security_group_create("provided_web");
        let classifier = h
            .plugin
            .create_policy_classifier(PolicyClassifierRequest {
                tenant_id: "t1".into(),
                name: "any".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let rule = h
            .plugin
            .create_policy_rule(PolicyRuleRequest {
                tenant_id: "t1".into(),
                name: "any".into(),
                policy_classifier_id: classifier.id,
                ..Default::default()
            })
            .await
            .unwrap();
        let err = h
            .plugin
            .create_contract(ContractRequest {
                tenant_id: "t1".into(),
                name: "web".into(),
                policy_rules: vec![rule.id],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        let stored: Vec<Contract> = h.plugin.list(&Query::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(h.provider.security_groups().is_empty());
        assert!(h.gateway.ledger().owned(ResourceKind::SecurityGroup).is_empty());
        assert_eq!(
            h.driver.renderer().mapping(&stored[0].id).unwrap_err(),
            GbpError::ContractMappingMissing(stored[0].id.clone())
        );
    }

    #[tokio::test]
    async fn test_rule_failure_keeps_group_and_rerenders() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let contract = http_contract(&h, Direction::In).await;
        h.provider.inject_fault(FaultPoint::CreateSecurityGroupRule);
        let err = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "a".into(),
                l2_context_id: Some(l2.id.clone()),
                provided_contracts: vec![contract.id.clone()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(backend_failure(&err));

        let stored: Vec<EndpointGroup> = h.plugin.list(&Query::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subnets.len(), 1);
        assert!(h.provider.security_group_rules().is_empty());

        h.provider.clear_fault(FaultPoint::CreateSecurityGroupRule);
        h.plugin
            .update_endpoint_group(
                &stored[0].id,
                EndpointGroupUpdate {
                    description: Some("retry".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(h.provider.security_group_rules().len(), 1);
    }

    #[tokio::test]
    async fn test_subnet_delete_failure_after_group_delete() {
        let h = harness();
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let group = group(&h, "web", &l2).await;
        let subnet_id = group.subnets[0].clone();
        h.provider.inject_fault(FaultPoint::DeleteSubnet);

        let err = h.plugin.delete_endpoint_group(&group.id).await.unwrap_err();
        assert!(backend_failure(&err));
        assert_eq!(h.plugin.count::<EndpointGroup>(&Query::new()).unwrap(), 0);
        // detached, but still there and still ours
        assert!(h.provider.routers()[0].interfaces.is_empty());
        assert!(h.provider.subnets().iter().any(|s| s.id == subnet_id));
        assert!(h.gateway.ledger().is_owned(ResourceKind::Subnet, &subnet_id));
    }

    #[tokio::test]
    async fn test_exhausted_pool_keeps_group_without_subnets() {
        let h = harness();
        let l3 = h
            .plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: "t1".into(),
                name: "small".into(),
                ip_pool: "10.0.0.0/24".into(),
                subnet_prefix_length: 24,
                ..Default::default()
            })
            .await
            .unwrap();
        let l2 = l2(&h, &l3).await;
        group(&h, "a", &l2).await;

        let err = h
            .plugin
            .create_endpoint_group(EndpointGroupRequest {
                tenant_id: "t1".into(),
                name: "b".into(),
                l2_context_id: Some(l2.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::NoSubnetAvailable { .. }));
        let b: Vec<EndpointGroup> = h.plugin.list(&Query::new().filter("name", "b")).unwrap();
        assert_eq!(b.len(), 1);
        assert!(b[0].subnets.is_empty());
        assert_eq!(h.provider.subnets().len(), 1);
    }

    /// Deletes objects of one kind as soon as they are created, so later
    /// drivers find them gone when recording bindings
    struct DeleteOnCreate(PolicyKind);

    #[async_trait]
    impl PolicyDriver for DeleteOnCreate {
        fn name(&self) -> &str {
            "delete_on_create"
        }

        async fn postcommit(&self, plugin: &GroupPolicyPlugin, event: &PolicyEvent) -> Result<()> {
            match (self.0, event) {
                (PolicyKind::Endpoint, PolicyEvent::Endpoint(Change::Created(ep))) => {
                    plugin.delete::<Endpoint>(&ep.id).await
                }
                (PolicyKind::L2Context, PolicyEvent::L2Context(Change::Created(l2))) => {
                    plugin.delete::<L2Context>(&l2.id).await
                }
                (PolicyKind::L3Context, PolicyEvent::L3Context(Change::Created(l3))) => {
                    plugin.delete::<L3Context>(&l3.id).await
                }
                _ => Ok(()),
            }
        }
    }

    fn vanishing(kind: PolicyKind) -> Harness {
        let provider = Arc::new(InMemoryProvider::new());
        let services = ServiceDirectory::new().with_l3_router(provider.clone());
        harness_chained(services, provider, vec![Arc::new(DeleteOnCreate(kind))])
    }

    #[tokio::test]
    async fn test_router_released_when_l3_context_vanishes() {
        let h = vanishing(PolicyKind::L3Context);
        let err = h
            .plugin
            .create_l3_context(L3ContextRequest {
                tenant_id: "t1".into(),
                name: "l3".into(),
                ip_pool: "10.0.0.0/16".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::NotFound { kind: PolicyKind::L3Context, .. }));
        assert!(h.provider.routers().is_empty());
        assert!(h.gateway.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_network_released_when_l2_context_vanishes() {
        let h = vanishing(PolicyKind::L2Context);
        let l3 = l3(&h).await;
        let err = h
            .plugin
            .create_l2_context(L2ContextRequest {
                tenant_id: "t1".into(),
                name: "l2".into(),
                l3_context_id: Some(l3.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::NotFound { kind: PolicyKind::L2Context, .. }));
        assert!(h.provider.networks().is_empty());
        assert!(h.gateway.ledger().owned(ResourceKind::Network).is_empty());
    }

    #[tokio::test]
    async fn test_port_released_when_endpoint_vanishes() {
        let h = vanishing(PolicyKind::Endpoint);
        let l3 = l3(&h).await;
        let l2 = l2(&h, &l3).await;
        let group = group(&h, "web", &l2).await;
        let err = h
            .plugin
            .create_endpoint(EndpointRequest {
                tenant_id: "t1".into(),
                name: "vm1".into(),
                endpoint_group_id: Some(group.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::NotFound { kind: PolicyKind::Endpoint, .. }));
        assert!(h.provider.ports().is_empty());
        assert!(h.gateway.ledger().owned(ResourceKind::Port).is_empty());
    }
}
