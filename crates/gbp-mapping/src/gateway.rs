//! Provisioning gateway
//!
//! Single path through which drivers touch concrete resources. Creating an
//! implicit resource records it in the ownership ledger in the same call,
//! and the `*_if_owned` deletes consult and clear the ledger in the same
//! call, so ownership can never drift from what was actually provisioned.
//! Every change is also published to the notification sink.

use crate::ledger::OwnershipLedger;
use crate::notify::NotificationSink;
use crate::provider::*;
use gbp_common::{EventAction, GbpError, ProviderError, ResourceEvent, ResourceKind, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProvisioningGateway {
    provider: Arc<dyn ResourceProvider>,
    services: Arc<ServiceDirectory>,
    ledger: Arc<OwnershipLedger>,
    notifier: Arc<dyn NotificationSink>,
}

impl ProvisioningGateway {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        services: Arc<ServiceDirectory>,
        ledger: Arc<OwnershipLedger>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            provider,
            services,
            ledger,
            notifier,
        }
    }

    pub fn ledger(&self) -> &OwnershipLedger {
        &self.ledger
    }

    fn emit<T: Serialize>(
        &self,
        kind: ResourceKind,
        action: EventAction,
        id: &str,
        tenant_id: Option<&str>,
        body: Option<&T>,
    ) {
        let payload = body
            .and_then(|b| serde_json::to_value(b).ok())
            .unwrap_or(serde_json::Value::Null);
        let event = ResourceEvent::new(kind, action, id, tenant_id.map(str::to_string), payload);
        if let Err(e) = self.notifier.notify(&event) {
            warn!(event_type = %event.event_type(), error = %e, "notification failed");
        }
    }

    fn emit_delete(&self, kind: ResourceKind, id: &str) {
        self.emit::<()>(kind, EventAction::Delete, id, None, None);
    }

    /// Unmark after a successful delete. A resource already gone counts as
    /// deleted.
    fn settle_delete(&self, kind: ResourceKind, id: &str, result: ProviderResult<()>) -> Result<()> {
        match result {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                debug!(%kind, id, "owned resource already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.ledger.unmark(kind, id);
        info!(%kind, id, "deleted owned resource");
        self.emit_delete(kind, id);
        Ok(())
    }

    // === Networks ===

    pub async fn create_owned_network(&self, request: NetworkRequest) -> Result<Network> {
        let network = self.provider.create_network(request).await?;
        self.ledger.mark_owned(ResourceKind::Network, &network.id);
        info!(network_id = %network.id, name = %network.name, "created network");
        self.emit(
            ResourceKind::Network,
            EventAction::Create,
            &network.id,
            Some(&network.tenant_id),
            Some(&network),
        );
        Ok(network)
    }

    /// Delete a network if the engine owns it; returns whether it did
    pub async fn delete_network_if_owned(&self, id: &str) -> Result<bool> {
        if !self.ledger.is_owned(ResourceKind::Network, id) {
            return Ok(false);
        }
        let result = self.provider.delete_network(id).await;
        self.settle_delete(ResourceKind::Network, id, result)?;
        Ok(true)
    }

    // === Subnets ===

    pub async fn create_owned_subnet(&self, request: SubnetRequest) -> Result<Subnet> {
        let subnet = self.provider.create_subnet(request).await?;
        self.ledger.mark_owned(ResourceKind::Subnet, &subnet.id);
        info!(subnet_id = %subnet.id, cidr = %subnet.cidr, "created subnet");
        self.emit(
            ResourceKind::Subnet,
            EventAction::Create,
            &subnet.id,
            Some(&subnet.tenant_id),
            Some(&subnet),
        );
        Ok(subnet)
    }

    pub async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        Ok(self.provider.get_subnet(id).await?)
    }

    pub async fn delete_subnet_if_owned(&self, id: &str) -> Result<bool> {
        if !self.ledger.is_owned(ResourceKind::Subnet, id) {
            return Ok(false);
        }
        let result = self.provider.delete_subnet(id).await;
        self.settle_delete(ResourceKind::Subnet, id, result)?;
        Ok(true)
    }

    // === Ports ===

    pub async fn create_owned_port(&self, request: PortRequest) -> Result<Port> {
        let port = self.provider.create_port(request).await?;
        self.ledger.mark_owned(ResourceKind::Port, &port.id);
        info!(port_id = %port.id, network_id = %port.network_id, "created port");
        self.emit(
            ResourceKind::Port,
            EventAction::Create,
            &port.id,
            Some(&port.tenant_id),
            Some(&port),
        );
        Ok(port)
    }

    pub async fn delete_port_if_owned(&self, id: &str) -> Result<bool> {
        if !self.ledger.is_owned(ResourceKind::Port, id) {
            return Ok(false);
        }
        let result = self.provider.delete_port(id).await;
        self.settle_delete(ResourceKind::Port, id, result)?;
        Ok(true)
    }

    /// Add security groups to a port, keeping the ones already bound
    pub async fn bind_security_groups(&self, port_id: &str, groups: &[String]) -> Result<Port> {
        let port = self.provider.get_port(port_id).await?;
        let mut bound = port.security_groups.clone();
        for group in groups {
            if !bound.contains(group) {
                bound.push(group.clone());
            }
        }
        if bound == port.security_groups {
            return Ok(port);
        }
        self.update_port_security_groups(port, bound).await
    }

    /// Remove security groups from a port
    pub async fn unbind_security_groups(&self, port_id: &str, groups: &[String]) -> Result<Port> {
        let port = self.provider.get_port(port_id).await?;
        let bound: Vec<String> = port
            .security_groups
            .iter()
            .filter(|sg| !groups.contains(sg))
            .cloned()
            .collect();
        if bound == port.security_groups {
            return Ok(port);
        }
        self.update_port_security_groups(port, bound).await
    }

    async fn update_port_security_groups(&self, port: Port, groups: Vec<String>) -> Result<Port> {
        let port = self
            .provider
            .update_port_security_groups(&port.id, groups)
            .await?;
        debug!(port_id = %port.id, security_groups = ?port.security_groups, "updated port");
        self.emit(
            ResourceKind::Port,
            EventAction::Update,
            &port.id,
            Some(&port.tenant_id),
            Some(&port),
        );
        Ok(port)
    }

    // === Routers ===

    pub async fn create_owned_router(&self, request: RouterRequest) -> Result<Router> {
        let router = self.services.l3_router()?.create_router(request).await?;
        self.ledger.mark_owned(ResourceKind::Router, &router.id);
        info!(router_id = %router.id, name = %router.name, "created router");
        self.emit(
            ResourceKind::Router,
            EventAction::Create,
            &router.id,
            Some(&router.tenant_id),
            Some(&router),
        );
        Ok(router)
    }

    pub async fn delete_router_if_owned(&self, id: &str) -> Result<bool> {
        if !self.ledger.is_owned(ResourceKind::Router, id) {
            return Ok(false);
        }
        let result = self.services.l3_router()?.delete_router(id).await;
        self.settle_delete(ResourceKind::Router, id, result)?;
        Ok(true)
    }

    pub async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        self.services
            .l3_router()?
            .add_router_interface(router_id, subnet_id)
            .await?;
        info!(router_id, subnet_id, "attached subnet to router");
        self.emit(
            ResourceKind::Router,
            EventAction::Update,
            router_id,
            None,
            Some(&serde_json::json!({ "add_interface": subnet_id })),
        );
        Ok(())
    }

    pub async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        self.services
            .l3_router()?
            .remove_router_interface(router_id, subnet_id)
            .await?;
        info!(router_id, subnet_id, "detached subnet from router");
        self.emit(
            ResourceKind::Router,
            EventAction::Update,
            router_id,
            None,
            Some(&serde_json::json!({ "remove_interface": subnet_id })),
        );
        Ok(())
    }

    // === Security groups ===

    pub async fn create_owned_security_group(
        &self,
        request: SecurityGroupRequest,
    ) -> Result<SecurityGroup> {
        let group = self.provider.create_security_group(request).await?;
        self.ledger.mark_owned(ResourceKind::SecurityGroup, &group.id);
        info!(security_group_id = %group.id, name = %group.name, "created security group");
        self.emit(
            ResourceKind::SecurityGroup,
            EventAction::Create,
            &group.id,
            Some(&group.tenant_id),
            Some(&group),
        );
        Ok(group)
    }

    pub async fn delete_security_group_if_owned(&self, id: &str) -> Result<bool> {
        if !self.ledger.is_owned(ResourceKind::SecurityGroup, id) {
            return Ok(false);
        }
        let result = self.provider.delete_security_group(id).await;
        self.settle_delete(ResourceKind::SecurityGroup, id, result)?;
        Ok(true)
    }

    /// Rules live and die with their owned security group
    pub async fn create_security_group_rule(
        &self,
        request: SecurityGroupRuleRequest,
    ) -> Result<SecurityGroupRule> {
        let rule = self.provider.create_security_group_rule(request).await?;
        debug!(
            rule_id = %rule.id,
            security_group_id = %rule.security_group_id,
            remote_ip_prefix = ?rule.remote_ip_prefix,
            "created security group rule"
        );
        self.emit(
            ResourceKind::SecurityGroupRule,
            EventAction::Create,
            &rule.id,
            Some(&rule.tenant_id),
            Some(&rule),
        );
        Ok(rule)
    }

    pub async fn list_security_group_rules(&self, security_group_id: &str) -> Result<Vec<SecurityGroupRule>> {
        Ok(self.provider.list_security_group_rules(security_group_id).await?)
    }

    /// Delete a rendered rule. A rule already gone counts as deleted.
    pub async fn delete_security_group_rule(&self, id: &str) -> Result<()> {
        match self.provider.delete_security_group_rule(id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                debug!(rule_id = id, "rule already gone");
            }
            Err(e) => return Err(e.into()),
        }
        debug!(rule_id = id, "deleted security group rule");
        self.emit_delete(ResourceKind::SecurityGroupRule, id);
        Ok(())
    }

    // === Firewalls ===

    /// Enable a redirect target, leaving it alone if already up
    pub async fn activate_firewall(&self, id: &str) -> Result<Firewall> {
        let service = self.services.firewall()?;
        let firewall = match service.get_firewall(id).await {
            Ok(fw) => fw,
            Err(ProviderError::NotFound { .. }) => return Err(GbpError::FirewallNotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        };
        if firewall.admin_state_up {
            return Ok(firewall);
        }
        let firewall = service
            .update_firewall(
                id,
                FirewallUpdate {
                    admin_state_up: Some(true),
                },
            )
            .await?;
        info!(firewall_id = id, "enabled firewall");
        self.emit(
            ResourceKind::Firewall,
            EventAction::Update,
            id,
            Some(&firewall.tenant_id),
            Some(&firewall),
        );
        Ok(firewall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::provider::memory::InMemoryProvider;

    fn gateway() -> (Arc<InMemoryProvider>, ProvisioningGateway, BroadcastNotifier) {
        let provider = Arc::new(InMemoryProvider::new());
        let notifier = BroadcastNotifier::new(64);
        let services = ServiceDirectory::new()
            .with_l3_router(provider.clone())
            .with_firewall(provider.clone());
        let gateway = ProvisioningGateway::new(
            provider.clone(),
            Arc::new(services),
            Arc::new(OwnershipLedger::new()),
            Arc::new(notifier.clone()),
        );
        (provider, gateway, notifier)
    }

    fn network_request() -> NetworkRequest {
        NetworkRequest {
            tenant_id: "t1".into(),
            name: "l2p_web".into(),
            admin_state_up: true,
            shared: false,
        }
    }

    #[tokio::test]
    async fn test_create_marks_and_delete_unmarks() {
        let (provider, gateway, notifier) = gateway();
        let mut rx = notifier.subscribe();

        let network = gateway.create_owned_network(network_request()).await.unwrap();
        assert!(gateway.ledger().is_owned(ResourceKind::Network, &network.id));
        assert_eq!(rx.recv().await.unwrap().event_type(), "network.create.end");

        assert!(gateway.delete_network_if_owned(&network.id).await.unwrap());
        assert!(!gateway.ledger().is_owned(ResourceKind::Network, &network.id));
        assert!(provider.networks().is_empty());
        assert_eq!(rx.recv().await.unwrap().event_type(), "network.delete.end");
    }

    #[tokio::test]
    async fn test_explicit_resources_are_never_deleted() {
        let (provider, gateway, _notifier) = gateway();
        let network = provider.create_network(network_request()).await.unwrap();
        assert!(!gateway.delete_network_if_owned(&network.id).await.unwrap());
        assert_eq!(provider.networks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_ownership() {
        let (provider, gateway, _notifier) = gateway();
        let network = gateway.create_owned_network(network_request()).await.unwrap();
        provider
            .create_port(PortRequest {
                tenant_id: "t1".into(),
                name: "p".into(),
                network_id: network.id.clone(),
                admin_state_up: true,
                security_groups: vec![],
            })
            .await
            .unwrap();
        assert!(gateway.delete_network_if_owned(&network.id).await.is_err());
        assert!(gateway.ledger().is_owned(ResourceKind::Network, &network.id));
    }

    #[tokio::test]
    async fn test_bind_and_unbind_security_groups() {
        let (_provider, gateway, _notifier) = gateway();
        let network = gateway.create_owned_network(network_request()).await.unwrap();
        let port = gateway
            .create_owned_port(PortRequest {
                tenant_id: "t1".into(),
                name: "ep".into(),
                network_id: network.id,
                admin_state_up: true,
                security_groups: vec![],
            })
            .await
            .unwrap();
        let sg = gateway
            .create_owned_security_group(SecurityGroupRequest {
                tenant_id: "t1".into(),
                name: "gbp_web_provided".into(),
                description: String::new(),
            })
            .await
            .unwrap();

        let bound = gateway.bind_security_groups(&port.id, &[sg.id.clone()]).await.unwrap();
        assert_eq!(bound.security_groups, vec![sg.id.clone()]);
        let bound = gateway.bind_security_groups(&port.id, &[sg.id.clone()]).await.unwrap();
        assert_eq!(bound.security_groups.len(), 1);

        let unbound = gateway.unbind_security_groups(&port.id, &[sg.id.clone()]).await.unwrap();
        assert!(unbound.security_groups.is_empty());
    }

    #[tokio::test]
    async fn test_rule_delete_tolerates_missing_rule() {
        let (provider, gateway, notifier) = gateway();
        let sg = gateway
            .create_owned_security_group(SecurityGroupRequest {
                tenant_id: "t1".into(),
                name: "consumed_web".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        let request = SecurityGroupRuleRequest {
            tenant_id: "t1".into(),
            security_group_id: sg.id.clone(),
            direction: RuleDirection::Egress,
            ethertype: EtherType::IPv4,
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: Some("10.0.0.0/24".parse().unwrap()),
        };
        let rule = gateway.create_security_group_rule(request.clone()).await.unwrap();
        assert!(request.matches(&rule));
        let listed = gateway.list_security_group_rules(&sg.id).await.unwrap();
        assert_eq!(listed, vec![rule.clone()]);

        let mut rx = notifier.subscribe();
        gateway.delete_security_group_rule(&rule.id).await.unwrap();
        assert!(provider.security_group_rules().is_empty());
        assert_eq!(rx.recv().await.unwrap().event_type(), "security_group_rule.delete.end");
        gateway.delete_security_group_rule(&rule.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_activate_firewall() {
        let (provider, gateway, _notifier) = gateway();
        provider.add_firewall(Firewall {
            id: "fw-1".into(),
            tenant_id: "t1".into(),
            name: "edge".into(),
            admin_state_up: false,
        });
        let fw = gateway.activate_firewall("fw-1").await.unwrap();
        assert!(fw.admin_state_up);

        let err = gateway.activate_firewall("fw-404").await.unwrap_err();
        assert_eq!(err, GbpError::FirewallNotFound("fw-404".into()));
    }

    #[tokio::test]
    async fn test_router_requires_l3_service() {
        let provider = Arc::new(InMemoryProvider::new());
        let gateway = ProvisioningGateway::new(
            provider,
            Arc::new(ServiceDirectory::new()),
            Arc::new(OwnershipLedger::new()),
            Arc::new(crate::notify::TracingNotifier),
        );
        let err = gateway
            .create_owned_router(RouterRequest {
                tenant_id: "t1".into(),
                name: "l3p_default".into(),
                admin_state_up: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GbpError::GroupPolicyDeploymentError { .. }));
    }
}
