//! Apply command

use crate::manifest::Manifest;
use crate::output::{render, ObjectRow, OutputFormat, Tabular};
use anyhow::Result;
use colored::Colorize;
use gbp_common::ResourceKind;
use gbp_mapping::provider::*;
use gbp_mapping::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Abstract objects after an apply
#[derive(Debug, Serialize)]
pub struct PolicyReport {
    pub l3_contexts: Vec<L3Context>,
    pub l2_contexts: Vec<L2Context>,
    pub endpoint_groups: Vec<EndpointGroup>,
    pub endpoints: Vec<Endpoint>,
    pub contracts: Vec<Contract>,
    pub policy_rules: Vec<PolicyRule>,
    pub policy_classifiers: Vec<PolicyClassifier>,
    pub policy_actions: Vec<PolicyAction>,
}

/// Concrete resources after an apply
#[derive(Debug, Serialize)]
pub struct ResourceReport {
    pub networks: Vec<Network>,
    pub subnets: Vec<Subnet>,
    pub routers: Vec<Router>,
    pub ports: Vec<Port>,
    pub security_groups: Vec<SecurityGroup>,
    pub security_group_rules: Vec<SecurityGroupRule>,
    pub firewalls: Vec<Firewall>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub policy: PolicyReport,
    pub resources: ResourceReport,
    /// Implicitly created resource ids, by kind
    pub owned: BTreeMap<ResourceKind, Vec<String>>,
}

const OWNED_KINDS: [ResourceKind; 5] = [
    ResourceKind::Network,
    ResourceKind::Subnet,
    ResourceKind::Router,
    ResourceKind::Port,
    ResourceKind::SecurityGroup,
];

impl Report {
    pub fn collect(plugin: &GroupPolicyPlugin, provider: &InMemoryProvider, ledger: &OwnershipLedger) -> Result<Self> {
        let all = Query::new();
        let policy = PolicyReport {
            l3_contexts: plugin.list(&all)?,
            l2_contexts: plugin.list(&all)?,
            endpoint_groups: plugin.list(&all)?,
            endpoints: plugin.list(&all)?,
            contracts: plugin.list(&all)?,
            policy_rules: plugin.list(&all)?,
            policy_classifiers: plugin.list(&all)?,
            policy_actions: plugin.list(&all)?,
        };
        let resources = ResourceReport {
            networks: provider.networks(),
            subnets: provider.subnets(),
            routers: provider.routers(),
            ports: provider.ports(),
            security_groups: provider.security_groups(),
            security_group_rules: provider.security_group_rules(),
            firewalls: provider.firewalls(),
        };
        let owned = OWNED_KINDS
            .iter()
            .map(|kind| (*kind, ledger.owned(*kind)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        Ok(Self {
            policy,
            resources,
            owned,
        })
    }

    fn is_owned(&self, kind: ResourceKind, id: &str) -> bool {
        self.owned.get(&kind).is_some_and(|ids| ids.iter().any(|i| i == id))
    }

    fn policy_rows(&self) -> Vec<ObjectRow> {
        let p = &self.policy;
        let row = |kind: &str, name: &str, id: &str, detail: String| ObjectRow {
            kind: kind.into(),
            name: name.into(),
            id: id.into(),
            detail,
            owned: "-".into(),
        };
        let mut rows = Vec::new();
        for l3 in &p.l3_contexts {
            let detail = format!("pool {} /{} routers [{}]", l3.ip_pool, l3.subnet_prefix_length, l3.routers.join(", "));
            rows.push(row("l3_context", &l3.name, &l3.id, detail));
        }
        for l2 in &p.l2_contexts {
            let detail = format!(
                "network {} l3 {}",
                l2.network_id.as_deref().unwrap_or("-"),
                l2.l3_context_id.as_deref().unwrap_or("-")
            );
            rows.push(row("l2_context", &l2.name, &l2.id, detail));
        }
        for group in &p.endpoint_groups {
            let join = |ids: &std::collections::BTreeSet<String>| ids.iter().cloned().collect::<Vec<_>>().join(", ");
            let detail = format!(
                "subnets [{}] provides [{}] consumes [{}]",
                group.subnets.join(", "),
                join(&group.provided_contracts),
                join(&group.consumed_contracts)
            );
            rows.push(row("endpoint_group", &group.name, &group.id, detail));
        }
        for ep in &p.endpoints {
            let detail = format!("port {}", ep.port_id.as_deref().unwrap_or("-"));
            rows.push(row("endpoint", &ep.name, &ep.id, detail));
        }
        for contract in &p.contracts {
            let detail = format!("rules [{}]", contract.policy_rules.join(", "));
            rows.push(row("contract", &contract.name, &contract.id, detail));
        }
        for rule in &p.policy_rules {
            let detail = format!(
                "classifier {} actions [{}]{}",
                rule.policy_classifier_id,
                rule.policy_actions.join(", "),
                if rule.enabled { "" } else { " disabled" }
            );
            rows.push(row("policy_rule", &rule.name, &rule.id, detail));
        }
        for classifier in &p.policy_classifiers {
            let detail = format!(
                "{} {} {}",
                classifier.protocol.map_or_else(|| "any".to_string(), |p| p.to_string()),
                classifier.port_range.as_ref().map_or_else(|| "*".to_string(), |r| r.to_string()),
                classifier.direction
            );
            rows.push(row("policy_classifier", &classifier.name, &classifier.id, detail));
        }
        for action in &p.policy_actions {
            let detail = match &action.action_value {
                Some(value) => format!("{} -> {}", action.action_type, value),
                None => action.action_type.to_string(),
            };
            rows.push(row("policy_action", &action.name, &action.id, detail));
        }
        rows
    }

    fn resource_rows(&self) -> Vec<ObjectRow> {
        let r = &self.resources;
        let row = |kind: ResourceKind, name: &str, id: &str, detail: String| ObjectRow {
            kind: kind.to_string(),
            name: name.into(),
            id: id.into(),
            detail,
            owned: if self.is_owned(kind, id) { "yes".into() } else { "no".into() },
        };
        let mut rows = Vec::new();
        for network in &r.networks {
            let detail = format!("subnets [{}]", network.subnets.join(", "));
            rows.push(row(ResourceKind::Network, &network.name, &network.id, detail));
        }
        for subnet in &r.subnets {
            let detail = format!("{} on {}", subnet.cidr, subnet.network_id);
            rows.push(row(ResourceKind::Subnet, &subnet.name, &subnet.id, detail));
        }
        for router in &r.routers {
            let detail = format!("interfaces [{}]", router.interfaces.join(", "));
            rows.push(row(ResourceKind::Router, &router.name, &router.id, detail));
        }
        for port in &r.ports {
            let detail = format!("security groups [{}]", port.security_groups.join(", "));
            rows.push(row(ResourceKind::Port, &port.name, &port.id, detail));
        }
        for sg in &r.security_groups {
            let detail = format!("{} rules", sg.rules.len());
            rows.push(row(ResourceKind::SecurityGroup, &sg.name, &sg.id, detail));
        }
        for rule in &r.security_group_rules {
            let ports = match (rule.port_range_min, rule.port_range_max) {
                (Some(min), Some(max)) if min == max => min.to_string(),
                (Some(min), Some(max)) => format!("{}-{}", min, max),
                _ => "*".into(),
            };
            let detail = format!(
                "{} {} {} to {} in {}",
                rule.direction,
                rule.protocol.map_or_else(|| "any".to_string(), |p| p.to_string()),
                ports,
                rule.remote_ip_prefix.map_or_else(|| "any".to_string(), |p| p.to_string()),
                rule.security_group_id
            );
            rows.push(row(ResourceKind::SecurityGroupRule, "", &rule.id, detail));
        }
        for fw in &r.firewalls {
            let detail = if fw.admin_state_up { "up" } else { "down" };
            rows.push(row(ResourceKind::Firewall, &fw.name, &fw.id, detail.into()));
        }
        rows
    }
}

impl Tabular for Report {
    fn table(&self) -> String {
        format!(
            "Policy\n{}\n\nResources\n{}",
            render(self.policy_rows()),
            render(self.resource_rows())
        )
    }
}

/// Build an engine over an in-memory provider and apply the manifest
pub async fn run(manifest: &Manifest, config: &Config) -> Result<Report> {
    let provider = Arc::new(InMemoryProvider::new());
    manifest.seed(&provider);
    let services = ServiceDirectory::new()
        .with_l3_router(provider.clone())
        .with_firewall(provider.clone());
    let ledger = Arc::new(OwnershipLedger::new());
    let gateway = Arc::new(ProvisioningGateway::new(
        provider.clone(),
        Arc::new(services),
        ledger.clone(),
        Arc::new(TracingNotifier),
    ));
    let plugin = GroupPolicyPlugin::build(config, gateway)?;
    info!(tenant_id = %manifest.tenant_id, drivers = ?plugin.drivers().names(), "applying manifest");
    manifest.apply(&plugin).await?;
    Report::collect(&plugin, &provider, &ledger)
}

pub async fn handle(file: &Path, config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = crate::config::load(config_path)?;
    let manifest = Manifest::load(file)?;
    let report = run(&manifest, &config).await?;
    format.print(&report)?;
    eprintln!("{} {}", "Applied".green(), file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        serde_yaml::from_str(
            r#"
tenant_id: demo
firewalls:
  - id: fw1
    name: edge
l3_contexts:
  - name: main
    ip_pool: 10.0.0.0/16
    subnet_prefix_length: 24
classifiers:
  - name: http
    protocol: tcp
    port_range: "80"
    direction: in
actions:
  - name: allow
    action_type: allow
  - name: inspect
    action_type: redirect
    action_value: fw1
rules:
  - name: http
    classifier: http
    actions: [allow]
contracts:
  - name: web
    rules: [http]
endpoint_groups:
  - name: web
    provided_contracts: [web]
  - name: clients
    consumed_contracts: [web]
endpoints:
  - name: vm1
    endpoint_group: clients
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_renders_manifest() {
        let report = run(&manifest(), &Config::default()).await.unwrap();

        // each group got an implicit L2 bound to the tenant's default L3
        assert_eq!(report.policy.l2_contexts.len(), 2);
        assert!(report.policy.l3_contexts.iter().any(|l3| l3.name == "default"));
        assert_eq!(report.resources.ports.len(), 1);
        assert_eq!(report.resources.security_groups.len(), 2);
        assert_eq!(report.resources.security_group_rules.len(), 1);
        assert!(report.resources.firewalls[0].admin_state_up);
        assert_eq!(report.owned[&ResourceKind::Port].len(), 1);

        let table = report.table();
        assert!(table.contains("consumed_web"));
        assert!(table.contains("ep_vm1"));
    }

    #[tokio::test]
    async fn test_noop_driver_provisions_nothing() {
        let mut config = Config::default();
        config.group_policy.policy_drivers = vec!["noop".into()];
        let report = run(&manifest(), &config).await.unwrap();
        assert_eq!(report.policy.endpoint_groups.len(), 2);
        assert_eq!(report.policy.endpoints[0].port_id, None);
        assert!(report.resources.networks.is_empty());
        assert!(report.owned.is_empty());
    }

    #[test]
    fn test_failed_apply_reports_object() {
        let mut manifest = manifest();
        manifest.endpoint_groups[0].provided_contracts = vec!["missing".into()];
        let err = tokio_test::block_on(run(&manifest, &Config::default())).unwrap_err();
        assert!(err.to_string().contains("unknown contract 'missing'"));
    }
}
