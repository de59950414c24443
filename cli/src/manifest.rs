//! Policy manifests
//!
//! A manifest describes abstract policy for one tenant. Objects refer to
//! each other by name; names are resolved to ids as objects are created in
//! dependency order.

use anyhow::{bail, Context, Result};
use gbp_common::{ActionType, Direction, Protocol};
use gbp_mapping::provider::Firewall;
use gbp_mapping::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub tenant_id: String,
    pub firewalls: Vec<FirewallEntry>,
    pub l3_contexts: Vec<L3ContextEntry>,
    pub l2_contexts: Vec<L2ContextEntry>,
    pub classifiers: Vec<ClassifierEntry>,
    pub actions: Vec<ActionEntry>,
    pub rules: Vec<RuleEntry>,
    pub contracts: Vec<ContractEntry>,
    pub endpoint_groups: Vec<EndpointGroupEntry>,
    pub endpoints: Vec<EndpointEntry>,
}

/// Pre-existing firewall seeded into the in-memory provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L3ContextEntry {
    pub name: String,
    pub description: String,
    pub ip_version: Option<u8>,
    pub ip_pool: String,
    pub subnet_prefix_length: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L2ContextEntry {
    pub name: String,
    pub description: String,
    pub l3_context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierEntry {
    pub name: String,
    pub protocol: Option<Protocol>,
    pub port_range: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionEntry {
    pub name: String,
    pub action_type: ActionType,
    pub action_value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEntry {
    pub name: String,
    pub enabled: Option<bool>,
    pub classifier: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractEntry {
    pub name: String,
    pub description: String,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointGroupEntry {
    pub name: String,
    pub description: String,
    pub l2_context: Option<String>,
    pub provided_contracts: Vec<String>,
    pub consumed_contracts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointEntry {
    pub name: String,
    pub endpoint_group: String,
}

/// Name -> id for one kind
#[derive(Debug, Default)]
struct Names {
    kind: &'static str,
    ids: HashMap<String, String>,
}

impl Names {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ids: HashMap::new(),
        }
    }

    fn insert(&mut self, name: &str, id: &str) -> Result<()> {
        if self.ids.insert(name.to_string(), id.to_string()).is_some() {
            bail!("duplicate {} name '{}'", self.kind, name);
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<String> {
        self.ids
            .get(name)
            .cloned()
            .with_context(|| format!("unknown {} '{}'", self.kind, name))
    }

    fn resolve_all(&self, names: &[String]) -> Result<Vec<String>> {
        names.iter().map(|n| self.resolve(n)).collect()
    }
}

impl Manifest {
    /// Parse YAML or JSON, chosen by file extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let manifest = if is_yaml {
            serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        };
        Ok(manifest)
    }

    /// Seed firewalls into the provider
    pub fn seed(&self, provider: &InMemoryProvider) {
        for fw in &self.firewalls {
            provider.add_firewall(Firewall {
                id: fw.id.clone(),
                tenant_id: self.tenant_id.clone(),
                name: fw.name.clone(),
                admin_state_up: fw.admin_state_up,
            });
        }
    }

    /// Create every object through the plugin, stopping at the first error
    pub async fn apply(&self, plugin: &GroupPolicyPlugin) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            bail!("manifest has no tenant_id");
        }
        let tenant = || self.tenant_id.clone();

        let mut l3_names = Names::new("l3_context");
        for entry in &self.l3_contexts {
            let mut request = L3ContextRequest {
                tenant_id: tenant(),
                name: entry.name.clone(),
                description: entry.description.clone(),
                ip_version: entry.ip_version,
                ip_pool: entry.ip_pool.clone(),
                ..Default::default()
            };
            if let Some(prefix) = entry.subnet_prefix_length {
                request.subnet_prefix_length = prefix;
            }
            let l3 = plugin
                .create_l3_context(request)
                .await
                .with_context(|| format!("l3_context '{}'", entry.name))?;
            l3_names.insert(&entry.name, &l3.id)?;
        }

        let mut l2_names = Names::new("l2_context");
        for entry in &self.l2_contexts {
            let l3_context_id = entry.l3_context.as_deref().map(|n| l3_names.resolve(n)).transpose()?;
            let l2 = plugin
                .create_l2_context(L2ContextRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    l3_context_id,
                    network_id: None,
                })
                .await
                .with_context(|| format!("l2_context '{}'", entry.name))?;
            l2_names.insert(&entry.name, &l2.id)?;
        }

        let mut classifier_names = Names::new("classifier");
        for entry in &self.classifiers {
            let classifier = plugin
                .create_policy_classifier(PolicyClassifierRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: String::new(),
                    protocol: entry.protocol,
                    port_range: entry.port_range.clone(),
                    direction: entry.direction,
                })
                .await
                .with_context(|| format!("classifier '{}'", entry.name))?;
            classifier_names.insert(&entry.name, &classifier.id)?;
        }

        let mut action_names = Names::new("action");
        for entry in &self.actions {
            let action = plugin
                .create_policy_action(PolicyActionRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: String::new(),
                    action_type: entry.action_type,
                    action_value: entry.action_value.clone(),
                })
                .await
                .with_context(|| format!("action '{}'", entry.name))?;
            action_names.insert(&entry.name, &action.id)?;
        }

        let mut rule_names = Names::new("rule");
        for entry in &self.rules {
            let rule = plugin
                .create_policy_rule(PolicyRuleRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: String::new(),
                    enabled: entry.enabled.unwrap_or(true),
                    policy_classifier_id: classifier_names.resolve(&entry.classifier)?,
                    policy_actions: action_names.resolve_all(&entry.actions)?,
                })
                .await
                .with_context(|| format!("rule '{}'", entry.name))?;
            rule_names.insert(&entry.name, &rule.id)?;
        }

        let mut contract_names = Names::new("contract");
        for entry in &self.contracts {
            let contract = plugin
                .create_contract(ContractRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    policy_rules: rule_names.resolve_all(&entry.rules)?,
                })
                .await
                .with_context(|| format!("contract '{}'", entry.name))?;
            contract_names.insert(&entry.name, &contract.id)?;
        }

        let mut group_names = Names::new("endpoint_group");
        for entry in &self.endpoint_groups {
            let l2_context_id = entry.l2_context.as_deref().map(|n| l2_names.resolve(n)).transpose()?;
            let group = plugin
                .create_endpoint_group(EndpointGroupRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    l2_context_id,
                    subnets: Vec::new(),
                    provided_contracts: contract_names.resolve_all(&entry.provided_contracts)?,
                    consumed_contracts: contract_names.resolve_all(&entry.consumed_contracts)?,
                })
                .await
                .with_context(|| format!("endpoint_group '{}'", entry.name))?;
            group_names.insert(&entry.name, &group.id)?;
        }

        for entry in &self.endpoints {
            plugin
                .create_endpoint(EndpointRequest {
                    tenant_id: tenant(),
                    name: entry.name.clone(),
                    description: String::new(),
                    endpoint_group_id: Some(group_names.resolve(&entry.endpoint_group)?),
                    port_id: None,
                })
                .await
                .with_context(|| format!("endpoint '{}'", entry.name))?;
        }
        Ok(())
    }
}
