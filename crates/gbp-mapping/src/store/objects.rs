//! Per-kind table access, referential checks and back-reference upkeep

use super::{in_use, PolicyTables};
use crate::event::{Change, PolicyEvent};
use crate::model::*;
use gbp_common::{PolicyKind, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// An abstract object kept in the policy store
pub trait PolicyObject: Clone + Serialize + Send + Sync + 'static {
    /// Kind tag
    const KIND: PolicyKind;

    fn id(&self) -> &str;
    fn tenant_id(&self) -> &str;
    fn name(&self) -> &str;

    #[doc(hidden)]
    fn table(tables: &PolicyTables) -> &BTreeMap<String, Self>;
    #[doc(hidden)]
    fn table_mut(tables: &mut PolicyTables) -> &mut BTreeMap<String, Self>;

    /// Wrap a change in the matching event variant
    fn event(change: Change<Self>) -> PolicyEvent;

    /// Fail with `NotFound` when a referenced object is missing
    fn check_references(&self, _tables: &PolicyTables) -> Result<()> {
        Ok(())
    }

    /// Fail with `InUse` while another object references this one
    fn check_unreferenced(&self, _tables: &PolicyTables) -> Result<()> {
        Ok(())
    }

    /// Add this object to its parent's back-reference list
    fn link(&self, _tables: &mut PolicyTables) {}

    /// Remove this object from its parent's back-reference list
    fn unlink(&self, _tables: &mut PolicyTables) {}
}

macro_rules! object_accessors {
    ($kind:expr, $table:ident, $variant:ident) => {
        const KIND: PolicyKind = $kind;

        fn id(&self) -> &str {
            &self.id
        }

        fn tenant_id(&self) -> &str {
            &self.tenant_id
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn table(tables: &PolicyTables) -> &BTreeMap<String, Self> {
            &tables.$table
        }

        fn table_mut(tables: &mut PolicyTables) -> &mut BTreeMap<String, Self> {
            &mut tables.$table
        }

        fn event(change: Change<Self>) -> PolicyEvent {
            PolicyEvent::$variant(change)
        }
    };
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}

fn remove_id(list: &mut Vec<String>, id: &str) {
    list.retain(|x| x != id);
}

impl PolicyObject for Endpoint {
    object_accessors!(PolicyKind::Endpoint, endpoints, Endpoint);

    fn check_references(&self, tables: &PolicyTables) -> Result<()> {
        if let Some(group_id) = &self.endpoint_group_id {
            tables.get::<EndpointGroup>(group_id)?;
        }
        Ok(())
    }

    fn link(&self, tables: &mut PolicyTables) {
        if let Some(group) = self
            .endpoint_group_id
            .as_ref()
            .and_then(|id| tables.endpoint_groups.get_mut(id))
        {
            push_unique(&mut group.endpoints, &self.id);
        }
    }

    fn unlink(&self, tables: &mut PolicyTables) {
        if let Some(group) = self
            .endpoint_group_id
            .as_ref()
            .and_then(|id| tables.endpoint_groups.get_mut(id))
        {
            remove_id(&mut group.endpoints, &self.id);
        }
    }
}

impl PolicyObject for EndpointGroup {
    object_accessors!(PolicyKind::EndpointGroup, endpoint_groups, EndpointGroup);

    fn check_references(&self, tables: &PolicyTables) -> Result<()> {
        if let Some(l2) = &self.l2_context_id {
            tables.get::<L2Context>(l2)?;
        }
        tables.require_all::<Contract>(&self.provided_contracts)?;
        tables.require_all::<Contract>(&self.consumed_contracts)
    }

    fn check_unreferenced(&self, _tables: &PolicyTables) -> Result<()> {
        if !self.endpoints.is_empty() {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::Endpoint));
        }
        Ok(())
    }

    fn link(&self, tables: &mut PolicyTables) {
        if let Some(l2) = self
            .l2_context_id
            .as_ref()
            .and_then(|id| tables.l2_contexts.get_mut(id))
        {
            push_unique(&mut l2.endpoint_groups, &self.id);
        }
    }

    fn unlink(&self, tables: &mut PolicyTables) {
        if let Some(l2) = self
            .l2_context_id
            .as_ref()
            .and_then(|id| tables.l2_contexts.get_mut(id))
        {
            remove_id(&mut l2.endpoint_groups, &self.id);
        }
    }
}

impl PolicyObject for L2Context {
    object_accessors!(PolicyKind::L2Context, l2_contexts, L2Context);

    fn check_references(&self, tables: &PolicyTables) -> Result<()> {
        if let Some(l3) = &self.l3_context_id {
            tables.get::<L3Context>(l3)?;
        }
        Ok(())
    }

    fn check_unreferenced(&self, _tables: &PolicyTables) -> Result<()> {
        if !self.endpoint_groups.is_empty() {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::EndpointGroup));
        }
        Ok(())
    }

    fn link(&self, tables: &mut PolicyTables) {
        if let Some(l3) = self
            .l3_context_id
            .as_ref()
            .and_then(|id| tables.l3_contexts.get_mut(id))
        {
            push_unique(&mut l3.l2_contexts, &self.id);
        }
    }

    fn unlink(&self, tables: &mut PolicyTables) {
        if let Some(l3) = self
            .l3_context_id
            .as_ref()
            .and_then(|id| tables.l3_contexts.get_mut(id))
        {
            remove_id(&mut l3.l2_contexts, &self.id);
        }
    }
}

impl PolicyObject for L3Context {
    object_accessors!(PolicyKind::L3Context, l3_contexts, L3Context);

    fn check_unreferenced(&self, _tables: &PolicyTables) -> Result<()> {
        if !self.l2_contexts.is_empty() {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::L2Context));
        }
        Ok(())
    }
}

impl PolicyObject for Contract {
    object_accessors!(PolicyKind::Contract, contracts, Contract);

    fn check_references(&self, tables: &PolicyTables) -> Result<()> {
        tables.require_all::<PolicyRule>(&self.policy_rules)
    }

    fn check_unreferenced(&self, tables: &PolicyTables) -> Result<()> {
        let used = tables
            .endpoint_groups
            .values()
            .any(|g| g.provided_contracts.contains(&self.id) || g.consumed_contracts.contains(&self.id));
        if used {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::EndpointGroup));
        }
        Ok(())
    }
}

impl PolicyObject for PolicyRule {
    object_accessors!(PolicyKind::PolicyRule, policy_rules, PolicyRule);

    fn check_references(&self, tables: &PolicyTables) -> Result<()> {
        tables.get::<PolicyClassifier>(&self.policy_classifier_id)?;
        tables.require_all::<PolicyAction>(&self.policy_actions)
    }

    fn check_unreferenced(&self, tables: &PolicyTables) -> Result<()> {
        if tables.contracts.values().any(|c| c.policy_rules.contains(&self.id)) {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::Contract));
        }
        Ok(())
    }
}

impl PolicyObject for PolicyClassifier {
    object_accessors!(PolicyKind::PolicyClassifier, policy_classifiers, PolicyClassifier);

    fn check_unreferenced(&self, tables: &PolicyTables) -> Result<()> {
        if tables
            .policy_rules
            .values()
            .any(|r| r.policy_classifier_id == self.id)
        {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::PolicyRule));
        }
        Ok(())
    }
}

impl PolicyObject for PolicyAction {
    object_accessors!(PolicyKind::PolicyAction, policy_actions, PolicyAction);

    fn check_unreferenced(&self, tables: &PolicyTables) -> Result<()> {
        if tables.policy_rules.values().any(|r| r.policy_actions.contains(&self.id)) {
            return Err(in_use(Self::KIND, &self.id, PolicyKind::PolicyRule));
        }
        Ok(())
    }
}
