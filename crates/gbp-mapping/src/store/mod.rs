//! Policy object store
//!
//! Holds every abstract object in ordered tables behind a single
//! `parking_lot::RwLock`. Mutations go through a [`Transaction`]: the change
//! is staged and validated, drivers run their precommit hooks while the
//! write lock is still held, and only then is the change applied. Dropping
//! a transaction without applying it leaves the tables untouched.

mod objects;
mod query;

pub use objects::PolicyObject;
pub use query::{Query, SortKey};

use crate::event::{Change, PolicyEvent};
use crate::model::*;
use gbp_common::{GbpError, PolicyKind, Result};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Object tables keyed by id
#[derive(Debug, Default, Clone)]
pub struct PolicyTables {
    endpoints: BTreeMap<String, Endpoint>,
    endpoint_groups: BTreeMap<String, EndpointGroup>,
    l2_contexts: BTreeMap<String, L2Context>,
    l3_contexts: BTreeMap<String, L3Context>,
    contracts: BTreeMap<String, Contract>,
    policy_rules: BTreeMap<String, PolicyRule>,
    policy_classifiers: BTreeMap<String, PolicyClassifier>,
    policy_actions: BTreeMap<String, PolicyAction>,
}

impl PolicyTables {
    /// Look up an object, failing with `NotFound`
    pub fn get<T: PolicyObject>(&self, id: &str) -> Result<&T> {
        T::table(self)
            .get(id)
            .ok_or_else(|| GbpError::not_found(T::KIND, id))
    }

    /// Whether an object exists
    pub fn contains<T: PolicyObject>(&self, id: &str) -> bool {
        T::table(self).contains_key(id)
    }

    /// Fail with `NotFound` for `kind` unless every id exists
    pub(crate) fn require_all<'a, T: PolicyObject>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        for id in ids {
            self.get::<T>(id)?;
        }
        Ok(())
    }

    fn insert<T: PolicyObject>(&mut self, object: T) {
        object.link(self);
        T::table_mut(self).insert(object.id().to_string(), object);
    }

    fn remove<T: PolicyObject>(&mut self, id: &str) -> Option<T> {
        let removed = T::table_mut(self).remove(id);
        if let Some(object) = &removed {
            object.unlink(self);
        }
        removed
    }

    fn apply_change<T: PolicyObject>(&mut self, change: &Change<T>) {
        match change {
            Change::Created(object) => self.insert(object.clone()),
            Change::Updated { current, .. } => {
                self.remove::<T>(current.id());
                self.insert(current.clone());
            }
            Change::Deleted(object) => {
                self.remove::<T>(object.id());
            }
        }
    }
}

/// Thread-safe store of abstract policy objects
#[derive(Debug, Default)]
pub struct PolicyStore {
    tables: RwLock<PolicyTables>,
    /// Bumped on every applied change
    version: AtomicU64,
}

impl PolicyStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Begin a transaction, taking the write lock
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            tables: self.tables.write(),
            version: &self.version,
        }
    }

    /// Fetch a copy of one object
    pub fn get<T: PolicyObject>(&self, id: &str) -> Result<T> {
        self.tables.read().get::<T>(id).cloned()
    }

    /// Objects matching a query
    pub fn list<T: PolicyObject>(&self, query: &Query) -> Result<Vec<T>> {
        let tables = self.tables.read();
        query.execute(T::table(&tables))
    }

    /// Objects matching a query, projected to the requested fields
    pub fn list_fields<T: PolicyObject>(&self, query: &Query) -> Result<Vec<serde_json::Value>> {
        let tables = self.tables.read();
        let rows = query.execute::<T>(T::table(&tables))?;
        rows.iter().map(|row| query.project(row)).collect()
    }

    /// Number of objects matching a query's tenant and filters
    pub fn count<T: PolicyObject>(&self, query: &Query) -> Result<usize> {
        let tables = self.tables.read();
        query.count(T::table(&tables))
    }

    // === Bindings recorded by drivers after provisioning ===

    /// Record the port backing an endpoint
    pub fn bind_endpoint_port(&self, endpoint_id: &str, port_id: &str) -> Result<Endpoint> {
        self.modify::<Endpoint>(endpoint_id, |ep| ep.port_id = Some(port_id.to_string()))
    }

    /// Record the L2 context of a group
    pub fn bind_group_l2_context(&self, group_id: &str, l2_context_id: &str) -> Result<EndpointGroup> {
        let mut tables = self.tables.write();
        tables.get::<L2Context>(l2_context_id)?;
        self.modify_locked::<EndpointGroup>(&mut tables, group_id, |group| {
            group.l2_context_id = Some(l2_context_id.to_string())
        })
    }

    /// Append a subnet to a group
    pub fn add_group_subnet(&self, group_id: &str, subnet_id: &str) -> Result<EndpointGroup> {
        self.modify::<EndpointGroup>(group_id, |group| {
            if !group.subnets.iter().any(|s| s == subnet_id) {
                group.subnets.push(subnet_id.to_string());
            }
        })
    }

    /// Record the network backing an L2 context
    pub fn bind_l2_network(&self, l2_context_id: &str, network_id: &str) -> Result<L2Context> {
        self.modify::<L2Context>(l2_context_id, |l2| l2.network_id = Some(network_id.to_string()))
    }

    /// Record the L3 context of an L2 context
    pub fn bind_l2_l3_context(&self, l2_context_id: &str, l3_context_id: &str) -> Result<L2Context> {
        let mut tables = self.tables.write();
        tables.get::<L3Context>(l3_context_id)?;
        self.modify_locked::<L2Context>(&mut tables, l2_context_id, |l2| {
            l2.l3_context_id = Some(l3_context_id.to_string())
        })
    }

    /// Record the router of an L3 context
    pub fn add_l3_router(&self, l3_context_id: &str, router_id: &str) -> Result<L3Context> {
        self.modify::<L3Context>(l3_context_id, |l3| {
            if !l3.routers.iter().any(|r| r == router_id) {
                l3.routers.push(router_id.to_string());
            }
        })
    }

    fn modify<T: PolicyObject>(&self, id: &str, f: impl FnOnce(&mut T)) -> Result<T> {
        let mut tables = self.tables.write();
        self.modify_locked(&mut tables, id, f)
    }

    fn modify_locked<T: PolicyObject>(
        &self,
        tables: &mut PolicyTables,
        id: &str,
        f: impl FnOnce(&mut T),
    ) -> Result<T> {
        let mut object = tables
            .remove::<T>(id)
            .ok_or_else(|| GbpError::not_found(T::KIND, id))?;
        f(&mut object);
        tables.insert(object.clone());
        self.version.fetch_add(1, Ordering::Release);
        Ok(object)
    }
}

/// Staged mutation holding the store's write lock
pub struct Transaction<'a> {
    tables: RwLockWriteGuard<'a, PolicyTables>,
    version: &'a AtomicU64,
}

impl<'a> Transaction<'a> {
    /// Tables as of the start of the transaction
    pub fn tables(&self) -> &PolicyTables {
        &self.tables
    }

    /// Validate a new object and stage its creation
    pub fn stage_create<T: PolicyObject>(&self, object: T) -> Result<PolicyEvent> {
        if self.tables.contains::<T>(object.id()) {
            return Err(GbpError::InvalidRequest(format!(
                "{} {} already exists",
                T::KIND,
                object.id()
            )));
        }
        object.check_references(&self.tables)?;
        Ok(T::event(Change::Created(object)))
    }

    /// Validate an updated object and stage the change
    pub fn stage_update<T: PolicyObject>(
        &self,
        id: &str,
        update: impl FnOnce(&T) -> Result<T>,
    ) -> Result<PolicyEvent> {
        let original = self.tables.get::<T>(id)?.clone();
        let current = update(&original)?;
        current.check_references(&self.tables)?;
        Ok(T::event(Change::Updated { original, current }))
    }

    /// Check nothing references the object and stage its deletion
    pub fn stage_delete<T: PolicyObject>(&self, id: &str) -> Result<PolicyEvent> {
        let object = self.tables.get::<T>(id)?.clone();
        object.check_unreferenced(&self.tables)?;
        Ok(T::event(Change::Deleted(object)))
    }

    /// Apply a staged change and release the lock
    pub fn apply(mut self, event: &PolicyEvent) {
        let tables = &mut *self.tables;
        match event {
            PolicyEvent::Endpoint(c) => tables.apply_change(c),
            PolicyEvent::EndpointGroup(c) => tables.apply_change(c),
            PolicyEvent::L2Context(c) => tables.apply_change(c),
            PolicyEvent::L3Context(c) => tables.apply_change(c),
            PolicyEvent::Contract(c) => tables.apply_change(c),
            PolicyEvent::PolicyRule(c) => tables.apply_change(c),
            PolicyEvent::PolicyClassifier(c) => tables.apply_change(c),
            PolicyEvent::PolicyAction(c) => tables.apply_change(c),
        }
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Kind-level helper used by referential checks
pub(crate) fn in_use(kind: PolicyKind, id: &str, used_by: PolicyKind) -> GbpError {
    GbpError::InUse {
        kind,
        id: id.to_string(),
        used_by,
    }
}
