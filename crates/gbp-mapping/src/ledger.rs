//! Ownership ledger
//!
//! Records which concrete resources the engine created implicitly. Only
//! resources found here are ever deleted by the engine; resources supplied
//! explicitly by the user never enter the ledger.

use dashmap::DashSet;
use gbp_common::ResourceKind;

/// Set of (kind, id) pairs the engine owns
#[derive(Debug, Default)]
pub struct OwnershipLedger {
    owned: DashSet<(ResourceKind, String)>,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ownership. Idempotent.
    pub fn mark_owned(&self, kind: ResourceKind, id: &str) {
        self.owned.insert((kind, id.to_string()));
    }

    pub fn is_owned(&self, kind: ResourceKind, id: &str) -> bool {
        self.owned.contains(&(kind, id.to_string()))
    }

    /// Forget ownership, returning whether the resource was owned
    pub fn unmark(&self, kind: ResourceKind, id: &str) -> bool {
        self.owned.remove(&(kind, id.to_string())).is_some()
    }

    /// Ids of every owned resource of one kind, sorted
    pub fn owned(&self, kind: ResourceKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .owned
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}
