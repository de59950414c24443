//! Lifecycle events dispatched to policy drivers

use crate::model::*;
use gbp_common::PolicyKind;

/// Lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A change to one object. Updates carry both versions so drivers can diff.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Created(T),
    Updated { original: T, current: T },
    Deleted(T),
}

impl<T> Change<T> {
    /// The object as it is after the change (before it, for deletes)
    pub fn current(&self) -> &T {
        match self {
            Self::Created(obj) | Self::Deleted(obj) => obj,
            Self::Updated { current, .. } => current,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Created(_) => Operation::Create,
            Self::Updated { .. } => Operation::Update,
            Self::Deleted(_) => Operation::Delete,
        }
    }
}

/// Change to any abstract policy object
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Endpoint(Change<Endpoint>),
    EndpointGroup(Change<EndpointGroup>),
    L2Context(Change<L2Context>),
    L3Context(Change<L3Context>),
    Contract(Change<Contract>),
    PolicyRule(Change<PolicyRule>),
    PolicyClassifier(Change<PolicyClassifier>),
    PolicyAction(Change<PolicyAction>),
}

impl PolicyEvent {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Endpoint(_) => PolicyKind::Endpoint,
            Self::EndpointGroup(_) => PolicyKind::EndpointGroup,
            Self::L2Context(_) => PolicyKind::L2Context,
            Self::L3Context(_) => PolicyKind::L3Context,
            Self::Contract(_) => PolicyKind::Contract,
            Self::PolicyRule(_) => PolicyKind::PolicyRule,
            Self::PolicyClassifier(_) => PolicyKind::PolicyClassifier,
            Self::PolicyAction(_) => PolicyKind::PolicyAction,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Endpoint(c) => c.operation(),
            Self::EndpointGroup(c) => c.operation(),
            Self::L2Context(c) => c.operation(),
            Self::L3Context(c) => c.operation(),
            Self::Contract(c) => c.operation(),
            Self::PolicyRule(c) => c.operation(),
            Self::PolicyClassifier(c) => c.operation(),
            Self::PolicyAction(c) => c.operation(),
        }
    }

    /// Id of the changed object
    pub fn id(&self) -> &str {
        match self {
            Self::Endpoint(c) => &c.current().id,
            Self::EndpointGroup(c) => &c.current().id,
            Self::L2Context(c) => &c.current().id,
            Self::L3Context(c) => &c.current().id,
            Self::Contract(c) => &c.current().id,
            Self::PolicyRule(c) => &c.current().id,
            Self::PolicyClassifier(c) => &c.current().id,
            Self::PolicyAction(c) => &c.current().id,
        }
    }

    /// Hook name used in logs, e.g. `create_endpoint_group`
    pub fn hook(&self) -> String {
        format!("{}_{}", self.operation().as_str(), self.kind())
    }
}
