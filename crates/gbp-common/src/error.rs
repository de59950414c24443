//! Error types for the group policy mapping engine

use crate::policy::{PolicyKind, ResourceKind, ServiceCapability};
use thiserror::Error;

/// Engine error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GbpError {
    /// Endpoint created without a group
    #[error("an endpoint must be associated with an endpoint group")]
    EndpointRequiresEndpointGroup,

    /// Group update would drop a subnet
    #[error("removing a subnet from an endpoint group is not supported")]
    EndpointGroupSubnetRemovalNotSupported,

    /// L3 context created with more than one router
    #[error("an L3 context supports at most one router")]
    L3PolicyMultipleRoutersNotSupported,

    /// L3 context update touching its routers
    #[error("updating the routers of an L3 context is not supported")]
    L3PolicyRoutersUpdateNotSupported,

    /// Pool exhausted during implicit allocation
    #[error("no subnet is available in the pool of L3 context {l3_context_id}")]
    NoSubnetAvailable {
        /// L3 context whose pool was exhausted
        l3_context_id: String,
    },

    /// Referenced object does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing object
        kind: PolicyKind,
        /// Missing id
        id: String,
    },

    /// Object is still referenced and cannot be deleted
    #[error("{kind} {id} is in use by {used_by}")]
    InUse {
        /// Kind of the object being deleted
        kind: PolicyKind,
        /// Id of the object being deleted
        id: String,
        /// Kind of the referencing object
        used_by: PolicyKind,
    },

    /// Malformed or out-of-range port range
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Other field validation failure
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Required service is not deployed
    #[error("group policy deployment error: service {service} is not available")]
    GroupPolicyDeploymentError {
        /// Missing service
        service: ServiceCapability,
    },

    /// Redirect target does not exist
    #[error("firewall {0} not found")]
    FirewallNotFound(String),

    /// Object lacks a binding it needs for provisioning
    #[error("{kind} {id} has no {binding}")]
    Unbound {
        /// Kind of the incomplete object
        kind: PolicyKind,
        /// Id of the incomplete object
        id: String,
        /// Missing binding
        binding: &'static str,
    },

    /// Contract has no security group mapping yet
    #[error("no security group mapping for contract {0}")]
    ContractMappingMissing(String),

    /// Resource provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl GbpError {
    /// Shorthand for [`GbpError::NotFound`]
    pub fn not_found(kind: PolicyKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Whether the error was raised by request validation, before anything
    /// was persisted
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EndpointRequiresEndpointGroup
                | Self::EndpointGroupSubnetRemovalNotSupported
                | Self::L3PolicyMultipleRoutersNotSupported
                | Self::L3PolicyRoutersUpdateNotSupported
                | Self::InvalidPortRange(_)
                | Self::InvalidRequest(_)
                | Self::NotFound { .. }
                | Self::InUse { .. }
        )
    }
}

/// Errors returned by a resource provider or optional service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Concrete resource does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind
        kind: ResourceKind,
        /// Resource id
        id: String,
    },

    /// Request collides with existing state (overlap, in use)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend rejected the request
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for the engine
pub type Result<T> = std::result::Result<T, GbpError>;
