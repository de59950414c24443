//! Resource notifications
//!
//! Every concrete resource the engine provisions produces one notification
//! named `<kind>.<action>.end`, mirroring the lifecycle notifications of the
//! networking service.

use crate::policy::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle action carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    /// Resource was created
    Create,
    /// Resource was updated
    Update,
    /// Resource was deleted
    Delete,
}

impl EventAction {
    /// Lowercase action name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Notification about a provisioned resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Unique event ID
    pub event_id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Resource kind
    pub resource: ResourceKind,
    /// Lifecycle action
    pub action: EventAction,
    /// Resource id
    pub resource_id: String,
    /// Owning tenant, when known
    pub tenant_id: Option<String>,
    /// Resource body as returned by the provider
    pub payload: serde_json::Value,
}

impl ResourceEvent {
    /// Build a notification stamped with the current time
    pub fn new(
        resource: ResourceKind,
        action: EventAction,
        resource_id: impl Into<String>,
        tenant_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: crate::new_id(),
            timestamp: Utc::now(),
            resource,
            action,
            resource_id: resource_id.into(),
            tenant_id,
            payload,
        }
    }

    /// Notification name, e.g. `network.create.end`
    pub fn event_type(&self) -> String {
        format!("{}.{}.end", self.resource.as_str(), self.action.as_str())
    }
}
