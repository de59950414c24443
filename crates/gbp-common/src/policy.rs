//! Policy vocabulary: abstract object kinds, concrete resource kinds and
//! classifier primitives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of abstract policy object held by the policy store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Workload reference
    Endpoint,
    /// Named set of endpoints
    EndpointGroup,
    /// Broadcast domain
    L2Context,
    /// Routing domain
    L3Context,
    /// Ordered set of policy rules
    Contract,
    /// Classifier plus actions
    PolicyRule,
    /// Traffic match
    PolicyClassifier,
    /// Allow or redirect
    PolicyAction,
}

impl PolicyKind {
    /// Resource name as used in APIs and log fields
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::EndpointGroup => "endpoint_group",
            Self::L2Context => "l2_context",
            Self::L3Context => "l3_context",
            Self::Contract => "contract",
            Self::PolicyRule => "policy_rule",
            Self::PolicyClassifier => "policy_classifier",
            Self::PolicyAction => "policy_action",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of concrete network resource managed through the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// L2 network
    Network,
    /// IP subnet of a network
    Subnet,
    /// Attachment point on a network
    Port,
    /// L3 router
    Router,
    /// Container of access-control rules
    SecurityGroup,
    /// Single access-control rule
    SecurityGroupRule,
    /// Firewall instance (redirect target)
    Firewall,
}

impl ResourceKind {
    /// Resource name as used in notifications
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::Port => "port",
            Self::Router => "router",
            Self::SecurityGroup => "security_group",
            Self::SecurityGroupRule => "security_group_rule",
            Self::Firewall => "firewall",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional service a deployment may or may not offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCapability {
    /// L3 routing (routers and router interfaces)
    L3Routing,
    /// Firewall as a service
    Firewall,
}

impl fmt::Display for ServiceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L3Routing => f.write_str("L3_ROUTER_NAT"),
            Self::Firewall => f.write_str("FIREWALL"),
        }
    }
}

/// Classifier protocol. Absent on a classifier means any protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP
    Icmp,
}

impl Protocol {
    /// Lowercase protocol name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction of a classifier, seen from the providing group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward the provider
    In,
    /// Away from the provider
    Out,
    /// Both ways
    #[default]
    Bi,
}

impl Direction {
    /// Whether traffic toward the provider matches
    pub fn inbound(&self) -> bool {
        matches!(self, Self::In | Self::Bi)
    }

    /// Whether traffic away from the provider matches
    pub fn outbound(&self) -> bool {
        matches!(self, Self::Out | Self::Bi)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
            Self::Bi => f.write_str("bi"),
        }
    }
}

/// Policy action type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Permit matching traffic
    #[default]
    Allow,
    /// Steer matching traffic to a service (firewall)
    Redirect,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Redirect => f.write_str("redirect"),
        }
    }
}
