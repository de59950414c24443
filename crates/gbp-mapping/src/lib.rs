//! GBP Mapping - Group policy mapping engine
//!
//! Stores abstract group policy (endpoints, groups, L2/L3 contexts and
//! contracts) and renders it onto concrete networking resources through a
//! chain of policy drivers:
//! - Policy object store with two-phase hooks
//! - Mapping driver (networks, subnets, routers, ports, security groups)
//! - Subnet allocation from L3 pools
//! - Ownership ledger for implicitly created resources
//! - Pluggable resource provider with an in-memory implementation

#![warn(clippy::all)]

pub mod allocator;
pub mod config;
pub mod driver;
pub mod event;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod plugin;
pub mod provider;
pub mod render;
pub mod store;

pub use config::{Config, ConfigError, GroupPolicyConfig, MappingConfig};
pub use driver::{DriverManager, MappingDriver, NoopDriver, PolicyDriver};
pub use event::{Change, Operation, PolicyEvent};
pub use gateway::ProvisioningGateway;
pub use ledger::OwnershipLedger;
pub use model::*;
pub use notify::{BroadcastNotifier, NotificationSink, NotifyError, TracingNotifier};
pub use plugin::GroupPolicyPlugin;
pub use provider::memory::InMemoryProvider;
pub use provider::{FirewallService, L3RouterService, ResourceProvider, ServiceDirectory};
pub use store::{PolicyObject, PolicyStore, Query, SortKey};
