//! Policy drivers and the manager that chains them
//!
//! Every store mutation is offered to each configured driver twice:
//! `precommit` runs while the store's write lock is held and can veto the
//! change, `postcommit` runs after the change is visible and provisions
//! whatever the change implies. Drivers run in configuration order and the
//! first error stops the chain.

pub mod mapping;

pub use mapping::MappingDriver;

use crate::config::Config;
use crate::event::PolicyEvent;
use crate::gateway::ProvisioningGateway;
use crate::plugin::GroupPolicyPlugin;
use crate::store::PolicyTables;
use async_trait::async_trait;
use gbp_common::{GbpError, Result};
use std::sync::Arc;
use tracing::{debug, error};

#[async_trait]
pub trait PolicyDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Validate a staged change. Nothing is persisted when this fails.
    fn precommit(&self, _tables: &PolicyTables, _event: &PolicyEvent) -> Result<()> {
        Ok(())
    }

    /// Provision for a committed change
    async fn postcommit(&self, _plugin: &GroupPolicyPlugin, _event: &PolicyEvent) -> Result<()> {
        Ok(())
    }
}

/// Driver that accepts everything and provisions nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

#[async_trait]
impl PolicyDriver for NoopDriver {
    fn name(&self) -> &str {
        "noop"
    }
}

/// Ordered chain of policy drivers
#[derive(Clone, Default)]
pub struct DriverManager {
    drivers: Vec<Arc<dyn PolicyDriver>>,
}

impl DriverManager {
    pub fn new(drivers: Vec<Arc<dyn PolicyDriver>>) -> Self {
        Self { drivers }
    }

    /// Build the drivers named in `[group_policy] policy_drivers`
    pub fn from_config(config: &Config, gateway: Arc<ProvisioningGateway>) -> Result<Self> {
        let mut drivers: Vec<Arc<dyn PolicyDriver>> = Vec::new();
        for name in &config.group_policy.policy_drivers {
            match name.as_str() {
                "mapping" => drivers.push(Arc::new(MappingDriver::new(
                    gateway.clone(),
                    config.group_policy_mapping.clone(),
                ))),
                "noop" => drivers.push(Arc::new(NoopDriver)),
                other => {
                    return Err(GbpError::Config(format!("unknown policy driver '{}'", other)));
                }
            }
        }
        Ok(Self::new(drivers))
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn precommit(&self, tables: &PolicyTables, event: &PolicyEvent) -> Result<()> {
        for driver in &self.drivers {
            debug!(driver = driver.name(), hook = %event.hook(), id = event.id(), "precommit");
            if let Err(e) = driver.precommit(tables, event) {
                error!(driver = driver.name(), hook = %event.hook(), id = event.id(), error = %e, "precommit failed");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn postcommit(&self, plugin: &GroupPolicyPlugin, event: &PolicyEvent) -> Result<()> {
        for driver in &self.drivers {
            debug!(driver = driver.name(), hook = %event.hook(), id = event.id(), "postcommit");
            if let Err(e) = driver.postcommit(plugin, event).await {
                error!(driver = driver.name(), hook = %event.hook(), id = event.id(), error = %e, "postcommit failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
