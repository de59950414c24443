//! Config commands

use crate::config;
use crate::output::{render, OutputFormat, SettingRow, Tabular};
use crate::ConfigCommands;
use anyhow::{bail, Result};
use colored::Colorize;
use gbp_mapping::Config;
use std::path::Path;

impl Tabular for Config {
    fn table(&self) -> String {
        let mapping = &self.group_policy_mapping;
        let setting = |section: &str, key: &str, value: String| SettingRow {
            section: section.into(),
            key: key.into(),
            value,
        };
        render(vec![
            setting("group_policy", "policy_drivers", self.group_policy.policy_drivers.join(", ")),
            setting(
                "group_policy_mapping",
                "default_l3_context_name",
                mapping.default_l3_context_name.clone(),
            ),
            setting(
                "group_policy_mapping",
                "default_ip_version",
                mapping.default_ip_version.to_string(),
            ),
            setting("group_policy_mapping", "default_ip_pool", mapping.default_ip_pool.to_string()),
            setting(
                "group_policy_mapping",
                "default_subnet_prefix_length",
                mapping.default_subnet_prefix_length.to_string(),
            ),
        ])
    }
}

pub fn handle(action: ConfigCommands, path: &Path, format: OutputFormat) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let config = config::load(path)?;
            format.print(&config)?;
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            config::save(&Config::default(), path)?;
            eprintln!("{} {}", "Configuration written to".green(), path.display());
        }
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}
