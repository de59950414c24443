//! Output formatting

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

/// Something that can lay itself out as table rows
pub trait Tabular {
    fn table(&self) -> String;
}

/// One line of an apply report
#[derive(Debug, Clone, Tabled)]
pub struct ObjectRow {
    #[tabled(rename = "KIND")]
    pub kind: String,
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "DETAIL")]
    pub detail: String,
    #[tabled(rename = "OWNED")]
    pub owned: String,
}

/// One configuration setting
#[derive(Debug, Clone, Tabled)]
pub struct SettingRow {
    #[tabled(rename = "SECTION")]
    pub section: String,
    #[tabled(rename = "KEY")]
    pub key: String,
    #[tabled(rename = "VALUE")]
    pub value: String,
}

pub fn render<R: Tabled>(rows: Vec<R>) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

impl OutputFormat {
    pub fn print<T: Serialize + Tabular>(&self, data: &T) -> Result<()> {
        match self {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
            OutputFormat::Table => println!("{}", data.table()),
        }
        Ok(())
    }
}
