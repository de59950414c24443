//! CLI Commands

pub mod apply;
pub mod config;
