//! GBP Common - Shared types for the group policy mapping engine
//!
//! This crate provides the vocabulary shared by the engine and its tools:
//! - Abstract policy kinds and concrete resource kinds
//! - Classifier primitives (protocol, direction, port range)
//! - Resource notifications
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod policy;
pub mod port_range;

pub use error::*;
pub use events::*;
pub use policy::*;
pub use port_range::*;

/// Generate a fresh object identifier (UUID v4, hyphenated)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
