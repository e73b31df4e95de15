//! Shared types, errors, and configuration for unitwork.
//!
//! This crate provides the pieces every other crate depends on:
//! - The persistence error taxonomy
//! - `key=value` property line parsing
//! - Configuration resource resolution and loading

pub mod config;
pub mod error;
pub mod properties;

pub use config::{ConfigLoader, ConnectionConfig, OrmConfig, ResourceLocator};
pub use error::{PersistError, PersistResult};
pub use properties::parse_property_lines;
