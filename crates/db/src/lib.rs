//! Session and transaction layer over `SeaORM`.
//!
//! This crate provides:
//! - A session factory built from configuration
//! - A single-use session wrapper with a sticky failure state
//! - Entity lifecycle hooks and cascade deletion
//! - Named parameter queries and entity criteria
//! - Schema export to a script or a live database

pub mod classify;
pub mod entity;
pub mod factory;
pub mod query;
pub mod schema;
pub mod session;

pub use classify::classify;
pub use entity::{CascadeDelete, EntityKey, VersionedEntity};
pub use factory::{SessionFactory, backend_for_url, connect_options};
pub use query::{CalendarDay, Criteria, NamedQuery, Page};
pub use schema::{InfoLines, SchemaExport, SchemaMetadata};
pub use session::DbSession;
