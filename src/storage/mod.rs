//! SQLite storage layer for the merge.
//!
//! Provides:
//! - Kismet schema and catalog queries
//! - Database handles for the target and read-only sources
//! - Pragma backup and restore around bulk loads
//! - Pooled target connections with attached sources
//! - Related-device lookup over merged packets

pub mod attach;
pub mod database;
pub mod lookup;
pub mod pragma;
pub mod schema;

pub use attach::{AttachPool, AttachedSource};
pub use database::DatabaseHandle;
pub use lookup::RelatedMacs;
pub use pragma::{Pragma, PragmaStore};
