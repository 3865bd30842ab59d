//! Display discovery module
//!
//! Provides the catalog trait used to resolve a display id into its geometry
//! before a capture stream is opened.

mod catalog;

pub use catalog::{DisplayCatalog, DisplayDescriptor, StaticCatalog};

#[cfg(feature = "os-displays")]
pub use catalog::OsDisplayCatalog;
