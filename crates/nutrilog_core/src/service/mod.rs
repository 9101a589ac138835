//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into versioning, group and import APIs.
//! - Keep the CLI and other front ends decoupled from storage details.

pub mod locks;
pub mod scan_import;
pub mod versioned_store;
