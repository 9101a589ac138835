//! Core domain logic for NutriLog.
//! This crate is the single source of truth for nutrient arithmetic and
//! versioned food storage invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod taxonomy;

pub use config::{ConfigError, CoreConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{init_logging, LoggingError};
pub use model::food::{
    FoodError, FoodId, FoodRecord, IngredientRef, ServingInfo, Version, VersionKey,
};
pub use model::nutrient::NutrientNode;
pub use model::unit::MassUnit;
pub use repo::food_repo::{
    FoodRepository, GroupId, RepoError, RepoResult, SqliteFoodRepository, StoreStats,
};
pub use service::locks::IdentityLocks;
pub use service::scan_import::{
    apply_scan, import_scan, CancelToken, ScanBatch, ScanCandidate, ScanError, ScanOutcome,
    ScanResult,
};
pub use service::versioned_store::{
    GcReport, StoreError, StoreResult, UpdateOutcome, VersionedStore,
};
pub use taxonomy::{TaxonomyError, TaxonomyIndex, TaxonomyNode};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
