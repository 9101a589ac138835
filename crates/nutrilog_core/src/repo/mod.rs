//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the storage contract the versioned store is written against.
//! - Isolate SQLite query details from versioning and GC decisions.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`FoodNotFound`,
//!   `VersionNotFound`, `GroupNotFound`) in addition to DB transport errors.
//! - Repositories never decide in-place vs fork; they only report reference
//!   counts.

pub mod food_repo;
