//! Food and nutrient value model.
//!
//! # Responsibility
//! - Define the value trees edited by callers before they are committed.
//! - Keep all amount/unit arithmetic and ingredient bookkeeping in one place.
//!
//! # Invariants
//! - Every food version is addressed by a `VersionKey` (identity + version).
//! - Model operations are synchronous and touch only caller-owned values;
//!   persistence lives in `repo`/`service`.

pub mod food;
pub mod nutrient;
pub mod unit;
