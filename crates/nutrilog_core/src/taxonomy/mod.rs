//! Nutrient taxonomy definition and read-only lookup index.
//!
//! # Responsibility
//! - Describe the authoritative nutrient hierarchy (`TaxonomyNode`).
//! - Load the hierarchy once from JSON and expose it as `TaxonomyIndex`.
//!
//! # Invariants
//! - Names are unique case-insensitively across the whole tree.
//! - The index is immutable after construction and is passed explicitly to
//!   the engines that need it.
//! - A failed load yields an empty index; lookups then return empty results.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

mod index;

pub use index::{TaxonomyEntry, TaxonomyIndex};

/// Built-in nutrient hierarchy shipped with the core crate.
pub(crate) const BUILTIN_TAXONOMY_JSON: &str = include_str!("nutrients.json");

/// One node of the external taxonomy definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub name: String,
    /// Grouping-only node: skipped in parent chains and flattened in child
    /// listings when generics are ignored.
    #[serde(default)]
    pub ignore_generic: bool,
    #[serde(default)]
    pub children: Vec<TaxonomyNode>,
}

impl TaxonomyNode {
    /// Creates a regular (addable) leaf node.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ignore_generic: false,
            children: Vec::new(),
        }
    }

    /// Creates a node with children.
    pub fn branch(name: impl Into<String>, children: Vec<TaxonomyNode>) -> Self {
        Self {
            name: name.into(),
            ignore_generic: false,
            children,
        }
    }

    /// Creates a generic grouping node with children.
    pub fn generic(name: impl Into<String>, children: Vec<TaxonomyNode>) -> Self {
        Self {
            name: name.into(),
            ignore_generic: true,
            children,
        }
    }
}

/// Errors raised while building a taxonomy index.
#[derive(Debug)]
pub enum TaxonomyError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    EmptyName,
    DuplicateName(String),
}

impl Display for TaxonomyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read taxonomy definition: {err}"),
            Self::Parse(err) => write!(f, "invalid taxonomy definition: {err}"),
            Self::EmptyName => write!(f, "taxonomy node name must not be blank"),
            Self::DuplicateName(name) => write!(f, "duplicate taxonomy name `{name}`"),
        }
    }
}

impl Error for TaxonomyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::EmptyName | Self::DuplicateName(_) => None,
        }
    }
}

impl From<std::io::Error> for TaxonomyError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TaxonomyError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}
