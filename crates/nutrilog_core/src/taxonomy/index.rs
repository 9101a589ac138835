//! Arena-backed taxonomy index.
//!
//! # Invariants
//! - `entries[0]` is the root when the index is non-empty.
//! - `by_name` keys are lowercase; every entry is reachable from the root.
//! - Unknown names produce empty results, never panics.

use super::{TaxonomyError, TaxonomyNode, BUILTIN_TAXONOMY_JSON};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    ignore_generic: bool,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Read-only lookup over the nutrient taxonomy.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyIndex {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
}

/// Borrowed view of one taxonomy entry.
#[derive(Debug, Clone, Copy)]
pub struct TaxonomyEntry<'a> {
    index: &'a TaxonomyIndex,
    id: usize,
}

impl<'a> TaxonomyEntry<'a> {
    /// Canonical spelling of the name.
    pub fn name(&self) -> &'a str {
        self.index.entries[self.id].name.as_str()
    }

    pub fn is_generic(&self) -> bool {
        self.index.entries[self.id].ignore_generic
    }

    pub fn parent_name(&self) -> Option<&'a str> {
        self.index.entries[self.id]
            .parent
            .map(|parent| self.index.entries[parent].name.as_str())
    }

    /// Immediate children, generics included.
    pub fn child_names(&self) -> Vec<&'a str> {
        self.index.entries[self.id]
            .children
            .iter()
            .map(|child| self.index.entries[*child].name.as_str())
            .collect()
    }
}

impl TaxonomyIndex {
    /// Index with no entries. Every lookup yields an empty result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds an index from an in-memory definition.
    pub fn from_root(root: TaxonomyNode) -> Result<Self, TaxonomyError> {
        let mut index = Self::default();
        let mut pending = vec![(root, None::<usize>)];
        while let Some((node, parent)) = pending.pop() {
            let name = node.name.trim().to_string();
            if name.is_empty() {
                return Err(TaxonomyError::EmptyName);
            }
            let key = name.to_lowercase();
            if index.by_name.contains_key(&key) {
                return Err(TaxonomyError::DuplicateName(name));
            }

            let id = index.entries.len();
            index.entries.push(Entry {
                name,
                ignore_generic: node.ignore_generic,
                parent,
                children: Vec::new(),
            });
            index.by_name.insert(key, id);
            if let Some(parent) = parent {
                index.entries[parent].children.push(id);
            }

            // Reversed so that pop() visits children in definition order.
            for child in node.children.into_iter().rev() {
                pending.push((child, Some(id)));
            }
        }
        Ok(index)
    }

    /// Parses a JSON definition (`{name, ignore_generic, children[]}`).
    pub fn from_json(json: &str) -> Result<Self, TaxonomyError> {
        let root: TaxonomyNode = serde_json::from_str(json)?;
        Self::from_root(root)
    }

    /// Loads a JSON definition from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Loads a definition from disk, degrading to an empty index on failure.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(index) => {
                info!(
                    "event=taxonomy_load module=taxonomy status=ok source=file entries={}",
                    index.len()
                );
                index
            }
            Err(err) => {
                warn!(
                    "event=taxonomy_load module=taxonomy status=error source=file path={} error={}",
                    path.display(),
                    err
                );
                Self::empty()
            }
        }
    }

    /// Index over the definition embedded in the crate.
    pub fn builtin() -> Self {
        match Self::from_json(BUILTIN_TAXONOMY_JSON) {
            Ok(index) => index,
            Err(err) => {
                warn!(
                    "event=taxonomy_load module=taxonomy status=error source=builtin error={}",
                    err
                );
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the single root, if loaded.
    pub fn root_name(&self) -> Option<&str> {
        self.entries.first().map(|entry| entry.name.as_str())
    }

    /// Case-insensitive exact lookup.
    pub fn find(&self, name: &str) -> Option<TaxonomyEntry<'_>> {
        self.lookup(name).map(|id| TaxonomyEntry { index: self, id })
    }

    /// Canonical spelling for `name`.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.lookup(name).map(|id| self.entries[id].name.as_str())
    }

    pub fn is_generic(&self, name: &str) -> bool {
        self.lookup(name)
            .map(|id| self.entries[id].ignore_generic)
            .unwrap_or(false)
    }

    /// Ancestors of `name`, root-first, excluding `name` itself.
    pub fn parent_chain(&self, name: &str, ignoring_generics: bool) -> Vec<String> {
        let Some(id) = self.lookup(name) else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut cursor = self.entries[id].parent;
        while let Some(current) = cursor {
            let entry = &self.entries[current];
            if !(ignoring_generics && entry.ignore_generic) {
                chain.push(entry.name.clone());
            }
            cursor = entry.parent;
        }
        chain.reverse();
        chain
    }

    /// Immediate children. With `ignoring_generics`, a generic child is
    /// replaced by its own children, recursively.
    pub fn children(&self, name: &str, ignoring_generics: bool) -> Vec<String> {
        let Some(id) = self.lookup(name) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        self.collect_children(id, ignoring_generics, &mut names);
        names
    }

    /// Canonical insertion order below `name`: every descendant in pre-order.
    pub fn child_order(&self, name: &str, ignoring_generics: bool) -> Vec<String> {
        let Some(id) = self.lookup(name) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        self.collect_descendants(id, ignoring_generics, &mut names);
        names
    }

    /// Canonical order of nodes that may appear at the top of a food's forest.
    pub fn top_level_order(&self) -> Vec<String> {
        match self.root_name() {
            Some(root) => self.child_order(root, true),
            None => Vec::new(),
        }
    }

    /// Position of `child` within `child_order(parent)`. `parent = None`
    /// means the top level.
    pub fn canonical_index(&self, parent: Option<&str>, child: &str) -> Option<usize> {
        let order = match parent {
            Some(parent) => self.child_order(parent, true),
            None => self.top_level_order(),
        };
        order
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(child))
    }

    /// Ancestors (generics excluded) followed by the canonical leaf name.
    ///
    /// Empty when `name` is unknown or is a generic grouping node.
    pub fn full_path(&self, name: &str) -> Vec<String> {
        let Some(id) = self.lookup(name) else {
            return Vec::new();
        };
        let entry = &self.entries[id];
        if entry.ignore_generic {
            return Vec::new();
        }
        let mut path = self.parent_chain(name, true);
        path.push(entry.name.clone());
        path
    }

    /// Every non-generic name in canonical order.
    pub fn addable_names(&self) -> Vec<String> {
        self.top_level_order()
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.trim().to_lowercase()).copied()
    }

    fn collect_children(&self, id: usize, ignoring_generics: bool, out: &mut Vec<String>) {
        for child in &self.entries[id].children {
            let entry = &self.entries[*child];
            if ignoring_generics && entry.ignore_generic {
                self.collect_children(*child, ignoring_generics, out);
            } else {
                out.push(entry.name.clone());
            }
        }
    }

    fn collect_descendants(&self, id: usize, ignoring_generics: bool, out: &mut Vec<String>) {
        for child in &self.entries[id].children {
            let entry = &self.entries[*child];
            if !(ignoring_generics && entry.ignore_generic) {
                out.push(entry.name.clone());
            }
            self.collect_descendants(*child, ignoring_generics, out);
        }
    }
}
