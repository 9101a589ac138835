//! Nutrient tree engine.
//!
//! # Responsibility
//! - Hold one nutrient amount and its breakdown into sub-nutrients.
//! - Own all unit-aware arithmetic: deltas, ancestor propagation and unit
//!   auto-scaling.
//!
//! # Invariants
//! - `amount` is finite and non-negative.
//! - A node's stored `amount` is its canonical value; children are a
//!   breakdown that may be partial. Every mutation applies its gram delta to
//!   each ancestor on the path, so no path leaves an ancestor stale.
//! - `recalculate_tree` is the only operation that overwrites stored amounts
//!   with children sums.
//! - Gram values produced by a delta are rounded to 6 decimal places before
//!   they are re-expressed in the node unit.
//!
//! Mutations return the applied gram delta up the recursion instead of
//! holding references to ancestors.

use crate::model::unit::{grams_eq, round_grams, MassUnit};
use crate::taxonomy::TaxonomyIndex;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Storage row id of a persisted nutrient node.
pub type NutrientNodeId = i64;

/// One nutrient amount with an ordered breakdown into children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientNode {
    pub name: String,
    pub amount: f64,
    pub unit: MassUnit,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NutrientNode>,
    /// Row id when this node was loaded from the store. Never compared by
    /// `is_equivalent`.
    #[serde(skip)]
    pub stored_id: Option<NutrientNodeId>,
}

impl NutrientNode {
    /// Creates a childless node. Negative or non-finite amounts become zero.
    pub fn new(name: impl Into<String>, amount: f64, unit: MassUnit) -> Self {
        Self {
            name: name.into(),
            amount: sanitize_amount(amount),
            unit,
            children: Vec::new(),
            stored_id: None,
        }
    }

    /// Builder helper that appends `child` as-is.
    pub fn with_child(mut self, child: NutrientNode) -> Self {
        self.children.push(child);
        self
    }

    /// Builds a linear chain along `path` ending in a copy of `leaf`.
    ///
    /// Intermediate nodes take the leaf amount and unit. The leaf is renamed
    /// to the last path element so canonical spelling wins.
    pub fn chain(path: &[String], leaf: &NutrientNode) -> Option<Self> {
        let (last, ancestors) = path.split_last()?;
        let mut node = leaf.detached();
        node.name = last.clone();
        for name in ancestors.iter().rev() {
            node = NutrientNode::new(name.clone(), leaf.amount, leaf.unit).with_child(node);
        }
        Some(node)
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }

    /// Own amount in grams.
    pub fn grams(&self) -> f64 {
        self.unit.to_grams(self.amount)
    }

    /// Canonical gram value of this node, rounded to storage precision.
    ///
    /// After `recalculate_tree` this equals `leaf_total_in_grams`.
    pub fn total_in_grams(&self) -> f64 {
        round_grams(self.grams())
    }

    /// Gram sum over leaf descendants, or own grams for a leaf.
    pub fn leaf_total_in_grams(&self) -> f64 {
        if self.children.is_empty() {
            return round_grams(self.grams());
        }
        round_grams(
            self.children
                .iter()
                .map(NutrientNode::leaf_total_in_grams)
                .sum(),
        )
    }

    /// Number of nodes in this subtree, self included.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(NutrientNode::node_count)
            .sum::<usize>()
    }

    /// Depth-first lookup, self first.
    pub fn find(&self, name: &str) -> Option<&NutrientNode> {
        if self.is_named(name) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut NutrientNode> {
        if self.is_named(name) {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Sets the node to `grams`, rounding and optionally re-picking the unit.
    pub fn set_grams(&mut self, grams: f64, optimize_unit: bool) {
        let grams = sanitize_amount(round_grams(grams));
        if optimize_unit {
            self.unit = MassUnit::best_for_grams(grams);
        }
        self.amount = round_grams(self.unit.from_grams(grams));
    }

    /// Adds a (possibly negative) gram delta, clamping at zero.
    pub fn adjust_grams(&mut self, delta_grams: f64, optimize_unit: bool) {
        self.set_grams(self.grams() + delta_grams, optimize_unit);
    }

    /// Re-expresses the amount in its most readable unit.
    pub fn optimize_unit(&mut self) {
        self.set_grams(self.grams(), true);
    }

    /// Copy with storage ids cleared, for insertion into another tree.
    pub fn detached(&self) -> NutrientNode {
        NutrientNode {
            name: self.name.clone(),
            amount: self.amount,
            unit: self.unit,
            children: self.children.iter().map(NutrientNode::detached).collect(),
            stored_id: None,
        }
    }

    /// Detached copy with every amount multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> NutrientNode {
        let mut node = NutrientNode::new(
            self.name.clone(),
            round_grams(self.amount * factor),
            self.unit,
        );
        node.children = self
            .children
            .iter()
            .map(|child| child.scaled(factor))
            .collect();
        node
    }

    /// Sets a new amount and/or unit on the first node named `target_name`.
    ///
    /// Without `new_unit`, the new value is a gram amount and the result is
    /// auto-scaled. An explicit `new_unit` is kept verbatim.
    /// The gram delta is applied to every ancestor; `optimize_ancestors`
    /// lets ancestors re-pick their unit.
    pub fn modify(
        &mut self,
        target_name: &str,
        new_amount: Option<f64>,
        new_unit: Option<MassUnit>,
        optimize_ancestors: bool,
    ) -> bool {
        self.modify_with_delta(target_name, new_amount, new_unit, optimize_ancestors)
            .is_some()
    }

    fn modify_with_delta(
        &mut self,
        target_name: &str,
        new_amount: Option<f64>,
        new_unit: Option<MassUnit>,
        optimize_ancestors: bool,
    ) -> Option<f64> {
        if self.is_named(target_name) {
            let old_grams = self.grams();
            match new_unit {
                Some(unit) => {
                    self.unit = unit;
                    self.amount = round_grams(sanitize_amount(new_amount.unwrap_or(self.amount)));
                }
                None => {
                    let grams = sanitize_amount(new_amount.unwrap_or(old_grams));
                    self.set_grams(grams, true);
                }
            }
            return Some(round_grams(old_grams - self.grams()));
        }

        for child in &mut self.children {
            if let Some(delta) =
                child.modify_with_delta(target_name, new_amount, new_unit, optimize_ancestors)
            {
                if delta != 0.0 {
                    self.adjust_grams(-delta, optimize_ancestors);
                }
                return Some(delta);
            }
        }
        None
    }

    /// Adds `other` into this tree.
    ///
    /// With `direct_insert`, `other` becomes (or merges into) an immediate
    /// child. Otherwise its taxonomy path is walked from this node, creating
    /// missing intermediate nodes with `other`'s amount and unit. With
    /// `adjust_amounts`, every traversed node receives `other`'s grams.
    ///
    /// Returns `false` when `other` is not in the taxonomy or its path does
    /// not pass through this node.
    pub fn add(
        &mut self,
        other: &NutrientNode,
        adjust_amounts: bool,
        optimize_unit: bool,
        direct_insert: bool,
        taxonomy: &TaxonomyIndex,
    ) -> bool {
        if direct_insert {
            if adjust_amounts {
                self.adjust_grams(other.grams(), optimize_unit);
            }
            self.attach_child(other, adjust_amounts, optimize_unit, taxonomy);
            return true;
        }

        let path = taxonomy.full_path(&other.name);
        if path.is_empty() {
            warn!(
                "event=taxonomy_miss module=nutrient status=skipped op=add nutrient={}",
                other.name
            );
            return false;
        }
        let Some(start) = path.iter().position(|name| self.is_named(name)) else {
            warn!(
                "event=path_mismatch module=nutrient status=skipped op=add node={} nutrient={}",
                self.name, other.name
            );
            return false;
        };

        self.add_along_path(&path[start + 1..], other, adjust_amounts, optimize_unit, taxonomy);
        true
    }

    /// Merges `other` into this same-named node: adds its grams (when
    /// `adjust_amounts`) and attaches its children recursively.
    pub fn merge(
        &mut self,
        other: &NutrientNode,
        adjust_amounts: bool,
        optimize_unit: bool,
        taxonomy: &TaxonomyIndex,
    ) {
        if adjust_amounts {
            self.adjust_grams(other.grams(), optimize_unit);
        }
        for child in &other.children {
            self.attach_child(child, adjust_amounts, optimize_unit, taxonomy);
        }
    }

    fn add_along_path(
        &mut self,
        rest: &[String],
        other: &NutrientNode,
        adjust_amounts: bool,
        optimize_unit: bool,
        taxonomy: &TaxonomyIndex,
    ) {
        let Some((next, tail)) = rest.split_first() else {
            self.merge(other, adjust_amounts, optimize_unit, taxonomy);
            return;
        };

        if adjust_amounts {
            self.adjust_grams(other.grams(), optimize_unit);
        }
        if let Some(child) = self.children.iter_mut().find(|child| child.is_named(next)) {
            child.add_along_path(tail, other, adjust_amounts, optimize_unit, taxonomy);
            return;
        }
        if let Some(created) = NutrientNode::chain(rest, other) {
            let position = self.insert_position(next, taxonomy);
            self.children.insert(position, created);
        }
    }

    fn attach_child(
        &mut self,
        other: &NutrientNode,
        adjust_amounts: bool,
        optimize_unit: bool,
        taxonomy: &TaxonomyIndex,
    ) {
        if let Some(existing) = self
            .children
            .iter_mut()
            .find(|child| child.is_named(&other.name))
        {
            existing.merge(other, adjust_amounts, optimize_unit, taxonomy);
            return;
        }
        let position = self.insert_position(&other.name, taxonomy);
        self.children.insert(position, other.detached());
    }

    /// Index before the first child whose canonical position exceeds `name`'s.
    fn insert_position(&self, name: &str, taxonomy: &TaxonomyIndex) -> usize {
        let Some(target) = taxonomy.canonical_index(Some(&self.name), name) else {
            return self.children.len();
        };
        self.children
            .iter()
            .position(|child| {
                taxonomy
                    .canonical_index(Some(&self.name), &child.name)
                    .is_some_and(|index| index > target)
            })
            .unwrap_or(self.children.len())
    }

    /// Removes `other`'s grams from the matching node and every ancestor on
    /// the way to it, then recurses into `other`'s children that exist here.
    /// Never creates nodes.
    pub fn subtract(&mut self, other: &NutrientNode, optimize_unit: bool) -> bool {
        self.subtract_with_delta(other, optimize_unit).is_some()
    }

    fn subtract_with_delta(&mut self, other: &NutrientNode, optimize_unit: bool) -> Option<f64> {
        if self.is_named(&other.name) {
            let before = self.grams();
            self.adjust_grams(-other.grams(), optimize_unit);
            for other_child in &other.children {
                if let Some(child) = self
                    .children
                    .iter_mut()
                    .find(|child| child.is_named(&other_child.name))
                {
                    child.subtract_with_delta(other_child, optimize_unit);
                }
            }
            return Some(round_grams(before - self.grams()));
        }

        for child in &mut self.children {
            if let Some(removed) = child.subtract_with_delta(other, optimize_unit) {
                if removed != 0.0 {
                    self.adjust_grams(-removed, optimize_unit);
                }
                return Some(removed);
            }
        }
        None
    }

    /// Removes the first descendant named `target_name`.
    ///
    /// With `adjust_amounts`, the removed subtree's grams are subtracted from
    /// every ancestor, this node included.
    pub fn delete_child_nutrient(
        &mut self,
        target_name: &str,
        adjust_amounts: bool,
        optimize_unit: bool,
    ) -> bool {
        self.delete_with_delta(target_name, adjust_amounts, optimize_unit)
            .is_some()
    }

    fn delete_with_delta(
        &mut self,
        target_name: &str,
        adjust_amounts: bool,
        optimize_unit: bool,
    ) -> Option<f64> {
        if let Some(position) = self
            .children
            .iter()
            .position(|child| child.is_named(target_name))
        {
            let removed = self.children.remove(position);
            let grams = removed.total_in_grams();
            if adjust_amounts {
                self.adjust_grams(-grams, optimize_unit);
            }
            return Some(grams);
        }

        for child in &mut self.children {
            if let Some(grams) = child.delete_with_delta(target_name, adjust_amounts, optimize_unit)
            {
                if adjust_amounts {
                    self.adjust_grams(-grams, optimize_unit);
                }
                return Some(grams);
            }
        }
        None
    }

    /// Bottom-up: every node with children takes the gram sum of its
    /// children.
    pub fn recalculate_tree(&mut self, optimize_unit: bool) {
        for child in &mut self.children {
            child.recalculate_tree(optimize_unit);
        }
        if !self.children.is_empty() {
            let sum = self.children.iter().map(NutrientNode::grams).sum();
            self.set_grams(sum, optimize_unit);
        }
    }

    /// Like `recalculate_tree`, but nodes whose lowercase name is in
    /// `observed` keep their stored amount.
    pub fn recalculate_unobserved(&mut self, observed: &HashSet<String>, optimize_unit: bool) {
        for child in &mut self.children {
            child.recalculate_unobserved(observed, optimize_unit);
        }
        if !self.children.is_empty() && !observed.contains(&self.name.trim().to_lowercase()) {
            let sum = self.children.iter().map(NutrientNode::grams).sum();
            self.set_grams(sum, optimize_unit);
        }
    }

    /// Value equality: names, units, rounded amounts and children in order.
    pub fn is_equivalent(&self, other: &NutrientNode) -> bool {
        self.is_named(&other.name)
            && self.unit == other.unit
            && grams_eq(self.amount, other.amount)
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(left, right)| left.is_equivalent(right))
    }

    /// Checks amounts recursively; used by record validation.
    pub(crate) fn first_invalid_amount(&self) -> Option<&str> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Some(self.name.as_str());
        }
        self.children
            .iter()
            .find_map(NutrientNode::first_invalid_amount)
    }
}

fn sanitize_amount(amount: f64) -> f64 {
    if amount.is_finite() && amount > 0.0 {
        amount
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::NutrientNode;
    use crate::model::unit::MassUnit;
    use crate::taxonomy::TaxonomyIndex;
    use std::collections::HashSet;

    fn fat_with_saturated() -> NutrientNode {
        NutrientNode::new("Fat", 14.0, MassUnit::Grams)
            .with_child(NutrientNode::new("SaturatedFat", 1.0, MassUnit::Grams))
    }

    #[test]
    fn modify_child_propagates_delta_to_parent() {
        let mut fat = fat_with_saturated();
        assert!(fat.modify("SaturatedFat", Some(2.0), None, true));
        assert_eq!(fat.amount, 15.0);
        assert_eq!(fat.children[0].amount, 2.0);
    }

    #[test]
    fn modify_twice_with_same_value_is_idempotent() {
        let mut once = fat_with_saturated();
        once.modify("saturatedfat", Some(3.5), None, true);
        let mut twice = once.clone();
        twice.modify("saturatedfat", Some(3.5), None, true);
        assert_eq!(once, twice);
    }

    #[test]
    fn modify_unknown_name_reports_no_match() {
        let mut fat = fat_with_saturated();
        assert!(!fat.modify("Protein", Some(1.0), None, true));
        assert_eq!(fat, fat_with_saturated());
    }

    #[test]
    fn modify_auto_scales_small_values_to_micrograms() {
        let mut node = NutrientNode::new("VitaminD", 1.0, MassUnit::Grams);
        node.modify("VitaminD", Some(0.0005), None, true);
        assert_eq!(node.unit, MassUnit::Micrograms);
        assert_eq!(node.amount, 500.0);
        assert!((node.grams() - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn repeated_sub_milligram_modify_keeps_value() {
        let mut once = NutrientNode::new("VitaminD", 1.0, MassUnit::Grams);
        once.modify("VitaminD", Some(0.0005), None, true);
        let mut twice = once.clone();
        twice.modify("VitaminD", Some(0.0005), None, true);
        assert_eq!(once, twice);
        assert_eq!(twice.unit, MassUnit::Micrograms);
        assert_eq!(twice.amount, 500.0);
    }

    #[test]
    fn unitless_modify_reads_grams_on_scaled_node() {
        let mut fat = NutrientNode::new("Fat", 1.0, MassUnit::Grams)
            .with_child(NutrientNode::new("Omega-3", 300.0, MassUnit::Milligrams));
        assert!(fat.modify("Omega-3", Some(0.5), None, false));
        assert_eq!(fat.children[0].unit, MassUnit::Milligrams);
        assert_eq!(fat.children[0].amount, 500.0);
        assert_eq!(fat.amount, 1.2);
    }

    #[test]
    fn modify_with_explicit_unit_is_not_rescaled() {
        let mut fat = fat_with_saturated();
        fat.modify("SaturatedFat", Some(1500.0), Some(MassUnit::Milligrams), false);
        let saturated = &fat.children[0];
        assert_eq!(saturated.unit, MassUnit::Milligrams);
        assert_eq!(saturated.amount, 1500.0);
        assert_eq!(fat.amount, 14.5);
        assert_eq!(fat.unit, MassUnit::Grams);
    }

    #[test]
    fn modify_clamps_ancestors_at_zero() {
        let mut fat = NutrientNode::new("Fat", 1.0, MassUnit::Grams)
            .with_child(NutrientNode::new("SaturatedFat", 1.0, MassUnit::Grams));
        fat.modify("SaturatedFat", Some(0.0), None, false);
        assert_eq!(fat.amount, 0.0);
        assert_eq!(fat.children[0].amount, 0.0);
    }

    #[test]
    fn float_residue_is_rounded_away() {
        let mut node = NutrientNode::new("Fat", 0.3, MassUnit::Grams);
        node.adjust_grams(-0.1, false);
        node.adjust_grams(-0.2, false);
        assert_eq!(node.amount, 0.0);
    }

    #[test]
    fn unit_round_trip_preserves_grams() {
        let mut node = NutrientNode::new("Iron", 0.018, MassUnit::Grams);
        node.modify("Iron", Some(18.0), Some(MassUnit::Milligrams), false);
        node.modify("Iron", Some(18000.0), Some(MassUnit::Micrograms), false);
        node.modify("Iron", Some(0.018), Some(MassUnit::Grams), false);
        assert!((node.grams() - 0.018).abs() < 1e-6);
    }

    #[test]
    fn direct_insert_merges_same_named_child() {
        let taxonomy = TaxonomyIndex::builtin();
        let mut fat = fat_with_saturated();
        let extra = NutrientNode::new("SaturatedFat", 0.5, MassUnit::Grams);
        assert!(fat.add(&extra, true, false, true, &taxonomy));
        assert_eq!(fat.children.len(), 1);
        assert_eq!(fat.children[0].amount, 1.5);
        assert_eq!(fat.amount, 14.5);
    }

    #[test]
    fn direct_insert_respects_canonical_order() {
        let taxonomy = TaxonomyIndex::builtin();
        let mut fat = NutrientNode::new("Fat", 10.0, MassUnit::Grams)
            .with_child(NutrientNode::new("UnsaturatedFat", 4.0, MassUnit::Grams));
        let trans = NutrientNode::new("TransFat", 1.0, MassUnit::Grams);
        fat.add(&trans, false, false, true, &taxonomy);
        let saturated = NutrientNode::new("SaturatedFat", 2.0, MassUnit::Grams);
        fat.add(&saturated, false, false, true, &taxonomy);
        let names: Vec<_> = fat.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["SaturatedFat", "TransFat", "UnsaturatedFat"]);
        assert_eq!(fat.amount, 10.0);
    }

    #[test]
    fn add_via_taxonomy_creates_missing_intermediates() {
        let taxonomy = TaxonomyIndex::builtin();
        let mut fat = fat_with_saturated();
        let omega = NutrientNode::new("Omega-3", 0.5, MassUnit::Grams);
        assert!(fat.add(&omega, true, false, false, &taxonomy));

        assert_eq!(fat.amount, 14.5);
        let unsaturated = fat.find("UnsaturatedFat").unwrap();
        assert_eq!(unsaturated.amount, 0.5);
        let poly = unsaturated.find("Polyunsaturated").unwrap();
        assert_eq!(poly.amount, 0.5);
        assert_eq!(poly.children[0].name, "Omega-3");
        assert_eq!(fat.children[0].name, "SaturatedFat");
    }

    #[test]
    fn add_fails_for_unknown_or_unrelated_nutrients() {
        let taxonomy = TaxonomyIndex::builtin();
        let mut fat = fat_with_saturated();
        let unknown = NutrientNode::new("Unobtainium", 1.0, MassUnit::Grams);
        assert!(!fat.add(&unknown, true, false, false, &taxonomy));
        let sugar = NutrientNode::new("Sugars", 1.0, MassUnit::Grams);
        assert!(!fat.add(&sugar, true, false, false, &taxonomy));
        assert_eq!(fat, fat_with_saturated());
    }

    #[test]
    fn subtract_only_touches_existing_nodes() {
        let mut fat = fat_with_saturated();
        let removal = NutrientNode::new("SaturatedFat", 0.25, MassUnit::Grams);
        assert!(fat.subtract(&removal, false));
        assert_eq!(fat.amount, 13.75);
        assert_eq!(fat.children[0].amount, 0.75);

        let missing = NutrientNode::new("TransFat", 1.0, MassUnit::Grams);
        assert!(!fat.subtract(&missing, false));
        assert_eq!(fat.children.len(), 1);
    }

    #[test]
    fn subtract_recurses_into_matching_children() {
        let mut fat = fat_with_saturated();
        let removal = NutrientNode::new("Fat", 4.0, MassUnit::Grams)
            .with_child(NutrientNode::new("SaturatedFat", 0.5, MassUnit::Grams))
            .with_child(NutrientNode::new("TransFat", 0.5, MassUnit::Grams));
        assert!(fat.subtract(&removal, false));
        assert_eq!(fat.amount, 10.0);
        assert_eq!(fat.children[0].amount, 0.5);
        assert_eq!(fat.children.len(), 1);
    }

    #[test]
    fn delete_deep_child_adjusts_every_ancestor() {
        let taxonomy = TaxonomyIndex::builtin();
        let mut fat = fat_with_saturated();
        fat.add(
            &NutrientNode::new("Omega-3", 2.0, MassUnit::Grams),
            true,
            false,
            false,
            &taxonomy,
        );
        assert_eq!(fat.amount, 16.0);

        assert!(fat.delete_child_nutrient("Omega-3", true, false));
        assert_eq!(fat.amount, 14.0);
        let poly = fat.find("Polyunsaturated").unwrap();
        assert!(poly.children.is_empty());
        assert_eq!(poly.amount, 0.0);
        assert!(!fat.delete_child_nutrient("Omega-3", true, false));
    }

    #[test]
    fn recalculate_then_total_matches_leaf_sum() {
        let mut fat = NutrientNode::new("Fat", 99.0, MassUnit::Grams)
            .with_child(NutrientNode::new("SaturatedFat", 1.5, MassUnit::Grams))
            .with_child(
                NutrientNode::new("UnsaturatedFat", 42.0, MassUnit::Grams)
                    .with_child(NutrientNode::new("Monounsaturated", 300.0, MassUnit::Milligrams))
                    .with_child(NutrientNode::new("Polyunsaturated", 0.2, MassUnit::Grams)),
            );
        let leaf_sum = fat.leaf_total_in_grams();
        fat.recalculate_tree(true);
        assert_eq!(fat.total_in_grams(), leaf_sum);
        assert_eq!(fat.total_in_grams(), 2.0);
        let unsaturated = fat.find("UnsaturatedFat").unwrap();
        assert_eq!(unsaturated.unit, MassUnit::Milligrams);
        assert_eq!(unsaturated.amount, 500.0);
    }

    #[test]
    fn recalculate_unobserved_keeps_observed_parents() {
        let mut fat = NutrientNode::new("Fat", 9.0, MassUnit::Grams).with_child(
            NutrientNode::new("UnsaturatedFat", 7.0, MassUnit::Grams)
                .with_child(NutrientNode::new("Polyunsaturated", 3.0, MassUnit::Grams)),
        );
        let observed: HashSet<String> = ["fat".to_string(), "polyunsaturated".to_string()]
            .into_iter()
            .collect();
        fat.recalculate_unobserved(&observed, false);
        assert_eq!(fat.amount, 9.0);
        assert_eq!(fat.children[0].amount, 3.0);
    }

    #[test]
    fn scaled_copy_multiplies_every_level() {
        let mut fat = fat_with_saturated();
        fat.stored_id = Some(9);
        let doubled = fat.scaled(2.0);
        assert_eq!(doubled.amount, 28.0);
        assert_eq!(doubled.children[0].amount, 2.0);
        assert_eq!(doubled.stored_id, None);
        assert_eq!(fat.amount, 14.0);
    }

    #[test]
    fn chain_uses_canonical_names_and_leaf_amounts() {
        let path = vec!["Fat".to_string(), "UnsaturatedFat".to_string(), "Omega-3".to_string()];
        let leaf = NutrientNode::new("omega-3", 250.0, MassUnit::Milligrams);
        let chain = NutrientNode::chain(&path, &leaf).unwrap();
        assert_eq!(chain.name, "Fat");
        assert_eq!(chain.unit, MassUnit::Milligrams);
        assert_eq!(chain.amount, 250.0);
        assert_eq!(chain.node_count(), 3);
        assert_eq!(chain.find("Omega-3").unwrap().name, "Omega-3");
    }
}
