//! Food record aggregate.
//!
//! # Responsibility
//! - Own a forest of top-level nutrient trees, ingredient references and
//!   calories for one version of a food.
//! - Orchestrate taxonomy-path creation and ingredient-driven adjustments.
//!
//! # Invariants
//! - `identity` is a non-nil UUID that never changes for a food.
//! - `version` starts at 1; the store decides when it advances.
//! - `calories` never goes below zero.
//! - A food never contains itself through any chain of ingredients.
//!
//! Ingredient-driven adjustments are intentionally shallow: multiplier
//! changes touch top-level nodes and their direct children, removal touches
//! top-level nodes only.

use crate::model::nutrient::NutrientNode;
use crate::model::unit::{grams_eq, MassUnit};
use crate::taxonomy::TaxonomyIndex;
use log::warn;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identity shared by every version of one food.
pub type FoodId = Uuid;

/// Per-identity version number, starting at 1.
pub type Version = u32;

/// Composite identity of one immutable snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    pub food_id: FoodId,
    pub version: Version,
}

impl VersionKey {
    pub fn new(food_id: FoodId, version: Version) -> Self {
        Self { food_id, version }
    }
}

impl Display for VersionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#v{}", self.food_id, self.version)
    }
}

/// Serving metadata carried with every version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServingInfo {
    /// Free-form label such as `1 cup` or `2 slices`.
    pub description: Option<String>,
    /// Gram weight of one serving, when known.
    pub grams: Option<f64>,
}

/// Reference to another food pinned at the version seen when it was added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientRef {
    /// Snapshot of the ingredient at the pinned version.
    pub food: FoodRecord,
    pub serving_multiplier: f64,
}

impl IngredientRef {
    pub fn key(&self) -> VersionKey {
        self.food.composite_id()
    }
}

/// Validation and graph errors raised by record operations.
#[derive(Debug, Clone, PartialEq)]
pub enum FoodError {
    NilIdentity,
    ZeroVersion,
    NegativeCalories(i64),
    InvalidAmount(String),
    InvalidMultiplier(f64),
    CircularIngredient {
        food_id: FoodId,
        ingredient_id: FoodId,
    },
    IngredientNotFound(FoodId),
}

impl Display for FoodError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NilIdentity => write!(f, "food identity must not be nil"),
            Self::ZeroVersion => write!(f, "food version must be >= 1"),
            Self::NegativeCalories(value) => write!(f, "calories must be >= 0, got {value}"),
            Self::InvalidAmount(name) => {
                write!(f, "nutrient `{name}` has a negative or non-finite amount")
            }
            Self::InvalidMultiplier(value) => {
                write!(f, "serving multiplier must be finite and >= 0, got {value}")
            }
            Self::CircularIngredient {
                food_id,
                ingredient_id,
            } => write!(
                f,
                "adding ingredient {ingredient_id} to {food_id} would create a cycle"
            ),
            Self::IngredientNotFound(id) => write!(f, "ingredient not found: {id}"),
        }
    }
}

impl Error for FoodError {}

/// One version of a food: calories, nutrient forest and ingredients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodRecord {
    pub identity: FoodId,
    pub version: Version,
    pub name: String,
    pub calories: i64,
    #[serde(default)]
    pub nutrients: Vec<NutrientNode>,
    #[serde(default)]
    pub ingredients: Vec<IngredientRef>,
    #[serde(default)]
    pub serving: ServingInfo,
}

impl FoodRecord {
    /// Creates an unsaved version-1 record with a fresh identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identity: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            calories: 0,
            nutrients: Vec::new(),
            ingredients: Vec::new(),
            serving: ServingInfo::default(),
        }
    }

    /// Creates a version-1 record with a caller-provided identity.
    pub fn with_id(identity: FoodId, name: impl Into<String>) -> Result<Self, FoodError> {
        if identity.is_nil() {
            return Err(FoodError::NilIdentity);
        }
        let mut record = Self::new(name);
        record.identity = identity;
        Ok(record)
    }

    pub fn composite_id(&self) -> VersionKey {
        VersionKey::new(self.identity, self.version)
    }

    /// Sets calories, clamping at zero.
    pub fn set_calories(&mut self, calories: i64) {
        self.calories = calories.max(0);
    }

    pub fn validate(&self) -> Result<(), FoodError> {
        if self.identity.is_nil() {
            return Err(FoodError::NilIdentity);
        }
        if self.version == 0 {
            return Err(FoodError::ZeroVersion);
        }
        if self.calories < 0 {
            return Err(FoodError::NegativeCalories(self.calories));
        }
        if let Some(name) = self
            .nutrients
            .iter()
            .find_map(NutrientNode::first_invalid_amount)
        {
            return Err(FoodError::InvalidAmount(name.to_string()));
        }
        for ingredient in &self.ingredients {
            validate_multiplier(ingredient.serving_multiplier)?;
            ingredient.food.validate()?;
        }
        if self.contains_ingredient(self.identity) {
            return Err(FoodError::CircularIngredient {
                food_id: self.identity,
                ingredient_id: self.identity,
            });
        }
        Ok(())
    }

    /// Depth-first lookup across the forest.
    pub fn find_nutrient(&self, name: &str) -> Option<&NutrientNode> {
        self.nutrients.iter().find_map(|node| node.find(name))
    }

    pub fn find_nutrient_mut(&mut self, name: &str) -> Option<&mut NutrientNode> {
        self.nutrients.iter_mut().find_map(|node| node.find_mut(name))
    }

    /// Canonical gram value of the first node named `name`.
    pub fn total_nutrient_grams(&self, name: &str) -> Option<f64> {
        self.find_nutrient(name).map(NutrientNode::total_in_grams)
    }

    /// Adds a nutrient along its taxonomy path.
    ///
    /// Returns `true` when new nodes were created. When a node with the same
    /// name already exists the value is merged into it and `false` is
    /// returned; `propagate_amounts` then also raises its ancestors.
    pub fn create_nutrient_chain(
        &mut self,
        taxonomy: &TaxonomyIndex,
        nutrient: &NutrientNode,
        propagate_amounts: bool,
    ) -> bool {
        if self.find_nutrient(&nutrient.name).is_some() {
            self.merge_existing(taxonomy, nutrient, propagate_amounts);
            return false;
        }

        let path = taxonomy.full_path(&nutrient.name);
        let Some(root_name) = path.first() else {
            warn!(
                "event=taxonomy_miss module=food status=skipped op=create_chain nutrient={}",
                nutrient.name
            );
            return false;
        };

        if let Some(root) = self
            .nutrients
            .iter_mut()
            .find(|node| node.is_named(root_name))
        {
            return root.add(nutrient, propagate_amounts, true, false, taxonomy);
        }

        match NutrientNode::chain(&path, nutrient) {
            Some(chain) => {
                self.insert_top_level(chain, taxonomy);
                true
            }
            None => false,
        }
    }

    fn merge_existing(
        &mut self,
        taxonomy: &TaxonomyIndex,
        nutrient: &NutrientNode,
        propagate_amounts: bool,
    ) {
        if propagate_amounts {
            if let Some(root) = self
                .nutrients
                .iter_mut()
                .find(|node| node.contains(&nutrient.name))
            {
                if root.add(nutrient, true, true, false, taxonomy) {
                    return;
                }
            }
        }
        if let Some(node) = self.find_nutrient_mut(&nutrient.name) {
            node.merge(nutrient, true, true, taxonomy);
        }
    }

    /// Inserts `node` at its canonical top-level position.
    pub fn insert_top_level(&mut self, node: NutrientNode, taxonomy: &TaxonomyIndex) {
        let position = match taxonomy.canonical_index(None, &node.name) {
            Some(target) => self
                .nutrients
                .iter()
                .position(|existing| {
                    taxonomy
                        .canonical_index(None, &existing.name)
                        .is_some_and(|index| index > target)
                })
                .unwrap_or(self.nutrients.len()),
            None => self.nutrients.len(),
        };
        self.nutrients.insert(position, node);
    }

    /// Delegates to the first top-level tree containing `name`.
    pub fn modify_nutrient(
        &mut self,
        name: &str,
        new_amount: Option<f64>,
        new_unit: Option<MassUnit>,
        optimize_ancestors: bool,
    ) -> bool {
        self.nutrients
            .iter_mut()
            .any(|node| node.modify(name, new_amount, new_unit, optimize_ancestors))
    }

    /// Removes a top-level entry, or a descendant via its top-level tree.
    pub fn delete_nutrient(
        &mut self,
        name: &str,
        adjust_amounts: bool,
        optimize_unit: bool,
    ) -> bool {
        if let Some(position) = self.nutrients.iter().position(|node| node.is_named(name)) {
            self.nutrients.remove(position);
            return true;
        }
        self.nutrients
            .iter_mut()
            .any(|node| node.delete_child_nutrient(name, adjust_amounts, optimize_unit))
    }

    /// Recalculates every top-level tree from its leaves.
    pub fn recalculate(&mut self, optimize_unit: bool) {
        for node in &mut self.nutrients {
            node.recalculate_tree(optimize_unit);
        }
    }

    /// Appends `ingredient` at multiplier 1 and adds its calories.
    ///
    /// Fails before any mutation when the ingredient is this food or
    /// already contains it.
    pub fn add_ingredient(
        &mut self,
        taxonomy: &TaxonomyIndex,
        ingredient: FoodRecord,
        add_nutrients: bool,
    ) -> Result<(), FoodError> {
        if ingredient.identity == self.identity || ingredient.contains_ingredient(self.identity) {
            return Err(FoodError::CircularIngredient {
                food_id: self.identity,
                ingredient_id: ingredient.identity,
            });
        }

        self.set_calories(self.calories.saturating_add(ingredient.calories));
        if add_nutrients {
            for nutrient in &ingredient.nutrients {
                match self.find_nutrient_mut(&nutrient.name) {
                    Some(existing) => existing.merge(nutrient, true, true, taxonomy),
                    None => self.insert_top_level(nutrient.detached(), taxonomy),
                }
            }
        }
        self.ingredients.push(IngredientRef {
            food: ingredient,
            serving_multiplier: 1.0,
        });
        Ok(())
    }

    /// Changes an ingredient's multiplier and applies the difference to
    /// calories and to shallow nutrient matches.
    pub fn modify_ingredient(
        &mut self,
        ingredient_id: FoodId,
        new_multiplier: f64,
    ) -> Result<(), FoodError> {
        validate_multiplier(new_multiplier)?;
        let position = self.ingredient_position(ingredient_id)?;
        let old_multiplier = self.ingredients[position].serving_multiplier;
        self.ingredients[position].serving_multiplier = new_multiplier;

        let factor = new_multiplier - old_multiplier;
        if factor == 0.0 {
            return Ok(());
        }
        let ingredient = self.ingredients[position].food.clone();
        self.set_calories(
            self.calories
                .saturating_add(scaled_calories(factor, ingredient.calories)),
        );

        for top in &ingredient.nutrients {
            self.adjust_shallow_match(top, factor);
            for child in &top.children {
                self.adjust_shallow_match(child, factor);
            }
        }
        Ok(())
    }

    /// Removes an ingredient and subtracts its scaled calories and, when
    /// asked, its scaled top-level nutrients.
    pub fn remove_ingredient(
        &mut self,
        ingredient_id: FoodId,
        subtract_nutrients: bool,
    ) -> Result<IngredientRef, FoodError> {
        let position = self.ingredient_position(ingredient_id)?;
        let removed = self.ingredients.remove(position);
        let multiplier = removed.serving_multiplier;
        self.set_calories(
            self.calories
                .saturating_sub(scaled_calories(multiplier, removed.food.calories)),
        );

        if subtract_nutrients {
            for nutrient in &removed.food.nutrients {
                if let Some(target) = self
                    .nutrients
                    .iter_mut()
                    .find(|node| node.is_named(&nutrient.name))
                {
                    target.adjust_grams(-(multiplier * nutrient.grams()), true);
                }
            }
        }
        Ok(removed)
    }

    /// Re-pins an ingredient to `updated`, swapping its scaled contribution.
    ///
    /// The old snapshot's calories and nutrients are taken out and the new
    /// ones merged in at the ref's current multiplier, with the same
    /// non-propagating semantics `add_ingredient` used. Returns the replaced
    /// ref.
    pub fn replace_ingredient(
        &mut self,
        taxonomy: &TaxonomyIndex,
        updated: FoodRecord,
    ) -> Result<IngredientRef, FoodError> {
        if updated.identity == self.identity || updated.contains_ingredient(self.identity) {
            return Err(FoodError::CircularIngredient {
                food_id: self.identity,
                ingredient_id: updated.identity,
            });
        }
        let position = self.ingredient_position(updated.identity)?;
        let multiplier = self.ingredients[position].serving_multiplier;
        let previous = std::mem::replace(
            &mut self.ingredients[position],
            IngredientRef {
                food: updated,
                serving_multiplier: multiplier,
            },
        );
        let updated = &self.ingredients[position].food;
        let calorie_delta = scaled_calories(multiplier, updated.calories)
            .saturating_sub(scaled_calories(multiplier, previous.food.calories));
        let added: Vec<NutrientNode> = updated
            .nutrients
            .iter()
            .map(|nutrient| nutrient.scaled(multiplier))
            .collect();

        self.set_calories(self.calories.saturating_add(calorie_delta));
        for nutrient in &previous.food.nutrients {
            let removed = nutrient.scaled(multiplier);
            if let Some(existing) = self.find_nutrient_mut(&removed.name) {
                existing.subtract(&removed, true);
            }
        }
        for nutrient in added {
            match self.find_nutrient_mut(&nutrient.name) {
                Some(existing) => existing.merge(&nutrient, true, true, taxonomy),
                None => self.insert_top_level(nutrient, taxonomy),
            }
        }
        Ok(previous)
    }

    /// Whether `candidate` appears anywhere in the ingredient graph.
    pub fn contains_ingredient(&self, candidate: FoodId) -> bool {
        self.ingredients.iter().any(|ingredient| {
            ingredient.food.identity == candidate || ingredient.food.contains_ingredient(candidate)
        })
    }

    /// Deep value equality ignoring version numbers and storage ids.
    pub fn is_equivalent(&self, other: &FoodRecord) -> bool {
        self.identity == other.identity
            && self.name == other.name
            && self.calories == other.calories
            && self.serving == other.serving
            && self.nutrients.len() == other.nutrients.len()
            && self
                .nutrients
                .iter()
                .zip(&other.nutrients)
                .all(|(left, right)| left.is_equivalent(right))
            && self.ingredients.len() == other.ingredients.len()
            && self
                .ingredients
                .iter()
                .zip(&other.ingredients)
                .all(|(left, right)| {
                    left.key() == right.key()
                        && grams_eq(left.serving_multiplier, right.serving_multiplier)
                })
    }

    fn ingredient_position(&self, ingredient_id: FoodId) -> Result<usize, FoodError> {
        self.ingredients
            .iter()
            .position(|ingredient| ingredient.food.identity == ingredient_id)
            .ok_or(FoodError::IngredientNotFound(ingredient_id))
    }

    fn adjust_shallow_match(&mut self, nutrient: &NutrientNode, factor: f64) {
        let delta = factor * nutrient.grams();
        let target = match self
            .nutrients
            .iter()
            .position(|node| node.is_named(&nutrient.name))
        {
            Some(position) => Some(&mut self.nutrients[position]),
            None => self
                .nutrients
                .iter_mut()
                .flat_map(|top| top.children.iter_mut())
                .find(|child| child.is_named(&nutrient.name)),
        };
        if let Some(target) = target {
            target.adjust_grams(delta, true);
        }
    }
}

fn validate_multiplier(value: f64) -> Result<(), FoodError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FoodError::InvalidMultiplier(value))
    }
}

fn scaled_calories(multiplier: f64, calories: i64) -> i64 {
    (multiplier * calories as f64).round() as i64
}
