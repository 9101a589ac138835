//! Cancellable, all-or-nothing application of scanned nutrient values.
//!
//! # Responsibility
//! - Turn extracted `{name, amount, unit}` candidates into record edits.
//! - Reconcile taxonomy ancestors that were not observed directly.
//! - Commit the reconciled record through one store update.
//!
//! # Invariants
//! - Edits are applied to a private copy; the caller's record is never
//!   touched.
//! - Cancellation is checked before every batch and once before returning;
//!   a cancelled scan commits nothing.
//! - Observed values are kept verbatim (explicit unit, no auto-scaling).

use crate::model::food::{FoodId, FoodRecord};
use crate::model::nutrient::NutrientNode;
use crate::model::unit::MassUnit;
use crate::repo::food_repo::FoodRepository;
use crate::service::versioned_store::{StoreError, UpdateOutcome, VersionedStore};
use crate::taxonomy::TaxonomyIndex;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+(?:[.,]\d+)?)\s*([A-Za-zµμ]*)\.?\s*$").expect("valid quantity regex")
});

/// One extracted value, as produced by the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    pub name: String,
    pub amount: f64,
    pub unit: MassUnit,
}

impl ScanCandidate {
    /// Unit text is parsed leniently; unknown units mean grams.
    pub fn new(name: impl Into<String>, amount: f64, unit_text: &str) -> Self {
        Self {
            name: name.into(),
            amount,
            unit: MassUnit::parse_lenient(unit_text),
        }
    }

    /// Parses a label quantity such as `1.5 mg`, `12g` or `0,4 mcg`.
    pub fn parse(name: impl Into<String>, quantity: &str) -> Option<Self> {
        let captures = QUANTITY_RE.captures(quantity)?;
        let amount = captures
            .get(1)?
            .as_str()
            .replace(',', ".")
            .parse::<f64>()
            .ok()?;
        let unit_text = captures.get(2).map_or("", |unit| unit.as_str());
        Some(Self::new(name, amount, unit_text))
    }
}

/// Candidates delivered together by the producer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanBatch {
    pub candidates: Vec<ScanCandidate>,
}

impl ScanBatch {
    pub fn new(candidates: Vec<ScanCandidate>) -> Self {
        Self { candidates }
    }
}

/// Complete producer output: batches plus the label's calorie total.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanResult {
    pub batches: Vec<ScanBatch>,
    pub total_calories: Option<i64>,
}

/// Cooperative cancellation flag shared with the producer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reconciled record plus per-candidate counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub record: FoodRecord,
    /// Candidates that created a new taxonomy chain or node.
    pub created: usize,
    /// Candidates that overwrote an existing node.
    pub modified: usize,
    /// Candidates with unknown or generic names.
    pub skipped: usize,
}

/// Errors from scan application.
#[derive(Debug)]
pub enum ScanError {
    /// Cancelled after `applied_batches` batches; nothing was committed.
    Cancelled { applied_batches: usize },
    Store(StoreError),
}

impl Display for ScanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled { applied_batches } => {
                write!(f, "scan cancelled after {applied_batches} batch(es)")
            }
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ScanError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Cancelled { .. } => None,
        }
    }
}

impl From<StoreError> for ScanError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Applies `scan` to a copy of `record`. See `apply_scan_with_progress`.
pub fn apply_scan(
    record: &FoodRecord,
    scan: &ScanResult,
    taxonomy: &TaxonomyIndex,
    cancel: &CancelToken,
) -> Result<ScanOutcome, ScanError> {
    apply_scan_with_progress(record, scan, taxonomy, cancel, |_| {})
}

/// Applies `scan` to a copy of `record`, calling `on_batch` with the number
/// of batches applied so far after each one.
///
/// Existing nutrients are overwritten with the observed amount and unit;
/// new ones are created along their taxonomy path without propagation. A
/// single reconciliation pass then recomputes every ancestor that was not
/// itself observed, and the calorie total replaces the record's calories.
pub fn apply_scan_with_progress(
    record: &FoodRecord,
    scan: &ScanResult,
    taxonomy: &TaxonomyIndex,
    cancel: &CancelToken,
    mut on_batch: impl FnMut(usize),
) -> Result<ScanOutcome, ScanError> {
    let mut working = record.clone();
    let mut observed = HashSet::new();
    let (mut created, mut modified, mut skipped) = (0usize, 0usize, 0usize);

    for (index, batch) in scan.batches.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(cancelled(record, index));
        }
        for candidate in &batch.candidates {
            match apply_candidate(&mut working, candidate, taxonomy, &mut observed) {
                CandidateEffect::Created => created += 1,
                CandidateEffect::Modified => modified += 1,
                CandidateEffect::Skipped => skipped += 1,
            }
        }
        on_batch(index + 1);
    }
    if cancel.is_cancelled() {
        return Err(cancelled(record, scan.batches.len()));
    }

    for node in &mut working.nutrients {
        node.recalculate_unobserved(&observed, true);
    }
    if let Some(calories) = scan.total_calories {
        working.set_calories(calories);
    }

    info!(
        "event=scan_apply module=scan status=ok food_id={} batches={} created={} modified={} skipped={}",
        record.identity,
        scan.batches.len(),
        created,
        modified,
        skipped
    );
    Ok(ScanOutcome {
        record: working,
        created,
        modified,
        skipped,
    })
}

/// Loads the current version of `food_id`, applies `scan` and commits the
/// result with one `update`.
pub fn import_scan<R: FoodRepository>(
    store: &VersionedStore<R>,
    food_id: FoodId,
    scan: &ScanResult,
    taxonomy: &TaxonomyIndex,
    cancel: &CancelToken,
) -> Result<(ScanOutcome, UpdateOutcome), ScanError> {
    let current = store.get_current(food_id)?;
    let outcome = apply_scan(&current, scan, taxonomy, cancel)?;
    let update = store.update(&outcome.record)?;
    Ok((outcome, update))
}

enum CandidateEffect {
    Created,
    Modified,
    Skipped,
}

fn apply_candidate(
    record: &mut FoodRecord,
    candidate: &ScanCandidate,
    taxonomy: &TaxonomyIndex,
    observed: &mut HashSet<String>,
) -> CandidateEffect {
    let Some(name) = taxonomy
        .canonical_name(&candidate.name)
        .filter(|name| !taxonomy.is_generic(name))
        .map(str::to_string)
    else {
        warn!(
            "event=taxonomy_miss module=scan status=skipped nutrient={}",
            candidate.name
        );
        return CandidateEffect::Skipped;
    };

    if record.find_nutrient(&name).is_some() {
        record.modify_nutrient(&name, Some(candidate.amount), Some(candidate.unit), false);
        observed.insert(name.to_lowercase());
        return CandidateEffect::Modified;
    }

    let node = NutrientNode::new(name.clone(), candidate.amount, candidate.unit);
    if record.create_nutrient_chain(taxonomy, &node, false) {
        observed.insert(name.to_lowercase());
        CandidateEffect::Created
    } else {
        CandidateEffect::Skipped
    }
}

fn cancelled(record: &FoodRecord, applied_batches: usize) -> ScanError {
    warn!(
        "event=scan_apply module=scan status=cancelled food_id={} applied_batches={}",
        record.identity, applied_batches
    );
    ScanError::Cancelled { applied_batches }
}
