//! Copy-on-write versioned food store.
//!
//! # Responsibility
//! - Persist food snapshots keyed by `(food_id, version)`.
//! - Decide per update whether the current version may be rewritten in place
//!   or must fork into `last_version + 1`.
//! - Share unchanged nutrient nodes between versions and collect everything
//!   no live head, group or ingredient chain can reach.
//!
//! # Invariants
//! - A version observed by another food's ingredient list, or by more than
//!   its owning group, is never rewritten.
//! - Version numbers per identity strictly increase; a collected or
//!   tombstoned key is never handed out again.
//! - read-decide-write-collect runs as one transaction under the identity
//!   lock, so the reference counts behind a decision cannot go stale.
//! - Collection runs after the new links are written, so nothing the new
//!   version references is ever swept.
//!
//! A failed write leaves the caller's in-memory record untouched and
//! un-reconciled; callers reload with `get_current` if they need to retry.

use crate::model::food::{FoodError, FoodId, FoodRecord, Version, VersionKey};
use crate::model::nutrient::{NutrientNode, NutrientNodeId};
use crate::repo::food_repo::{
    FoodGroup, FoodHead, FoodRepository, GroupId, IngredientLink, RepoError, StoreStats,
};
use crate::service::locks::IdentityLocks;
use crate::taxonomy::TaxonomyIndex;
use log::{debug, error, info};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Result type used by versioned store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from versioned store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Identity has never been created.
    FoodNotFound(FoodId),
    /// Identity was deleted; its current pointer is gone.
    FoodDeleted(FoodId),
    /// `create` was called for an identity that already has a head.
    FoodExists(FoodId),
    /// New identities start at version 1.
    InvalidInitialVersion(Version),
    /// Requested version was never written or has been collected.
    VersionNotFound(VersionKey),
    /// Snapshot was read from a version that is no longer current.
    StaleSnapshot {
        food_id: FoodId,
        current: Version,
        found: Version,
    },
    /// An ingredient ref points at a version that does not exist.
    IngredientMissing(VersionKey),
    GroupNotFound(GroupId),
    NotAGroupMember {
        group_id: GroupId,
        food_id: FoodId,
    },
    /// Record-level validation or graph error.
    Food(FoodError),
    /// Repository-level failure.
    Repo(RepoError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FoodNotFound(id) => write!(f, "food not found: {id}"),
            Self::FoodDeleted(id) => write!(f, "food was deleted: {id}"),
            Self::FoodExists(id) => write!(f, "food already exists: {id}"),
            Self::InvalidInitialVersion(version) => {
                write!(f, "new foods start at version 1, got {version}")
            }
            Self::VersionNotFound(key) => write!(f, "food version not found: {key}"),
            Self::StaleSnapshot {
                food_id,
                current,
                found,
            } => write!(
                f,
                "snapshot of {food_id} is at version {found} but current is {current}"
            ),
            Self::IngredientMissing(key) => write!(f, "ingredient version not found: {key}"),
            Self::GroupNotFound(id) => write!(f, "food group not found: {id}"),
            Self::NotAGroupMember { group_id, food_id } => {
                write!(f, "food {food_id} is not a member of group {group_id}")
            }
            Self::Food(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Food(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::FoodNotFound(id) => Self::FoodNotFound(id),
            RepoError::VersionNotFound(key) => Self::VersionNotFound(key),
            RepoError::GroupNotFound(id) => Self::GroupNotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<FoodError> for StoreError {
    fn from(value: FoodError) -> Self {
        Self::Food(value)
    }
}

/// What `update` did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Snapshot was equivalent to the current version.
    Unchanged(VersionKey),
    /// Current version was not referenced upstream and was rewritten.
    InPlace(VersionKey),
    /// Current version was referenced upstream; a new version was written.
    Forked {
        previous: VersionKey,
        current: VersionKey,
    },
}

impl UpdateOutcome {
    /// Key of the identity's current version after the update.
    pub fn current_key(&self) -> VersionKey {
        match self {
            Self::Unchanged(key) | Self::InPlace(key) => *key,
            Self::Forked { current, .. } => *current,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Unchanged(_) => "unchanged",
            Self::InPlace(_) => "in_place",
            Self::Forked { .. } => "fork",
        }
    }
}

/// Rows removed by one collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcReport {
    pub versions_deleted: usize,
    pub ingredient_links_deleted: usize,
    pub nutrient_trees_deleted: usize,
    pub nutrient_nodes_deleted: usize,
    /// Versions reachable from a live head or group after the pass.
    pub versions_retained: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.versions_deleted == 0 && self.nutrient_nodes_deleted == 0
    }
}

/// Versioned food store facade over a repository implementation.
pub struct VersionedStore<R: FoodRepository> {
    repo: R,
    locks: Arc<IdentityLocks>,
}

impl<R: FoodRepository> VersionedStore<R> {
    /// Creates a store with its own lock registry.
    pub fn new(repo: R) -> Self {
        Self::with_locks(repo, Arc::new(IdentityLocks::new()))
    }

    /// Creates a store sharing `locks` with other stores on the same data.
    pub fn with_locks(repo: R, locks: Arc<IdentityLocks>) -> Self {
        Self { repo, locks }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persists a new identity at version 1 and returns the stored snapshot.
    pub fn create(&self, record: &FoodRecord) -> StoreResult<FoodRecord> {
        record.validate()?;
        if record.version != 1 {
            return Err(StoreError::InvalidInitialVersion(record.version));
        }
        let food_id = record.identity;
        let started_at = Instant::now();

        let result: StoreResult<FoodRecord> = self.locks.with_identity(food_id, || {
            self.repo.atomically(|repo| {
                if repo.food_head(food_id)?.is_some() {
                    return Err(StoreError::FoodExists(food_id));
                }
                let links = ingredient_links(record);
                ensure_ingredient_graph(repo, food_id, &links)?;
                repo.insert_food_head(food_id, record.version)?;
                repo.insert_version_header(record)?;
                write_contents(repo, record, &links)?;
                Ok(repo.load_version(record.composite_id())?)
            })
        });

        match &result {
            Ok(stored) => info!(
                "event=food_create module=store status=ok food_id={} version={} nutrients={} ingredients={} duration_ms={}",
                food_id,
                stored.version,
                stored.nutrients.len(),
                stored.ingredients.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=food_create module=store status=error food_id={} duration_ms={} error={}",
                food_id,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    /// Key of the identity's current version.
    pub fn current_key(&self, food_id: FoodId) -> StoreResult<VersionKey> {
        Ok(live_head(&self.repo, food_id)?.current_key())
    }

    /// Loads the current snapshot of a live identity.
    pub fn get_current(&self, food_id: FoodId) -> StoreResult<FoodRecord> {
        self.repo.atomically(|repo| {
            let head = live_head(repo, food_id)?;
            Ok(repo.load_version(head.current_key())?)
        })
    }

    /// Loads any version that has not been collected.
    pub fn get_version(&self, key: VersionKey) -> StoreResult<FoodRecord> {
        Ok(self.repo.load_version(key)?)
    }

    /// Persists `snapshot` as the identity's new state.
    ///
    /// `snapshot.version` must be the current version. Equivalent snapshots
    /// are a no-op; otherwise the current version is rewritten in place
    /// unless it is referenced upstream, in which case `last_version + 1` is
    /// allocated. Unchanged nutrient nodes are linked, not copied.
    pub fn update(&self, snapshot: &FoodRecord) -> StoreResult<UpdateOutcome> {
        snapshot.validate()?;
        let food_id = snapshot.identity;
        let started_at = Instant::now();

        let result = self.locks.with_identity(food_id, || {
            self.repo
                .atomically(|repo| apply_update(repo, snapshot))
        });

        match &result {
            Ok((outcome, report)) => info!(
                "event=food_update module=store status=ok mode={} food_id={} version={} gc_versions={} gc_nodes={} duration_ms={}",
                outcome.mode(),
                food_id,
                outcome.current_key().version,
                report.versions_deleted,
                report.nutrient_nodes_deleted,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=food_update module=store status=error food_id={} version={} duration_ms={} error={}",
                food_id,
                snapshot.version,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result.map(|(outcome, _)| outcome)
    }

    /// Re-pins `owner`'s ref to `ingredient_id` at that ingredient's current
    /// version, swapping the scaled contribution, and stores the result.
    pub fn migrate_ingredient_ref(
        &self,
        taxonomy: &TaxonomyIndex,
        owner_id: FoodId,
        ingredient_id: FoodId,
    ) -> StoreResult<UpdateOutcome> {
        let mut record = self.get_current(owner_id)?;
        let latest = self.get_current(ingredient_id)?;
        let pinned = record
            .ingredients
            .iter()
            .find(|ingredient| ingredient.food.identity == ingredient_id)
            .map(|ingredient| ingredient.key())
            .ok_or(FoodError::IngredientNotFound(ingredient_id))?;
        if pinned == latest.composite_id() {
            return Ok(UpdateOutcome::Unchanged(record.composite_id()));
        }

        record.replace_ingredient(taxonomy, latest)?;
        self.update(&record)
    }

    /// Tombstones an identity and collects what it exclusively owned.
    ///
    /// Versions still pinned by groups or other foods' ingredients survive.
    pub fn delete_food(&self, food_id: FoodId) -> StoreResult<GcReport> {
        let started_at = Instant::now();
        let result: StoreResult<GcReport> = self.locks.with_identity(food_id, || {
            self.repo.atomically(|repo| {
                live_head(repo, food_id)?;
                repo.tombstone_food(food_id)?;
                collect(repo)
            })
        });
        log_gc("food_delete", &result, started_at);
        result
    }

    pub fn create_group(&self, name: &str) -> StoreResult<FoodGroup> {
        let group = self.repo.insert_group(name.trim())?;
        info!(
            "event=group_create module=store status=ok group_id={}",
            group.group_id
        );
        Ok(group)
    }

    /// Pins `key` inside a group, replacing any previous pin of that food.
    pub fn add_to_group(&self, group_id: GroupId, key: VersionKey) -> StoreResult<()> {
        self.locks.with_identity(key.food_id, || {
            self.repo.atomically(|repo| {
                if !repo.version_exists(key)? {
                    return Err(StoreError::VersionNotFound(key));
                }
                repo.upsert_group_member(group_id, key)?;
                collect(repo).map(|_| ())
            })
        })
    }

    /// Removes a food from a group and collects the version if unreachable.
    pub fn remove_from_group(&self, group_id: GroupId, food_id: FoodId) -> StoreResult<GcReport> {
        let started_at = Instant::now();
        let result = self.locks.with_identity(food_id, || {
            self.repo.atomically(|repo| {
                if !repo.remove_group_member(group_id, food_id)? {
                    return Err(StoreError::NotAGroupMember { group_id, food_id });
                }
                collect(repo)
            })
        });
        log_gc("group_remove", &result, started_at);
        result
    }

    /// Moves a group's pin of `food_id` to the food's current version.
    pub fn migrate_group_member(
        &self,
        group_id: GroupId,
        food_id: FoodId,
    ) -> StoreResult<VersionKey> {
        self.locks.with_identity(food_id, || {
            self.repo.atomically(|repo| {
                let current = live_head(repo, food_id)?.current_key();
                let pinned = repo
                    .group_members(group_id)?
                    .into_iter()
                    .find(|key| key.food_id == food_id)
                    .ok_or(StoreError::NotAGroupMember { group_id, food_id })?;
                if pinned != current {
                    repo.upsert_group_member(group_id, current)?;
                    let report = collect(repo)?;
                    debug!(
                        "event=group_migrate module=store status=ok food_id={} from={} to={} gc_versions={}",
                        food_id, pinned.version, current.version, report.versions_deleted
                    );
                }
                Ok(current)
            })
        })
    }

    /// Pinned keys of a group in insertion order.
    pub fn group_members(&self, group_id: GroupId) -> StoreResult<Vec<VersionKey>> {
        Ok(self.repo.group_members(group_id)?)
    }

    /// Snapshots of a group's members, as pinned.
    pub fn load_group(&self, group_id: GroupId) -> StoreResult<Vec<FoodRecord>> {
        self.repo.atomically(|repo| {
            let mut records = Vec::new();
            for key in repo.group_members(group_id)? {
                records.push(repo.load_version(key)?);
            }
            Ok(records)
        })
    }

    /// Deletes a group and collects versions only it kept alive.
    pub fn delete_group(&self, group_id: GroupId) -> StoreResult<GcReport> {
        let started_at = Instant::now();
        let result = self.repo.atomically(|repo| {
            repo.delete_group(group_id)?;
            collect(repo)
        });
        log_gc("group_delete", &result, started_at);
        result
    }

    /// Runs a full mark-and-sweep pass.
    pub fn collect_garbage(&self) -> StoreResult<GcReport> {
        let started_at = Instant::now();
        let result = self.repo.atomically(collect::<R>);
        log_gc("gc", &result, started_at);
        result
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.repo.stats()?)
    }
}

fn apply_update<R: FoodRepository>(
    repo: &R,
    snapshot: &FoodRecord,
) -> StoreResult<(UpdateOutcome, GcReport)> {
    let food_id = snapshot.identity;
    let head = live_head(repo, food_id)?;
    if snapshot.version != head.current_version {
        return Err(StoreError::StaleSnapshot {
            food_id,
            current: head.current_version,
            found: snapshot.version,
        });
    }

    let current_key = head.current_key();
    let current = repo.load_version(current_key)?;
    if current.is_equivalent(snapshot) {
        return Ok((UpdateOutcome::Unchanged(current_key), GcReport::default()));
    }

    let links = ingredient_links(snapshot);
    ensure_ingredient_graph(repo, food_id, &links)?;

    let references = repo.version_references(current_key)?;
    let outcome = if references.is_referenced_upstream() {
        let next = head.last_version.checked_add(1).ok_or_else(|| {
            RepoError::InvalidData(format!("version counter exhausted for {food_id}"))
        })?;
        let mut forked = snapshot.clone();
        forked.version = next;
        repo.insert_version_header(&forked)?;
        write_contents(repo, &forked, &links)?;
        repo.set_current_version(food_id, next, next)?;
        debug!(
            "event=version_fork module=store food_id={} from={} to={} ingredient_refs={} group_refs={}",
            food_id,
            current_key.version,
            next,
            references.ingredient_refs,
            references.group_refs
        );
        UpdateOutcome::Forked {
            previous: current_key,
            current: forked.composite_id(),
        }
    } else {
        repo.update_version_header(snapshot)?;
        write_contents(repo, snapshot, &links)?;
        UpdateOutcome::InPlace(current_key)
    };

    let report = collect(repo)?;
    Ok((outcome, report))
}

fn live_head<R: FoodRepository>(repo: &R, food_id: FoodId) -> StoreResult<FoodHead> {
    match repo.food_head(food_id)? {
        None => Err(StoreError::FoodNotFound(food_id)),
        Some(head) if head.is_deleted => Err(StoreError::FoodDeleted(food_id)),
        Some(head) => Ok(head),
    }
}

fn ingredient_links(record: &FoodRecord) -> Vec<IngredientLink> {
    record.ingredients.iter().map(IngredientLink::from).collect()
}

/// Every target must exist, and no stored ingredient chain starting at a
/// target may lead back to `food_id`.
fn ensure_ingredient_graph<R: FoodRepository>(
    repo: &R,
    food_id: FoodId,
    links: &[IngredientLink],
) -> StoreResult<()> {
    for link in links {
        if !repo.version_exists(link.target)? {
            return Err(StoreError::IngredientMissing(link.target));
        }
        let mut seen = HashSet::new();
        let mut pending = vec![link.target];
        while let Some(key) = pending.pop() {
            if key.food_id == food_id {
                return Err(FoodError::CircularIngredient {
                    food_id,
                    ingredient_id: link.target.food_id,
                }
                .into());
            }
            if seen.insert(key) {
                pending.extend(repo.ingredient_targets(key)?);
            }
        }
    }
    Ok(())
}

fn write_contents<R: FoodRepository>(
    repo: &R,
    record: &FoodRecord,
    links: &[IngredientLink],
) -> StoreResult<()> {
    let key = record.composite_id();
    let mut used = HashSet::new();
    let mut node_ids = Vec::with_capacity(record.nutrients.len());
    for node in &record.nutrients {
        node_ids.push(persist_node(repo, key, node, &mut used)?);
    }
    repo.set_version_nutrients(key, &node_ids)?;
    repo.set_version_ingredients(key, links)?;
    Ok(())
}

/// Resolves the storage row for one nutrient node of the version at `key`,
/// children first.
///
/// - same fields over the same child rows: shared by id
/// - changed, reached only from `key`: rewritten in place
/// - changed and reached from any other version: written as a new row
fn persist_node<R: FoodRepository>(
    repo: &R,
    key: VersionKey,
    node: &NutrientNode,
    used: &mut HashSet<NutrientNodeId>,
) -> StoreResult<NutrientNodeId> {
    let mut child_ids = Vec::with_capacity(node.children.len());
    for child in &node.children {
        child_ids.push(persist_node(repo, key, child, used)?);
    }

    let stored = match node.stored_id.filter(|id| !used.contains(id)) {
        Some(stored_id) => repo.nutrient_node_row(stored_id)?,
        None => None,
    };
    let node_id = match stored {
        Some(row) if row.matches(node, &child_ids) => row.node_id,
        Some(row) => {
            let owners = repo.nutrient_owner_versions(row.node_id)?;
            if owners.iter().all(|owner| *owner == key) {
                repo.rewrite_nutrient_node(row.node_id, node, &child_ids)?;
                row.node_id
            } else {
                repo.insert_nutrient_node(node, &child_ids)?
            }
        }
        None => repo.insert_nutrient_node(node, &child_ids)?,
    };
    used.insert(node_id);
    Ok(node_id)
}

/// Mark from live heads and group pins, follow ingredient chains, sweep
/// unreachable versions, then drop nutrient rows no version reaches.
///
/// Each pass walks every stored version and every nutrient row, so a write
/// costs time proportional to the whole store.
fn collect<R: FoodRepository>(repo: &R) -> StoreResult<GcReport> {
    let mut reachable = HashSet::new();
    let mut pending = repo.live_heads()?;
    pending.extend(repo.all_group_member_keys()?);
    while let Some(key) = pending.pop() {
        if reachable.insert(key) {
            pending.extend(repo.ingredient_targets(key)?);
        }
    }

    let mut report = GcReport {
        versions_retained: reachable.len(),
        ..GcReport::default()
    };
    for key in repo.all_versions()? {
        if reachable.contains(&key) {
            continue;
        }
        report.ingredient_links_deleted += repo.ingredient_targets(key)?.len();
        repo.delete_version(key)?;
        report.versions_deleted += 1;
        debug!("event=gc_sweep module=store kind=version key={key}");
    }
    let swept = repo.sweep_nutrient_nodes()?;
    report.nutrient_trees_deleted = swept.roots;
    report.nutrient_nodes_deleted = swept.nodes;
    Ok(report)
}

fn log_gc(event: &str, result: &StoreResult<GcReport>, started_at: Instant) {
    match result {
        Ok(report) => info!(
            "event={} module=store status=ok versions_deleted={} trees_deleted={} nodes_deleted={} retained={} duration_ms={}",
            event,
            report.versions_deleted,
            report.nutrient_trees_deleted,
            report.nutrient_nodes_deleted,
            report.versions_retained,
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event={} module=store status=error duration_ms={} error={}",
            event,
            started_at.elapsed().as_millis(),
            err
        ),
    }
}
