//! Food version repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist food heads, immutable version rows, nutrient trees, ingredient
//!   links and group memberships keyed by `(food_id, version)`.
//! - Expose the reference counts and reachability primitives the versioned
//!   store needs to decide in-place vs fork and to collect garbage.
//!
//! # Invariants
//! - Versions link their top-level nutrient rows; nutrient rows link their
//!   children through `nutrient_edges`. Any node may be reached from many
//!   parents and many versions (structural sharing).
//! - Deleting a version row cascades to its nutrient links and ingredient
//!   rows, never to nutrient rows. Nutrient rows go only through
//!   `sweep_nutrient_nodes`.
//! - `foods.last_version` only grows, so a composite id is never reused.
//! - Child ordering is `nutrient_edges.sort_order ASC`.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::food::{FoodId, FoodRecord, IngredientRef, ServingInfo, Version, VersionKey};
use crate::model::nutrient::{NutrientNode, NutrientNodeId};
use crate::model::unit::MassUnit;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable food group identifier.
pub type GroupId = Uuid;

/// Result type used by food repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors from food repository operations.
#[derive(Debug)]
pub enum RepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Food identity has no head row.
    FoodNotFound(FoodId),
    /// Version row does not exist (never written or collected).
    VersionNotFound(VersionKey),
    /// Group does not exist.
    GroupNotFound(GroupId),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::FoodNotFound(id) => write!(f, "food not found: {id}"),
            Self::VersionNotFound(key) => write!(f, "food version not found: {key}"),
            Self::GroupNotFound(id) => write!(f, "food group not found: {id}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "food repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "food repository requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid food data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Head row of one food identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoodHead {
    pub food_id: FoodId,
    /// Version returned by "get current".
    pub current_version: Version,
    /// Highest version number ever allocated for this identity.
    pub last_version: Version,
    /// Tombstone marker. A deleted identity keeps its head so numbers are
    /// never handed out again.
    pub is_deleted: bool,
}

impl FoodHead {
    pub fn current_key(&self) -> VersionKey {
        VersionKey::new(self.food_id, self.current_version)
    }
}

/// Who observes one version, apart from its own head pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionReferences {
    /// Ingredient rows owned by versions of other foods.
    pub ingredient_refs: usize,
    /// Group memberships pinned to this version.
    pub group_refs: usize,
}

impl VersionReferences {
    /// A version is referenced upstream when another food uses it as an
    /// ingredient, or when more than its owning group pins it.
    pub fn is_referenced_upstream(&self) -> bool {
        self.ingredient_refs > 0 || self.group_refs > 1
    }
}

/// Ingredient row as persisted: target key plus multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngredientLink {
    pub target: VersionKey,
    pub serving_multiplier: f64,
}

impl From<&IngredientRef> for IngredientLink {
    fn from(value: &IngredientRef) -> Self {
        Self {
            target: value.key(),
            serving_multiplier: value.serving_multiplier,
        }
    }
}

/// Food group read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoodGroup {
    pub group_id: GroupId,
    pub name: String,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
}

/// One stored nutrient row with its ordered child ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NutrientNodeRow {
    pub node_id: NutrientNodeId,
    pub name: String,
    pub amount: f64,
    pub unit: MassUnit,
    pub child_ids: Vec<NutrientNodeId>,
}

impl NutrientNodeRow {
    /// True when storing `node` over `child_ids` would not change this row.
    pub fn matches(&self, node: &NutrientNode, child_ids: &[NutrientNodeId]) -> bool {
        self.name == node.name
            && self.unit == node.unit
            && self.amount == node.amount
            && self.child_ids == child_ids
    }
}

/// Rows removed by one nutrient sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NutrientSweep {
    /// Removed nodes that had no parent edge at all.
    pub roots: usize,
    pub nodes: usize,
}

/// Row counts, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub foods: usize,
    pub versions: usize,
    pub nutrient_nodes: usize,
    pub nutrient_edges: usize,
    pub version_nutrient_links: usize,
    pub ingredient_links: usize,
    pub groups: usize,
    pub group_members: usize,
}

/// Storage-agnostic repository interface behind the versioned store.
pub trait FoodRepository {
    /// Runs `op` as one atomic unit. Joins an already open transaction.
    fn atomically<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>;

    /// Loads the head row, tombstoned or not.
    fn food_head(&self, food_id: FoodId) -> RepoResult<Option<FoodHead>>;
    /// Creates the head row for a new identity.
    fn insert_food_head(&self, food_id: FoodId, version: Version) -> RepoResult<()>;
    /// Moves the current pointer and the high-water mark.
    fn set_current_version(
        &self,
        food_id: FoodId,
        current_version: Version,
        last_version: Version,
    ) -> RepoResult<()>;
    /// Marks an identity deleted without releasing its version numbers.
    fn tombstone_food(&self, food_id: FoodId) -> RepoResult<()>;
    /// Current keys of every non-deleted identity.
    fn live_heads(&self) -> RepoResult<Vec<VersionKey>>;

    fn version_exists(&self, key: VersionKey) -> RepoResult<bool>;
    /// Loads one snapshot with nutrient trees and ingredient snapshots
    /// resolved recursively. Loaded nutrient nodes carry their `stored_id`.
    fn load_version(&self, key: VersionKey) -> RepoResult<FoodRecord>;
    fn insert_version_header(&self, record: &FoodRecord) -> RepoResult<()>;
    fn update_version_header(&self, record: &FoodRecord) -> RepoResult<()>;
    /// Deletes one version row; its links and ingredient rows cascade.
    fn delete_version(&self, key: VersionKey) -> RepoResult<()>;
    fn all_versions(&self) -> RepoResult<Vec<VersionKey>>;

    /// Own fields and child ids of one stored node.
    fn nutrient_node_row(&self, node_id: NutrientNodeId) -> RepoResult<Option<NutrientNodeRow>>;
    /// Inserts one node row above already stored `child_ids`.
    fn insert_nutrient_node(
        &self,
        node: &NutrientNode,
        child_ids: &[NutrientNodeId],
    ) -> RepoResult<NutrientNodeId>;
    /// Overwrites one node row and replaces its child edges.
    fn rewrite_nutrient_node(
        &self,
        node_id: NutrientNodeId,
        node: &NutrientNode,
        child_ids: &[NutrientNodeId],
    ) -> RepoResult<()>;
    /// Versions whose nutrient trees reach `node_id` through any parent chain.
    fn nutrient_owner_versions(&self, node_id: NutrientNodeId) -> RepoResult<Vec<VersionKey>>;
    /// Replaces the ordered top-level links of one version.
    fn set_version_nutrients(&self, key: VersionKey, node_ids: &[NutrientNodeId])
        -> RepoResult<()>;
    /// Deletes every nutrient row no version reaches.
    fn sweep_nutrient_nodes(&self) -> RepoResult<NutrientSweep>;

    /// Replaces the ordered ingredient rows of one version.
    fn set_version_ingredients(&self, key: VersionKey, links: &[IngredientLink])
        -> RepoResult<()>;
    /// Ingredient targets of one version.
    fn ingredient_targets(&self, key: VersionKey) -> RepoResult<Vec<VersionKey>>;
    fn version_references(&self, key: VersionKey) -> RepoResult<VersionReferences>;

    fn insert_group(&self, name: &str) -> RepoResult<FoodGroup>;
    fn get_group(&self, group_id: GroupId) -> RepoResult<Option<FoodGroup>>;
    /// Deletes a group; memberships cascade.
    fn delete_group(&self, group_id: GroupId) -> RepoResult<()>;
    /// Pins `key.food_id` inside the group at `key.version`.
    fn upsert_group_member(&self, group_id: GroupId, key: VersionKey) -> RepoResult<()>;
    /// Returns `false` when the food was not a member.
    fn remove_group_member(&self, group_id: GroupId, food_id: FoodId) -> RepoResult<bool>;
    fn group_members(&self, group_id: GroupId) -> RepoResult<Vec<VersionKey>>;
    /// Every pinned key across all groups.
    fn all_group_member_keys(&self) -> RepoResult<Vec<VersionKey>>;

    fn stats(&self) -> RepoResult<StoreStats>;
}

/// SQLite-backed food repository.
pub struct SqliteFoodRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteFoodRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_food_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl FoodRepository for SqliteFoodRepository<'_> {
    fn atomically<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>,
    {
        if !self.conn.is_autocommit() {
            return op(self);
        }
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(RepoError::from)?;
        let value = op(self)?;
        tx.commit().map_err(RepoError::from)?;
        Ok(value)
    }

    fn food_head(&self, food_id: FoodId) -> RepoResult<Option<FoodHead>> {
        let row = self
            .conn
            .query_row(
                "SELECT current_version, last_version, is_deleted
                 FROM foods
                 WHERE food_id = ?1;",
                [food_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Version>(0)?,
                        row.get::<_, Version>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((current_version, last_version, is_deleted)) = row else {
            return Ok(None);
        };
        Ok(Some(FoodHead {
            food_id,
            current_version,
            last_version,
            is_deleted: parse_flag(is_deleted, "foods.is_deleted")?,
        }))
    }

    fn insert_food_head(&self, food_id: FoodId, version: Version) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO foods (food_id, current_version, last_version, is_deleted)
             VALUES (?1, ?2, ?2, 0);",
            params![food_id.to_string(), version],
        )?;
        Ok(())
    }

    fn set_current_version(
        &self,
        food_id: FoodId,
        current_version: Version,
        last_version: Version,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE foods
             SET current_version = ?2,
                 last_version = MAX(last_version, ?3),
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE food_id = ?1
               AND is_deleted = 0;",
            params![food_id.to_string(), current_version, last_version],
        )?;
        if changed == 0 {
            return Err(RepoError::FoodNotFound(food_id));
        }
        Ok(())
    }

    fn tombstone_food(&self, food_id: FoodId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE foods
             SET is_deleted = 1,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE food_id = ?1;",
            [food_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::FoodNotFound(food_id));
        }
        Ok(())
    }

    fn live_heads(&self) -> RepoResult<Vec<VersionKey>> {
        query_keys(
            self.conn,
            "SELECT food_id, current_version
             FROM foods
             WHERE is_deleted = 0
             ORDER BY food_id ASC;",
            [],
            "foods.food_id",
        )
    }

    fn version_exists(&self, key: VersionKey) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM food_versions
                WHERE food_id = ?1 AND version = ?2
            );",
            params![key.food_id.to_string(), key.version],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn load_version(&self, key: VersionKey) -> RepoResult<FoodRecord> {
        let mut resolved = HashMap::new();
        load_version_resolving(self.conn, key, &mut resolved)
    }

    fn insert_version_header(&self, record: &FoodRecord) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO food_versions (
                food_id,
                version,
                name,
                calories,
                serving_description,
                serving_grams
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                record.identity.to_string(),
                record.version,
                record.name,
                record.calories,
                record.serving.description,
                record.serving.grams,
            ],
        )?;
        Ok(())
    }

    fn update_version_header(&self, record: &FoodRecord) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE food_versions
             SET name = ?3,
                 calories = ?4,
                 serving_description = ?5,
                 serving_grams = ?6,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE food_id = ?1
               AND version = ?2;",
            params![
                record.identity.to_string(),
                record.version,
                record.name,
                record.calories,
                record.serving.description,
                record.serving.grams,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::VersionNotFound(record.composite_id()));
        }
        Ok(())
    }

    fn delete_version(&self, key: VersionKey) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM food_versions
             WHERE food_id = ?1
               AND version = ?2;",
            params![key.food_id.to_string(), key.version],
        )?;
        if changed == 0 {
            return Err(RepoError::VersionNotFound(key));
        }
        Ok(())
    }

    fn all_versions(&self) -> RepoResult<Vec<VersionKey>> {
        query_keys(
            self.conn,
            "SELECT food_id, version
             FROM food_versions
             ORDER BY food_id ASC, version ASC;",
            [],
            "food_versions.food_id",
        )
    }

    fn nutrient_node_row(&self, node_id: NutrientNodeId) -> RepoResult<Option<NutrientNodeRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT node_id, name, amount, unit
                 FROM nutrient_nodes
                 WHERE node_id = ?1;",
                [node_id],
                parse_nutrient_row_raw,
            )
            .optional()?;
        let Some(raw) = row else {
            return Ok(None);
        };
        let node = raw.into_node()?;
        Ok(Some(NutrientNodeRow {
            node_id,
            name: node.name,
            amount: node.amount,
            unit: node.unit,
            child_ids: child_node_ids(self.conn, node_id)?,
        }))
    }

    fn insert_nutrient_node(
        &self,
        node: &NutrientNode,
        child_ids: &[NutrientNodeId],
    ) -> RepoResult<NutrientNodeId> {
        self.conn.execute(
            "INSERT INTO nutrient_nodes (name, amount, unit)
             VALUES (?1, ?2, ?3);",
            params![node.name, node.amount, node.unit.symbol()],
        )?;
        let node_id = self.conn.last_insert_rowid();
        insert_child_edges(self.conn, node_id, child_ids)?;
        Ok(node_id)
    }

    fn rewrite_nutrient_node(
        &self,
        node_id: NutrientNodeId,
        node: &NutrientNode,
        child_ids: &[NutrientNodeId],
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE nutrient_nodes
             SET name = ?2,
                 amount = ?3,
                 unit = ?4
             WHERE node_id = ?1;",
            params![node_id, node.name, node.amount, node.unit.symbol()],
        )?;
        if changed == 0 {
            return Err(RepoError::InvalidData(format!(
                "nutrient node `{node_id}` does not exist"
            )));
        }
        self.conn.execute(
            "DELETE FROM nutrient_edges WHERE parent_node_id = ?1;",
            [node_id],
        )?;
        insert_child_edges(self.conn, node_id, child_ids)
    }

    fn nutrient_owner_versions(&self, node_id: NutrientNodeId) -> RepoResult<Vec<VersionKey>> {
        query_keys(
            self.conn,
            "WITH RECURSIVE up(node_id) AS (
                SELECT ?1
                UNION
                SELECT e.parent_node_id
                FROM nutrient_edges e
                INNER JOIN up ON e.child_node_id = up.node_id
            )
            SELECT DISTINCT l.food_id, l.version
            FROM version_nutrients l
            INNER JOIN up ON l.node_id = up.node_id
            ORDER BY l.food_id ASC, l.version ASC;",
            [node_id],
            "version_nutrients.food_id",
        )
    }

    fn set_version_nutrients(
        &self,
        key: VersionKey,
        node_ids: &[NutrientNodeId],
    ) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM version_nutrients
             WHERE food_id = ?1
               AND version = ?2;",
            params![key.food_id.to_string(), key.version],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO version_nutrients (food_id, version, sort_order, node_id)
             VALUES (?1, ?2, ?3, ?4);",
        )?;
        for (index, node_id) in node_ids.iter().enumerate() {
            stmt.execute(params![
                key.food_id.to_string(),
                key.version,
                index as i64,
                node_id
            ])?;
        }
        Ok(())
    }

    fn sweep_nutrient_nodes(&self) -> RepoResult<NutrientSweep> {
        let roots: i64 = self.conn.query_row(
            &format!(
                "{LIVE_NUTRIENTS_CTE}
                SELECT COUNT(*)
                FROM nutrient_nodes n
                WHERE n.node_id NOT IN (SELECT node_id FROM live)
                  AND NOT EXISTS (
                    SELECT 1 FROM nutrient_edges e WHERE e.child_node_id = n.node_id
                  );"
            ),
            [],
            |row| row.get(0),
        )?;
        let nodes = self.conn.execute(
            &format!(
                "{LIVE_NUTRIENTS_CTE}
                DELETE FROM nutrient_nodes
                WHERE node_id NOT IN (SELECT node_id FROM live);"
            ),
            [],
        )?;
        Ok(NutrientSweep {
            roots: roots as usize,
            nodes,
        })
    }

    fn set_version_ingredients(
        &self,
        key: VersionKey,
        links: &[IngredientLink],
    ) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM ingredients
             WHERE food_id = ?1
               AND version = ?2;",
            params![key.food_id.to_string(), key.version],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO ingredients (
                food_id,
                version,
                sort_order,
                ingredient_food_id,
                ingredient_version,
                serving_multiplier
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        )?;
        for (index, link) in links.iter().enumerate() {
            stmt.execute(params![
                key.food_id.to_string(),
                key.version,
                index as i64,
                link.target.food_id.to_string(),
                link.target.version,
                link.serving_multiplier,
            ])?;
        }
        Ok(())
    }

    fn ingredient_targets(&self, key: VersionKey) -> RepoResult<Vec<VersionKey>> {
        query_keys(
            self.conn,
            "SELECT ingredient_food_id, ingredient_version
             FROM ingredients
             WHERE food_id = ?1
               AND version = ?2
             ORDER BY sort_order ASC;",
            params![key.food_id.to_string(), key.version],
            "ingredients.ingredient_food_id",
        )
    }

    fn version_references(&self, key: VersionKey) -> RepoResult<VersionReferences> {
        let (ingredient_refs, group_refs): (i64, i64) = self.conn.query_row(
            "SELECT
                (SELECT COUNT(*)
                 FROM ingredients
                 WHERE ingredient_food_id = ?1
                   AND ingredient_version = ?2
                   AND food_id <> ?1),
                (SELECT COUNT(*)
                 FROM group_members
                 WHERE food_id = ?1
                   AND version = ?2);",
            params![key.food_id.to_string(), key.version],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(VersionReferences {
            ingredient_refs: ingredient_refs as usize,
            group_refs: group_refs as usize,
        })
    }

    fn insert_group(&self, name: &str) -> RepoResult<FoodGroup> {
        let group_id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO food_groups (group_id, name) VALUES (?1, ?2);",
            params![group_id.to_string(), name],
        )?;
        self.get_group(group_id)?
            .ok_or(RepoError::GroupNotFound(group_id))
    }

    fn get_group(&self, group_id: GroupId) -> RepoResult<Option<FoodGroup>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, created_at
                 FROM food_groups
                 WHERE group_id = ?1;",
                [group_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(name, created_at)| FoodGroup {
            group_id,
            name,
            created_at,
        }))
    }

    fn delete_group(&self, group_id: GroupId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM food_groups WHERE group_id = ?1;",
            [group_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::GroupNotFound(group_id));
        }
        Ok(())
    }

    fn upsert_group_member(&self, group_id: GroupId, key: VersionKey) -> RepoResult<()> {
        if self.get_group(group_id)?.is_none() {
            return Err(RepoError::GroupNotFound(group_id));
        }
        self.conn.execute(
            "INSERT INTO group_members (group_id, food_id, version, sort_order)
             VALUES (
                ?1,
                ?2,
                ?3,
                (SELECT COALESCE(MAX(sort_order), -1) + 1
                 FROM group_members
                 WHERE group_id = ?1)
             )
             ON CONFLICT(group_id, food_id) DO UPDATE SET version = excluded.version;",
            params![group_id.to_string(), key.food_id.to_string(), key.version],
        )?;
        Ok(())
    }

    fn remove_group_member(&self, group_id: GroupId, food_id: FoodId) -> RepoResult<bool> {
        if self.get_group(group_id)?.is_none() {
            return Err(RepoError::GroupNotFound(group_id));
        }
        let changed = self.conn.execute(
            "DELETE FROM group_members
             WHERE group_id = ?1
               AND food_id = ?2;",
            params![group_id.to_string(), food_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn group_members(&self, group_id: GroupId) -> RepoResult<Vec<VersionKey>> {
        if self.get_group(group_id)?.is_none() {
            return Err(RepoError::GroupNotFound(group_id));
        }
        query_keys(
            self.conn,
            "SELECT food_id, version
             FROM group_members
             WHERE group_id = ?1
             ORDER BY sort_order ASC, food_id ASC;",
            [group_id.to_string()],
            "group_members.food_id",
        )
    }

    fn all_group_member_keys(&self) -> RepoResult<Vec<VersionKey>> {
        query_keys(
            self.conn,
            "SELECT DISTINCT food_id, version
             FROM group_members
             ORDER BY food_id ASC, version ASC;",
            [],
            "group_members.food_id",
        )
    }

    fn stats(&self) -> RepoResult<StoreStats> {
        Ok(StoreStats {
            foods: count_rows(self.conn, "foods")?,
            versions: count_rows(self.conn, "food_versions")?,
            nutrient_nodes: count_rows(self.conn, "nutrient_nodes")?,
            nutrient_edges: count_rows(self.conn, "nutrient_edges")?,
            version_nutrient_links: count_rows(self.conn, "version_nutrients")?,
            ingredient_links: count_rows(self.conn, "ingredients")?,
            groups: count_rows(self.conn, "food_groups")?,
            group_members: count_rows(self.conn, "group_members")?,
        })
    }
}

fn load_version_resolving(
    conn: &Connection,
    key: VersionKey,
    resolved: &mut HashMap<VersionKey, FoodRecord>,
) -> RepoResult<FoodRecord> {
    if let Some(record) = resolved.get(&key) {
        return Ok(record.clone());
    }

    let header = conn
        .query_row(
            "SELECT name, calories, serving_description, serving_grams
             FROM food_versions
             WHERE food_id = ?1
               AND version = ?2;",
            params![key.food_id.to_string(), key.version],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((name, calories, serving_description, serving_grams)) = header else {
        return Err(RepoError::VersionNotFound(key));
    };

    let mut nutrients = Vec::new();
    for node_id in linked_nutrient_ids(conn, key)? {
        let node = load_nutrient_subtree(conn, node_id)?.ok_or_else(|| {
            RepoError::InvalidData(format!("version {key} links missing node `{node_id}`"))
        })?;
        nutrients.push(node);
    }

    let mut ingredients = Vec::new();
    for (target, serving_multiplier) in ingredient_rows(conn, key)? {
        let food = load_version_resolving(conn, target, resolved)?;
        ingredients.push(IngredientRef {
            food,
            serving_multiplier,
        });
    }

    let record = FoodRecord {
        identity: key.food_id,
        version: key.version,
        name,
        calories,
        nutrients,
        ingredients,
        serving: ServingInfo {
            description: serving_description,
            grams: serving_grams,
        },
    };
    resolved.insert(key, record.clone());
    Ok(record)
}

fn linked_nutrient_ids(conn: &Connection, key: VersionKey) -> RepoResult<Vec<NutrientNodeId>> {
    let mut stmt = conn.prepare(
        "SELECT node_id
         FROM version_nutrients
         WHERE food_id = ?1
           AND version = ?2
         ORDER BY sort_order ASC;",
    )?;
    let mut rows = stmt.query(params![key.food_id.to_string(), key.version])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

fn ingredient_rows(conn: &Connection, key: VersionKey) -> RepoResult<Vec<(VersionKey, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT ingredient_food_id, ingredient_version, serving_multiplier
         FROM ingredients
         WHERE food_id = ?1
           AND version = ?2
         ORDER BY sort_order ASC;",
    )?;
    let mut rows = stmt.query(params![key.food_id.to_string(), key.version])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        let food_id_text: String = row.get(0)?;
        let target = VersionKey::new(
            parse_uuid(&food_id_text, "ingredients.ingredient_food_id")?,
            row.get(1)?,
        );
        items.push((target, row.get(2)?));
    }
    Ok(items)
}

/// Nutrient row before unit validation.
struct RawNutrientRow {
    node_id: NutrientNodeId,
    name: String,
    amount: f64,
    unit: String,
}

impl RawNutrientRow {
    fn into_node(self) -> RepoResult<NutrientNode> {
        let unit = MassUnit::from_symbol(&self.unit).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid unit `{}` in nutrient_nodes.unit",
                self.unit
            ))
        })?;
        let mut node = NutrientNode::new(self.name, self.amount, unit);
        node.stored_id = Some(self.node_id);
        Ok(node)
    }
}

fn parse_nutrient_row_raw(row: &Row<'_>) -> rusqlite::Result<RawNutrientRow> {
    Ok(RawNutrientRow {
        node_id: row.get(0)?,
        name: row.get(1)?,
        amount: row.get(2)?,
        unit: row.get(3)?,
    })
}

fn load_nutrient_subtree(
    conn: &Connection,
    node_id: NutrientNodeId,
) -> RepoResult<Option<NutrientNode>> {
    let root = conn
        .query_row(
            "SELECT node_id, name, amount, unit
             FROM nutrient_nodes
             WHERE node_id = ?1;",
            [node_id],
            parse_nutrient_row_raw,
        )
        .optional()?;
    let Some(raw) = root else {
        return Ok(None);
    };
    let mut node = raw.into_node()?;
    load_nutrient_children(conn, &mut node)?;
    Ok(Some(node))
}

fn load_nutrient_children(conn: &Connection, node: &mut NutrientNode) -> RepoResult<()> {
    let Some(parent_id) = node.stored_id else {
        return Ok(());
    };
    let raws = {
        let mut stmt = conn.prepare(
            "SELECT n.node_id, n.name, n.amount, n.unit
             FROM nutrient_edges e
             INNER JOIN nutrient_nodes n ON n.node_id = e.child_node_id
             WHERE e.parent_node_id = ?1
             ORDER BY e.sort_order ASC;",
        )?;
        let mut rows = stmt.query([parent_id])?;
        let mut raws = Vec::new();
        while let Some(row) = rows.next()? {
            raws.push(parse_nutrient_row_raw(row)?);
        }
        raws
    };
    for raw in raws {
        let mut child = raw.into_node()?;
        load_nutrient_children(conn, &mut child)?;
        node.children.push(child);
    }
    Ok(())
}

fn child_node_ids(
    conn: &Connection,
    parent_id: NutrientNodeId,
) -> RepoResult<Vec<NutrientNodeId>> {
    let mut stmt = conn.prepare(
        "SELECT child_node_id
         FROM nutrient_edges
         WHERE parent_node_id = ?1
         ORDER BY sort_order ASC;",
    )?;
    let mut rows = stmt.query([parent_id])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

fn insert_child_edges(
    conn: &Connection,
    parent_id: NutrientNodeId,
    child_ids: &[NutrientNodeId],
) -> RepoResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO nutrient_edges (parent_node_id, sort_order, child_node_id)
         VALUES (?1, ?2, ?3);",
    )?;
    for (index, child_id) in child_ids.iter().enumerate() {
        stmt.execute(params![parent_id, index as i64, child_id])?;
    }
    Ok(())
}

/// Nodes reachable from any version link.
const LIVE_NUTRIENTS_CTE: &str = "WITH RECURSIVE live(node_id) AS (
    SELECT node_id FROM version_nutrients
    UNION
    SELECT e.child_node_id
    FROM nutrient_edges e
    INNER JOIN live ON e.parent_node_id = live.node_id
)";

fn query_keys<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    column: &'static str,
) -> RepoResult<Vec<VersionKey>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        let food_id_text: String = row.get(0)?;
        keys.push(VersionKey::new(
            parse_uuid(&food_id_text, column)?,
            row.get(1)?,
        ));
    }
    Ok(keys)
}

fn count_rows(conn: &Connection, table: &'static str) -> RepoResult<usize> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

fn parse_flag(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid flag value `{other}` in {column}"
        ))),
    }
}

fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

const REQUIRED_TABLES: [&str; 8] = [
    "foods",
    "food_versions",
    "nutrient_nodes",
    "nutrient_edges",
    "version_nutrients",
    "ingredients",
    "food_groups",
    "group_members",
];

fn ensure_food_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in REQUIRED_TABLES {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
