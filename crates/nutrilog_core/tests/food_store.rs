use nutrilog_core::db::open_db_in_memory;
use nutrilog_core::{
    FoodError, FoodRecord, GroupId, IngredientRef, MassUnit, NutrientNode,
    SqliteFoodRepository, StoreError, TaxonomyIndex, UpdateOutcome, VersionKey, VersionedStore,
};
use rusqlite::Connection;

fn store(conn: &Connection) -> VersionedStore<SqliteFoodRepository<'_>> {
    VersionedStore::new(SqliteFoodRepository::try_new(conn).unwrap())
}

fn grams(name: &str, amount: f64) -> NutrientNode {
    NutrientNode::new(name, amount, MassUnit::Grams)
}

fn oatmeal() -> FoodRecord {
    let mut record = FoodRecord::new("Oatmeal");
    record.set_calories(150);
    record.serving.description = Some("1 bowl".to_string());
    record.serving.grams = Some(240.0);
    record
        .nutrients
        .push(grams("Fat", 10.0).with_child(grams("SaturatedFat", 3.0)));
    record.nutrients.push(grams("Protein", 5.0));
    record
}

/// Creates `record` and pins its first version in two groups.
fn create_shared(
    store: &VersionedStore<SqliteFoodRepository<'_>>,
    record: &FoodRecord,
) -> (VersionKey, [GroupId; 2]) {
    let stored = store.create(record).unwrap();
    let breakfast = store.create_group("Breakfast").unwrap().group_id;
    let favourites = store.create_group("Favourites").unwrap().group_id;
    store.add_to_group(breakfast, stored.composite_id()).unwrap();
    store.add_to_group(favourites, stored.composite_id()).unwrap();
    (stored.composite_id(), [breakfast, favourites])
}

#[test]
fn create_then_get_current_roundtrips() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();

    let stored = store.create(&record).unwrap();
    assert_eq!(stored.version, 1);
    assert!(stored.is_equivalent(&record));

    let loaded = store.get_current(record.identity).unwrap();
    assert_eq!(loaded.serving.description.as_deref(), Some("1 bowl"));
    assert_eq!(loaded.total_nutrient_grams("SaturatedFat"), Some(3.0));
    assert_eq!(loaded.nutrients[0].name, "Fat");
    assert_eq!(loaded.nutrients[1].name, "Protein");
    assert_eq!(
        store.current_key(record.identity).unwrap(),
        VersionKey::new(record.identity, 1)
    );
}

#[test]
fn create_rejects_duplicates_and_later_versions() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    store.create(&record).unwrap();

    assert!(matches!(
        store.create(&record),
        Err(StoreError::FoodExists(id)) if id == record.identity
    ));

    let mut later = FoodRecord::new("Imported");
    later.version = 3;
    assert!(matches!(
        store.create(&later),
        Err(StoreError::InvalidInitialVersion(3))
    ));
}

#[test]
fn unknown_identity_and_version_are_reported() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();

    assert!(matches!(
        store.get_current(record.identity),
        Err(StoreError::FoodNotFound(_))
    ));
    store.create(&record).unwrap();
    let missing = VersionKey::new(record.identity, 9);
    assert!(matches!(
        store.get_version(missing),
        Err(StoreError::VersionNotFound(key)) if key == missing
    ));
}

#[test]
fn unreferenced_version_is_rewritten_in_place() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    store.create(&record).unwrap();

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(180);
    edited.modify_nutrient("SaturatedFat", Some(4.0), None, false);

    let outcome = store.update(&edited).unwrap();
    assert_eq!(outcome, UpdateOutcome::InPlace(record.composite_id()));

    let loaded = store.get_current(record.identity).unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.calories, 180);
    assert_eq!(loaded.total_nutrient_grams("Fat"), Some(11.0));
    assert_eq!(store.stats().unwrap().versions, 1);
}

#[test]
fn equivalent_snapshot_is_a_no_op() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    store.create(&record).unwrap();
    let before = store.stats().unwrap();

    let snapshot = store.get_current(record.identity).unwrap();
    let outcome = store.update(&snapshot).unwrap();

    assert_eq!(outcome, UpdateOutcome::Unchanged(record.composite_id()));
    assert_eq!(outcome.mode(), "unchanged");
    assert_eq!(store.stats().unwrap(), before);
}

#[test]
fn single_group_membership_sees_in_place_edits() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    store.create(&record).unwrap();
    let lunch = store.create_group("Lunch").unwrap().group_id;
    store.add_to_group(lunch, record.composite_id()).unwrap();

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(175);
    let outcome = store.update(&edited).unwrap();

    assert!(matches!(outcome, UpdateOutcome::InPlace(_)));
    let members = store.load_group(lunch).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].calories, 175);
}

#[test]
fn second_group_membership_forces_fork() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    let (v1, groups) = create_shared(&store, &record);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(300);
    let outcome = store.update(&edited).unwrap();

    let v2 = VersionKey::new(record.identity, 2);
    assert_eq!(
        outcome,
        UpdateOutcome::Forked {
            previous: v1,
            current: v2
        }
    );
    assert_eq!(store.get_current(record.identity).unwrap().calories, 300);
    assert_eq!(store.get_version(v1).unwrap().calories, 150);
    for group in groups {
        assert_eq!(store.group_members(group).unwrap(), vec![v1]);
    }
}

#[test]
fn stale_snapshot_is_rejected_after_fork() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    create_shared(&store, &record);

    let first = store.get_current(record.identity).unwrap();
    let mut edited = first.clone();
    edited.set_calories(300);
    store.update(&edited).unwrap();

    let mut late = first;
    late.set_calories(90);
    assert!(matches!(
        store.update(&late),
        Err(StoreError::StaleSnapshot {
            current: 2,
            found: 1,
            ..
        })
    ));
}

#[test]
fn ingredient_reference_forces_fork_and_migration_repins() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let taxonomy = TaxonomyIndex::builtin();
    let oats = oatmeal();
    store.create(&oats).unwrap();

    let mut porridge = FoodRecord::new("Porridge");
    porridge
        .add_ingredient(&taxonomy, store.get_current(oats.identity).unwrap(), true)
        .unwrap();
    store.create(&porridge).unwrap();

    let mut richer = store.get_current(oats.identity).unwrap();
    richer.set_calories(200);
    richer.modify_nutrient("Fat", Some(12.0), None, false);
    let outcome = store.update(&richer).unwrap();
    assert!(matches!(outcome, UpdateOutcome::Forked { .. }));

    let pinned = store.get_current(porridge.identity).unwrap();
    assert_eq!(pinned.ingredients[0].key(), VersionKey::new(oats.identity, 1));
    assert_eq!(pinned.calories, 150);

    let migrated = store
        .migrate_ingredient_ref(&taxonomy, porridge.identity, oats.identity)
        .unwrap();
    assert_eq!(migrated, UpdateOutcome::InPlace(porridge.composite_id()));

    let repinned = store.get_current(porridge.identity).unwrap();
    assert_eq!(repinned.ingredients[0].key(), VersionKey::new(oats.identity, 2));
    assert_eq!(repinned.calories, 200);
    assert_eq!(repinned.total_nutrient_grams("Fat"), Some(12.0));
    assert!(matches!(
        store.get_version(VersionKey::new(oats.identity, 1)),
        Err(StoreError::VersionNotFound(_))
    ));

    let again = store
        .migrate_ingredient_ref(&taxonomy, porridge.identity, oats.identity)
        .unwrap();
    assert!(matches!(again, UpdateOutcome::Unchanged(_)));
}

#[test]
fn migrating_group_members_releases_old_version() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    let (v1, [breakfast, favourites]) = create_shared(&store, &record);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(300);
    store.update(&edited).unwrap();
    let v2 = VersionKey::new(record.identity, 2);

    assert_eq!(store.migrate_group_member(breakfast, record.identity).unwrap(), v2);
    assert!(store.get_version(v1).is_ok());

    assert_eq!(store.migrate_group_member(favourites, record.identity).unwrap(), v2);
    assert!(matches!(
        store.get_version(v1),
        Err(StoreError::VersionNotFound(_))
    ));
    assert_eq!(store.stats().unwrap().versions, 1);
}

#[test]
fn collected_versions_are_never_reused() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    let (_, [breakfast, favourites]) = create_shared(&store, &record);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(300);
    store.update(&edited).unwrap();
    store.remove_from_group(breakfast, record.identity).unwrap();
    let report = store.remove_from_group(favourites, record.identity).unwrap();
    assert_eq!(report.versions_deleted, 1);

    let v2 = store.current_key(record.identity).unwrap();
    store.add_to_group(breakfast, v2).unwrap();
    store.add_to_group(favourites, v2).unwrap();
    let mut again = store.get_current(record.identity).unwrap();
    again.set_calories(320);

    let outcome = store.update(&again).unwrap();
    assert_eq!(outcome.current_key(), VersionKey::new(record.identity, 3));
}

#[test]
fn deleted_identity_is_tombstoned_and_pinned_versions_survive() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    let (v1, [breakfast, _]) = create_shared(&store, &record);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(300);
    store.update(&edited).unwrap();

    let report = store.delete_food(record.identity).unwrap();
    assert_eq!(report.versions_deleted, 1);
    assert!(matches!(
        store.get_current(record.identity),
        Err(StoreError::FoodDeleted(_))
    ));
    assert!(matches!(
        store.update(&edited),
        Err(StoreError::FoodDeleted(_))
    ));
    assert!(matches!(
        store.create(&record),
        Err(StoreError::FoodExists(_))
    ));
    assert_eq!(store.load_group(breakfast).unwrap()[0].composite_id(), v1);
}

#[test]
fn cycle_through_stored_versions_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let taxonomy = TaxonomyIndex::builtin();
    let salt = FoodRecord::new("Salt");
    store.create(&salt).unwrap();

    let mut brine = FoodRecord::new("Brine");
    brine
        .add_ingredient(&taxonomy, store.get_current(salt.identity).unwrap(), false)
        .unwrap();
    store.create(&brine).unwrap();

    // The embedded snapshot hides the back edge; the stored graph does not.
    let mut hidden = store.get_current(brine.identity).unwrap();
    hidden.ingredients.clear();
    let mut looped = store.get_current(salt.identity).unwrap();
    looped.ingredients.push(IngredientRef {
        food: hidden,
        serving_multiplier: 1.0,
    });

    assert!(matches!(
        store.update(&looped),
        Err(StoreError::Food(FoodError::CircularIngredient { .. }))
    ));
    assert!(store.get_current(salt.identity).unwrap().ingredients.is_empty());
}

#[test]
fn ingredient_pointing_at_unknown_version_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let taxonomy = TaxonomyIndex::builtin();
    let mut stew = FoodRecord::new("Stew");
    stew.add_ingredient(&taxonomy, FoodRecord::new("Ghost"), false)
        .unwrap();

    assert!(matches!(
        store.create(&stew),
        Err(StoreError::IngredientMissing(_))
    ));
    assert_eq!(store.stats().unwrap().foods, 0);
}

#[test]
fn unchanged_trees_are_shared_and_collected_exactly_once() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = oatmeal();
    let (_, [breakfast, favourites]) = create_shared(&store, &record);
    assert_eq!(store.stats().unwrap().nutrient_nodes, 3);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.set_calories(300);
    store.update(&edited).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.versions, 2);
    assert_eq!(stats.nutrient_nodes, 3);
    assert_eq!(stats.version_nutrient_links, 4);

    let mut protein = store.get_current(record.identity).unwrap();
    protein.modify_nutrient("Protein", Some(7.0), None, false);
    assert!(matches!(
        store.update(&protein).unwrap(),
        UpdateOutcome::InPlace(_)
    ));
    assert_eq!(store.stats().unwrap().nutrient_nodes, 4);

    let kept = store.delete_group(breakfast).unwrap();
    assert!(kept.is_empty());
    let report = store.delete_group(favourites).unwrap();
    assert_eq!(report.versions_deleted, 1);
    assert_eq!(report.nutrient_trees_deleted, 1);
    assert_eq!(report.nutrient_nodes_deleted, 1);

    let stats = store.stats().unwrap();
    assert_eq!(stats.versions, 1);
    assert_eq!(stats.nutrient_nodes, 3);
    assert_eq!(stats.version_nutrient_links, 2);
    assert_eq!(stats.groups, 0);

    let current = store.get_current(record.identity).unwrap();
    assert_eq!(current.total_nutrient_grams("SaturatedFat"), Some(3.0));
    assert_eq!(current.total_nutrient_grams("Protein"), Some(7.0));
    assert!(store.collect_garbage().unwrap().is_empty());
}

fn fat_breakdown() -> FoodRecord {
    let mut record = FoodRecord::new("Walnut butter");
    record.nutrients.push(
        grams("Fat", 10.0)
            .with_child(grams("SaturatedFat", 1.0))
            .with_child(
                grams("UnsaturatedFat", 9.0)
                    .with_child(grams("Monounsaturated", 2.0))
                    .with_child(grams("Polyunsaturated", 7.0)),
            ),
    );
    record
}

fn stored_id(record: &FoodRecord, name: &str) -> Option<i64> {
    record.find_nutrient(name).and_then(|node| node.stored_id)
}

#[test]
fn fork_shares_unchanged_sibling_subtrees() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = fat_breakdown();
    let (v1, [breakfast, favourites]) = create_shared(&store, &record);
    let before = store.stats().unwrap();
    assert_eq!((before.nutrient_nodes, before.nutrient_edges), (5, 4));

    let mut edited = store.get_current(record.identity).unwrap();
    edited.modify_nutrient("SaturatedFat", Some(2.0), None, false);
    assert!(matches!(
        store.update(&edited).unwrap(),
        UpdateOutcome::Forked { .. }
    ));

    let after = store.stats().unwrap();
    assert_eq!(after.nutrient_nodes, 7);
    assert_eq!(after.nutrient_edges, 6);

    let old = store.get_version(v1).unwrap();
    let new = store.get_current(record.identity).unwrap();
    assert_eq!(old.total_nutrient_grams("SaturatedFat"), Some(1.0));
    assert_eq!(new.total_nutrient_grams("SaturatedFat"), Some(2.0));
    assert_eq!(new.total_nutrient_grams("Fat"), Some(11.0));
    for shared in ["UnsaturatedFat", "Monounsaturated", "Polyunsaturated"] {
        assert_eq!(stored_id(&old, shared), stored_id(&new, shared));
    }
    assert_ne!(stored_id(&old, "Fat"), stored_id(&new, "Fat"));
    assert_ne!(stored_id(&old, "SaturatedFat"), stored_id(&new, "SaturatedFat"));

    store.remove_from_group(breakfast, record.identity).unwrap();
    let report = store.remove_from_group(favourites, record.identity).unwrap();
    assert_eq!(report.versions_deleted, 1);
    assert_eq!(report.nutrient_trees_deleted, 1);
    assert_eq!(report.nutrient_nodes_deleted, 2);
    let stats = store.stats().unwrap();
    assert_eq!((stats.nutrient_nodes, stats.nutrient_edges), (5, 4));
    let survivor = store.get_current(record.identity).unwrap();
    assert_eq!(survivor.total_nutrient_grams("Polyunsaturated"), Some(7.0));
}

#[test]
fn in_place_edit_forks_only_nodes_other_versions_reach() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let record = fat_breakdown();
    let (v1, _) = create_shared(&store, &record);

    let mut edited = store.get_current(record.identity).unwrap();
    edited.modify_nutrient("SaturatedFat", Some(2.0), None, false);
    store.update(&edited).unwrap();
    assert_eq!(store.stats().unwrap().nutrient_nodes, 7);

    let mut mono = store.get_current(record.identity).unwrap();
    let own_fat = stored_id(&mono, "Fat");
    let own_saturated = stored_id(&mono, "SaturatedFat");
    mono.modify_nutrient("Monounsaturated", Some(3.0), None, false);
    assert!(matches!(
        store.update(&mono).unwrap(),
        UpdateOutcome::InPlace(_)
    ));

    assert_eq!(store.stats().unwrap().nutrient_nodes, 9);
    let current = store.get_current(record.identity).unwrap();
    assert_eq!(stored_id(&current, "Fat"), own_fat);
    assert_eq!(stored_id(&current, "SaturatedFat"), own_saturated);
    assert_eq!(current.total_nutrient_grams("Monounsaturated"), Some(3.0));
    assert_eq!(current.total_nutrient_grams("UnsaturatedFat"), Some(10.0));

    let pinned = store.get_version(v1).unwrap();
    assert_eq!(pinned.total_nutrient_grams("Monounsaturated"), Some(2.0));
    assert_eq!(pinned.total_nutrient_grams("UnsaturatedFat"), Some(9.0));
}

#[test]
fn gc_follows_ingredient_of_ingredient_chains() {
    let conn = open_db_in_memory().unwrap();
    let store = store(&conn);
    let taxonomy = TaxonomyIndex::builtin();

    let mut flour = FoodRecord::new("Flour");
    flour.set_calories(100);
    flour.nutrients.push(grams("Protein", 3.0));
    store.create(&flour).unwrap();
    let mut dough = FoodRecord::new("Dough");
    dough
        .add_ingredient(&taxonomy, store.get_current(flour.identity).unwrap(), true)
        .unwrap();
    store.create(&dough).unwrap();
    let mut pizza = FoodRecord::new("Pizza");
    pizza
        .add_ingredient(&taxonomy, store.get_current(dough.identity).unwrap(), true)
        .unwrap();
    store.create(&pizza).unwrap();

    let mut stronger = store.get_current(flour.identity).unwrap();
    stronger.modify_nutrient("Protein", Some(4.0), None, false);
    assert!(matches!(
        store.update(&stronger).unwrap(),
        UpdateOutcome::Forked { .. }
    ));
    let mut bigger = store.get_current(dough.identity).unwrap();
    bigger.set_calories(180);
    assert!(matches!(
        store.update(&bigger).unwrap(),
        UpdateOutcome::Forked { .. }
    ));
    assert!(matches!(
        store
            .migrate_ingredient_ref(&taxonomy, dough.identity, flour.identity)
            .unwrap(),
        UpdateOutcome::InPlace(_)
    ));
    assert_eq!(store.stats().unwrap().versions, 5);

    let report = store.delete_food(pizza.identity).unwrap();
    assert_eq!(report.versions_deleted, 3);
    for gone in [
        VersionKey::new(pizza.identity, 1),
        VersionKey::new(dough.identity, 1),
        VersionKey::new(flour.identity, 1),
    ] {
        assert!(matches!(
            store.get_version(gone),
            Err(StoreError::VersionNotFound(_))
        ));
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.versions, 2);
    assert_eq!(stats.ingredient_links, 1);
    assert_eq!(stats.version_nutrient_links, 2);
    assert_eq!(stats.nutrient_nodes, 2);
    assert_eq!(stats.nutrient_edges, 0);
    let dough_now = store.get_current(dough.identity).unwrap();
    assert_eq!(
        dough_now.ingredients[0].key(),
        VersionKey::new(flour.identity, 2)
    );
    assert!(store.collect_garbage().unwrap().is_empty());
}
