//! Query compilation and object queries over the gallery schema, plus
//! change-tracking properties.

use proptest::prelude::*;
use relgraph_codec::Value;
use relgraph_core::query::{CompiledQuery, Ordering, Property, SelectQuery, SqlCompiler};
use relgraph_core::{CoreError, CoreResult, Fault, PersistenceState, SqlConfig};
use relgraph_driver::Row;
use relgraph_testkit::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn compile(query: &SelectQuery) -> CoreResult<CompiledQuery> {
    let schema = gallery_schema();
    let config = SqlConfig::default();
    SqlCompiler::new(&schema, &config).compile_select(query)
}

/// Relationship hops in a path rooted at `Painting`.
fn hops(path: &str) -> usize {
    path.split('.').count() - 1
}

#[test]
fn filter_and_ordering_share_one_join() {
    let query = SelectQuery::new("Painting")
        .filter(Property::new("artist.name").eq("Monet"))
        .order_by(Ordering::asc("artist.name"));
    let compiled = compile(&query).unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT t0.ID, t0.TITLE, t0.IMAGE, t0.ARTIST_ID, t0.GALLERY_ID FROM PAINTING t0 \
         JOIN ARTIST t1 ON (t0.ARTIST_ID = t1.ID) WHERE t1.NAME = ? ORDER BY t1.NAME"
    );
    assert_eq!(compiled.params, vec![Value::from("Monet")]);
    assert!(!compiled.distinct);
}

#[test]
fn outer_marker_gets_its_own_left_join() {
    let query = SelectQuery::new("Painting")
        .filter(Property::new("artist.name").eq("Monet"))
        .order_by(Ordering::asc("artist+.name"));
    let compiled = compile(&query).unwrap();

    assert!(compiled.sql.contains(" JOIN ARTIST t1 ON (t0.ARTIST_ID = t1.ID)"));
    assert!(compiled.sql.contains(" LEFT JOIN ARTIST t2 ON (t0.ARTIST_ID = t2.ID)"));
    assert!(compiled.sql.ends_with("ORDER BY t2.NAME"));
}

#[test]
fn to_many_join_forces_distinct() {
    let query = SelectQuery::new("Gallery").filter(Property::new("exhibits.number").gt(3i64));
    let compiled = compile(&query).unwrap();

    assert!(compiled.sql.starts_with("SELECT DISTINCT t0.ID, t0.NAME FROM GALLERY t0"));
    assert!(compiled.distinct);
    assert!(!compiled.suppressed_distinct);
}

#[test]
fn large_objects_move_distinct_into_memory() {
    let store = TestChannel::new();
    let context = store.context();
    let query = SelectQuery::new("Artist")
        .filter(Property::new("paintings.title").like("Water%"))
        .limit(5);

    let compiled = context.compile(&query).unwrap();
    assert!(!compiled.sql.contains("DISTINCT"));
    assert!(!compiled.sql.contains("LIMIT"));
    assert!(compiled.suppressed_distinct);
    assert_eq!(compiled.memory_limit, Some(5));

    store.driver.push_rows(vec![
        artist_row(1, "Monet"),
        artist_row(1, "Monet"),
        artist_row(2, "Turner"),
    ]);
    let artists = context.perform_query(&query).unwrap();
    assert_eq!(artists.len(), 2);
    assert_eq!(artists[0].identity(), Some(artist_id(1)));
    assert_eq!(artists[1].identity(), Some(artist_id(2)));
}

#[test]
fn objects_bind_their_keys() {
    let store = TestChannel::new();
    let context = store.context();
    let artist = store.fetch_artist(&context, 7, "Degas");

    let compiled = context
        .compile(&SelectQuery::new("Painting").filter(Property::new("artist").eq(&artist)))
        .unwrap();
    assert!(compiled.sql.ends_with("WHERE t0.ARTIST_ID = ?"));
    assert_eq!(compiled.params, vec![Value::Integer(7)]);

    let unsaved = context.new_object("Artist").unwrap();
    let error = context
        .compile(&SelectQuery::new("Painting").filter(Property::new("artist").eq(&unsaved)))
        .unwrap_err();
    assert!(matches!(error, CoreError::InvalidParameter { .. }));

    let gallery = store.fetch_gallery(&context, 1, "Louvre");
    let error = context
        .compile(&SelectQuery::new("Painting").filter(Property::new("artist").eq(&gallery)))
        .unwrap_err();
    assert!(matches!(error, CoreError::InvalidParameter { .. }));
}

#[test]
fn bad_paths_are_rejected() {
    for path in ["artist.nope", "title.length", "artist..name", "title+"] {
        let query = SelectQuery::new("Painting").filter(Property::new(path).eq(1i64));
        assert!(
            matches!(compile(&query), Err(CoreError::InvalidPath { .. })),
            "{path} should not compile"
        );
    }
}

#[test]
fn column_query_groups_by_plain_columns() {
    let query = SelectQuery::new("Painting").column("artist.name").count();
    let compiled = compile(&query).unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT t1.NAME, COUNT(*) FROM PAINTING t0 JOIN ARTIST t1 ON (t0.ARTIST_ID = t1.ID) GROUP BY t1.NAME"
    );
    assert!(!compiled.object_query);
}

#[test]
fn quoting_applies_to_tables_and_columns() {
    let schema = gallery_schema();
    let config = SqlConfig::new().quote_identifiers(true);
    let compiled = SqlCompiler::new(&schema, &config)
        .compile_select(&SelectQuery::new("Gallery").filter(Property::new("name").is_null()))
        .unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT t0.\"ID\", t0.\"NAME\" FROM \"GALLERY\" t0 WHERE t0.\"NAME\" IS NULL"
    );
    assert!(compiled.params.is_empty());
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn compilation_is_deterministic(path in painting_path_strategy(), name in name_strategy()) {
        let query = SelectQuery::new("Painting")
            .filter(Property::new(path).eq(name.as_str()))
            .order_by(Ordering::desc(path));
        let first = compile(&query).unwrap();
        let second = compile(&query).unwrap();

        prop_assert_eq!(&first.sql, &second.sql);
        prop_assert_eq!(&first.params, &second.params);
        prop_assert_eq!(first.params.len(), 1);
        // One join per hop, shared by the qualifier and the ordering.
        prop_assert_eq!(first.sql.matches("JOIN ").count(), hops(path));
        // Paintings carry a BLOB, so a to-many hop can only dedup in memory.
        let to_many = path.contains("paintings") || path.contains("exhibits");
        prop_assert!(!first.distinct);
        prop_assert_eq!(first.suppressed_distinct, to_many);
    }

    #[test]
    fn edits_back_to_originals_leave_object_clean(edits in field_edits_strategy(8)) {
        let store = TestChannel::new();
        let context = store.context();
        let row = Row::new()
            .with("ID", 1i64)
            .with("NAME", "a")
            .with("BIO", "b")
            .with("VERSION", 1i64)
            .with("MENTOR_ID", Value::Null);
        let artist = store.fetch(&context, "Artist", row);

        let mut current: BTreeMap<&str, Value> =
            [("name", Value::from("a")), ("bio", Value::from("b"))].into_iter().collect();
        let original = current.clone();
        for edit in &edits {
            context.set_field(&artist, edit.attribute, edit.value.clone()).unwrap();
            current.insert(edit.attribute, edit.value.clone());
        }

        let clean = current == original;
        prop_assert_eq!(context.has_changes(), !clean);
        let expected = if clean { PersistenceState::Committed } else { PersistenceState::Modified };
        prop_assert_eq!(artist.state(), expected);

        let changed: BTreeSet<String> = context
            .diff(&artist_id(1))
            .map(|d| d.attributes().keys().cloned().collect())
            .unwrap_or_default();
        let expected: BTreeSet<String> = current
            .iter()
            .filter(|(k, v)| original.get(*k) != Some(*v))
            .map(|(k, _)| k.to_string())
            .collect();
        prop_assert_eq!(changed, expected);
    }

    #[test]
    fn membership_delta_is_the_net_effect(ops in membership_ops_strategy(3, 12)) {
        let store = TestChannel::new();
        let context = store.context();
        let artist = store.fetch_artist(&context, 1, "Monet");
        let paintings: Vec<_> = (1..=3)
            .map(|id| store.fetch(&context, "Painting", painting_row(id, "Study", None, None)))
            .collect();

        let mut members = BTreeSet::new();
        for op in &ops {
            let painting = &paintings[(op.painting() - 1) as usize];
            match op {
                MembershipOp::Add(id) => {
                    context.add_to_relationship(&artist, "paintings", painting).unwrap();
                    members.insert(*id);
                }
                MembershipOp::Remove(id) => {
                    context.remove_from_relationship(&artist, "paintings", painting).unwrap();
                    members.remove(id);
                }
            }
        }

        let delta: BTreeMap<_, i64> = context
            .diff(&artist_id(1))
            .and_then(|d| d.to_many("paintings").cloned())
            .unwrap_or_default();
        let expected: BTreeMap<_, i64> = members.iter().map(|id| (painting_id(*id), 1)).collect();
        prop_assert_eq!(delta, expected);

        for (index, painting) in paintings.iter().enumerate() {
            let member = members.contains(&(index as i64 + 1));
            let target = if member { Some(artist_id(1)) } else { None };
            prop_assert_eq!(painting.to_one("artist"), Fault::Loaded(target));
            prop_assert_eq!(painting.state() == PersistenceState::Modified, member);
        }
        prop_assert_eq!(artist.state() == PersistenceState::Modified, !members.is_empty());
    }
}
