//! Benchmark utilities.

use relgraph_codec::Value;
use relgraph_core::query::SelectQuery;
use relgraph_core::{Context, EntityRef};
use relgraph_sync_protocol::{ContextId, GraphDiffEvent, ObjectChange};
use relgraph_testkit::{artist_id, artist_row, painting_row, TestChannel};
use std::collections::BTreeMap;

/// Registers `count` new artists, each with `paintings` new paintings.
pub fn new_artists(context: &Context, count: usize, paintings: usize) -> Vec<EntityRef> {
    (0..count)
        .map(|i| {
            let artist = context.new_object("Artist").expect("Failed to create artist");
            context
                .set_field(&artist, "name", format!("Artist {i}"))
                .expect("Failed to set name");
            for j in 0..paintings {
                let painting = context.new_object("Painting").expect("Failed to create painting");
                context
                    .set_field(&painting, "title", format!("Painting {i}.{j}"))
                    .expect("Failed to set title");
                context
                    .set_to_one(&painting, "artist", Some(&artist))
                    .expect("Failed to relate painting");
            }
            artist
        })
        .collect()
}

/// Fetches artists `1..=count` into `context`.
pub fn fetch_artists(store: &TestChannel, context: &Context, count: i64) -> Vec<EntityRef> {
    store
        .driver
        .push_rows((1..=count).map(|id| artist_row(id, "Monet")).collect());
    context
        .perform_query(&SelectQuery::new("Artist"))
        .expect("Failed to fetch artists")
}

/// Scripts `count` painting rows for the next query.
pub fn script_paintings(store: &TestChannel, count: i64) {
    store.driver.push_rows(
        (1..=count)
            .map(|id| painting_row(id, "Study", Some(1), None))
            .collect(),
    );
}

/// A peer event renaming artists `1..=count`.
pub fn rename_event(count: i64) -> GraphDiffEvent {
    let mut event = GraphDiffEvent::new(ContextId::new(u64::MAX));
    for id in 1..=count {
        let row: BTreeMap<String, Value> = artist_row(id, "Renamed").into_map();
        event
            .changes
            .push(ObjectChange::update(artist_id(id), row, vec!["NAME".to_string()]));
    }
    event
}
