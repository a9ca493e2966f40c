//! Peer contexts sharing one channel: merges, conflicts, membership
//! changes and event delivery.

use relgraph_codec::Value;
use relgraph_core::{
    ChannelConfig, Context, ContextConfig, ContextDelegate, DeliveryMode, Fault, PeerListener,
    PersistenceState,
};
use relgraph_sync_protocol::{ChangeKind, GraphDiffEvent, LocalChange, MergeDecision, MergePolicy};
use relgraph_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

fn watch(context: &Context, delegate: RecordingDelegate) -> Arc<RecordingDelegate> {
    let delegate = Arc::new(delegate);
    let shared: Arc<dyn ContextDelegate> = delegate.clone();
    context.set_delegate(Some(shared));
    delegate
}

#[test]
fn clean_copy_takes_peer_update() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let delegate = watch(&b, RecordingDelegate::deferring());

    a.set_field(&mine, "name", "Claude Monet").unwrap();
    let summary = a.commit().unwrap();

    assert_eq!(theirs.value("name"), Value::from("Claude Monet"));
    assert_eq!(theirs.state(), PersistenceState::Committed);
    assert_eq!(
        b.snapshot(&artist_id(1)).unwrap().get("NAME"),
        Some(&Value::from("Claude Monet"))
    );
    let reports = delegate.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(Some(reports[0].sequence), summary.sequence);
    assert_eq!(reports[0].applied, vec![artist_id(1)]);
    assert!(delegate.conflicts().is_empty());
}

#[test]
fn local_edits_survive_by_default() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let delegate = watch(&b, RecordingDelegate::deferring());
    b.set_field(&theirs, "name", "Local").unwrap();

    a.set_field(&mine, "name", "Remote").unwrap();
    a.commit().unwrap();

    assert_eq!(theirs.value("name"), Value::from("Local"));
    assert_eq!(theirs.state(), PersistenceState::Modified);
    let conflicts = delegate.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local, LocalChange::Modified);
    assert_eq!(conflicts[0].incoming_kind, ChangeKind::Update);
    assert_eq!(
        conflicts[0].overlapping_columns(),
        BTreeSet::from(["NAME".to_string()])
    );
    assert_eq!(delegate.skipped().len(), 1);
    assert_eq!(delegate.reports()[0].skipped, vec![artist_id(1)]);
    // The stale snapshot still guards the next write.
    assert_eq!(
        b.snapshot(&artist_id(1)).unwrap().get("NAME"),
        Some(&Value::from("Monet"))
    );
}

#[test]
fn disjoint_policy_merges_other_columns() {
    let store = TestChannel::new();
    let a = store.context();
    let b = store.context_with(ContextConfig::new().merge_policy(MergePolicy::MergeDisjoint));
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let delegate = watch(&b, RecordingDelegate::deferring());
    b.set_field(&theirs, "bio", "Painter of light").unwrap();

    a.set_field(&mine, "name", "Claude Monet").unwrap();
    a.commit().unwrap();

    assert_eq!(theirs.value("name"), Value::from("Claude Monet"));
    assert_eq!(theirs.value("bio"), Value::from("Painter of light"));
    assert_eq!(theirs.state(), PersistenceState::Modified);
    assert!(delegate.skipped().is_empty());
    assert_eq!(delegate.reports()[0].applied, vec![artist_id(1)]);
}

#[test]
fn delegate_decision_overrides_policy() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    watch(&b, RecordingDelegate::deciding(MergeDecision::Approve));
    b.set_field(&theirs, "name", "Local").unwrap();

    a.set_field(&mine, "name", "Remote").unwrap();
    a.commit().unwrap();

    assert_eq!(theirs.value("name"), Value::from("Remote"));
    assert_eq!(theirs.state(), PersistenceState::Committed);
    assert!(!b.has_changes());
}

#[test]
fn peer_delete_drops_clean_copy() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let delegate = watch(&b, RecordingDelegate::deferring());

    store.driver.push_rows(vec![]);
    a.delete_object(&mine).unwrap();
    a.commit().unwrap();

    assert_eq!(theirs.state(), PersistenceState::Transient);
    assert!(b.lookup(&artist_id(1)).is_none());
    assert!(b.snapshot(&artist_id(1)).is_none());
    assert_eq!(delegate.reports()[0].removed, vec![artist_id(1)]);
}

#[test]
fn approved_peer_delete_reinserts_local_edits() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let delegate = watch(&b, RecordingDelegate::deciding(MergeDecision::Approve));
    b.set_field(&theirs, "name", "Kept").unwrap();

    store.driver.push_rows(vec![]);
    a.delete_object(&mine).unwrap();
    a.commit().unwrap();

    assert!(delegate.conflicts()[0].is_remote_delete());
    assert_eq!(theirs.state(), PersistenceState::New);
    assert_eq!(theirs.identity(), Some(artist_id(1)));

    let summary = b.commit().unwrap();
    assert_eq!(summary.inserted, 1);
    let inserts = store.driver.statements_starting_with("INSERT INTO ARTIST");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].params[0], Value::Integer(1));
    assert_eq!(inserts[0].params[1], Value::from("Kept"));
    assert_eq!(theirs.state(), PersistenceState::Committed);
}

#[test]
fn unknown_objects_are_ignored() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let delegate = watch(&b, RecordingDelegate::deferring());

    let artist = a.new_object("Artist").unwrap();
    a.set_field(&artist, "name", "Cassatt").unwrap();
    a.commit().unwrap();

    assert_eq!(b.registered_count(), 0);
    let reports = delegate.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].ignored, 1);
    assert!(reports[0].applied.is_empty());
}

#[test]
fn moved_painting_updates_peer_lists() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let (monet, _paintings) = scenarios::artist_with_paintings(&store, &b, 1, 1);
    let degas = store.fetch_artist(&b, 2, "Degas");
    store.driver.push_rows(vec![]);
    assert!(b.related_objects(&degas, "paintings").unwrap().is_empty());
    let delegate = watch(&b, RecordingDelegate::deferring());

    let painting = store.fetch_painting(&a, 100, "Painting 0", Some(1));
    let _old_owner = store.fetch_artist(&a, 1, "Monet");
    let new_owner = store.fetch_artist(&a, 2, "Degas");
    a.set_to_one(&painting, "artist", Some(&new_owner)).unwrap();
    a.commit().unwrap();

    let updates = store.driver.statements_starting_with("UPDATE PAINTING");
    assert_eq!(updates.len(), 1);
    assert_eq!(monet.to_many("paintings"), Fault::Loaded(vec![]));
    assert_eq!(degas.to_many("paintings"), Fault::Loaded(vec![painting_id(100)]));
    let copy = b.lookup(&painting_id(100)).unwrap();
    assert_eq!(copy.to_one("artist"), Fault::Loaded(Some(artist_id(2))));
    assert_eq!(delegate.reports()[0].arcs, 2);
}

#[test]
fn invalidation_reaches_every_peer() {
    let store = TestChannel::new();
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");

    assert_eq!(a.invalidate_objects(&[artist_id(1)]), 1);

    assert_eq!(mine.state(), PersistenceState::Hollow);
    assert_eq!(theirs.state(), PersistenceState::Hollow);
    assert_eq!(theirs.get("name"), Fault::NotLoaded);

    store.driver.push_rows(vec![artist_row(1, "Refetched")]);
    b.resolve_fault(&theirs).unwrap();
    assert_eq!(theirs.state(), PersistenceState::Committed);
    assert_eq!(theirs.value("name"), Value::from("Refetched"));
}

#[test]
fn background_delivery_after_drain() {
    let store = TestChannel::with_config(ChannelConfig::new().delivery(DeliveryMode::Background));
    let (a, b) = (store.context(), store.context());
    let mine = store.fetch_artist(&a, 1, "Monet");
    let theirs = store.fetch_artist(&b, 1, "Monet");
    let peer = Arc::new(RecordingPeer::new(u64::MAX));
    let weak: Weak<dyn PeerListener> = Arc::downgrade(&peer) as Weak<dyn PeerListener>;
    store.channel.register_peer(weak);

    for name in ["One", "Two", "Three"] {
        a.set_field(&mine, "name", name).unwrap();
        a.commit().unwrap();
    }
    store.channel.drain();

    assert_eq!(peer.sequences(), vec![1, 2, 3]);
    assert_eq!(theirs.value("name"), Value::from("Three"));
    assert_eq!(theirs.state(), PersistenceState::Committed);
}

#[test]
fn dropped_peers_are_pruned() {
    let store = TestChannel::new();
    let before = store.channel.peer_count();
    let a = store.context();
    {
        let _b = store.context();
        assert_eq!(store.channel.peer_count(), before + 2);
    }
    let artist = a.new_object("Artist").unwrap();
    a.set_field(&artist, "name", "Pissarro").unwrap();
    a.commit().unwrap();
    assert_eq!(store.channel.peer_count(), before + 1);
}

#[test]
fn bridges_poll_and_subscribe() {
    let store = TestChannel::new();
    let receiver = store.channel.subscribe();
    let a = store.context();

    for name in ["Morisot", "Cassatt"] {
        let artist = a.new_object("Artist").unwrap();
        a.set_field(&artist, "name", name).unwrap();
        a.commit().unwrap();
    }

    assert_eq!(store.channel.latest_sequence(), 2);
    let all: Vec<u64> = store.channel.events_since(0, 10).iter().map(|e| e.sequence).collect();
    assert_eq!(all, vec![1, 2]);
    let tail = store.channel.events_since(1, 10);
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].changes[0].identity, artist_id(201));

    let pushed: Vec<GraphDiffEvent> = receiver.try_iter().collect();
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0].source, a.id());
    assert_eq!(pushed[0].changes[0].kind, ChangeKind::Insert);

    let decoded = GraphDiffEvent::decode(&pushed[1].encode().unwrap()).unwrap();
    assert_eq!(decoded, pushed[1]);
}
