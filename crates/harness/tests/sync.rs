use tidepool_core::{FieldValue, Hlc, Row, RowId};
use tidepool_engine::{ChangeKind, ChangeOrigin};
use tidepool_harness::{Table, TestNetwork, init_tracing};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn two_peers() -> Result<TestNetwork, Box<dyn std::error::Error>> {
    init_tracing();
    let mut net = TestNetwork::new();
    net.add_peer("owner-1")?;
    net.add_peer("owner-1")?;
    Ok(net)
}

fn seed_goal(net: &mut TestNetwork) -> Result<RowId, Box<dyn std::error::Error>> {
    let goal = net.peer_mut(0).create(
        Table::Goal,
        vec![
            ("title", "goal-1".into()),
            ("target_value", FieldValue::Integer(10)),
            ("current_value", FieldValue::Integer(3)),
            ("completed", false.into()),
        ],
    )?;
    net.settle()?;
    assert!(net.peer(1).engine.get(Table::Goal, goal)?.is_some());
    Ok(goal)
}

// ============================================================================
// Counters
// ============================================================================

#[test]
fn concurrent_counter_taps_both_count() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(0).go_offline();
    net.peer(1).go_offline();
    net.peer_mut(0).engine.increment(Table::Goal, goal, "current_value", 2i64)?;
    net.peer_mut(1).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.peer(0).go_online();
    net.peer(1).go_online();
    net.settle()?;

    for i in 0..2 {
        assert_eq!(net.peer(i).field(Table::Goal, goal, "current_value")?, Some(FieldValue::Integer(6)));
        assert_eq!(net.peer(i).field(Table::Goal, goal, "completed")?, Some(FieldValue::Boolean(false)));
        assert_eq!(net.peer(i).engine.pending_count()?, 0);
    }
    let remote = net.remote.row(goal).expect("goal on remote");
    assert_eq!(remote.field("current_value"), Some(&FieldValue::Integer(6)));
    assert_eq!(remote.field("completed"), Some(&FieldValue::Boolean(false)));
    Ok(())
}

#[test]
fn interleaved_counter_taps_sum_every_delta() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(1).go_offline();
    net.peer_mut(0).engine.increment(Table::Goal, goal, "current_value", 2i64)?;
    net.peer_mut(0).engine.flush()?;
    net.peer_mut(1).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.advance(10);
    net.peer_mut(0).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.peer_mut(1).engine.increment(Table::Goal, goal, "current_value", 2i64)?;
    // Peer 1's second tap merged into its unsent first one.
    assert_eq!(net.peer(1).engine.pending_count()?, 1);

    net.peer(1).go_online();
    net.peer_mut(1).engine.flush()?;
    net.settle()?;

    for i in 0..2 {
        assert_eq!(net.peer(i).field(Table::Goal, goal, "current_value")?, Some(FieldValue::Integer(9)));
    }
    assert_eq!(
        net.remote.row(goal).and_then(|r| r.field("current_value").cloned()),
        Some(FieldValue::Integer(9))
    );
    Ok(())
}

// ============================================================================
// Field-level last-write-wins
// ============================================================================

#[test]
fn concurrent_edits_to_different_fields_both_survive() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(0).go_offline();
    net.peer(1).go_offline();
    net.peer_mut(0).engine.update(Table::Goal, goal, [("title", FieldValue::from("renamed"))])?;
    net.peer_mut(1).engine.update(Table::Goal, goal, [("target_value", FieldValue::Integer(12))])?;
    net.peer(0).go_online();
    net.peer(1).go_online();
    net.settle()?;

    for i in 0..2 {
        let row = net.peer(i).engine.get(Table::Goal, goal)?.expect("goal live");
        assert_eq!(row.field("title"), Some(&FieldValue::Text("renamed".into())));
        assert_eq!(row.field("target_value"), Some(&FieldValue::Integer(12)));
        assert!(!net.peer(i).engine.has_pending_divergence(Table::Goal, goal)?);
    }
    Ok(())
}

#[test]
fn later_edit_to_the_same_field_wins() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(0).go_offline();
    net.peer(1).go_offline();
    net.peer_mut(0).engine.update(Table::Goal, goal, [("title", FieldValue::from("first"))])?;
    net.advance(50);
    net.peer_mut(1).engine.update(Table::Goal, goal, [("title", FieldValue::from("second"))])?;
    net.peer(0).go_online();
    net.peer(1).go_online();
    net.settle()?;

    for i in 0..2 {
        assert_eq!(
            net.peer(i).field(Table::Goal, goal, "title")?,
            Some(FieldValue::Text("second".into()))
        );
    }
    Ok(())
}

#[test]
fn overruled_local_edit_is_flagged_until_acknowledged() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(0).go_offline();
    net.peer_mut(0).engine.update(Table::Goal, goal, [("title", FieldValue::from("mine"))])?;
    net.advance(50);
    net.peer_mut(1).engine.update(Table::Goal, goal, [("title", FieldValue::from("theirs"))])?;
    net.peer_mut(1).engine.flush()?;

    net.peer(0).go_online();
    let report = net.peer_mut(0).engine.flush()?;
    assert_eq!(report.remote_wins, 1);
    assert_eq!(report.sent, 0);

    let peer = net.peer_mut(0);
    assert_eq!(peer.field(Table::Goal, goal, "title")?, Some(FieldValue::Text("theirs".into())));
    assert!(peer.engine.has_pending_divergence(Table::Goal, goal)?);
    assert_eq!(peer.engine.divergent_rows()?, vec![("goal".to_string(), goal)]);

    assert!(peer.engine.acknowledge_divergence(Table::Goal, goal)?);
    assert!(!peer.engine.has_pending_divergence(Table::Goal, goal)?);
    assert!(!peer.engine.acknowledge_divergence(Table::Goal, goal)?);
    Ok(())
}

// ============================================================================
// Delete precedence
// ============================================================================

fn delete_races_edit(deleter: usize, editor: usize) -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer(0).go_offline();
    net.peer(1).go_offline();
    net.peer_mut(deleter).engine.delete(Table::Goal, goal)?;
    net.advance(50);
    net.peer_mut(editor).engine.update(Table::Goal, goal, [("title", FieldValue::from("late edit"))])?;
    net.peer_mut(editor).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.peer(0).go_online();
    net.peer(1).go_online();
    net.settle()?;

    for i in 0..2 {
        assert!(net.peer(i).engine.get(Table::Goal, goal)?.is_none());
        assert!(net.peer(i).row(Table::Goal, goal)?.is_some_and(|r| r.deleted));
        assert_eq!(net.peer(i).engine.pending_count()?, 0);
    }
    assert!(net.remote.row(goal).is_some_and(|r| r.deleted));
    Ok(())
}

#[test]
fn delete_beats_a_later_edit_pushed_after_it() -> TestResult {
    delete_races_edit(0, 1)
}

#[test]
fn delete_beats_a_later_edit_pushed_before_it() -> TestResult {
    delete_races_edit(1, 0)
}

// ============================================================================
// Pull path
// ============================================================================

#[test]
fn malformed_and_unknown_rows_are_skipped() -> TestResult {
    let mut net = two_peers()?;
    let now = Hlc::new(net.time.get(), 0);

    let unknown = Row::new(RowId::new(), "widget", "owner-1", now);
    let mut malformed = Row::new(RowId::new(), "goal", "owner-1", now);
    malformed.deleted = true;
    let mut valid = Row::new(RowId::new(), "tag", "owner-1", now);
    valid.set_field("name", "imported".into(), now)?;

    net.remote.inject_feed(unknown);
    net.remote.inject_feed(malformed.clone());
    net.remote.inject_feed(valid.clone());

    let report = net.peer_mut(0).engine.pull()?;
    assert_eq!(report.skipped, 2);
    assert_eq!(report.applied, 1);

    let peer = net.peer(0);
    assert!(peer.row(Table::Goal, malformed.id)?.is_none());
    assert_eq!(
        peer.field(Table::Tag, valid.id, "name")?,
        Some(FieldValue::Text("imported".into()))
    );
    // The cursor moved past the bad rows.
    assert_eq!(net.peer_mut(0).engine.pull()?.applied, 0);
    Ok(())
}

#[test]
fn edit_held_back_inside_the_grace_window_arrives_on_a_later_pull() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;
    let grace = net.peer(0).engine.config().grace_window_ms;

    net.peer_mut(0).engine.update(Table::Goal, goal, [("title", FieldValue::from("mine"))])?;
    net.peer_mut(0).engine.flush()?;
    net.advance(500);
    net.peer_mut(1).engine.pull()?;
    net.peer_mut(1).engine.update(Table::Goal, goal, [("notes", FieldValue::from("theirs"))])?;
    net.peer_mut(1).engine.flush()?;

    let report = net.peer_mut(0).engine.pull()?;
    assert_eq!(report.applied, 0);
    assert!(report.suppressed > 0);
    assert_eq!(net.peer(0).field(Table::Goal, goal, "notes")?, None);

    // The feed cursor is already past the held-back rows.
    net.advance(grace + 1);
    let report = net.peer_mut(0).engine.pull()?;
    assert_eq!(report.applied, 1);
    assert_eq!(report.suppressed, 0);
    net.settle()?;

    for i in 0..2 {
        let row = net.peer(i).engine.get(Table::Goal, goal)?.expect("goal live");
        assert_eq!(row.field("title"), Some(&FieldValue::Text("mine".into())));
        assert_eq!(row.field("notes"), Some(&FieldValue::Text("theirs".into())));
    }
    Ok(())
}

#[test]
fn counter_value_held_back_inside_the_grace_window_converges() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;

    net.peer_mut(0).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.peer_mut(0).engine.flush()?;
    net.advance(500);
    net.peer_mut(1).engine.increment(Table::Goal, goal, "current_value", 1i64)?;
    net.peer_mut(1).engine.flush()?;

    net.peer_mut(0).engine.pull()?;
    net.settle()?;

    for i in 0..2 {
        assert_eq!(net.peer(i).field(Table::Goal, goal, "current_value")?, Some(FieldValue::Integer(5)));
    }
    Ok(())
}

#[test]
fn pulled_changes_emit_remote_events() -> TestResult {
    let mut net = two_peers()?;
    let events = net.peer_mut(1).engine.subscribe();

    let project = net.peer_mut(0).create(Table::Project, vec![("name", "Home".into())])?;
    net.settle()?;
    net.peer_mut(0).engine.delete(Table::Project, project)?;
    net.settle()?;

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.id == project)
        .map(|e| (e.change, e.origin))
        .collect();
    assert_eq!(
        seen,
        vec![
            (ChangeKind::Created, ChangeOrigin::Remote),
            (ChangeKind::Deleted, ChangeOrigin::Remote),
        ]
    );
    Ok(())
}

#[test]
fn late_joiner_catches_up_from_the_feed() -> TestResult {
    let mut net = two_peers()?;
    let goal = seed_goal(&mut net)?;
    net.peer_mut(0).engine.increment(Table::Goal, goal, "current_value", 4i64)?;
    net.settle()?;

    let late = net.add_peer("owner-1")?;
    net.settle()?;
    assert_eq!(
        net.peer(late).field(Table::Goal, goal, "current_value")?,
        Some(FieldValue::Integer(7))
    );
    Ok(())
}
