use tidepool_core::hlc::ManualTime;
use tidepool_core::{FieldValue, RowId};
use tidepool_engine::{BatchOp, EngineError};
use tidepool_harness::{MemoryRemote, Table, TestPeer, init_tracing};

struct ProjectTree {
    project: RowId,
    tag: RowId,
    commitment: RowId,
    goal_list: RowId,
    goals: [RowId; 2],
}

impl ProjectTree {
    fn descendants(&self) -> Vec<(Table, RowId)> {
        vec![
            (Table::Tag, self.tag),
            (Table::Commitment, self.commitment),
            (Table::GoalList, self.goal_list),
            (Table::Goal, self.goals[0]),
            (Table::Goal, self.goals[1]),
        ]
    }
}

fn build_tree(peer: &mut TestPeer) -> Result<ProjectTree, EngineError> {
    let project = peer.create(Table::Project, vec![("name", "project-1".into())])?;
    let tag = peer.create(Table::Tag, vec![("project_id", project.into()), ("name", "tag-1".into())])?;
    let commitment = peer.create(Table::Commitment, vec![("project_id", project.into())])?;
    let goal_list = peer.create(Table::GoalList, vec![("project_id", project.into())])?;
    let goals = [
        peer.create(Table::Goal, vec![("goal_list_id", goal_list.into()), ("title", "goal-1".into())])?,
        peer.create(Table::Goal, vec![("goal_list_id", goal_list.into()), ("title", "goal-2".into())])?,
    ];
    Ok(ProjectTree {
        project,
        tag,
        commitment,
        goal_list,
        goals,
    })
}

fn peer() -> Result<TestPeer, EngineError> {
    init_tracing();
    TestPeer::new("owner-1", &MemoryRemote::new(), &ManualTime::new(1_000_000))
}

#[test]
fn project_delete_tombstones_every_descendant() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    let tree = build_tree(&mut peer)?;

    let touched = peer.engine.delete(Table::Project, tree.project)?;
    assert_eq!(touched, 6);

    let project = peer.row(Table::Project, tree.project)?.expect("tombstone kept");
    let deleted_at = project.deleted_at.expect("project tombstoned");

    let mut tombstones = 0;
    for (table, id) in tree.descendants() {
        let row = peer.row(table, id)?.expect("tombstone kept");
        assert!(row.deleted, "{table:?} {id} should be deleted");
        assert_eq!(row.deleted_at, Some(deleted_at));
        tombstones += 1;
    }
    assert_eq!(tombstones, 5);

    let key = FieldValue::Ref(tree.project);
    for table in [Table::Tag, Table::Commitment, Table::GoalList] {
        assert!(peer.engine.query(table, "project_id", &key)?.is_empty());
    }
    Ok(())
}

#[test]
fn deleting_a_tombstone_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    let tree = build_tree(&mut peer)?;
    peer.engine.delete(Table::Project, tree.project)?;
    let before = peer.row(Table::Goal, tree.goals[0])?;
    let pending = peer.engine.pending_count()?;

    peer.time.advance(5_000);
    assert_eq!(peer.engine.delete(Table::Project, tree.project)?, 0);
    assert_eq!(peer.engine.delete(Table::Goal, tree.goals[0])?, 0);

    assert_eq!(peer.row(Table::Goal, tree.goals[0])?, before);
    assert_eq!(peer.engine.pending_count()?, pending);
    Ok(())
}

#[test]
fn deleting_a_missing_row_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    assert_eq!(peer.engine.delete(Table::Project, RowId::new())?, 0);
    assert_eq!(peer.engine.pending_count()?, 0);
    Ok(())
}

#[test]
fn tag_delete_unlinks_tasks_instead_of_deleting_them() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    let project = peer.create(Table::Project, vec![("name", "Home".into())])?;
    let tag = peer.create(Table::Tag, vec![("project_id", project.into())])?;
    let task = peer.create(
        Table::Task,
        vec![("project_id", project.into()), ("tag_id", tag.into()), ("title", "call".into())],
    )?;

    assert_eq!(peer.engine.delete(Table::Tag, tag)?, 2);

    let task_row = peer.engine.get(Table::Task, task)?.expect("task survives");
    assert_eq!(task_row.field("tag_id"), Some(&FieldValue::Null));
    assert_eq!(task_row.field("title"), Some(&FieldValue::Text("call".into())));
    Ok(())
}

#[test]
fn project_delete_also_unlinks_tasks_of_its_tags() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    let tree = build_tree(&mut peer)?;
    let task = peer.create(Table::Task, vec![("tag_id", tree.tag.into())])?;

    assert_eq!(peer.engine.delete(Table::Project, tree.project)?, 7);
    assert_eq!(peer.field(Table::Task, task, "tag_id")?, Some(FieldValue::Null));
    Ok(())
}

#[test]
fn failing_batch_leaves_the_cascade_unapplied() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = peer()?;
    let tree = build_tree(&mut peer)?;
    let pending = peer.engine.pending_count()?;

    let result = peer.engine.batch_write(&[
        BatchOp::delete(Table::Project, tree.project),
        BatchOp::update(Table::Goal, RowId::new(), [("title", FieldValue::from("x"))]),
    ]);
    assert!(result.is_err());

    assert!(peer.engine.get(Table::Project, tree.project)?.is_some());
    for (table, id) in tree.descendants() {
        assert!(peer.engine.get(table, id)?.is_some(), "{table:?} {id} should be live");
    }
    assert_eq!(peer.engine.pending_count()?, pending);
    Ok(())
}

#[test]
fn cascade_replicates_to_other_peers() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let remote = MemoryRemote::new();
    let time = ManualTime::new(1_000_000);
    let mut a = TestPeer::new("owner-1", &remote, &time)?;
    let mut b = TestPeer::new("owner-1", &remote, &time)?;

    let tree = build_tree(&mut a)?;
    a.sync()?;
    b.sync()?;
    assert!(b.engine.get(Table::Goal, tree.goals[1])?.is_some());

    a.engine.delete(Table::Project, tree.project)?;
    a.sync()?;
    time.advance(b.engine.config().grace_window_ms + 1);
    b.sync()?;

    assert!(b.engine.get(Table::Project, tree.project)?.is_none());
    for (table, id) in tree.descendants() {
        assert!(b.engine.get(table, id)?.is_none(), "{table:?} {id} should be deleted on b");
        assert!(remote.row(id).is_some_and(|r| r.deleted));
    }
    Ok(())
}
