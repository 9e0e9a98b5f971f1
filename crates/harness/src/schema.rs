use tidepool_core::{EntityKind, OrderScope, Placement, Relationship};

/// Entity kinds of the goal-tracking domain used by the scenario tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Project,
    Tag,
    Commitment,
    GoalList,
    Goal,
    Task,
}

static RELATIONSHIPS: [Relationship<Table>; 5] = [
    Relationship::cascade(Table::Project, Table::Tag, "project_id"),
    Relationship::cascade(Table::Project, Table::Commitment, "project_id"),
    Relationship::cascade(Table::Project, Table::GoalList, "project_id"),
    Relationship::cascade(Table::GoalList, Table::Goal, "goal_list_id"),
    Relationship::unlink(Table::Tag, Table::Task, "tag_id"),
];

impl EntityKind for Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Project => "project",
            Table::Tag => "tag",
            Table::Commitment => "commitment",
            Table::GoalList => "goal_list",
            Table::Goal => "goal",
            Table::Task => "task",
        }
    }

    fn all() -> &'static [Self] {
        &[
            Table::Project,
            Table::Tag,
            Table::Commitment,
            Table::GoalList,
            Table::Goal,
            Table::Task,
        ]
    }

    fn relationships() -> &'static [Relationship<Self>] {
        &RELATIONSHIPS
    }

    fn order_scope(&self) -> Option<OrderScope> {
        match self {
            Table::Goal => Some(OrderScope {
                scope_field: "goal_list_id",
                placement: Placement::Prepend,
            }),
            Table::Task => Some(OrderScope {
                scope_field: "project_id",
                placement: Placement::Append,
            }),
            _ => None,
        }
    }
}
