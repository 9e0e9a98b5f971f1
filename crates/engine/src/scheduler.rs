//! Push and pull state machines.
//!
//! The scheduler only decides *when* to sync; the engine drives the actual
//! network round trips and reports back through [`SyncScheduler::finish_push`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use tracing::{debug, warn};

use tidepool_core::{Mutation, MutationPayload, RowId};

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Scheduled { due_ms: u64 },
    Pushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Listening,
    Applying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every entry that was pending when the push started is gone.
    Drained,
    /// Entries remain that could not be sent yet.
    Remaining,
    Failed,
}

#[derive(Debug)]
pub struct SyncScheduler {
    debounce_ms: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    push: PushState,
    pull: PullState,
    /// A local write arrived while a push was in flight.
    follow_up: bool,
    failures: u32,
}

impl SyncScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            debounce_ms: config.debounce_ms,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
            push: PushState::Idle,
            pull: PullState::Listening,
            follow_up: false,
            failures: 0,
        }
    }

    pub fn push_state(&self) -> PushState {
        self.push
    }

    pub fn pull_state(&self) -> PullState {
        self.pull
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_due(&self) -> Option<u64> {
        match self.push {
            PushState::Scheduled { due_ms } => Some(due_ms),
            _ => None,
        }
    }

    /// Trailing debounce: each write pushes the deadline out, but never
    /// earlier than a pending backoff.
    pub fn on_local_write(&mut self, now_ms: u64) {
        let debounced = now_ms.saturating_add(self.debounce_ms);
        self.push = match self.push {
            PushState::Idle => PushState::Scheduled { due_ms: debounced },
            PushState::Scheduled { due_ms } => PushState::Scheduled {
                due_ms: due_ms.max(debounced),
            },
            PushState::Pushing => {
                self.follow_up = true;
                PushState::Pushing
            }
        };
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        matches!(self.push, PushState::Scheduled { due_ms } if now_ms >= due_ms)
    }

    /// Enter `Pushing`. Returns false if a push is already in flight.
    pub fn begin_push(&mut self) -> bool {
        if self.push == PushState::Pushing {
            return false;
        }
        self.push = PushState::Pushing;
        self.follow_up = false;
        true
    }

    pub fn finish_push(&mut self, now_ms: u64, outcome: PushOutcome) {
        let follow_up = std::mem::take(&mut self.follow_up);
        self.push = match outcome {
            PushOutcome::Drained => {
                self.failures = 0;
                if follow_up {
                    PushState::Scheduled {
                        due_ms: now_ms.saturating_add(self.debounce_ms),
                    }
                } else {
                    PushState::Idle
                }
            }
            PushOutcome::Remaining => {
                self.failures = 0;
                PushState::Scheduled {
                    due_ms: now_ms.saturating_add(self.debounce_ms),
                }
            }
            PushOutcome::Failed => {
                self.failures = self.failures.saturating_add(1);
                let delay = self.backoff_delay();
                debug!(failures = self.failures, delay_ms = delay, "push failed, backing off");
                PushState::Scheduled {
                    due_ms: now_ms.saturating_add(delay),
                }
            }
        };
    }

    /// `min(base * 2^(failures - 1), max)`.
    pub fn backoff_delay(&self) -> u64 {
        let exponent = self.failures.saturating_sub(1).min(32);
        self.backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms)
    }

    /// Enter `Applying`. Returns false if a pull is already being applied.
    pub fn begin_pull(&mut self) -> bool {
        if self.pull == PullState::Applying {
            return false;
        }
        self.pull = PullState::Applying;
        true
    }

    pub fn finish_pull(&mut self) {
        self.pull = PullState::Listening;
    }
}

/// Order outbox entries so that a row's create is sent before anything that
/// touches or references that row. Ties keep outbox order.
pub fn order_for_push(mut pending: Vec<Mutation>) -> Vec<Mutation> {
    pending.sort_by_key(|m| m.seq);

    let creates: HashMap<RowId, usize> = pending
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m.payload, MutationPayload::Create { .. }))
        .map(|(i, m)| (m.entity_id, i))
        .collect();

    let n = pending.len();
    let mut indegree = vec![0usize; n];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (j, m) in pending.iter().enumerate() {
        let mut deps: BTreeSet<usize> = m
            .references()
            .into_iter()
            .filter_map(|r| creates.get(&r).copied())
            .collect();
        if let Some(&c) = creates.get(&m.entity_id) {
            deps.insert(c);
        }
        deps.remove(&j);
        for i in deps {
            edges[i].push(j);
            indegree[j] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &edges[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() < n {
        warn!(
            stuck = n - order.len(),
            "reference cycle among pending creates, falling back to outbox order"
        );
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        order.extend((0..n).filter(|i| !placed.contains(i)));
    }

    let mut slots: Vec<Option<Mutation>> = pending.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::{FieldValue, Hlc, Row};

    fn scheduler() -> SyncScheduler {
        SyncScheduler::new(&EngineConfig {
            debounce_ms: 100,
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn writes_debounce_until_quiet() {
        let mut s = scheduler();
        s.on_local_write(0);
        s.on_local_write(50);
        assert!(!s.is_due(120));
        assert!(s.is_due(150));
    }

    #[test]
    fn only_one_push_in_flight_and_follow_up_is_scheduled() {
        let mut s = scheduler();
        s.on_local_write(0);
        assert!(s.begin_push());
        assert!(!s.begin_push());
        s.on_local_write(10);
        s.finish_push(20, PushOutcome::Drained);
        assert_eq!(s.push_state(), PushState::Scheduled { due_ms: 120 });

        assert!(s.begin_push());
        s.finish_push(200, PushOutcome::Drained);
        assert_eq!(s.push_state(), PushState::Idle);
    }

    #[test]
    fn failures_back_off_exponentially_up_to_cap() {
        let mut s = scheduler();
        let mut delays = Vec::new();
        for _ in 0..5 {
            assert!(s.begin_push());
            s.finish_push(0, PushOutcome::Failed);
            delays.push(s.next_due().unwrap());
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);

        assert!(s.begin_push());
        s.finish_push(0, PushOutcome::Drained);
        assert_eq!(s.failures(), 0);
    }

    #[test]
    fn writes_do_not_cut_backoff_short() {
        let mut s = scheduler();
        assert!(s.begin_push());
        s.finish_push(0, PushOutcome::Failed);
        s.on_local_write(10);
        assert_eq!(s.next_due(), Some(1_000));
    }

    #[test]
    fn pull_is_single_flight() {
        let mut s = scheduler();
        assert!(s.begin_pull());
        assert!(!s.begin_pull());
        s.finish_pull();
        assert_eq!(s.pull_state(), PullState::Listening);
    }

    fn create(id: RowId, seq: i64, parent: Option<RowId>) -> Mutation {
        let mut row = Row::new(id, "goal", "owner", Hlc::new(1, 0));
        if let Some(parent) = parent {
            row.set_field("goal_list_id", parent.into(), Hlc::new(1, 0)).unwrap();
        }
        let mut m = Mutation::new("goal", id, MutationPayload::Create { row }, Hlc::new(1, 0));
        m.seq = seq;
        m
    }

    #[test]
    fn parent_create_is_sent_before_referencing_child() {
        let parent = RowId::new();
        let child = RowId::new();
        let mut set = Mutation::new(
            "goal",
            parent,
            MutationPayload::Set {
                field: "title".into(),
                value: FieldValue::Text("x".into()),
            },
            Hlc::new(2, 0),
        );
        set.seq = 3;
        let ordered = order_for_push(vec![set, create(parent, 2, None), create(child, 1, Some(parent))]);
        let ids: Vec<(RowId, i64)> = ordered.iter().map(|m| (m.entity_id, m.seq)).collect();
        assert_eq!(ids, vec![(parent, 2), (child, 1), (parent, 3)]);
    }

    #[test]
    fn independent_entries_keep_outbox_order() {
        let a = create(RowId::new(), 2, None);
        let b = create(RowId::new(), 1, None);
        let ordered = order_for_push(vec![a, b]);
        assert_eq!(ordered.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn reference_cycle_falls_back_to_outbox_order() {
        let a = RowId::new();
        let b = RowId::new();
        let ordered = order_for_push(vec![create(a, 1, Some(b)), create(b, 2, Some(a))]);
        assert_eq!(ordered.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
    }
}
