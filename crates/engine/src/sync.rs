//! Driving the push and pull paths against the attached remote.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;

use tracing::{debug, info, warn};

use tidepool_core::{EntityKind, Mutation, MutationPayload, Row, RowId};
use tidepool_storage::{OUTBOX_TABLE, SYNC_META_TABLE, Store, StorageError, StoreTx};

use crate::error::EngineError;
use crate::events::{ChangeEvent, ChangeKind, ChangeOrigin};
use crate::remote::{PushAck, PushAction, PushOp, RemoteBackend, TransportError};
use crate::resolver::{self, PushDecision};
use crate::scheduler::{PushOutcome, order_for_push};
use crate::Engine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub already_applied: usize,
    pub remote_wins: usize,
    pub stale: usize,
    pub rejected: usize,
    pub deferred: usize,
    /// Outbox length once the push finished.
    pub remaining: u64,
}

impl PushReport {
    fn progress(&self) -> usize {
        self.applied + self.duplicates + self.already_applied + self.remote_wins + self.rejected
    }
}

impl AddAssign for PushReport {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.already_applied += other.already_applied;
        self.remote_wins += other.remote_wins;
        self.stale += other.stale;
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.remaining = other.remaining;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub applied: usize,
    pub unchanged: usize,
    /// Skipped behind a recent local write from some context.
    pub suppressed: usize,
    /// Malformed or unknown rows.
    pub skipped: usize,
}

impl AddAssign for PullReport {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.suppressed += other.suppressed;
        self.skipped += other.skipped;
    }
}

/// One outbox entry and what the resolver decided for it.
struct Planned {
    mutation: Mutation,
    decision: PushDecision,
}

fn no_remote() -> EngineError {
    TransportError::Unreachable("no remote attached".into()).into()
}

impl<K: EntityKind> Engine<K> {
    // ========================================================================
    // Push path
    // ========================================================================

    /// Push if the debounce or backoff deadline has passed.
    pub fn tick(&mut self) -> Result<Option<PushReport>, EngineError> {
        let now_ms = self.clock.physical_now()?;
        if !self.scheduler.is_due(now_ms) {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    /// Push the outbox now, ignoring the debounce.
    ///
    /// On a transport failure or cancellation every entry stays queued and
    /// the scheduler backs off.
    pub fn flush(&mut self) -> Result<PushReport, EngineError> {
        if !self.scheduler.begin_push() {
            debug!("push already in flight");
            return Ok(PushReport::default());
        }
        let Some(mut remote) = self.remote.take() else {
            self.finish_push(PushOutcome::Failed);
            return Err(no_remote());
        };
        let result = self.drain(remote.as_mut());
        self.remote = Some(remote);

        let outcome = match &result {
            Ok(report) if report.remaining == 0 => PushOutcome::Drained,
            Ok(_) => PushOutcome::Remaining,
            Err(err) => {
                warn!(error = %err, "push failed");
                PushOutcome::Failed
            }
        };
        self.finish_push(outcome);
        if let Ok(report) = &result {
            info!(
                sent = report.sent,
                applied = report.applied,
                remaining = report.remaining,
                "push finished"
            );
        }
        result
    }

    fn finish_push(&mut self, outcome: PushOutcome) {
        let now_ms = self.clock.physical_now().unwrap_or_else(|err| {
            warn!(error = %err, "time source failed, scheduling from zero");
            0
        });
        self.scheduler.finish_push(now_ms, outcome);
    }

    fn drain(&mut self, remote: &mut dyn RemoteBackend) -> Result<PushReport, EngineError> {
        let mut total = PushReport::default();
        loop {
            let round = self.push_round(remote)?;
            let progress = round.progress();
            total += round;
            if progress == 0 || total.remaining == 0 {
                return Ok(total);
            }
        }
    }

    fn push_round(&mut self, remote: &mut dyn RemoteBackend) -> Result<PushReport, EngineError> {
        let mut report = PushReport::default();
        let pending = self.storage.pending_mutations()?;
        if pending.is_empty() {
            return Ok(report);
        }
        // A counter can only wait for a create that is still queued.
        let creating: BTreeSet<RowId> = pending
            .iter()
            .filter(|m| matches!(m.payload, MutationPayload::Create { .. }))
            .map(|m| m.entity_id)
            .collect();
        let mut batch = order_for_push(pending);
        batch.truncate(self.config.push_batch_size);

        let snapshots = self.fetch_snapshots(remote, &batch)?;

        // Resolve against a projection of the remote so later entries in the
        // batch see the effect of earlier ones.
        let mut projected = snapshots.clone();
        let mut planned = Vec::with_capacity(batch.len());
        for mut m in batch {
            let decision = resolver::resolve_push(&m, projected.get(&m.entity_id))?;
            if let PushDecision::Send(action) = &decision {
                m.attempts += 1;
                if let PushAction::WriteCounter { stamp, .. } = action {
                    m.pushed_stamp = Some(*stamp);
                }
                if let Some(next) = resolver::project(projected.get(&m.entity_id), action)? {
                    projected.insert(m.entity_id, next);
                }
            }
            planned.push(Planned {
                mutation: m,
                decision,
            });
        }

        let ops: Vec<PushOp> = planned
            .iter()
            .filter_map(|p| match &p.decision {
                PushDecision::Send(action) => Some(PushOp {
                    op_id: p.mutation.op_id,
                    table: p.mutation.table.clone(),
                    id: p.mutation.entity_id,
                    action: action.clone(),
                }),
                _ => None,
            })
            .collect();

        let acks = if ops.is_empty() {
            Vec::new()
        } else {
            // Attempts and counter stamps are durable before anything leaves.
            self.cancel.check()?;
            self.storage.transaction(&[OUTBOX_TABLE], |tx| {
                for p in planned.iter().filter(|p| matches!(p.decision, PushDecision::Send(_))) {
                    tx.update_mutation(&p.mutation)?;
                }
                Ok::<_, StorageError>(())
            })?;
            debug!(ops = ops.len(), "pushing");
            let acks = remote.push(&ops)?;
            if acks.len() != ops.len() {
                return Err(TransportError::Protocol(format!(
                    "{} acks for {} ops",
                    acks.len(),
                    ops.len()
                ))
                .into());
            }
            self.cancel.check()?;
            acks
        };
        report.sent = ops.len();

        let mut acks = acks.into_iter();
        let mut remove = Vec::new();
        let mut refetch: BTreeSet<(String, RowId)> = BTreeSet::new();
        let mut settled: BTreeMap<RowId, String> = BTreeMap::new();
        let mut rejected = Vec::new();
        for p in &planned {
            let key = (p.mutation.table.clone(), p.mutation.entity_id);
            match &p.decision {
                PushDecision::Defer if creating.contains(&key.1) => report.deferred += 1,
                PushDecision::Defer => {
                    warn!(
                        table = %p.mutation.table,
                        id = %p.mutation.entity_id,
                        kind = p.mutation.kind().as_str(),
                        "remote never created this row, dropping mutation"
                    );
                    report.rejected += 1;
                    remove.push(p.mutation.op_id);
                    rejected.push(key);
                }
                PushDecision::AlreadyApplied => {
                    report.already_applied += 1;
                    remove.push(p.mutation.op_id);
                    settled.insert(key.1, key.0);
                }
                PushDecision::RemoteWins => {
                    report.remote_wins += 1;
                    settled.insert(key.1, key.0);
                }
                PushDecision::Send(_) => match acks.next() {
                    Some(PushAck::Applied) => {
                        report.applied += 1;
                        remove.push(p.mutation.op_id);
                        settled.insert(key.1, key.0);
                    }
                    Some(PushAck::Duplicate) => {
                        report.duplicates += 1;
                        remove.push(p.mutation.op_id);
                        refetch.insert(key);
                    }
                    Some(PushAck::Stale) => {
                        report.stale += 1;
                        refetch.insert(key);
                    }
                    Some(PushAck::Rejected(reason)) => {
                        warn!(
                            table = %p.mutation.table,
                            id = %p.mutation.entity_id,
                            kind = p.mutation.kind().as_str(),
                            %reason,
                            "remote rejected mutation, dropping it"
                        );
                        report.rejected += 1;
                        remove.push(p.mutation.op_id);
                        rejected.push(key.clone());
                        refetch.insert(key);
                    }
                    None => {}
                },
            }
        }
        // Entities with any unconfirmed entry are re-read instead of projected.
        settled.retain(|id, table| !refetch.contains(&(table.clone(), *id)));

        let reconciled: Vec<Row> = settled
            .keys()
            .filter_map(|id| projected.get(id).cloned())
            .collect();
        let stamp = self.clock.tick()?;
        let events = self.storage.transaction(&Self::full_scope(), |tx| {
            for op_id in &remove {
                tx.remove_mutation(*op_id)?;
            }
            for (table, id) in &rejected {
                tx.mark_divergence(table, *id, stamp)?;
            }
            let mut events = Vec::new();
            for row in &reconciled {
                if let Some(event) = merge_into(tx, row)? {
                    events.push(event);
                }
            }
            Ok::<_, EngineError>(events)
        })?;
        self.events.emit(events);

        if !refetch.is_empty() {
            let mut by_table: BTreeMap<String, Vec<RowId>> = BTreeMap::new();
            for (table, id) in refetch {
                by_table.entry(table).or_default().push(id);
            }
            let mut rows = Vec::new();
            for (table, ids) in by_table {
                match remote.fetch(&table, &ids) {
                    Ok(found) => rows.extend(found),
                    Err(err) => warn!(%table, error = %err, "refetch after push failed"),
                }
            }
            self.ingest(rows, None, false)?;
        }

        report.remaining = self.storage.outbox_len()?;
        Ok(report)
    }

    /// Current remote state of every entity in `batch`, by id.
    fn fetch_snapshots(
        &mut self,
        remote: &mut dyn RemoteBackend,
        batch: &[Mutation],
    ) -> Result<HashMap<RowId, Row>, EngineError> {
        let mut by_table: BTreeMap<&str, Vec<RowId>> = BTreeMap::new();
        for m in batch {
            let ids = by_table.entry(m.table.as_str()).or_default();
            if !ids.contains(&m.entity_id) {
                ids.push(m.entity_id);
            }
        }
        let mut snapshots = HashMap::new();
        for (table, ids) in by_table {
            self.cancel.check()?;
            for row in remote.fetch(table, &ids)? {
                if let Err(err) = row.validate() {
                    warn!(%table, id = %row.id, error = %err, "ignoring malformed snapshot");
                    continue;
                }
                self.observe(&row);
                snapshots.insert(row.id, row);
            }
        }
        Ok(snapshots)
    }

    /// Advance the local clock past a remote stamp.
    fn observe(&mut self, row: &Row) {
        if let Err(err) = self.clock.receive(&row.updated_at) {
            warn!(id = %row.id, error = %err, "remote stamp not merged into clock");
        }
    }

    // ========================================================================
    // Pull path
    // ========================================================================

    /// Ingest the remote change feed from the persisted cursor until caught up.
    pub fn pull(&mut self) -> Result<PullReport, EngineError> {
        let Some(mut remote) = self.remote.take() else {
            return Err(no_remote());
        };
        let result = self.pull_pages(remote.as_mut());
        self.remote = Some(remote);
        result
    }

    fn pull_pages(&mut self, remote: &mut dyn RemoteBackend) -> Result<PullReport, EngineError> {
        let mut total = self.retry_deferred(remote)?;
        loop {
            self.cancel.check()?;
            let since = self.storage.cursor()?;
            let page = remote.pull(since, self.config.pull_page_size)?;
            let fetched = page.rows.len();
            let advanced = Some(page.cursor) != since;
            total += self.ingest(page.rows, Some(page.cursor), true)?;
            if fetched < self.config.pull_page_size || !advanced {
                return Ok(total);
            }
        }
    }

    /// Fetch rows an earlier pull suppressed and merge them now that their
    /// announcements may have expired.
    ///
    /// The feed cursor has already moved past these rows, so this is the only
    /// way their remote state reaches the Local Store.
    fn retry_deferred(&mut self, remote: &mut dyn RemoteBackend) -> Result<PullReport, EngineError> {
        let deferred = self.storage.deferred_pulls()?;
        if deferred.is_empty() {
            return Ok(PullReport::default());
        }
        let mut by_table: BTreeMap<String, Vec<RowId>> = BTreeMap::new();
        for (table, id) in deferred {
            by_table.entry(table).or_default().push(id);
        }
        let mut rows = Vec::new();
        let mut gone = Vec::new();
        for (table, ids) in by_table {
            self.cancel.check()?;
            let found = remote.fetch(&table, &ids)?;
            gone.extend(ids.into_iter().filter(|id| !found.iter().any(|r| r.id == *id)));
            rows.extend(found);
        }
        if !gone.is_empty() {
            self.storage.transaction(&[SYNC_META_TABLE], |tx| {
                for id in &gone {
                    tx.clear_deferred_pull(*id)?;
                }
                Ok::<_, StorageError>(())
            })?;
        }
        debug!(rows = rows.len(), "retrying suppressed rows");
        self.ingest(rows, None, true)
    }

    /// Apply row snapshots delivered by a realtime feed.
    pub fn apply_remote_rows(&mut self, rows: Vec<Row>) -> Result<PullReport, EngineError> {
        self.ingest(rows, None, true)
    }

    /// Merge remote snapshots into the Local Store in one transaction.
    ///
    /// Unknown tables and malformed rows are skipped without affecting the
    /// rest of the page. With `suppress` set, rows behind a recent local write
    /// are left alone and recorded for a later retry.
    pub(crate) fn ingest(
        &mut self,
        rows: Vec<Row>,
        cursor: Option<u64>,
        suppress: bool,
    ) -> Result<PullReport, EngineError> {
        if !self.scheduler.begin_pull() {
            debug!("pull already being applied");
            return Ok(PullReport::default());
        }
        let result = self.ingest_rows(rows, cursor, suppress);
        self.scheduler.finish_pull();
        result
    }

    fn ingest_rows(
        &mut self,
        rows: Vec<Row>,
        cursor: Option<u64>,
        suppress: bool,
    ) -> Result<PullReport, EngineError> {
        let mut report = PullReport::default();
        let mut accepted = Vec::with_capacity(rows.len());
        let mut unusable = Vec::new();
        for row in rows {
            if K::from_name(&row.table).is_none() {
                warn!(table = %row.table, id = %row.id, "skipping row for unknown table");
                report.skipped += 1;
                unusable.push(row.id);
                continue;
            }
            if let Err(err) = row.validate() {
                warn!(table = %row.table, id = %row.id, error = %err, "skipping malformed row");
                report.skipped += 1;
                unusable.push(row.id);
                continue;
            }
            self.observe(&row);
            accepted.push(row);
        }

        let now_ms = self.clock.physical_now()?;
        let coordinator = &self.coordinator;
        let (events, counts) = self.storage.transaction(&Self::full_scope(), |tx| {
            let mut counts = PullReport::default();
            if suppress {
                coordinator.prune(tx, now_ms)?;
            }
            for id in &unusable {
                tx.clear_deferred_pull(*id)?;
            }
            let mut events = Vec::new();
            for row in &accepted {
                if suppress && coordinator.should_suppress(&*tx, row)? {
                    tx.defer_pull(&row.table, row.id)?;
                    counts.suppressed += 1;
                    continue;
                }
                match merge_into(tx, row) {
                    Ok(Some(event)) => {
                        tx.clear_deferred_pull(row.id)?;
                        counts.applied += 1;
                        events.push(event);
                    }
                    Ok(None) => {
                        tx.clear_deferred_pull(row.id)?;
                        counts.unchanged += 1;
                    }
                    Err(EngineError::Core(err))
                    | Err(EngineError::Storage(StorageError::Core(err))) => {
                        warn!(table = %row.table, id = %row.id, error = %err, "skipping unmergeable row");
                        tx.clear_deferred_pull(row.id)?;
                        counts.skipped += 1;
                    }
                    Err(EngineError::Storage(StorageError::ConstraintViolation(reason))) => {
                        warn!(table = %row.table, id = %row.id, %reason, "skipping conflicting row");
                        tx.clear_deferred_pull(row.id)?;
                        counts.skipped += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            if let Some(cursor) = cursor {
                tx.set_cursor(cursor)?;
            }
            Ok::<_, EngineError>((events, counts))
        })?;
        self.events.emit(events);

        report += counts;
        if report.applied + report.suppressed + report.skipped > 0 {
            debug!(
                applied = report.applied,
                unchanged = report.unchanged,
                suppressed = report.suppressed,
                skipped = report.skipped,
                "ingested remote rows"
            );
        }
        Ok(report)
    }
}

/// Merge one remote snapshot with local state inside `tx`.
///
/// Returns the change event if the local row changed.
fn merge_into(
    tx: &mut StoreTx<'_>,
    remote: &Row,
) -> Result<Option<ChangeEvent>, EngineError> {
    let local = tx.get_row(&remote.table, remote.id)?;
    let pending = tx.pending_for_entity(remote.id)?;
    let outcome = resolver::merge_remote(local.as_ref(), &pending, remote)?;

    let changed = local.as_ref() != Some(&outcome.row);
    // The row goes first: it is the only write that can be refused.
    if changed {
        tx.put_row(&outcome.row)?;
    }
    for op_id in &outcome.dropped {
        tx.remove_mutation(*op_id)?;
    }
    if outcome.divergent {
        tx.mark_divergence(&remote.table, remote.id, remote.updated_at)?;
        info!(table = %remote.table, id = %remote.id, "local edits overruled by remote");
    }
    if !changed {
        return Ok(None);
    }

    let change = match &local {
        None => ChangeKind::Created,
        Some(local) if outcome.row.deleted && !local.deleted => ChangeKind::Deleted,
        Some(_) => ChangeKind::Updated,
    };
    Ok(Some(ChangeEvent {
        table: remote.table.clone(),
        id: remote.id,
        change,
        origin: ChangeOrigin::Remote,
    }))
}
