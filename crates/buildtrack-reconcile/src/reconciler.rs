use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use buildtrack_config::{BuildtrackConfig, ReconcileConfig, database_path, load_workspace_config};
use buildtrack_core::{Channel, ObjectId, entity_key};
use buildtrack_store::{
    ChangeLogEntry, ChangeLogSink, ENTITY_STAGE_SNAPSHOT, NameCache, ProgressStore, SqliteStore,
    TtlNameCache,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;
use crate::aggregate::{HierarchyAggregator, ParentAggregation};
use crate::locks::ObjectLocks;
use crate::report::{
    FactCorrection, OmittedMilestone, ProgressReport, ProgressReporter, ReportRequest,
};
use crate::status::{ControlPointStatusView, annotate_control_points};
use crate::sync::{SyncChange, SyncPropagator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub as_of: NaiveDate,
    pub deadline_window_days: i64,
    pub actor: String,
    pub composite_milestone: String,
}

impl ReconcileSettings {
    pub fn from_config(config: &ReconcileConfig, as_of: NaiveDate) -> Self {
        Self {
            as_of,
            deadline_window_days: config.deadline_window_days,
            actor: config.actor.clone(),
            composite_milestone: config.composite_milestone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub object_id: ObjectId,
    pub as_of: NaiveDate,
    pub parents: Vec<ParentAggregation>,
    pub reports: Vec<ProgressReport>,
    pub corrections_applied: Vec<FactCorrection>,
    pub statuses: Vec<ControlPointStatusView>,
    pub sync: Vec<SyncChange>,
    pub omitted: Vec<OmittedMilestone>,
}

impl ReconcileOutcome {
    pub fn parents_updated(&self) -> usize {
        self.parents.iter().filter(|parent| parent.changed).count()
    }

    pub fn implementation_changes(&self) -> usize {
        self.sync
            .iter()
            .filter(|change| change.outcome.is_write())
            .count()
    }
}

/// Full reconciliation of one object against one store.
pub struct Reconciler<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    store: &'a S,
    changelog: &'a L,
    cache: &'a dyn NameCache,
    locks: &'a ObjectLocks,
    settings: &'a ReconcileSettings,
}

impl<'a, S, L> Reconciler<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    pub fn new(
        store: &'a S,
        changelog: &'a L,
        cache: &'a dyn NameCache,
        locks: &'a ObjectLocks,
        settings: &'a ReconcileSettings,
    ) -> Self {
        Self {
            store,
            changelog,
            cache,
            locks,
            settings,
        }
    }

    pub fn reconcile_object(
        &self,
        object_id: ObjectId,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.locks.with_lock(object_id, || self.reconcile_locked(object_id))
    }

    fn reconcile_locked(&self, object_id: ObjectId) -> Result<ReconcileOutcome, ReconcileError> {
        let settings = self.settings;
        let as_of = settings.as_of;

        let parents = HierarchyAggregator::new(self.store, self.changelog, &settings.actor, as_of)
            .aggregate_object(object_id)?;

        let reporter = ProgressReporter::new(self.store, &settings.composite_milestone);
        let mut reports = Vec::with_capacity(Channel::ALL.len());
        let mut corrections_applied = Vec::new();
        let mut omitted = BTreeMap::new();
        for channel in Channel::ALL {
            let report = reporter.report(ReportRequest {
                object_id,
                channel,
                as_of,
            })?;
            for correction in &report.corrections {
                if self.apply_correction(correction)? {
                    corrections_applied.push(*correction);
                }
            }
            for missing in &report.omitted {
                omitted
                    .entry(missing.milestone_id)
                    .or_insert_with(|| missing.clone());
            }
            reports.push(report);
        }

        let statuses =
            annotate_control_points(self.store, object_id, as_of, settings.deadline_window_days)?;

        let sync = SyncPropagator::new(self.store, self.changelog, self.cache, &settings.actor)
            .sync_object(object_id)?;

        let outcome = ReconcileOutcome {
            object_id,
            as_of,
            parents,
            reports,
            corrections_applied,
            statuses,
            sync,
            omitted: omitted.into_values().collect(),
        };
        tracing::info!(
            object_id,
            as_of = %as_of,
            parents_updated = outcome.parents_updated(),
            corrections = outcome.corrections_applied.len(),
            implementation_changes = outcome.implementation_changes(),
            omitted = outcome.omitted.len(),
            "object reconciled"
        );
        Ok(outcome)
    }

    /// Writes a composite-rule correction onto its snapshot row. Returns whether the row
    /// changed; an already-corrected row is left alone and not logged again.
    fn apply_correction(&self, correction: &FactCorrection) -> Result<bool, ReconcileError> {
        let FactCorrection {
            object_id,
            milestone_id,
            period,
            channel,
            fact,
            rule,
        } = *correction;

        let Some(before) = self.store.snapshot(object_id, milestone_id, period)? else {
            return Ok(false);
        };

        let persistence =
            || ReconcileError::persistence(ENTITY_STAGE_SNAPSHOT, object_id, milestone_id);
        let changed = self
            .store
            .correct_snapshot_fact(object_id, milestone_id, period, channel, fact)
            .map_err(persistence())?;
        if !changed {
            return Ok(false);
        }

        let mut after = before.clone();
        after.set_fact(channel, Some(fact));
        let entry = ChangeLogEntry::new(
            ENTITY_STAGE_SNAPSHOT,
            entity_key(object_id, milestone_id),
            serde_json::to_value(&before)?,
            serde_json::to_value(&after)?,
            &self.settings.actor,
        );
        self.changelog
            .record_change(&entry)
            .map_err(persistence())?;

        tracing::info!(
            object_id,
            milestone_id,
            period = %period,
            channel = channel.as_str(),
            rule = rule.as_str(),
            fact,
            "submission fact corrected"
        );
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ObjectRun {
    pub object_id: ObjectId,
    pub result: Result<ReconcileOutcome, ReconcileError>,
}

/// Reconciles many objects of one workspace on a bounded set of worker threads.
/// Each worker opens its own store connection; the name cache and object locks are
/// shared.
pub struct BatchReconciler {
    workspace: PathBuf,
    config: BuildtrackConfig,
    cache: Arc<dyn NameCache>,
    locks: Arc<ObjectLocks>,
}

impl BatchReconciler {
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self, ReconcileError> {
        let workspace = workspace.as_ref().to_path_buf();
        let config = load_workspace_config(&workspace)?;
        let ttl = Duration::from_secs(config.reconcile.name_cache_ttl_secs);
        Ok(Self {
            workspace,
            config,
            cache: Arc::new(TtlNameCache::new(ttl)),
            locks: Arc::new(ObjectLocks::new()),
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn NameCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &BuildtrackConfig {
        &self.config
    }

    pub fn cache(&self) -> &dyn NameCache {
        self.cache.as_ref()
    }

    pub fn settings(&self, as_of: NaiveDate) -> ReconcileSettings {
        ReconcileSettings::from_config(&self.config.reconcile, as_of)
    }

    pub fn open_store(&self) -> Result<SqliteStore, ReconcileError> {
        Ok(SqliteStore::open_path(database_path(
            &self.workspace,
            &self.config,
        ))?)
    }

    /// Runs in input order. A failed object never stops the others.
    pub fn reconcile_batch(
        &self,
        objects: &[ObjectId],
        settings: &ReconcileSettings,
        jobs: usize,
    ) -> Vec<ObjectRun> {
        let workers = jobs.max(1).min(objects.len());
        let next = AtomicUsize::new(0);
        let next = &next;

        let mut runs = thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| scope.spawn(move || self.worker(objects, next, settings)))
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(runs) => runs,
                    Err(_) => {
                        tracing::error!("reconcile worker panicked");
                        Vec::new()
                    }
                })
                .collect::<Vec<_>>()
        });

        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, run)| run).collect()
    }

    fn worker(
        &self,
        objects: &[ObjectId],
        next: &AtomicUsize,
        settings: &ReconcileSettings,
    ) -> Vec<(usize, ObjectRun)> {
        let store = self.open_store();
        let mut runs = Vec::new();

        loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(&object_id) = objects.get(index) else {
                break;
            };

            let result = match &store {
                Ok(store) => {
                    Reconciler::new(store, store, self.cache(), &self.locks, settings)
                        .reconcile_object(object_id)
                }
                Err(err) => Err(ReconcileError::Message(format!(
                    "store unavailable: {err}"
                ))),
            };
            if let Err(err) = &result {
                tracing::error!(
                    object_id,
                    error = %err,
                    aborts_object = err.aborts_object(),
                    "object reconciliation failed"
                );
            }
            runs.push((index, ObjectRun { object_id, result }));
        }

        runs
    }
}
