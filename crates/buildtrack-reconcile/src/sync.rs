use std::collections::HashSet;

use buildtrack_core::{
    ControlPoint, ImplementationMilestone, MilestoneId, MilestoneLibraryEntry, ObjectId,
    aggregate_finish_dates, entity_key, resolve_implementation_name,
};
use buildtrack_store::{
    CachedLibrary, ChangeLogEntry, ChangeLogSink, ENTITY_IMPLEMENTATION_MILESTONE, NameCache,
    ProgressStore,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The control point's name matches no implementation milestone.
    Unmapped,
    /// An ancestor control point feeds the same implementation milestone.
    CoveredByParent,
    /// Nothing to create yet.
    NoDates,
    Unchanged,
    Created,
    Updated,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unmapped => "unmapped",
            Self::CoveredByParent => "covered_by_parent",
            Self::NoDates => "no_dates",
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChange {
    pub object_id: ObjectId,
    pub control_point_milestone_id: MilestoneId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_milestone_id: Option<MilestoneId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_name: Option<String>,
    pub plan_finish: Option<NaiveDate>,
    pub fact_finish: Option<NaiveDate>,
    pub outcome: SyncOutcome,
}

impl SyncChange {
    fn skipped(point: &ControlPoint, outcome: SyncOutcome) -> Self {
        Self {
            object_id: point.object_id,
            control_point_milestone_id: point.milestone_id,
            implementation_milestone_id: None,
            canonical_name: None,
            plan_finish: None,
            fact_finish: None,
            outcome,
        }
    }
}

/// Mirrors control-point completion into the implementation timeline.
pub struct SyncPropagator<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    store: &'a S,
    changelog: &'a L,
    library: CachedLibrary<'a, S>,
    actor: &'a str,
}

impl<'a, S, L> SyncPropagator<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    pub fn new(store: &'a S, changelog: &'a L, cache: &'a dyn NameCache, actor: &'a str) -> Self {
        Self {
            store,
            changelog,
            library: CachedLibrary::new(store, cache),
            actor,
        }
    }

    /// Idempotent: a second call with unchanged inputs writes and logs nothing.
    pub fn sync_from_control_point(
        &self,
        point: &ControlPoint,
    ) -> Result<SyncChange, ReconcileError> {
        let object_id = point.object_id;
        let Some(entry) = self.store.milestone(point.milestone_id)? else {
            tracing::warn!(
                object_id,
                milestone_id = point.milestone_id,
                branch = "missing_library_entry",
                "control point has no library entry"
            );
            return Ok(SyncChange::skipped(point, SyncOutcome::Unmapped));
        };

        let Some(mapping) = resolve_implementation_name(&entry.name) else {
            return Ok(SyncChange::skipped(point, SyncOutcome::Unmapped));
        };

        if self.ancestor_feeds(point, &entry, mapping.canonical_name)? {
            tracing::debug!(
                object_id,
                milestone_id = point.milestone_id,
                canonical_name = mapping.canonical_name,
                branch = "covered_by_parent",
                "implementation milestone fed by an ancestor"
            );
            return Ok(SyncChange::skipped(point, SyncOutcome::CoveredByParent));
        }

        let Some(implementation_id) = self.library.implementation_id(mapping.canonical_name)?
        else {
            tracing::error!(
                object_id,
                milestone_id = point.milestone_id,
                pattern = mapping.pattern,
                canonical_name = mapping.canonical_name,
                branch = "unmapped_implementation_milestone",
                "implementation milestone missing from library; refusing to create it"
            );
            return Err(ReconcileError::UnmappedImplementationMilestone {
                pattern: mapping.pattern,
                canonical_name: mapping.canonical_name,
            });
        };

        let (plan_finish, fact_finish) = self.effective_dates(point)?;
        let mut change = SyncChange {
            object_id,
            control_point_milestone_id: point.milestone_id,
            implementation_milestone_id: Some(implementation_id),
            canonical_name: Some(mapping.canonical_name.to_owned()),
            plan_finish,
            fact_finish,
            outcome: SyncOutcome::Unchanged,
        };

        let before = self
            .store
            .implementation_milestone(object_id, implementation_id)?;
        if before.is_none() && plan_finish.is_none() && fact_finish.is_none() {
            change.outcome = SyncOutcome::NoDates;
            return Ok(change);
        }

        let after = ImplementationMilestone {
            object_id,
            milestone_id: implementation_id,
            plan_finish,
            fact_finish,
        };
        if before.as_ref() == Some(&after) {
            return Ok(change);
        }

        let entity = ENTITY_IMPLEMENTATION_MILESTONE;
        let persistence = || ReconcileError::persistence(entity, object_id, implementation_id);
        self.store
            .upsert_implementation_milestone(&after)
            .map_err(persistence())?;
        let log_entry = ChangeLogEntry::new(
            ENTITY_IMPLEMENTATION_MILESTONE,
            entity_key(object_id, implementation_id),
            serde_json::to_value(&before)?,
            serde_json::to_value(&after)?,
            self.actor,
        );
        self.changelog
            .record_change(&log_entry)
            .map_err(persistence())?;

        change.outcome = if before.is_some() {
            SyncOutcome::Updated
        } else {
            SyncOutcome::Created
        };
        tracing::info!(
            object_id,
            milestone_id = point.milestone_id,
            implementation_milestone_id = implementation_id,
            canonical_name = mapping.canonical_name,
            outcome = change.outcome.as_str(),
            "implementation milestone synced"
        );
        Ok(change)
    }

    /// Syncs every live control point of the object. Only configuration and persistence
    /// errors stop the object; other failures drop the single control point.
    pub fn sync_object(&self, object_id: ObjectId) -> Result<Vec<SyncChange>, ReconcileError> {
        let mut changes = Vec::new();
        for point in self.store.control_points_for_object(object_id)? {
            match self.sync_from_control_point(&point) {
                Ok(change) => changes.push(change),
                Err(err) if err.aborts_object() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        object_id,
                        milestone_id = point.milestone_id,
                        branch = "sync",
                        error = %err,
                        "control point skipped during sync"
                    );
                }
            }
        }
        Ok(changes)
    }

    /// Children's aggregated dates when the milestone has children with control points,
    /// otherwise the control point's own dates.
    fn effective_dates(
        &self,
        point: &ControlPoint,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), ReconcileError> {
        if self.store.child_milestones(point.milestone_id)?.is_empty() {
            return Ok((point.plan_finish, point.fact_finish));
        }

        let children = self
            .store
            .child_control_points(point.object_id, point.milestone_id)?;
        if children.is_empty() {
            return Ok((point.plan_finish, point.fact_finish));
        }

        let dates = aggregate_finish_dates(&children);
        Ok((dates.plan_finish, dates.fact_finish))
    }

    fn ancestor_feeds(
        &self,
        point: &ControlPoint,
        entry: &MilestoneLibraryEntry,
        canonical_name: &str,
    ) -> Result<bool, ReconcileError> {
        let mut seen = HashSet::new();
        let mut cursor = entry.parent_id;
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                break;
            }
            let Some(parent) = self.store.milestone(parent_id)? else {
                break;
            };
            let same_target = resolve_implementation_name(&parent.name)
                .is_some_and(|mapping| mapping.canonical_name == canonical_name);
            if same_target
                && self
                    .store
                    .control_point(point.object_id, parent_id)?
                    .is_some()
            {
                return Ok(true);
            }
            cursor = parent.parent_id;
        }
        Ok(false)
    }
}
