use std::collections::{BTreeSet, HashMap};

use buildtrack_core::{
    AggregatedDates, ControlPoint, MilestoneId, ObjectId, aggregate_finish_dates,
    classify_status, entity_key,
};
use buildtrack_store::{ChangeLogEntry, ChangeLogSink, ENTITY_CONTROL_POINT, ProgressStore};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentAggregation {
    pub object_id: ObjectId,
    pub parent_milestone_id: MilestoneId,
    pub dates: AggregatedDates,
    pub child_count: usize,
    /// Whether the parent control point was written.
    pub changed: bool,
}

/// Derives parent control points from their children and persists the result.
pub struct HierarchyAggregator<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    store: &'a S,
    changelog: &'a L,
    actor: &'a str,
    today: NaiveDate,
}

impl<'a, S, L> HierarchyAggregator<'a, S, L>
where
    S: ProgressStore + ?Sized,
    L: ChangeLogSink + ?Sized,
{
    pub fn new(store: &'a S, changelog: &'a L, actor: &'a str, today: NaiveDate) -> Self {
        Self {
            store,
            changelog,
            actor,
            today,
        }
    }

    /// Computes the parent's finish dates without writing anything.
    pub fn compute(
        &self,
        object_id: ObjectId,
        parent_milestone_id: MilestoneId,
    ) -> Result<(AggregatedDates, usize), ReconcileError> {
        let children = self
            .store
            .child_control_points(object_id, parent_milestone_id)?;
        Ok((aggregate_finish_dates(&children), children.len()))
    }

    pub fn aggregate_parent(
        &self,
        parent_milestone_id: MilestoneId,
        object_id: ObjectId,
    ) -> Result<ParentAggregation, ReconcileError> {
        let (dates, child_count) = self.compute(object_id, parent_milestone_id)?;
        let mut aggregation = ParentAggregation {
            object_id,
            parent_milestone_id,
            dates,
            child_count,
            changed: false,
        };

        if dates.is_empty() {
            tracing::debug!(
                object_id,
                milestone_id = parent_milestone_id,
                child_count,
                branch = "incomplete_children",
                "parent dates left empty"
            );
            return Ok(aggregation);
        }

        let before = self.store.control_point(object_id, parent_milestone_id)?;
        let mut after = before
            .clone()
            .unwrap_or_else(|| ControlPoint::new(object_id, parent_milestone_id));
        if let Some(plan_finish) = dates.plan_finish {
            after.plan_finish = Some(plan_finish);
        }
        if let Some(fact_finish) = dates.fact_finish {
            after.fact_finish = Some(fact_finish);
        }
        after.status = Some(classify_status(
            after.plan_finish,
            after.fact_finish,
            self.today,
        ));

        if before.as_ref() == Some(&after) {
            return Ok(aggregation);
        }

        let persistence =
            || ReconcileError::persistence(ENTITY_CONTROL_POINT, object_id, parent_milestone_id);
        self.store
            .upsert_control_point(&after)
            .map_err(persistence())?;
        let entry = ChangeLogEntry::new(
            ENTITY_CONTROL_POINT,
            entity_key(object_id, parent_milestone_id),
            serde_json::to_value(&before)?,
            serde_json::to_value(&after)?,
            self.actor,
        );
        self.changelog.record_change(&entry).map_err(persistence())?;

        tracing::info!(
            object_id,
            milestone_id = parent_milestone_id,
            child_count,
            plan_finish = ?after.plan_finish,
            fact_finish = ?after.fact_finish,
            created = before.is_none(),
            "parent control point updated"
        );
        aggregation.changed = true;
        Ok(aggregation)
    }

    /// Aggregates every ancestor of the object's control points, deepest first so a
    /// freshly derived parent feeds its own parent in the same pass.
    pub fn aggregate_object(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<ParentAggregation>, ReconcileError> {
        let parents = self.parents_to_aggregate(object_id)?;
        let mut results = Vec::with_capacity(parents.len());
        for parent_milestone_id in parents {
            let aggregation = self.aggregate_parent(parent_milestone_id, object_id)?;
            if aggregation.child_count > 0 {
                results.push(aggregation);
            }
        }
        Ok(results)
    }

    pub fn parents_to_aggregate(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<MilestoneId>, ReconcileError> {
        let parent_of = self
            .store
            .list_milestones()?
            .into_iter()
            .map(|entry| (entry.id, entry.parent_id))
            .collect::<HashMap<_, _>>();

        let mut ancestors = BTreeSet::new();
        for point in self.store.control_points_for_object(object_id)? {
            let mut cursor = parent_of.get(&point.milestone_id).copied().flatten();
            while let Some(parent) = cursor {
                if !ancestors.insert(parent) {
                    break;
                }
                cursor = parent_of.get(&parent).copied().flatten();
            }
        }

        let depth = |mut id: MilestoneId| {
            let mut depth = 0usize;
            while let Some(parent) = parent_of.get(&id).copied().flatten() {
                depth += 1;
                if depth > parent_of.len() {
                    break;
                }
                id = parent;
            }
            depth
        };

        let mut ordered = ancestors.into_iter().collect::<Vec<_>>();
        ordered.sort_by_key(|&id| (std::cmp::Reverse(depth(id)), id));
        Ok(ordered)
    }
}
