use buildtrack_core::{
    ComparisonTriple, HISTORY_WEEKS, MilestoneId, ObjectId, PeriodBucket, history_periods,
    select_from_recent_history, select_week_pair,
};
use buildtrack_store::{ProgressStore, StoreError};
use chrono::NaiveDate;

const RECENT_HISTORY_LIMIT: u32 = 3;

/// Reads the six weekly buckets ending at the week containing `as_of`, newest first.
pub fn load_history<S: ProgressStore + ?Sized>(
    store: &S,
    object_id: ObjectId,
    as_of: NaiveDate,
) -> Result<[PeriodBucket; HISTORY_WEEKS], StoreError> {
    let mut history: [PeriodBucket; HISTORY_WEEKS] = Default::default();
    for (bucket, period) in history.iter_mut().zip(history_periods(as_of)) {
        for snapshot in store.snapshots_for_period(object_id, period)? {
            bucket.insert(snapshot.milestone_id, snapshot);
        }
    }
    Ok(history)
}

pub struct DatasetSelector<'a, S: ProgressStore + ?Sized> {
    store: &'a S,
    object_id: ObjectId,
    as_of: NaiveDate,
    history: [PeriodBucket; HISTORY_WEEKS],
}

impl<'a, S: ProgressStore + ?Sized> DatasetSelector<'a, S> {
    pub fn load(store: &'a S, object_id: ObjectId, as_of: NaiveDate) -> Result<Self, StoreError> {
        Ok(Self {
            store,
            object_id,
            as_of,
            history: load_history(store, object_id, as_of)?,
        })
    }

    pub fn history(&self) -> &[PeriodBucket; HISTORY_WEEKS] {
        &self.history
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Week pairs first; the milestone's recorded history is only read when they fail.
    /// Rows from weeks after `as_of` are never selected.
    pub fn comparison_triple(
        &self,
        milestone_id: MilestoneId,
    ) -> Result<Option<ComparisonTriple>, StoreError> {
        if let Some(triple) = select_week_pair(&self.history, milestone_id) {
            return Ok(Some(triple));
        }

        let recent = self.store.recent_snapshots(
            self.object_id,
            milestone_id,
            self.as_of,
            RECENT_HISTORY_LIMIT,
        )?;
        let triple = select_from_recent_history(milestone_id, &recent);
        if triple.is_none() {
            tracing::debug!(
                object_id = self.object_id,
                milestone_id,
                branch = "no_history",
                "milestone has no recorded snapshots"
            );
        }
        Ok(triple)
    }
}
