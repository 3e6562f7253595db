use buildtrack_core::{
    Channel, ControlPoint, ImplementationLibraryEntry, ImplementationMilestone, MilestoneId,
    MilestoneLibraryEntry, ObjectId, StageSnapshot, normalize_name, parse_percent, week_start,
};
use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::{OptionalExtension, Row, params};

use crate::{ProgressStore, SqliteStore, StoreError, unix_timestamp_secs};

const SNAPSHOT_COLUMNS: &str = "object_id, milestone_id, period, regulator_plan, regulator_fact, \
     contractor_plan, contractor_fact, ai_fact";
const CONTROL_POINT_COLUMNS: &str = "cp.object_id, cp.milestone_id, cp.plan_start, \
     cp.plan_finish, cp.fact_start, cp.fact_finish, cp.status";

impl ProgressStore for SqliteStore {
    fn milestone(&self, id: MilestoneId) -> Result<Option<MilestoneLibraryEntry>, StoreError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, name, parent_id, display_name
                FROM milestone_library
                WHERE id = ?1
                "#,
                params![id],
                milestone_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn find_milestone_by_name(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
    ) -> Result<Option<MilestoneLibraryEntry>, StoreError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, name, parent_id, display_name
                FROM milestone_library
                WHERE name = ?1 AND IFNULL(parent_id, 0) = IFNULL(?2, 0)
                "#,
                params![normalize_name(name), parent_id],
                milestone_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn get_or_create_milestone(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
        display_name: &str,
    ) -> Result<MilestoneLibraryEntry, StoreError> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(StoreError::InvalidData(
                "milestone name must not be blank".to_owned(),
            ));
        }

        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO milestone_library (name, parent_id, display_name)
            VALUES (?1, ?2, ?3)
            "#,
            params![normalized, parent_id, display_name.trim()],
        )?;
        if inserted > 0 {
            tracing::debug!(name = %normalized, parent_id = ?parent_id, "library entry created");
        }

        self.find_milestone_by_name(&normalized, parent_id)?
            .ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "library entry '{normalized}' vanished after insert"
                ))
            })
    }

    fn child_milestones(
        &self,
        parent_id: MilestoneId,
    ) -> Result<Vec<MilestoneLibraryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, parent_id, display_name
            FROM milestone_library
            WHERE parent_id = ?1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(params![parent_id], milestone_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn list_milestones(&self) -> Result<Vec<MilestoneLibraryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, parent_id, display_name
            FROM milestone_library
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map([], milestone_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn find_implementation_milestone(
        &self,
        name: &str,
    ) -> Result<Option<ImplementationLibraryEntry>, StoreError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, name, display_name
                FROM implementation_library
                WHERE name = ?1
                "#,
                params![normalize_name(name)],
                |row| {
                    Ok(ImplementationLibraryEntry {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    fn register_implementation_milestone(
        &self,
        display_name: &str,
    ) -> Result<ImplementationLibraryEntry, StoreError> {
        let normalized = normalize_name(display_name);
        if normalized.is_empty() {
            return Err(StoreError::InvalidData(
                "implementation milestone name must not be blank".to_owned(),
            ));
        }

        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO implementation_library (name, display_name)
            VALUES (?1, ?2)
            "#,
            params![normalized, display_name.trim()],
        )?;

        self.find_implementation_milestone(&normalized)?
            .ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "implementation milestone '{normalized}' vanished after insert"
                ))
            })
    }

    fn upsert_snapshot(&self, snapshot: &StageSnapshot) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO stage_snapshots (
                object_id, milestone_id, period, regulator_plan, regulator_fact,
                contractor_plan, contractor_fact, ai_fact, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
            ON CONFLICT(object_id, milestone_id, period) DO UPDATE SET
                regulator_plan = excluded.regulator_plan,
                regulator_fact = excluded.regulator_fact,
                contractor_plan = excluded.contractor_plan,
                contractor_fact = excluded.contractor_fact,
                ai_fact = excluded.ai_fact,
                deleted_at = NULL
            "#,
            params![
                snapshot.object_id,
                snapshot.milestone_id,
                week_start(snapshot.period),
                snapshot.regulator_plan,
                snapshot.regulator_fact,
                snapshot.contractor_plan,
                snapshot.contractor_fact,
                snapshot.ai_fact,
            ],
        )?;

        Ok(())
    }

    fn snapshot(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
    ) -> Result<Option<StageSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM stage_snapshots \
             WHERE object_id = ?1 AND milestone_id = ?2 AND period = ?3 AND deleted_at IS NULL"
        );
        let record = self
            .conn
            .query_row(
                &sql,
                params![object_id, milestone_id, week_start(period)],
                snapshot_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn snapshots_for_period(
        &self,
        object_id: ObjectId,
        period: NaiveDate,
    ) -> Result<Vec<StageSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM stage_snapshots \
             WHERE object_id = ?1 AND period = ?2 AND deleted_at IS NULL \
             ORDER BY milestone_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![object_id, week_start(period)], snapshot_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn recent_snapshots(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        up_to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<StageSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM stage_snapshots \
             WHERE object_id = ?1 AND milestone_id = ?2 AND period <= ?3 \
               AND deleted_at IS NULL \
             ORDER BY period DESC \
             LIMIT ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![object_id, milestone_id, week_start(up_to), i64::from(limit)],
            snapshot_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn correct_snapshot_fact(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
        channel: Channel,
        fact: f64,
    ) -> Result<bool, StoreError> {
        let column = channel.fact_column();
        let sql = format!(
            "UPDATE stage_snapshots SET {column} = ?1 \
             WHERE object_id = ?2 AND milestone_id = ?3 AND period = ?4 \
               AND deleted_at IS NULL \
               AND ({column} IS NULL OR {column} != ?1)"
        );
        let changed = self
            .conn
            .execute(&sql, params![fact, object_id, milestone_id, week_start(period)])?;
        Ok(changed > 0)
    }

    fn tombstone_snapshot(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            UPDATE stage_snapshots SET deleted_at = ?4
            WHERE object_id = ?1 AND milestone_id = ?2 AND period = ?3 AND deleted_at IS NULL
            "#,
            params![
                object_id,
                milestone_id,
                week_start(period),
                unix_timestamp_secs()
            ],
        )?;
        Ok(())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT object_id FROM stage_snapshots WHERE deleted_at IS NULL
            UNION
            SELECT object_id FROM control_points WHERE deleted_at IS NULL
            ORDER BY 1
            "#,
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn control_point(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<Option<ControlPoint>, StoreError> {
        let sql = format!(
            "SELECT {CONTROL_POINT_COLUMNS} FROM control_points cp \
             WHERE cp.object_id = ?1 AND cp.milestone_id = ?2 AND cp.deleted_at IS NULL"
        );
        let record = self
            .conn
            .query_row(&sql, params![object_id, milestone_id], control_point_from_row)
            .optional()?;

        Ok(record)
    }

    fn control_points_for_object(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<ControlPoint>, StoreError> {
        let sql = format!(
            "SELECT {CONTROL_POINT_COLUMNS} FROM control_points cp \
             WHERE cp.object_id = ?1 AND cp.deleted_at IS NULL \
             ORDER BY cp.milestone_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![object_id], control_point_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn child_control_points(
        &self,
        object_id: ObjectId,
        parent_milestone_id: MilestoneId,
    ) -> Result<Vec<ControlPoint>, StoreError> {
        let sql = format!(
            "SELECT {CONTROL_POINT_COLUMNS} FROM control_points cp \
             JOIN milestone_library ml ON ml.id = cp.milestone_id \
             WHERE cp.object_id = ?1 AND ml.parent_id = ?2 AND cp.deleted_at IS NULL \
             ORDER BY cp.milestone_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![object_id, parent_milestone_id],
            control_point_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn upsert_control_point(&self, point: &ControlPoint) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO control_points (
                object_id, milestone_id, plan_start, plan_finish, fact_start, fact_finish,
                status, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
            ON CONFLICT(object_id, milestone_id) DO UPDATE SET
                plan_start = excluded.plan_start,
                plan_finish = excluded.plan_finish,
                fact_start = excluded.fact_start,
                fact_finish = excluded.fact_finish,
                status = excluded.status,
                deleted_at = NULL
            "#,
            params![
                point.object_id,
                point.milestone_id,
                point.plan_start,
                point.plan_finish,
                point.fact_start,
                point.fact_finish,
                point.status.map(|status| status.as_str()),
            ],
        )?;

        Ok(())
    }

    fn tombstone_control_point(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            UPDATE control_points SET deleted_at = ?3
            WHERE object_id = ?1 AND milestone_id = ?2 AND deleted_at IS NULL
            "#,
            params![object_id, milestone_id, unix_timestamp_secs()],
        )?;
        Ok(())
    }

    fn implementation_milestone(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<Option<ImplementationMilestone>, StoreError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT object_id, milestone_id, plan_finish, fact_finish
                FROM implementation_milestones
                WHERE object_id = ?1 AND milestone_id = ?2
                "#,
                params![object_id, milestone_id],
                implementation_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn implementation_milestones_for_object(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<ImplementationMilestone>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT object_id, milestone_id, plan_finish, fact_finish
            FROM implementation_milestones
            WHERE object_id = ?1
            ORDER BY milestone_id
            "#,
        )?;
        let rows = stmt.query_map(params![object_id], implementation_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn upsert_implementation_milestone(
        &self,
        milestone: &ImplementationMilestone,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO implementation_milestones (
                object_id, milestone_id, plan_finish, fact_finish, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(object_id, milestone_id) DO UPDATE SET
                plan_finish = excluded.plan_finish,
                fact_finish = excluded.fact_finish,
                updated_at = excluded.updated_at
            "#,
            params![
                milestone.object_id,
                milestone.milestone_id,
                milestone.plan_finish,
                milestone.fact_finish,
                unix_timestamp_secs(),
            ],
        )?;

        Ok(())
    }
}

fn milestone_from_row(row: &Row<'_>) -> rusqlite::Result<MilestoneLibraryEntry> {
    Ok(MilestoneLibraryEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        display_name: row.get(3)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<StageSnapshot> {
    Ok(StageSnapshot {
        object_id: row.get(0)?,
        milestone_id: row.get(1)?,
        period: row.get(2)?,
        regulator_plan: percent_column(row, 3)?,
        regulator_fact: percent_column(row, 4)?,
        contractor_plan: percent_column(row, 5)?,
        contractor_fact: percent_column(row, 6)?,
        ai_fact: percent_column(row, 7)?,
    })
}

fn control_point_from_row(row: &Row<'_>) -> rusqlite::Result<ControlPoint> {
    let object_id: ObjectId = row.get(0)?;
    let milestone_id: MilestoneId = row.get(1)?;
    let raw_status: Option<String> = row.get(6)?;
    let status = raw_status.and_then(|raw| match raw.parse() {
        Ok(status) => Some(status),
        Err(err) => {
            tracing::warn!(
                object_id,
                milestone_id,
                status = %raw,
                error = %err,
                "stored control point status not recognized, treating as unset"
            );
            None
        }
    });

    Ok(ControlPoint {
        object_id,
        milestone_id,
        plan_start: row.get(2)?,
        plan_finish: row.get(3)?,
        fact_start: row.get(4)?,
        fact_finish: row.get(5)?,
        status,
    })
}

fn implementation_from_row(row: &Row<'_>) -> rusqlite::Result<ImplementationMilestone> {
    Ok(ImplementationMilestone {
        object_id: row.get(0)?,
        milestone_id: row.get(1)?,
        plan_finish: row.get(2)?,
        fact_finish: row.get(3)?,
    })
}

/// Snapshot value columns are loosely typed; ingestion may hand over numbers or text.
fn percent_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    let value = match row.get_ref(idx)? {
        ValueRef::Integer(value) => Some(value as f64),
        ValueRef::Real(value) => Some(value).filter(|value| value.is_finite()),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(parse_percent),
        ValueRef::Null | ValueRef::Blob(_) => None,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).expect("valid date")
    }

    #[test]
    fn text_values_decode_as_percentages() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        store
            .conn
            .execute(
                r#"
                INSERT INTO stage_snapshots (
                    object_id, milestone_id, period, regulator_plan, regulator_fact,
                    contractor_plan, contractor_fact, ai_fact
                ) VALUES (1, 2, '2024-01-15', '40', 'n/a', 55, 60.5, '12,5')
                "#,
                [],
            )
            .expect("raw insert");

        let snapshot = store
            .snapshot(1, 2, date(1, 17))
            .expect("read snapshot")
            .expect("snapshot exists");
        assert_eq!(snapshot.regulator_plan, Some(40.0));
        assert_eq!(snapshot.regulator_fact, None);
        assert_eq!(snapshot.contractor_plan, Some(55.0));
        assert_eq!(snapshot.contractor_fact, Some(60.5));
        assert_eq!(snapshot.ai_fact, Some(12.5));
    }

    #[test]
    fn unrecognized_status_reads_as_unset() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        store
            .conn
            .execute(
                r#"
                INSERT INTO control_points (object_id, milestone_id, plan_finish, status)
                VALUES (1, 2, '2024-01-20', 'on_hold')
                "#,
                [],
            )
            .expect("raw insert");

        let point = store
            .control_point(1, 2)
            .expect("read control point")
            .expect("control point exists");
        assert_eq!(point.status, None);
        assert_eq!(point.plan_finish, Some(date(1, 20)));
    }

    #[test]
    fn recent_snapshots_stop_at_the_requested_week() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        for (period, fact) in [(date(1, 8), 10.0), (date(1, 15), 20.0), (date(3, 4), 90.0)] {
            let mut snapshot = StageSnapshot::new(1, 2, period);
            snapshot.contractor_fact = Some(fact);
            store.upsert_snapshot(&snapshot).expect("upsert");
        }

        let facts = store
            .recent_snapshots(1, 2, date(1, 17), 3)
            .expect("recent")
            .into_iter()
            .map(|snapshot| snapshot.contractor_fact)
            .collect::<Vec<_>>();
        assert_eq!(facts, vec![Some(20.0), Some(10.0)]);
    }

    #[test]
    fn fact_correction_touches_only_one_channel_and_reports_noop() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        let mut snapshot = StageSnapshot::new(1, 2, date(1, 15));
        snapshot.regulator_fact = Some(0.0);
        snapshot.contractor_fact = Some(0.0);
        store.upsert_snapshot(&snapshot).expect("upsert");

        let changed = store
            .correct_snapshot_fact(1, 2, date(1, 15), Channel::Regulator, 100.0)
            .expect("correct");
        assert!(changed);
        let again = store
            .correct_snapshot_fact(1, 2, date(1, 15), Channel::Regulator, 100.0)
            .expect("correct again");
        assert!(!again);

        let stored = store
            .snapshot(1, 2, date(1, 15))
            .expect("read")
            .expect("exists");
        assert_eq!(stored.regulator_fact, Some(100.0));
        assert_eq!(stored.contractor_fact, Some(0.0));
    }
}
