use std::sync::Mutex;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SqliteStore, StoreError, unix_timestamp_secs};

// Downstream consumers match on these literals.
pub const ENTITY_CONTROL_POINT: &str = "control_point";
pub const ENTITY_IMPLEMENTATION_MILESTONE: &str = "implementation_milestone";
pub const ENTITY_STAGE_SNAPSHOT: &str = "stage_snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub before: Value,
    pub after: Value,
    pub actor: String,
}

impl ChangeLogEntry {
    pub fn new(
        entity_type: &str,
        entity_id: impl Into<String>,
        before: Value,
        after: Value,
        actor: &str,
    ) -> Self {
        Self {
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.into(),
            before,
            after,
            actor: actor.to_owned(),
        }
    }
}

/// Write-only audit destination for derived-row changes.
pub trait ChangeLogSink {
    fn record_change(&self, entry: &ChangeLogEntry) -> Result<(), StoreError>;
}

impl ChangeLogSink for SqliteStore {
    fn record_change(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO change_log (
                entity_type, entity_id, before_json, after_json, actor, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.before)?,
                serde_json::to_string(&entry.after)?,
                entry.actor,
                unix_timestamp_secs(),
            ],
        )?;

        tracing::debug!(
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            actor = %entry.actor,
            "change recorded"
        );
        Ok(())
    }
}

impl SqliteStore {
    /// Recorded changes for one entity, oldest first.
    pub fn list_changes(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT entity_type, entity_id, before_json, after_json, actor
            FROM change_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entity_type, entity_id, before, after, actor) = row?;
            entries.push(ChangeLogEntry {
                entity_type,
                entity_id,
                before: serde_json::from_str(&before)?,
                after: serde_json::from_str(&after)?,
                actor,
            });
        }

        Ok(entries)
    }

    pub fn count_changes(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM change_log", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

/// In-process sink, handy when the audit trail lives elsewhere or in tests.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    entries: Mutex<Vec<ChangeLogEntry>>,
}

impl MemoryChangeLog {
    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ChangeLogSink for MemoryChangeLog {
    fn record_change(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn sqlite_sink_round_trips_entries_per_entity() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");

        let entry = ChangeLogEntry::new(
            ENTITY_IMPLEMENTATION_MILESTONE,
            "1:4",
            Value::Null,
            json!({"plan_finish": "2024-01-10"}),
            "reconciler",
        );
        store.record_change(&entry).expect("record");
        store
            .record_change(&ChangeLogEntry::new(
                ENTITY_CONTROL_POINT,
                "1:4",
                Value::Null,
                json!({}),
                "reconciler",
            ))
            .expect("record other entity");

        let listed = store
            .list_changes(ENTITY_IMPLEMENTATION_MILESTONE, "1:4")
            .expect("list");
        assert_eq!(listed, vec![entry]);
        assert_eq!(store.count_changes().expect("count"), 2);
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemoryChangeLog::default();
        for id in ["1:1", "1:2"] {
            sink.record_change(&ChangeLogEntry::new(
                ENTITY_STAGE_SNAPSHOT,
                id,
                Value::Null,
                Value::Null,
                "tester",
            ))
            .expect("record");
        }

        let ids = sink
            .entries()
            .into_iter()
            .map(|entry| entry.entity_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1:1", "1:2"]);
    }
}
