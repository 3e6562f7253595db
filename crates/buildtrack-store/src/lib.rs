use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use buildtrack_config::{ConfigError, database_path, load_workspace_config};
use buildtrack_core::{
    Channel, ControlPoint, ImplementationLibraryEntry, ImplementationMilestone, MilestoneId,
    MilestoneLibraryEntry, ObjectId, StageSnapshot,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use thiserror::Error;

mod cache;
mod changelog;
mod sqlite;

pub use cache::{CachedLibrary, NameCache, NameKey, NameScope, TtlNameCache};
pub use changelog::{
    ChangeLogEntry, ChangeLogSink, ENTITY_CONTROL_POINT, ENTITY_IMPLEMENTATION_MILESTONE,
    ENTITY_STAGE_SNAPSHOT, MemoryChangeLog,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Persistence for the milestone library, period snapshots, control points and the
/// implementation timeline. Tombstoned rows are never returned by readers.
pub trait ProgressStore {
    fn milestone(&self, id: MilestoneId) -> Result<Option<MilestoneLibraryEntry>, StoreError>;
    fn find_milestone_by_name(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
    ) -> Result<Option<MilestoneLibraryEntry>, StoreError>;
    /// Returns the existing entry for (name, parent) or inserts it. Safe under
    /// concurrent callers: the losing insert is ignored and the winning row returned.
    fn get_or_create_milestone(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
        display_name: &str,
    ) -> Result<MilestoneLibraryEntry, StoreError>;
    fn child_milestones(
        &self,
        parent_id: MilestoneId,
    ) -> Result<Vec<MilestoneLibraryEntry>, StoreError>;
    fn list_milestones(&self) -> Result<Vec<MilestoneLibraryEntry>, StoreError>;

    fn find_implementation_milestone(
        &self,
        name: &str,
    ) -> Result<Option<ImplementationLibraryEntry>, StoreError>;
    fn register_implementation_milestone(
        &self,
        display_name: &str,
    ) -> Result<ImplementationLibraryEntry, StoreError>;

    fn upsert_snapshot(&self, snapshot: &StageSnapshot) -> Result<(), StoreError>;
    fn snapshot(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
    ) -> Result<Option<StageSnapshot>, StoreError>;
    fn snapshots_for_period(
        &self,
        object_id: ObjectId,
        period: NaiveDate,
    ) -> Result<Vec<StageSnapshot>, StoreError>;
    /// Newest first, limited to periods on or before the week containing `up_to`.
    fn recent_snapshots(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        up_to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<StageSnapshot>, StoreError>;
    /// Rewrites one channel's fact on one period row. Returns whether a row changed.
    fn correct_snapshot_fact(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
        channel: Channel,
        fact: f64,
    ) -> Result<bool, StoreError>;
    fn tombstone_snapshot(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        period: NaiveDate,
    ) -> Result<(), StoreError>;
    fn list_objects(&self) -> Result<Vec<ObjectId>, StoreError>;

    fn control_point(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<Option<ControlPoint>, StoreError>;
    fn control_points_for_object(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<ControlPoint>, StoreError>;
    /// Control points of `object_id` whose library entry has `parent_milestone_id` as parent.
    fn child_control_points(
        &self,
        object_id: ObjectId,
        parent_milestone_id: MilestoneId,
    ) -> Result<Vec<ControlPoint>, StoreError>;
    fn upsert_control_point(&self, point: &ControlPoint) -> Result<(), StoreError>;
    fn tombstone_control_point(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<(), StoreError>;

    fn implementation_milestone(
        &self,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> Result<Option<ImplementationMilestone>, StoreError>;
    fn implementation_milestones_for_object(
        &self,
        object_id: ObjectId,
    ) -> Result<Vec<ImplementationMilestone>, StoreError>;
    fn upsert_implementation_milestone(
        &self,
        milestone: &ImplementationMilestone,
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    sqlite_path: PathBuf,
}

impl SqliteStore {
    /// Opens the workspace database named by `.buildtrack/config.toml`.
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let workspace_root = workspace_root.as_ref();
        let config = load_workspace_config(workspace_root)?;
        Self::open_path(database_path(workspace_root, &config))
    }

    pub fn open_path(sqlite_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let sqlite_path = sqlite_path.into();
        if let Some(parent) = sqlite_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self { conn, sqlite_path })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }
}

pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS milestone_library (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            parent_id INTEGER REFERENCES milestone_library(id),
            display_name TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_milestone_library_name_parent
            ON milestone_library (name, IFNULL(parent_id, 0));
        CREATE INDEX IF NOT EXISTS idx_milestone_library_parent
            ON milestone_library (parent_id);

        CREATE TABLE IF NOT EXISTS implementation_library (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stage_snapshots (
            object_id INTEGER NOT NULL,
            milestone_id INTEGER NOT NULL,
            period TEXT NOT NULL,
            regulator_plan,
            regulator_fact,
            contractor_plan,
            contractor_fact,
            ai_fact,
            deleted_at INTEGER,
            PRIMARY KEY (object_id, milestone_id, period)
        );
        CREATE INDEX IF NOT EXISTS idx_stage_snapshots_object_period
            ON stage_snapshots (object_id, period);

        CREATE TABLE IF NOT EXISTS control_points (
            object_id INTEGER NOT NULL,
            milestone_id INTEGER NOT NULL,
            plan_start TEXT,
            plan_finish TEXT,
            fact_start TEXT,
            fact_finish TEXT,
            status TEXT,
            deleted_at INTEGER,
            PRIMARY KEY (object_id, milestone_id)
        );

        CREATE TABLE IF NOT EXISTS implementation_milestones (
            object_id INTEGER NOT NULL,
            milestone_id INTEGER NOT NULL,
            plan_finish TEXT,
            fact_finish TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (object_id, milestone_id)
        );

        CREATE TABLE IF NOT EXISTS change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            before_json TEXT NOT NULL,
            after_json TEXT NOT NULL,
            actor TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_change_log_entity
            ON change_log (entity_type, entity_id);
        "#,
    )?;

    Ok(())
}

pub(crate) fn unix_timestamp_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
