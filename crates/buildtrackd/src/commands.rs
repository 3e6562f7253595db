use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use buildtrack_config::{config_path, ensure_workspace_config, load_workspace_config};
use buildtrack_core::ObjectId;
use buildtrack_reconcile::{
    BatchReconciler, ProgressReporter, ReconcileOutcome, ReportRequest, SyncPropagator,
    annotate_control_points,
};
use buildtrack_store::{ProgressStore, SqliteStore};
use chrono::NaiveDate;
use serde::Serialize;

use crate::cli::{ReconcileArgs, ReportArgs, StatusArgs, SyncArgs};

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn run_init(workspace: &Path, out: &mut dyn Write) -> Result<()> {
    ensure_workspace_config(workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(workspace).display()
        )
    })?;
    let store = SqliteStore::open(workspace).context("failed to open progress database")?;

    writeln!(out, "config: {}", config_path(workspace).display())?;
    writeln!(out, "database: {}", store.sqlite_path().display())?;
    Ok(())
}

/// Read-only: composite corrections are listed in the report but not written.
pub fn run_report(workspace: &Path, args: &ReportArgs, out: &mut dyn Write) -> Result<()> {
    let config = load_workspace_config(workspace).context("failed to load workspace config")?;
    let store = SqliteStore::open(workspace).context("failed to open progress database")?;

    let report = ProgressReporter::new(&store, &config.reconcile.composite_milestone)
        .report(ReportRequest {
            object_id: args.object_id,
            channel: args.channel,
            as_of: args.as_of.unwrap_or_else(today),
        })
        .with_context(|| format!("failed to build report for object {}", args.object_id))?;

    serde_json::to_writer_pretty(&mut *out, &report)?;
    writeln!(out)?;
    Ok(())
}

pub fn run_status(workspace: &Path, args: &StatusArgs, out: &mut dyn Write) -> Result<()> {
    let config = load_workspace_config(workspace).context("failed to load workspace config")?;
    let store = SqliteStore::open(workspace).context("failed to open progress database")?;
    let window = args
        .deadline_window_days
        .unwrap_or(config.reconcile.deadline_window_days);

    let statuses = annotate_control_points(
        &store,
        args.object_id,
        args.as_of.unwrap_or_else(today),
        window,
    )
    .with_context(|| format!("failed to annotate object {}", args.object_id))?;

    serde_json::to_writer_pretty(&mut *out, &statuses)?;
    writeln!(out)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ObjectRunReport<'a> {
    object_id: ObjectId,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Returns whether every object reconciled successfully.
pub fn run_reconcile(
    workspace: &Path,
    args: &ReconcileArgs,
    out: &mut dyn Write,
) -> Result<bool> {
    let batch = BatchReconciler::new(workspace).context("failed to prepare reconciler")?;
    let mut settings = batch.settings(args.as_of.unwrap_or_else(today));
    if let Some(window) = args.deadline_window_days {
        settings.deadline_window_days = window;
    }

    let objects = if args.object_ids.is_empty() {
        batch
            .open_store()
            .context("failed to open progress database")?
            .list_objects()
            .context("failed to list objects")?
    } else {
        args.object_ids.clone()
    };

    let runs = batch.reconcile_batch(&objects, &settings, args.jobs);
    let reports = runs
        .iter()
        .map(|run| ObjectRunReport {
            object_id: run.object_id,
            ok: run.result.is_ok(),
            outcome: run.result.as_ref().ok(),
            error: run.result.as_ref().err().map(|err| err.to_string()),
        })
        .collect::<Vec<_>>();

    serde_json::to_writer_pretty(&mut *out, &reports)?;
    writeln!(out)?;

    let failed = reports.iter().filter(|report| !report.ok).count();
    if failed > 0 {
        tracing::warn!(failed, total = reports.len(), "reconciliation finished with failures");
    }
    Ok(failed == 0)
}

/// Returns the number of implementation milestones created or updated.
pub fn run_sync(workspace: &Path, args: &SyncArgs, out: &mut dyn Write) -> Result<usize> {
    let batch = BatchReconciler::new(workspace).context("failed to prepare reconciler")?;
    let store = batch.open_store().context("failed to open progress database")?;

    let actor = &batch.config().reconcile.actor;
    let changes = SyncPropagator::new(&store, &store, batch.cache(), actor)
        .sync_object(args.object_id)
        .with_context(|| format!("failed to sync object {}", args.object_id))?;
    let written = changes
        .iter()
        .filter(|change| change.outcome.is_write())
        .count();

    writeln!(out, "{written}")?;
    Ok(written)
}
