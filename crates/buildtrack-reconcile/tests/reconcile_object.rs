use std::path::PathBuf;

use buildtrack_config::ReconcileConfig;
use buildtrack_core::{
    COMPOSITE_MILESTONE_NAME, Channel, CompositeRule, ControlPoint, ControlPointStatus,
    MilestoneId, ObjectId, StageSnapshot, StatusColor, entity_key,
};
use buildtrack_reconcile::{
    BatchReconciler, ObjectLocks, OmissionReason, ProgressReporter, ReconcileError,
    ReconcileOutcome, ReconcileSettings, Reconciler, ReportRequest, SyncOutcome,
};
use buildtrack_store::{
    ENTITY_IMPLEMENTATION_MILESTONE, ENTITY_STAGE_SNAPSHOT, ProgressStore, SqliteStore,
    TtlNameCache,
};
use chrono::NaiveDate;
use tempfile::{TempDir, tempdir};

struct Site {
    _temp: TempDir,
    workspace: PathBuf,
    store: SqliteStore,
}

fn site() -> Site {
    let temp = tempdir().expect("tempdir");
    let workspace = temp.path().to_path_buf();
    let store = SqliteStore::open(&workspace).expect("open store");
    Site {
        _temp: temp,
        workspace,
        store,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn as_of() -> NaiveDate {
    date(2024, 1, 17)
}

fn settings() -> ReconcileSettings {
    ReconcileSettings::from_config(&ReconcileConfig::default(), as_of())
}

fn milestone(site: &Site, name: &str, parent: Option<MilestoneId>) -> MilestoneId {
    site.store
        .get_or_create_milestone(name, parent, name)
        .expect("library entry")
        .id
}

fn seed_fact(
    site: &Site,
    object_id: ObjectId,
    milestone_id: MilestoneId,
    period: NaiveDate,
    fact: f64,
) {
    let mut snapshot = StageSnapshot::new(object_id, milestone_id, period);
    snapshot.contractor_fact = Some(fact);
    site.store.upsert_snapshot(&snapshot).expect("seed snapshot");
}

fn seed_point(
    site: &Site,
    object_id: ObjectId,
    milestone_id: MilestoneId,
    plan_finish: Option<NaiveDate>,
    fact_finish: Option<NaiveDate>,
) {
    let mut point = ControlPoint::new(object_id, milestone_id);
    point.plan_finish = plan_finish;
    point.fact_finish = fact_finish;
    site.store.upsert_control_point(&point).expect("seed control point");
}

fn reconcile(
    site: &Site,
    cache: &TtlNameCache,
    object_id: ObjectId,
) -> Result<ReconcileOutcome, ReconcileError> {
    let locks = ObjectLocks::new();
    let settings = settings();
    Reconciler::new(&site.store, &site.store, cache, &locks, &settings).reconcile_object(object_id)
}

struct Composite {
    parent: MilestoneId,
    submission: MilestoneId,
    comments: MilestoneId,
    fixing: MilestoneId,
    conclusion: MilestoneId,
}

fn composite(site: &Site) -> Composite {
    let parent = milestone(site, COMPOSITE_MILESTONE_NAME, None);
    Composite {
        parent,
        submission: milestone(site, "Submission of documentation", Some(parent)),
        comments: milestone(site, "Expert comments", Some(parent)),
        fixing: milestone(site, "Fixing of comments", Some(parent)),
        conclusion: milestone(site, "Positive conclusion", Some(parent)),
    }
}

#[test]
fn overdue_control_point_is_red_with_delay() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let excavation = milestone(&site, "Excavation", None);
    seed_point(&site, 1, excavation, Some(date(2024, 1, 10)), None);

    let locks = ObjectLocks::new();
    let cache = TtlNameCache::default();
    let mut settings = settings();
    settings.as_of = date(2024, 1, 15);
    let outcome =
        Reconciler::new(&site.store, &site.store, &cache, &locks, &settings).reconcile_object(1)?;

    let status = &outcome.statuses[0];
    assert_eq!(status.status, ControlPointStatus::Overdue);
    assert_eq!(status.delay_days, Some(5));
    assert_eq!(status.color, StatusColor::Red);
    Ok(())
}

#[test]
fn issued_conclusion_without_comments_completes_composite_and_rewrites_submission()
-> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let stages = composite(&site);
    let week0 = date(2024, 1, 15);
    let week1 = date(2024, 1, 8);
    for period in [week0, week1] {
        seed_fact(&site, 1, stages.submission, period, 0.0);
        seed_fact(&site, 1, stages.fixing, period, 0.0);
        seed_fact(&site, 1, stages.conclusion, period, 100.0);
    }

    let cache = TtlNameCache::default();
    let outcome = reconcile(&site, &cache, 1)?;

    let contractor = outcome
        .reports
        .iter()
        .find(|report| report.channel == Channel::Contractor)
        .expect("contractor report");
    assert_eq!(contractor.composite_rule, Some(CompositeRule::NoObjections));
    let parent = contractor.find(stages.parent).expect("composite view");
    assert_eq!(parent.fact, Some(100.0));
    assert_eq!(parent.children.len(), 3);
    let submission = contractor.find(stages.submission).expect("submission view");
    assert_eq!(submission.fact, Some(100.0));
    assert_eq!(submission.delta_fact_week, 100);

    assert_eq!(outcome.corrections_applied.len(), 1);
    let stored = site
        .store
        .snapshot(1, stages.submission, week0)?
        .expect("current row");
    assert_eq!(stored.contractor_fact, Some(100.0));
    let history = site
        .store
        .snapshot(1, stages.submission, week1)?
        .expect("history row");
    assert_eq!(history.contractor_fact, Some(0.0));

    // the regulator channel has no values, so the default rule applies there
    let regulator = outcome
        .reports
        .iter()
        .find(|report| report.channel == Channel::Regulator)
        .expect("regulator report");
    assert_eq!(regulator.composite_rule, Some(CompositeRule::Default));

    let second = reconcile(&site, &cache, 1)?;
    assert!(second.corrections_applied.is_empty());
    let logged = site.store.list_changes(
        ENTITY_STAGE_SNAPSHOT,
        &entity_key(1, stages.submission),
    )?;
    assert_eq!(logged.len(), 1);
    Ok(())
}

#[test]
fn raised_objections_average_submission_and_fixing() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let stages = composite(&site);
    let week0 = date(2024, 1, 15);
    let week1 = date(2024, 1, 8);
    seed_fact(&site, 1, stages.submission, week0, 80.0);
    seed_fact(&site, 1, stages.comments, week0, 20.0);
    seed_fact(&site, 1, stages.fixing, week0, 50.0);
    seed_fact(&site, 1, stages.submission, week1, 60.0);
    seed_fact(&site, 1, stages.comments, week1, 20.0);
    seed_fact(&site, 1, stages.fixing, week1, 10.0);

    let report = ProgressReporter::new(&site.store, COMPOSITE_MILESTONE_NAME).report(
        ReportRequest {
            object_id: 1,
            channel: Channel::Contractor,
            as_of: as_of(),
        },
    )?;

    assert_eq!(report.composite_rule, Some(CompositeRule::ObjectionsRaised));
    let parent = report.find(stages.parent).expect("composite view");
    assert_eq!(parent.fact, Some(65.0));
    // one week back: 60 * 0.5 + 10 * 0.5 = 35
    assert_eq!(parent.delta_fact_week, 30);
    assert!(report.corrections.is_empty());
    assert!(report.find(stages.conclusion).is_none());
    assert!(report.omitted.iter().any(|omitted| {
        omitted.milestone_id == stages.conclusion && omitted.reason == OmissionReason::NoHistory
    }));
    Ok(())
}

#[test]
fn sparse_history_pairs_current_week_with_week_three() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let walls = milestone(&site, "Walls", None);
    seed_fact(&site, 1, walls, date(2024, 1, 15), 60.0);
    seed_fact(&site, 1, walls, date(2023, 12, 25), 35.0);

    let report = ProgressReporter::new(&site.store, COMPOSITE_MILESTONE_NAME).report(
        ReportRequest {
            object_id: 1,
            channel: Channel::Contractor,
            as_of: as_of(),
        },
    )?;

    let view = report.find(walls).expect("walls view");
    assert_eq!(view.fact, Some(60.0));
    assert_eq!(view.delta_fact_week, 25);
    assert_eq!(view.delta_fact_month, 25);
    Ok(())
}

#[test]
fn parent_fact_waits_for_every_child() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let frame = milestone(&site, "Frame", None);
    let columns = milestone(&site, "Columns", Some(frame));
    let slabs = milestone(&site, "Slabs", Some(frame));
    let stairs = milestone(&site, "Stairs", Some(frame));
    seed_point(&site, 1, columns, Some(date(2024, 1, 20)), Some(date(2024, 1, 12)));
    seed_point(&site, 1, slabs, Some(date(2024, 2, 5)), None);
    seed_point(&site, 1, stairs, Some(date(2024, 1, 30)), Some(date(2024, 1, 16)));

    let cache = TtlNameCache::default();
    let outcome = reconcile(&site, &cache, 1)?;
    assert_eq!(outcome.parents_updated(), 1);

    let parent = site.store.control_point(1, frame)?.expect("derived parent");
    assert_eq!(parent.plan_finish, Some(date(2024, 2, 5)));
    assert_eq!(parent.fact_finish, None);
    assert_eq!(parent.status, Some(ControlPointStatus::Pending));
    Ok(())
}

#[test]
fn sync_creates_once_and_stays_quiet_on_rerun() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let permit = site
        .store
        .register_implementation_milestone("Construction permit")?;
    let obtaining = milestone(&site, "Obtaining the construction permit", None);
    seed_point(&site, 1, obtaining, Some(date(2024, 1, 5)), Some(date(2024, 1, 3)));

    let cache = TtlNameCache::default();
    let first = reconcile(&site, &cache, 1)?;
    assert_eq!(first.implementation_changes(), 1);
    assert_eq!(first.sync[0].outcome, SyncOutcome::Created);

    let second = reconcile(&site, &cache, 1)?;
    assert_eq!(second.implementation_changes(), 0);
    assert_eq!(second.sync[0].outcome, SyncOutcome::Unchanged);

    let row = site
        .store
        .implementation_milestone(1, permit.id)?
        .expect("implementation row");
    assert_eq!(row.fact_finish, Some(date(2024, 1, 3)));
    let logged = site.store.list_changes(
        ENTITY_IMPLEMENTATION_MILESTONE,
        &entity_key(1, permit.id),
    )?;
    assert_eq!(logged.len(), 1);
    assert!(logged[0].before.is_null());
    Ok(())
}

#[test]
fn parent_with_children_syncs_aggregated_dates() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let networks = site
        .store
        .register_implementation_milestone("Utility networks")?;
    let parent = milestone(&site, "Engineering network construction", None);
    let water = milestone(&site, "Water supply", Some(parent));
    let power = milestone(&site, "Power supply", Some(parent));
    seed_point(&site, 1, water, Some(date(2024, 3, 1)), Some(date(2024, 1, 9)));
    seed_point(&site, 1, power, Some(date(2024, 4, 1)), Some(date(2024, 1, 11)));

    let cache = TtlNameCache::default();
    reconcile(&site, &cache, 1)?;

    let row = site
        .store
        .implementation_milestone(1, networks.id)?
        .expect("implementation row");
    assert_eq!(row.plan_finish, Some(date(2024, 4, 1)));
    assert_eq!(row.fact_finish, Some(date(2024, 1, 11)));
    Ok(())
}

#[test]
fn missing_implementation_entry_is_a_configuration_error() {
    let site = site();
    let landscaping = milestone(&site, "Landscaping works", None);
    seed_point(&site, 1, landscaping, None, Some(date(2024, 1, 12)));

    let cache = TtlNameCache::default();
    let err = reconcile(&site, &cache, 1).expect_err("unmapped canonical name");
    assert!(err.aborts_object());
    match err {
        ReconcileError::UnmappedImplementationMilestone { canonical_name, .. } => {
            assert_eq!(canonical_name, "Landscaping");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        site.store
            .find_implementation_milestone("Landscaping")
            .expect("lookup")
            .is_none()
    );
}

#[test]
fn batch_isolates_failing_objects() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    site.store
        .register_implementation_milestone("Commissioning")?;
    let commissioning = milestone(&site, "Commissioning of the building", None);
    let landscaping = milestone(&site, "Landscaping works", None);
    seed_point(&site, 1, commissioning, Some(date(2024, 6, 1)), None);
    seed_point(&site, 2, landscaping, Some(date(2024, 6, 1)), None);
    seed_point(&site, 3, commissioning, None, Some(date(2024, 1, 2)));

    let batch = BatchReconciler::new(&site.workspace)?;
    let runs = batch.reconcile_batch(&[1, 2, 3], &batch.settings(as_of()), 2);

    let ids = runs.iter().map(|run| run.object_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(runs[0].result.is_ok());
    assert!(matches!(
        runs[1].result,
        Err(ReconcileError::UnmappedImplementationMilestone { .. })
    ));
    let third = runs[2].result.as_ref().expect("object 3");
    assert_eq!(third.implementation_changes(), 1);
    Ok(())
}

#[test]
fn later_weeks_never_leak_into_a_past_report() -> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let walls = milestone(&site, "Walls", None);
    seed_fact(&site, 1, walls, date(2023, 10, 2), 10.0);
    seed_fact(&site, 1, walls, date(2024, 3, 4), 90.0);

    let report = ProgressReporter::new(&site.store, COMPOSITE_MILESTONE_NAME).report(
        ReportRequest {
            object_id: 1,
            channel: Channel::Contractor,
            as_of: as_of(),
        },
    )?;

    let view = report.find(walls).expect("walls view");
    assert_eq!(view.fact, Some(10.0));
    assert_eq!(view.delta_fact_week, 0);
    assert_eq!(view.delta_fact_month, 0);
    Ok(())
}

#[test]
fn composite_correction_never_touches_rows_after_the_run_date()
-> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let stages = composite(&site);
    let later = date(2024, 3, 4);
    seed_fact(&site, 1, stages.submission, later, 0.0);
    seed_fact(&site, 1, stages.conclusion, later, 100.0);

    let cache = TtlNameCache::default();
    let outcome = reconcile(&site, &cache, 1)?;
    assert!(outcome.corrections_applied.is_empty());

    let stored = site
        .store
        .snapshot(1, stages.submission, later)?
        .expect("later row");
    assert_eq!(stored.contractor_fact, Some(0.0));
    assert!(
        site.store
            .list_changes(ENTITY_STAGE_SNAPSHOT, &entity_key(1, stages.submission))?
            .is_empty()
    );
    Ok(())
}

#[test]
fn stale_current_week_is_evaluated_but_not_rewritten()
-> Result<(), Box<dyn std::error::Error>> {
    let site = site();
    let stages = composite(&site);
    // as_of falls in the week of 2024-01-15; the freshest pair is weeks one and two
    let week1 = date(2024, 1, 8);
    let week2 = date(2024, 1, 1);
    for period in [week1, week2] {
        seed_fact(&site, 1, stages.submission, period, 0.0);
        seed_fact(&site, 1, stages.conclusion, period, 100.0);
    }

    let cache = TtlNameCache::default();
    let outcome = reconcile(&site, &cache, 1)?;
    let contractor = outcome
        .reports
        .iter()
        .find(|report| report.channel == Channel::Contractor)
        .expect("contractor report");
    assert_eq!(contractor.composite_rule, Some(CompositeRule::NoObjections));
    assert!(contractor.corrections.is_empty());
    assert!(outcome.corrections_applied.is_empty());

    let stored = site
        .store
        .snapshot(1, stages.submission, week1)?
        .expect("week one row");
    assert_eq!(stored.contractor_fact, Some(0.0));
    Ok(())
}
