use buildtrack_core::{ControlPoint, ControlPointStatus, MilestoneId, ObjectId, StatusColor};
use buildtrack_store::ProgressStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPointStatusView {
    pub object_id: ObjectId,
    pub milestone_id: MilestoneId,
    pub name: Option<String>,
    pub plan_finish: Option<NaiveDate>,
    pub fact_finish: Option<NaiveDate>,
    pub status: ControlPointStatus,
    pub delay_days: Option<i64>,
    pub color: StatusColor,
}

impl ControlPointStatusView {
    fn from_point(
        point: &ControlPoint,
        name: Option<String>,
        today: NaiveDate,
        deadline_window_days: i64,
    ) -> Self {
        let assessment = point.assess(today, deadline_window_days);
        Self {
            object_id: point.object_id,
            milestone_id: point.milestone_id,
            name,
            plan_finish: point.plan_finish,
            fact_finish: point.fact_finish,
            status: assessment.status,
            delay_days: assessment.delay_days,
            color: assessment.color,
        }
    }
}

/// Every live control point of the object with its status, delay and color as of `today`.
pub fn annotate_control_points<S: ProgressStore + ?Sized>(
    store: &S,
    object_id: ObjectId,
    today: NaiveDate,
    deadline_window_days: i64,
) -> Result<Vec<ControlPointStatusView>, ReconcileError> {
    let names = store
        .list_milestones()?
        .into_iter()
        .map(|entry| (entry.id, entry.display_name))
        .collect::<std::collections::HashMap<_, _>>();

    let views = store
        .control_points_for_object(object_id)?
        .iter()
        .map(|point| {
            let view = ControlPointStatusView::from_point(
                point,
                names.get(&point.milestone_id).cloned(),
                today,
                deadline_window_days,
            );
            if view.status == ControlPointStatus::Overdue {
                tracing::debug!(
                    object_id,
                    milestone_id = point.milestone_id,
                    delay_days = ?view.delay_days,
                    "control point overdue"
                );
            }
            view
        })
        .collect();

    Ok(views)
}
