use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEADLINE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPointStatus {
    #[default]
    Pending,
    Overdue,
    Completed,
}

impl ControlPointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Overdue => "overdue",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for ControlPointStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pending" => Ok(Self::Pending),
            "overdue" => Ok(Self::Overdue),
            "completed" => Ok(Self::Completed),
            other => Err(format!(
                "invalid status '{other}', expected one of: pending, overdue, completed"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    White,
    Yellow,
    Green,
    Red,
}

impl StatusColor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Red => "red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAssessment {
    pub status: ControlPointStatus,
    pub delay_days: Option<i64>,
    pub color: StatusColor,
}

pub fn classify_status(
    plan_finish: Option<NaiveDate>,
    fact_finish: Option<NaiveDate>,
    today: NaiveDate,
) -> ControlPointStatus {
    if fact_finish.is_some() {
        return ControlPointStatus::Completed;
    }

    match plan_finish {
        Some(plan) if plan < today => ControlPointStatus::Overdue,
        _ => ControlPointStatus::Pending,
    }
}

/// Status, delay in days and display color of a control point as of `today`.
///
/// Pending points turn yellow when the planned finish is at most
/// `deadline_window_days` ahead.
pub fn assess(
    plan_finish: Option<NaiveDate>,
    fact_finish: Option<NaiveDate>,
    today: NaiveDate,
    deadline_window_days: i64,
) -> StatusAssessment {
    let status = classify_status(plan_finish, fact_finish, today);

    let (delay_days, color) = match (status, plan_finish, fact_finish) {
        (ControlPointStatus::Completed, Some(plan), Some(fact)) if fact > plan => {
            (Some((fact - plan).num_days()), StatusColor::Red)
        }
        (ControlPointStatus::Completed, _, _) => (None, StatusColor::Green),
        (ControlPointStatus::Overdue, Some(plan), _) => {
            (Some((today - plan).num_days()), StatusColor::Red)
        }
        (ControlPointStatus::Overdue, None, _) => (None, StatusColor::Red),
        (ControlPointStatus::Pending, Some(plan), _) => {
            let remaining = (plan - today).num_days();
            if (0..=deadline_window_days).contains(&remaining) {
                (None, StatusColor::Yellow)
            } else {
                (None, StatusColor::White)
            }
        }
        (ControlPointStatus::Pending, None, _) => (None, StatusColor::White),
    };

    StatusAssessment {
        status,
        delay_days,
        color,
    }
}
