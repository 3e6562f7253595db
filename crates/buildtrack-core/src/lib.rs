use chrono::{Datelike, NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

mod delta;
mod hierarchy;
mod mapping;
mod selector;
mod status;

pub use delta::{delta, parse_percent};
pub use hierarchy::{
    AggregatedDates, CompositeEvaluation, CompositeInputs, CompositeOutcome, CompositeRule,
    CompositeStage, CompositeStageValue, aggregate_finish_dates, evaluate_composite,
    evaluate_composite_siblings,
};
pub use mapping::{IMPLEMENTATION_MAPPINGS, ImplementationMapping, resolve_implementation_name};
pub use selector::{
    ComparisonTriple, HISTORY_WEEKS, PeriodBucket, TripleSource, WEEK_PAIRS, history_periods,
    select_comparison_triple, select_from_recent_history, select_week_pair,
};
pub use status::{
    ControlPointStatus, DEFAULT_DEADLINE_WINDOW_DAYS, StatusAssessment, StatusColor, assess,
    classify_status,
};

pub type ObjectId = i64;
pub type MilestoneId = i64;

/// Library name of the milestone whose fact is derived from its sub-stages.
pub const COMPOSITE_MILESTONE_NAME: &str = "Design Documentation Development";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Regulator,
    Contractor,
    Ai,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Self::Regulator, Self::Contractor, Self::Ai];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regulator => "regulator",
            Self::Contractor => "contractor",
            Self::Ai => "ai",
        }
    }

    pub fn plan(self, snapshot: &StageSnapshot) -> Option<f64> {
        match self {
            Self::Regulator => snapshot.regulator_plan,
            Self::Contractor => snapshot.contractor_plan,
            Self::Ai => None,
        }
    }

    pub fn fact(self, snapshot: &StageSnapshot) -> Option<f64> {
        match self {
            Self::Regulator => snapshot.regulator_fact,
            Self::Contractor => snapshot.contractor_fact,
            Self::Ai => snapshot.ai_fact,
        }
    }

    /// Column holding this channel's fact value in the snapshot table.
    pub fn fact_column(self) -> &'static str {
        match self {
            Self::Regulator => "regulator_fact",
            Self::Contractor => "contractor_fact",
            Self::Ai => "ai_fact",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "regulator" => Ok(Self::Regulator),
            "contractor" => Ok(Self::Contractor),
            "ai" => Ok(Self::Ai),
            other => Err(format!(
                "invalid channel '{other}', expected one of: regulator, contractor, ai"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneLibraryEntry {
    pub id: MilestoneId,
    pub name: String,
    pub parent_id: Option<MilestoneId>,
    pub display_name: String,
}

impl MilestoneLibraryEntry {
    pub fn is_named(&self, name: &str) -> bool {
        self.name == normalize_name(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationLibraryEntry {
    pub id: MilestoneId,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub object_id: ObjectId,
    pub milestone_id: MilestoneId,
    pub period: NaiveDate,
    pub regulator_plan: Option<f64>,
    pub regulator_fact: Option<f64>,
    pub contractor_plan: Option<f64>,
    pub contractor_fact: Option<f64>,
    pub ai_fact: Option<f64>,
}

impl StageSnapshot {
    /// Creates an empty snapshot; `period` is moved to its ISO-week Monday.
    pub fn new(object_id: ObjectId, milestone_id: MilestoneId, period: NaiveDate) -> Self {
        Self {
            object_id,
            milestone_id,
            period: week_start(period),
            regulator_plan: None,
            regulator_fact: None,
            contractor_plan: None,
            contractor_fact: None,
            ai_fact: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.regulator_plan.is_none()
            && self.regulator_fact.is_none()
            && self.contractor_plan.is_none()
            && self.contractor_fact.is_none()
            && self.ai_fact.is_none()
    }

    pub fn set_fact(&mut self, channel: Channel, value: Option<f64>) {
        match channel {
            Channel::Regulator => self.regulator_fact = value,
            Channel::Contractor => self.contractor_fact = value,
            Channel::Ai => self.ai_fact = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub object_id: ObjectId,
    pub milestone_id: MilestoneId,
    pub plan_start: Option<NaiveDate>,
    pub plan_finish: Option<NaiveDate>,
    pub fact_start: Option<NaiveDate>,
    pub fact_finish: Option<NaiveDate>,
    pub status: Option<ControlPointStatus>,
}

impl ControlPoint {
    pub fn new(object_id: ObjectId, milestone_id: MilestoneId) -> Self {
        Self {
            object_id,
            milestone_id,
            plan_start: None,
            plan_finish: None,
            fact_start: None,
            fact_finish: None,
            status: None,
        }
    }

    pub fn assess(&self, today: NaiveDate, deadline_window_days: i64) -> StatusAssessment {
        assess(
            self.plan_finish,
            self.fact_finish,
            today,
            deadline_window_days,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationMilestone {
    pub object_id: ObjectId,
    pub milestone_id: MilestoneId,
    pub plan_finish: Option<NaiveDate>,
    pub fact_finish: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewModel {
    pub id: MilestoneId,
    pub name: String,
    pub fact: Option<f64>,
    pub plan: Option<f64>,
    pub delta_plan_week: i64,
    pub delta_plan_month: i64,
    pub delta_fact_week: i64,
    pub delta_fact_month: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ViewModel>,
}

/// Canonical library form: trimmed, inner whitespace collapsed, lowercase.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = i64::from(date.weekday().num_days_from_monday());
    date - TimeDelta::days(offset)
}

pub fn entity_key(object_id: ObjectId, milestone_id: MilestoneId) -> String {
    format!("{object_id}:{milestone_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn week_start_moves_to_monday() {
        assert_eq!(week_start(date(2024, 1, 15)), date(2024, 1, 15));
        assert_eq!(week_start(date(2024, 1, 17)), date(2024, 1, 15));
        assert_eq!(week_start(date(2024, 1, 21)), date(2024, 1, 15));
        assert_eq!(week_start(date(2024, 1, 1)), date(2024, 1, 1));
        assert_eq!(week_start(date(2023, 12, 31)), date(2023, 12, 25));
    }

    #[test]
    fn normalize_name_collapses_case_and_whitespace() {
        assert_eq!(
            normalize_name("  Design   Documentation\tDevelopment "),
            "design documentation development"
        );
    }

    #[test]
    fn snapshot_new_normalizes_period_and_starts_empty() {
        let snapshot = StageSnapshot::new(1, 2, date(2024, 1, 18));
        assert_eq!(snapshot.period, date(2024, 1, 15));
        assert!(snapshot.is_empty());
    }

    #[test]
    fn ai_channel_has_no_plan() {
        let mut snapshot = StageSnapshot::new(1, 2, date(2024, 1, 15));
        snapshot.ai_fact = Some(40.0);
        snapshot.regulator_plan = Some(60.0);
        assert_eq!(Channel::Ai.plan(&snapshot), None);
        assert_eq!(Channel::Ai.fact(&snapshot), Some(40.0));
        assert_eq!(Channel::Regulator.plan(&snapshot), Some(60.0));
    }

    #[test]
    fn channel_parses_known_values() {
        assert_eq!("contractor".parse::<Channel>(), Ok(Channel::Contractor));
        assert!("gov".parse::<Channel>().is_err());
    }
}
