use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::{MilestoneId, StageSnapshot, week_start};

pub const HISTORY_WEEKS: usize = 6;

/// Week-index pairs tried in order when looking for a (current, one-back) comparison.
pub const WEEK_PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (2, 3), (3, 4)];

/// All milestone values reported as of one week start.
pub type PeriodBucket = BTreeMap<MilestoneId, StageSnapshot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TripleSource {
    WeekPair {
        current_week: usize,
        previous_week: usize,
    },
    RecentHistory {
        available: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTriple {
    pub current: StageSnapshot,
    pub one_back: StageSnapshot,
    pub month_back: StageSnapshot,
    pub source: TripleSource,
}

/// Week starts for the six history buckets, newest first.
pub fn history_periods(as_of: NaiveDate) -> [NaiveDate; HISTORY_WEEKS] {
    let anchor = week_start(as_of);
    std::array::from_fn(|weeks_back| anchor - TimeDelta::weeks(weeks_back as i64))
}

/// Picks the snapshots a milestone's deltas are computed against.
///
/// `recent` is the milestone's most recently recorded snapshots (any order); it is only
/// consulted when no week pair has data on both sides. Returns `None` when there is
/// nothing at all to compare.
pub fn select_comparison_triple(
    history: &[PeriodBucket; HISTORY_WEEKS],
    milestone_id: MilestoneId,
    recent: &[StageSnapshot],
) -> Option<ComparisonTriple> {
    select_week_pair(history, milestone_id)
        .or_else(|| select_from_recent_history(milestone_id, recent))
}

/// First entry of [`WEEK_PAIRS`] with a non-empty snapshot on both sides.
pub fn select_week_pair(
    history: &[PeriodBucket; HISTORY_WEEKS],
    milestone_id: MilestoneId,
) -> Option<ComparisonTriple> {
    let usable = |week: usize| {
        history[week]
            .get(&milestone_id)
            .filter(|snapshot| !snapshot.is_empty())
    };

    let (current_week, previous_week) = WEEK_PAIRS
        .into_iter()
        .find(|&(current, previous)| usable(current).is_some() && usable(previous).is_some())?;
    let current = usable(current_week)?;
    let one_back = usable(previous_week)?;
    let month_back = usable(4).or_else(|| usable(5)).unwrap_or(one_back);

    Some(ComparisonTriple {
        current: current.clone(),
        one_back: one_back.clone(),
        month_back: month_back.clone(),
        source: TripleSource::WeekPair {
            current_week,
            previous_week,
        },
    })
}

/// Newest three recorded snapshots, missing slots padded with the nearest one.
pub fn select_from_recent_history(
    milestone_id: MilestoneId,
    recent: &[StageSnapshot],
) -> Option<ComparisonTriple> {
    let mut ordered = recent
        .iter()
        .filter(|snapshot| snapshot.milestone_id == milestone_id)
        .collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.period.cmp(&a.period));
    ordered.truncate(3);

    let current = *ordered.first()?;
    let one_back = ordered.get(1).copied().unwrap_or(current);
    let month_back = ordered.get(2).copied().unwrap_or(one_back);

    Some(ComparisonTriple {
        current: current.clone(),
        one_back: one_back.clone(),
        month_back: month_back.clone(),
        source: TripleSource::RecentHistory {
            available: ordered.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MILESTONE: MilestoneId = 7;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).expect("valid date")
    }

    fn snapshot(period: NaiveDate, fact: f64) -> StageSnapshot {
        let mut snapshot = StageSnapshot::new(1, MILESTONE, period);
        snapshot.contractor_fact = Some(fact);
        snapshot
    }

    fn history_with(weeks: &[(usize, f64)]) -> [PeriodBucket; HISTORY_WEEKS] {
        let periods = history_periods(monday());
        let mut history: [PeriodBucket; HISTORY_WEEKS] = Default::default();
        for &(week, fact) in weeks {
            history[week].insert(MILESTONE, snapshot(periods[week], fact));
        }
        history
    }

    #[test]
    fn history_periods_step_back_one_week_each() {
        let periods = history_periods(NaiveDate::from_ymd_opt(2024, 3, 6).expect("date"));
        assert_eq!(periods[0], monday());
        assert_eq!(
            periods[5],
            NaiveDate::from_ymd_opt(2024, 1, 29).expect("date")
        );
    }

    #[test]
    fn freshest_pair_wins_and_month_back_prefers_week_four() {
        let history = history_with(&[(0, 50.0), (1, 40.0), (4, 10.0), (5, 5.0)]);
        let triple = select_comparison_triple(&history, MILESTONE, &[]).expect("triple");

        assert_eq!(triple.current.contractor_fact, Some(50.0));
        assert_eq!(triple.one_back.contractor_fact, Some(40.0));
        assert_eq!(triple.month_back.contractor_fact, Some(10.0));
        assert_eq!(
            triple.source,
            TripleSource::WeekPair {
                current_week: 0,
                previous_week: 1
            }
        );
    }

    #[test]
    fn week_three_pairs_with_week_zero_when_middle_weeks_are_missing() {
        let history = history_with(&[(0, 60.0), (3, 30.0)]);
        let triple = select_comparison_triple(&history, MILESTONE, &[]).expect("triple");

        assert_eq!(
            triple.source,
            TripleSource::WeekPair {
                current_week: 0,
                previous_week: 3
            }
        );
        assert_eq!(triple.one_back.contractor_fact, Some(30.0));
        // neither week four nor five exists, so month-back falls back to one-back
        assert_eq!(triple.month_back.contractor_fact, Some(30.0));
    }

    #[test]
    fn month_back_uses_week_five_when_week_four_missing() {
        let history = history_with(&[(1, 45.0), (2, 35.0), (5, 15.0)]);
        let triple = select_comparison_triple(&history, MILESTONE, &[]).expect("triple");

        assert_eq!(
            triple.source,
            TripleSource::WeekPair {
                current_week: 1,
                previous_week: 2
            }
        );
        assert_eq!(triple.month_back.contractor_fact, Some(15.0));
    }

    #[test]
    fn empty_snapshots_do_not_count_as_data() {
        let mut history = history_with(&[(0, 60.0), (2, 20.0)]);
        let periods = history_periods(monday());
        history[1].insert(MILESTONE, StageSnapshot::new(1, MILESTONE, periods[1]));

        let triple = select_comparison_triple(&history, MILESTONE, &[]).expect("triple");
        assert_eq!(
            triple.source,
            TripleSource::WeekPair {
                current_week: 0,
                previous_week: 2
            }
        );
    }

    #[test]
    fn recent_history_pads_missing_slots_with_nearest() {
        let history = history_with(&[(0, 70.0)]);
        let older = NaiveDate::from_ymd_opt(2023, 11, 6).expect("date");
        let oldest = NaiveDate::from_ymd_opt(2023, 10, 2).expect("date");
        let recent = vec![snapshot(oldest, 20.0), snapshot(older, 30.0)];

        let triple = select_comparison_triple(&history, MILESTONE, &recent).expect("triple");
        assert_eq!(triple.current.contractor_fact, Some(30.0));
        assert_eq!(triple.one_back.contractor_fact, Some(20.0));
        assert_eq!(triple.month_back.contractor_fact, Some(20.0));
        assert_eq!(triple.source, TripleSource::RecentHistory { available: 2 });
    }

    #[test]
    fn nothing_recorded_yields_none() {
        let history: [PeriodBucket; HISTORY_WEEKS] = Default::default();
        assert!(select_comparison_triple(&history, MILESTONE, &[]).is_none());
    }
}
