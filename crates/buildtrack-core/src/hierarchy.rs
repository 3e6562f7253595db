use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{ControlPoint, MilestoneId, normalize_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedDates {
    pub plan_finish: Option<NaiveDate>,
    pub fact_finish: Option<NaiveDate>,
}

impl AggregatedDates {
    pub fn is_empty(&self) -> bool {
        self.plan_finish.is_none() && self.fact_finish.is_none()
    }
}

/// Finish dates of a parent milestone derived from its children.
///
/// Each field is the latest child date, but only when every child has one; plan and
/// fact are decided independently.
pub fn aggregate_finish_dates(children: &[ControlPoint]) -> AggregatedDates {
    AggregatedDates {
        plan_finish: latest_if_complete(children.iter().map(|child| child.plan_finish)),
        fact_finish: latest_if_complete(children.iter().map(|child| child.fact_finish)),
    }
}

fn latest_if_complete(dates: impl Iterator<Item = Option<NaiveDate>>) -> Option<NaiveDate> {
    let dates = dates.collect::<Option<Vec<_>>>()?;
    dates.into_iter().max()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeStage {
    Submission,
    Comments,
    Fixing,
    Conclusion,
}

impl CompositeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "submission",
            Self::Comments => "comments",
            Self::Fixing => "fixing",
            Self::Conclusion => "conclusion",
        }
    }

    /// Recognizes a sub-stage from its library name.
    pub fn classify(name: &str) -> Option<Self> {
        let name = normalize_name(name);
        if name.contains("conclusion") {
            Some(Self::Conclusion)
        } else if name.contains("fix") {
            Some(Self::Fixing)
        } else if name.contains("comment") {
            Some(Self::Comments)
        } else if name.contains("submission") {
            Some(Self::Submission)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeInputs {
    pub submission: Option<f64>,
    pub comments: Option<f64>,
    pub fixing: Option<f64>,
    pub conclusion: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeRule {
    NoObjections,
    ObjectionsRaised,
    Default,
}

impl CompositeRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoObjections => "no_objections",
            Self::ObjectionsRaised => "objections_raised",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeOutcome {
    pub fact: f64,
    pub rule: CompositeRule,
    /// Value the Submission stage's fact must be rewritten to, if any.
    pub submission_fact: Option<f64>,
}

/// Fact percentage of the composite milestone for one channel.
pub fn evaluate_composite(inputs: CompositeInputs) -> CompositeOutcome {
    let submission = inputs.submission.unwrap_or(0.0);
    let fixing = inputs.fixing.unwrap_or(0.0);
    let objections_raised = inputs.comments.is_some_and(|comments| comments > 0.0);
    let concluded = inputs
        .conclusion
        .is_some_and(|conclusion| whole_percent(conclusion) == 100);
    let submission_settled = matches!(whole_percent(submission), 0 | 100);

    if !objections_raised && concluded && submission_settled {
        return CompositeOutcome {
            fact: 100.0,
            rule: CompositeRule::NoObjections,
            submission_fact: Some(100.0),
        };
    }

    if objections_raised {
        return CompositeOutcome {
            fact: (submission * 0.5 + fixing * 0.5).min(100.0),
            rule: CompositeRule::ObjectionsRaised,
            submission_fact: None,
        };
    }

    CompositeOutcome {
        fact: (submission * 0.5).min(100.0),
        rule: CompositeRule::Default,
        submission_fact: None,
    }
}

fn whole_percent(value: f64) -> i64 {
    value.floor() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeStageValue {
    pub milestone_id: MilestoneId,
    pub stage: CompositeStage,
    pub fact: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeEvaluation {
    pub outcome: CompositeOutcome,
    /// The sibling stages after the rule is applied; only Submission can differ.
    pub siblings: Vec<CompositeStageValue>,
}

impl CompositeEvaluation {
    /// Sibling stages whose fact was changed by the rule.
    pub fn corrections<'a>(
        &'a self,
        before: &'a [CompositeStageValue],
    ) -> impl Iterator<Item = &'a CompositeStageValue> + 'a {
        self.siblings
            .iter()
            .zip(before)
            .filter(|(after, before)| after.fact != before.fact)
            .map(|(after, _)| after)
    }
}

/// Evaluates the composite rule over the parent's sub-stages and returns the corrected
/// sibling set instead of mutating it. When a stage appears more than once the first
/// occurrence is used.
pub fn evaluate_composite_siblings(siblings: &[CompositeStageValue]) -> CompositeEvaluation {
    let first = |stage: CompositeStage| {
        siblings
            .iter()
            .find(|sibling| sibling.stage == stage)
            .and_then(|sibling| sibling.fact)
    };

    let outcome = evaluate_composite(CompositeInputs {
        submission: first(CompositeStage::Submission),
        comments: first(CompositeStage::Comments),
        fixing: first(CompositeStage::Fixing),
        conclusion: first(CompositeStage::Conclusion),
    });

    let siblings = siblings
        .iter()
        .map(|sibling| match (sibling.stage, outcome.submission_fact) {
            (CompositeStage::Submission, Some(fact)) => CompositeStageValue {
                fact: Some(fact),
                ..*sibling
            },
            _ => *sibling,
        })
        .collect();

    CompositeEvaluation { outcome, siblings }
}
