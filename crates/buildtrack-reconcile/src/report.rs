use std::collections::{BTreeMap, HashMap};

use buildtrack_core::{
    Channel, ComparisonTriple, CompositeRule, CompositeStage, CompositeStageValue, MilestoneId,
    MilestoneLibraryEntry, ObjectId, StageSnapshot, ViewModel, delta,
    evaluate_composite_siblings, week_start,
};
use buildtrack_store::ProgressStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;
use crate::dataset::DatasetSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub object_id: ObjectId,
    pub channel: Channel,
    pub as_of: NaiveDate,
}

/// A stored fact that the composite rule rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactCorrection {
    pub object_id: ObjectId,
    pub milestone_id: MilestoneId,
    pub period: NaiveDate,
    pub channel: Channel,
    pub fact: f64,
    pub rule: CompositeRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OmissionReason {
    NoHistory,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedMilestone {
    pub milestone_id: MilestoneId,
    pub reason: OmissionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub object_id: ObjectId,
    pub channel: Channel,
    pub as_of: NaiveDate,
    pub period: NaiveDate,
    pub milestones: Vec<ViewModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_rule: Option<CompositeRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<FactCorrection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted: Vec<OmittedMilestone>,
}

impl ProgressReport {
    /// Depth-first lookup of a view model by milestone id.
    pub fn find(&self, milestone_id: MilestoneId) -> Option<&ViewModel> {
        fn walk(views: &[ViewModel], milestone_id: MilestoneId) -> Option<&ViewModel> {
            views.iter().find_map(|view| {
                if view.id == milestone_id {
                    Some(view)
                } else {
                    walk(&view.children, milestone_id)
                }
            })
        }
        walk(&self.milestones, milestone_id)
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Current,
    OneBack,
    MonthBack,
}

impl Slot {
    fn pick(self, triple: &ComparisonTriple) -> &StageSnapshot {
        match self {
            Self::Current => &triple.current,
            Self::OneBack => &triple.one_back,
            Self::MonthBack => &triple.month_back,
        }
    }
}

struct CompositeView {
    view: ViewModel,
    rule: CompositeRule,
    corrected: Vec<CompositeStageValue>,
}

/// Builds per-milestone view models for one object and channel.
pub struct ProgressReporter<'a, S: ProgressStore + ?Sized> {
    store: &'a S,
    composite_milestone: &'a str,
}

impl<'a, S: ProgressStore + ?Sized> ProgressReporter<'a, S> {
    pub fn new(store: &'a S, composite_milestone: &'a str) -> Self {
        Self {
            store,
            composite_milestone,
        }
    }

    pub fn report(&self, request: ReportRequest) -> Result<ProgressReport, ReconcileError> {
        let object_id = request.object_id;
        let channel = request.channel;
        let period = week_start(request.as_of);
        let selector = DatasetSelector::load(self.store, object_id, request.as_of)?;
        let library = self.store.list_milestones()?;
        let composite = library
            .iter()
            .find(|entry| entry.is_named(self.composite_milestone));

        let mut triples = HashMap::new();
        let mut views = BTreeMap::new();
        let mut omitted = Vec::new();

        for entry in &library {
            if composite.is_some_and(|composite| composite.id == entry.id) {
                continue;
            }

            match selector.comparison_triple(entry.id) {
                Ok(Some(triple)) => {
                    views.insert(entry.id, view_from_triple(entry, &triple, channel));
                    triples.insert(entry.id, triple);
                }
                Ok(None) => omitted.push(OmittedMilestone {
                    milestone_id: entry.id,
                    reason: OmissionReason::NoHistory,
                }),
                Err(err) => {
                    tracing::warn!(
                        object_id,
                        milestone_id = entry.id,
                        channel = channel.as_str(),
                        branch = "comparison_triple",
                        error = %err,
                        "milestone omitted from report"
                    );
                    omitted.push(OmittedMilestone {
                        milestone_id: entry.id,
                        reason: OmissionReason::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }

        let mut composite_rule = None;
        let mut corrections = Vec::new();
        if let Some(composite) = composite {
            match self.composite_view(composite, &library, &selector, &triples, channel) {
                Ok(evaluated) => {
                    tracing::debug!(
                        object_id,
                        milestone_id = composite.id,
                        channel = channel.as_str(),
                        rule = evaluated.rule.as_str(),
                        fact = ?evaluated.view.fact,
                        "composite milestone evaluated"
                    );

                    for stage in &evaluated.corrected {
                        let triple = triples.get(&stage.milestone_id);
                        let (Some(triple), Some(fact)) = (triple, stage.fact) else {
                            tracing::debug!(
                                object_id,
                                milestone_id = stage.milestone_id,
                                rule = evaluated.rule.as_str(),
                                "no snapshot row to correct"
                            );
                            continue;
                        };

                        if let Some(view) = views.get_mut(&stage.milestone_id) {
                            view.fact = Some(fact);
                            view.delta_fact_week =
                                delta(Some(fact), channel.fact(&triple.one_back));
                            view.delta_fact_month =
                                delta(Some(fact), channel.fact(&triple.month_back));
                        }
                        if triple.current.period != period {
                            tracing::debug!(
                                object_id,
                                milestone_id = stage.milestone_id,
                                period = %triple.current.period,
                                rule = evaluated.rule.as_str(),
                                branch = "stale_current_row",
                                "current value predates the report week; stored row kept"
                            );
                            continue;
                        }
                        corrections.push(FactCorrection {
                            object_id,
                            milestone_id: stage.milestone_id,
                            period,
                            channel,
                            fact,
                            rule: evaluated.rule,
                        });
                    }

                    composite_rule = Some(evaluated.rule);
                    views.insert(composite.id, evaluated.view);
                }
                Err(err) => {
                    tracing::warn!(
                        object_id,
                        milestone_id = composite.id,
                        channel = channel.as_str(),
                        branch = "composite",
                        error = %err,
                        "composite milestone omitted from report"
                    );
                    omitted.push(OmittedMilestone {
                        milestone_id: composite.id,
                        reason: OmissionReason::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }

        Ok(ProgressReport {
            object_id,
            channel,
            as_of: request.as_of,
            period,
            milestones: assemble_tree(&library, views),
            composite_rule,
            corrections,
            omitted,
        })
    }

    /// The composite milestone's fact comes from its sub-stages in every slot, so it is
    /// evaluated even when it has no snapshots of its own.
    fn composite_view(
        &self,
        composite: &MilestoneLibraryEntry,
        library: &[MilestoneLibraryEntry],
        selector: &DatasetSelector<'_, S>,
        triples: &HashMap<MilestoneId, ComparisonTriple>,
        channel: Channel,
    ) -> Result<CompositeView, ReconcileError> {
        let stages = library
            .iter()
            .filter(|entry| entry.parent_id == Some(composite.id))
            .filter_map(|entry| {
                CompositeStage::classify(&entry.name).map(|stage| (entry.id, stage))
            })
            .collect::<Vec<_>>();

        let stage_values = |slot: Slot| {
            stages
                .iter()
                .map(|&(milestone_id, stage)| CompositeStageValue {
                    milestone_id,
                    stage,
                    fact: triples
                        .get(&milestone_id)
                        .and_then(|triple| channel.fact(slot.pick(triple))),
                })
                .collect::<Vec<_>>()
        };

        let current_stages = stage_values(Slot::Current);
        let current = evaluate_composite_siblings(&current_stages);
        let week = evaluate_composite_siblings(&stage_values(Slot::OneBack));
        let month = evaluate_composite_siblings(&stage_values(Slot::MonthBack));

        let own = selector.comparison_triple(composite.id)?;
        let plan = own.as_ref().and_then(|triple| channel.plan(&triple.current));
        let (delta_plan_week, delta_plan_month) = own
            .as_ref()
            .map(|triple| {
                (
                    delta(plan, channel.plan(&triple.one_back)),
                    delta(plan, channel.plan(&triple.month_back)),
                )
            })
            .unwrap_or((0, 0));

        let fact = current.outcome.fact;
        let corrected = current
            .corrections(&current_stages)
            .copied()
            .collect::<Vec<_>>();

        Ok(CompositeView {
            view: ViewModel {
                id: composite.id,
                name: composite.display_name.clone(),
                fact: Some(fact),
                plan,
                delta_plan_week,
                delta_plan_month,
                delta_fact_week: delta(Some(fact), Some(week.outcome.fact)),
                delta_fact_month: delta(Some(fact), Some(month.outcome.fact)),
                children: Vec::new(),
            },
            rule: current.outcome.rule,
            corrected,
        })
    }
}

fn view_from_triple(
    entry: &MilestoneLibraryEntry,
    triple: &ComparisonTriple,
    channel: Channel,
) -> ViewModel {
    let fact = channel.fact(&triple.current);
    let plan = channel.plan(&triple.current);

    ViewModel {
        id: entry.id,
        name: entry.display_name.clone(),
        fact,
        plan,
        delta_plan_week: delta(plan, channel.plan(&triple.one_back)),
        delta_plan_month: delta(plan, channel.plan(&triple.month_back)),
        delta_fact_week: delta(fact, channel.fact(&triple.one_back)),
        delta_fact_month: delta(fact, channel.fact(&triple.month_back)),
        children: Vec::new(),
    }
}

/// Nests each view under its library parent when the parent has a view of its own.
fn assemble_tree(
    library: &[MilestoneLibraryEntry],
    mut views: BTreeMap<MilestoneId, ViewModel>,
) -> Vec<ViewModel> {
    let parent_of = library
        .iter()
        .map(|entry| (entry.id, entry.parent_id))
        .collect::<HashMap<_, _>>();

    let mut roots = Vec::new();
    let mut children_by_parent: HashMap<MilestoneId, Vec<MilestoneId>> = HashMap::new();
    for &id in views.keys() {
        let parent = parent_of
            .get(&id)
            .copied()
            .flatten()
            .filter(|parent| views.contains_key(parent));
        match parent {
            Some(parent) => children_by_parent.entry(parent).or_default().push(id),
            None => roots.push(id),
        }
    }

    fn build(
        id: MilestoneId,
        views: &mut BTreeMap<MilestoneId, ViewModel>,
        children_by_parent: &HashMap<MilestoneId, Vec<MilestoneId>>,
    ) -> Option<ViewModel> {
        let mut view = views.remove(&id)?;
        if let Some(children) = children_by_parent.get(&id) {
            view.children = children
                .iter()
                .filter_map(|&child| build(child, views, children_by_parent))
                .collect();
        }
        Some(view)
    }

    roots
        .into_iter()
        .filter_map(|id| build(id, &mut views, &children_by_parent))
        .collect()
}
