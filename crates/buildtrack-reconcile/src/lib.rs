use buildtrack_core::{MilestoneId, ObjectId};
use buildtrack_store::StoreError;
use thiserror::Error;

mod aggregate;
mod dataset;
mod locks;
mod reconciler;
mod report;
mod status;
mod sync;

pub use aggregate::{HierarchyAggregator, ParentAggregation};
pub use dataset::{DatasetSelector, load_history};
pub use locks::ObjectLocks;
pub use reconciler::{
    BatchReconciler, ObjectRun, ReconcileOutcome, ReconcileSettings, Reconciler,
};
pub use report::{
    FactCorrection, OmissionReason, OmittedMilestone, ProgressReport, ProgressReporter,
    ReportRequest,
};
pub use status::{ControlPointStatusView, annotate_control_points};
pub use sync::{SyncChange, SyncOutcome, SyncPropagator};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("config error: {0}")]
    Config(#[from] buildtrack_config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(
        "implementation milestone '{canonical_name}' (matched by '{pattern}') is not in the library"
    )]
    UnmappedImplementationMilestone {
        pattern: &'static str,
        canonical_name: &'static str,
    },
    #[error("failed to persist {entity} {object_id}:{milestone_id}: {source}")]
    Persistence {
        entity: &'static str,
        object_id: ObjectId,
        milestone_id: MilestoneId,
        #[source]
        source: StoreError,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl ReconcileError {
    /// Errors that stop the current object instead of dropping a single milestone.
    pub fn aborts_object(&self) -> bool {
        matches!(
            self,
            Self::UnmappedImplementationMilestone { .. } | Self::Persistence { .. }
        )
    }

    pub(crate) fn persistence(
        entity: &'static str,
        object_id: ObjectId,
        milestone_id: MilestoneId,
    ) -> impl FnOnce(StoreError) -> Self {
        move |source| {
            tracing::error!(
                entity,
                object_id,
                milestone_id,
                error = %source,
                "derived row write failed"
            );
            Self::Persistence {
                entity,
                object_id,
                milestone_id,
                source,
            }
        }
    }
}
