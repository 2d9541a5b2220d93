mod plan;
mod select;
mod sources;
mod types;

pub use plan::{current_unix_timestamp, next_transition_id, TransitionPlanner, VERIFY_TARGET};
pub use select::select_target;
pub use sources::{BackupIndex, BackupSnapshot, ReleaseSource, ResolvedRelease};
pub use types::{
    ComponentPayload, MigrationSpec, Step, StepKind, TransitionDirection, TransitionPlan,
};

#[cfg(test)]
mod tests;
