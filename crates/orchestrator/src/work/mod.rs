//! Work planning: what each module still needs, and the jobs that produce it.

mod job;
mod plan;
mod unit;

pub use job::{Job, JobKind, JobQueue};
pub use plan::{ExecOutUnit, WorkPlan};
pub use unit::WorkUnit;
