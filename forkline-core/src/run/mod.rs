//! Run execution: event reconciliation and the single-run state machine.

pub mod coordinator;
pub mod reconciler;

pub use coordinator::{Applied, PartsSnapshot, RunCoordinator, RunOutcome, RunStart, RunState};
pub use reconciler::{Change, TokenReconciler, ToolOutcome, PENDING_ID_PREFIX};
