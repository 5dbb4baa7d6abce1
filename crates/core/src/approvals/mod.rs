pub mod machine;
pub mod plan;

pub use machine::{
    verify_view, ApprovalStateMachine, DecisionRequest, StartRequest, MAX_COMMENT_CHARS,
};
pub use plan::{ProcessWrite, TransitionOutcome, TransitionPlan};
