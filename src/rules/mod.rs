//! Rule evaluation.
//!
//! - `element`: the rule tree and its trigger state
//! - `evaluator`: leaf refresh and boolean evaluation over one tree
//! - `chain`: ordering, timing windows and counters across chained rules

pub mod chain;
pub mod element;
pub mod evaluator;

pub use chain::{prune_pending, RuleChain, RuleStart};
pub use element::{BooleanOp, RuleElement, RuleKind, TriggerState};
pub use evaluator::{evaluate, refresh, update_leaves, EvalContext};
