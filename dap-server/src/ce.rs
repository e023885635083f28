//! Constraint-expression handling.
//!
//! A constraint expression arrives as one string. [`split_ce`] first peels
//! off the server-function calls that synthesize new variables; the residual
//! projection/selection is then parsed by the nom grammar and applied to a
//! variable tree by an [`Evaluator`].

pub use eval::{
    BtpFunction, ConstraintEvaluator, Evaluator, FunctionKind, ProjectionFunction,
    SelectionFunction, ServerFunction,
};
pub use split::{SplitCe, split_ce};

pub(crate) mod grammar;

mod eval;
mod split;

/// Raw nom parsers for the constraint-expression grammar.
///
/// This module is only available when the feature "fuzz" was specified.
#[cfg(feature = "fuzz")]
pub mod internal {
    pub use super::grammar::constraint;
}
