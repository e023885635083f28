//! Splitting a constraint expression around server-function calls.

use log::debug;

use super::eval::{ConstraintEvaluator, FunctionKind};

/// The two halves of a split constraint expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitCe {
    /// Comma-joined calls of functions that synthesize new variables.
    pub function_ce: String,
    /// Everything else: plain projections, slicing, other function calls, and
    /// the whole selection.
    pub residual_ce: String,
}

/// Partition `expr` into the sub-expression of tree-building function calls
/// and the residual projection/selection.
///
/// The scan walks left to right. For every `(` the matching `)` is found by
/// paren balance, and the identifier immediately before the `(` is looked up
/// in the evaluator's function table. Calls of tree-building functions are
/// moved (with one joining comma each) into the function half; everything else
/// stays put. Either half may come out empty.
pub fn split_ce<E>(eval: &E, expr: &str) -> SplitCe
where
    E: ConstraintEvaluator + ?Sized,
{
    let mut ce = expr.to_owned();
    let mut function_ce = String::new();
    let mut pos = 0;

    while let Some(open) = find_from(&ce, pos, '(') {
        let Some(close) = matching_paren(&ce, open) else {
            break;
        };

        // The identifier immediately before the `(`.
        let name_start = ce[pos..open]
            .rfind(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .map(|i| pos + i + 1)
            .unwrap_or(pos);
        let name = &ce[name_start..open];

        if eval.find_function(name) == Some(FunctionKind::BaseType) {
            if !function_ce.is_empty() {
                function_ce.push(',');
            }
            function_ce.push_str(&ce[name_start..=close]);

            ce.replace_range(name_start..=close, "");
            pos = name_start;
            if ce[pos..].starts_with(',') {
                ce.remove(pos);
            } else if pos > 0 && ce.as_bytes().get(pos - 1) == Some(&b',') {
                // The call was the last term; drop the comma before it and
                // keep `pos` a valid boundary into the shortened string.
                pos -= 1;
                ce.remove(pos);
            }
        } else {
            pos = close + 1;
            if ce[pos..].starts_with(',') {
                pos += 1;
            }
        }
    }

    debug!("split ce: function part `{function_ce}`, residual `{ce}`");

    SplitCe {
        function_ce,
        residual_ce: ce,
    }
}

fn find_from(haystack: &str, from: usize, needle: char) -> Option<usize> {
    haystack[from..].find(needle).map(|i| i + from)
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;

    for (i, byte) in s.bytes().enumerate().skip(open) {
        match byte {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use dap_types::Dataset;
    use dap_types::constraint::Argument;

    use super::*;
    use crate::ce::{Evaluator, ServerFunction};

    fn btp_stub(_: &[Argument], _: &Dataset) -> Result<Dataset, dap_types::DapError> {
        Ok(Dataset::new("stub"))
    }

    fn eval_with_mean() -> Evaluator {
        let mut eval = Evaluator::new();
        eval.register("mean", ServerFunction::BaseType(btp_stub));
        eval.register("bind", ServerFunction::BaseType(btp_stub));
        eval
    }

    #[test]
    fn test_no_functions() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "u,v[0:4]&w>5");

        assert_eq!(split.function_ce, "");
        assert_eq!(split.residual_ce, "u,v[0:4]&w>5");
    }

    #[test]
    fn test_pure_function() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "mean(x,0)");

        assert_eq!(split.function_ce, "mean(x,0)");
        assert_eq!(split.residual_ce, "");
    }

    #[test]
    fn test_function_then_projection() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "mean(x,0),region");

        assert_eq!(split.function_ce, "mean(x,0)");
        assert_eq!(split.residual_ce, "region");
    }

    #[test]
    fn test_projection_then_function() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "region,mean(x,0)");

        assert_eq!(split.function_ce, "mean(x,0)");
        assert_eq!(split.residual_ce, "region");
    }

    #[test]
    fn test_two_functions() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "mean(x,0),bind(y),u");

        assert_eq!(split.function_ce, "mean(x,0),bind(y)");
        assert_eq!(split.residual_ce, "u");
    }

    #[test]
    fn test_unknown_function_stays_in_residual() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "scale(u,10),v");

        assert_eq!(split.function_ce, "");
        assert_eq!(split.residual_ce, "scale(u,10),v");
    }

    #[test]
    fn test_selection_is_preserved() {
        let eval = eval_with_mean();
        let split = split_ce(&eval, "mean(x,0)&site=\"S1\"");

        assert_eq!(split.function_ce, "mean(x,0)");
        assert_eq!(split.residual_ce, "&site=\"S1\"");
    }
}
