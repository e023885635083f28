//! Constraint evaluation.
//!
//! [`Evaluator`] parses a (residual) constraint expression against a dataset,
//! mutating projection flags and array slicing, and runs registered server
//! functions. The [`ConstraintEvaluator`] trait is the seam the response
//! builder talks through, so alternative evaluators can be dropped in.

use std::collections::HashMap;

use dap_types::constraint::{
    Argument, ConstraintExpr, FunctionCall, Projection, ProjectionTerm, RelOp, SelValue, Selection,
};
use dap_types::core::Keyword;
use dap_types::utils::name_path;
use dap_types::variable::{ScalarValue, Value, Variable};
use dap_types::{DapError, Dataset};
use log::debug;

use super::grammar;

/// How a registered server function behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Filters the tree in place.
    Projection,
    /// Contributes a predicate to the selection.
    Selection,
    /// Synthesizes a new variable tree from the original ("BTP" function).
    BaseType,
}

pub type ProjectionFunction = fn(&[Argument], &mut Dataset) -> Result<(), DapError>;
pub type SelectionFunction = fn(&[Argument], &Dataset) -> Result<bool, DapError>;
pub type BtpFunction = fn(&[Argument], &Dataset) -> Result<Dataset, DapError>;

/// A registered server function.
#[derive(Debug, Clone, Copy)]
pub enum ServerFunction {
    Projection(ProjectionFunction),
    Selection(SelectionFunction),
    BaseType(BtpFunction),
}

impl ServerFunction {
    pub fn kind(&self) -> FunctionKind {
        match self {
            Self::Projection(_) => FunctionKind::Projection,
            Self::Selection(_) => FunctionKind::Selection,
            Self::BaseType(_) => FunctionKind::BaseType,
        }
    }
}

/// The constraint-parsing and function-evaluation entry points the response
/// builder needs.
pub trait ConstraintEvaluator {
    /// Parse `ce` against `dataset`, mutating projection and slicing state.
    fn parse_constraint(&mut self, ce: &str, dataset: &mut Dataset) -> Result<(), DapError>;

    /// Look a server function up by name.
    fn find_function(&self, name: &str) -> Option<FunctionKind>;

    /// Run the tree-building function calls found by the last parse and
    /// return the freshly built result tree.
    fn eval_function_clauses(&self, dataset: &Dataset) -> Result<Dataset, DapError>;

    /// True when the last parse found tree-building function calls.
    fn has_function_clauses(&self) -> bool;

    /// True when the whole expression was nothing but function calls.
    fn functional_expression(&self) -> bool;

    /// Keywords stripped from the front of the last-parsed expression.
    fn keywords(&self) -> Vec<Keyword>;

    /// Evaluate the selection against one sequence row. Clauses that do not
    /// name a field of this sequence are ignored.
    fn row_matches(&self, fields: &[Variable], row: &[Value]) -> Result<bool, DapError>;
}

/// The default evaluator, with a registry of server functions.
#[derive(Debug, Default)]
pub struct Evaluator {
    functions: HashMap<String, ServerFunction>,
    parsed: ConstraintExpr,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, function: ServerFunction) {
        self.functions.insert(name.to_owned(), function);
    }

    fn apply(&self, expr: &ConstraintExpr, dataset: &mut Dataset) -> Result<(), DapError> {
        dataset.mark_all(false);
        for var in dataset.vars_mut() {
            clear_array_constraints(var);
        }

        // An empty projection means "send everything".
        if expr.projections.is_empty() {
            dataset.mark_all(true);
        }

        for term in &expr.projections {
            match term {
                ProjectionTerm::Simple(projection) => apply_projection(dataset, projection)?,
                ProjectionTerm::Call(call) => self.apply_call(dataset, call)?,
            }
        }

        for selection in &expr.selections {
            validate_selection(dataset, selection)?;
        }

        Ok(())
    }

    fn apply_call(&self, dataset: &mut Dataset, call: &FunctionCall) -> Result<(), DapError> {
        match self.functions.get(call.name.as_str()) {
            Some(ServerFunction::Projection(f)) => f(&call.args, dataset),
            // Evaluated separately, through eval_function_clauses().
            Some(ServerFunction::BaseType(_)) => Ok(()),
            Some(ServerFunction::Selection(_)) => Err(DapError::CeParse(format!(
                "`{}` is a selection function and cannot appear in the projection",
                call.name,
            ))),
            None => Err(DapError::CeParse(format!(
                "undefined function `{}`",
                call.name,
            ))),
        }
    }

    fn btp_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parsed.projections.iter().filter_map(|term| match term {
            ProjectionTerm::Call(call)
                if self.find_function(call.name.as_str()) == Some(FunctionKind::BaseType) =>
            {
                Some(call)
            }
            _ => None,
        })
    }
}

impl ConstraintEvaluator for Evaluator {
    fn parse_constraint(&mut self, ce: &str, dataset: &mut Dataset) -> Result<(), DapError> {
        let (keywords, rest) = strip_keywords(ce);

        let mut expr = if rest.is_empty() {
            ConstraintExpr::default()
        } else {
            match grammar::constraint(rest) {
                Ok((_, expr)) => expr,
                Err(nom::Err::Error(failure) | nom::Err::Failure(failure)) => {
                    let what = match failure.kind {
                        grammar::CeFailureKind::BadNumber => "bad number",
                        grammar::CeFailureKind::BadName => "bad identifier",
                        grammar::CeFailureKind::Nom(_) => "unexpected input",
                    };
                    return Err(DapError::CeParse(format!(
                        "`{ce}`: {what} at `{}`",
                        failure.input,
                    )));
                }
                Err(nom::Err::Incomplete(_)) => {
                    return Err(DapError::CeParse(format!("`{ce}` is incomplete")));
                }
            }
        };
        expr.keywords = keywords;

        debug!("parsed constraint `{ce}`: {expr:?}");

        self.apply(&expr, dataset)?;
        self.parsed = expr;
        Ok(())
    }

    fn find_function(&self, name: &str) -> Option<FunctionKind> {
        self.functions.get(name).map(ServerFunction::kind)
    }

    fn eval_function_clauses(&self, dataset: &Dataset) -> Result<Dataset, DapError> {
        let mut result = Dataset::new(format!("function_result_{}", name_path(&dataset.name)));
        result.filename = dataset.filename.clone();
        result.dap_version = dataset.dap_version.clone();

        let mut evaluated = 0usize;
        for call in self.btp_calls() {
            let Some(ServerFunction::BaseType(f)) = self.functions.get(call.name.as_str()) else {
                continue;
            };

            debug!("evaluating function clause `{}`", call.name);
            let partial = f(&call.args, dataset)?;
            for mut var in partial.into_vars() {
                // Function results arrive materialized.
                var.set_projected_recursive(true);
                var.set_read_recursive(true);
                result
                    .add_var(var)
                    .map_err(|e| DapError::Internal(e.to_string()))?;
            }
            evaluated += 1;
        }

        if evaluated == 0 {
            return Err(DapError::Internal(
                "eval_function_clauses called without function clauses".to_owned(),
            ));
        }

        Ok(result)
    }

    fn has_function_clauses(&self) -> bool {
        self.btp_calls().next().is_some()
    }

    fn functional_expression(&self) -> bool {
        self.parsed.is_functional()
    }

    fn keywords(&self) -> Vec<Keyword> {
        self.parsed.keywords.clone()
    }

    fn row_matches(&self, fields: &[Variable], row: &[Value]) -> Result<bool, DapError> {
        for clause in &self.parsed.selections {
            let leaf = clause.lhs.leaf();
            let Some(index) = fields.iter().position(|f| f.name == leaf.as_str()) else {
                continue;
            };
            let Some(lhs) = row.get(index).and_then(Value::scalar) else {
                continue;
            };

            if !clause_matches(&lhs, clause, fields, row)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Strip recognized keywords off the front of the expression.
fn strip_keywords(ce: &str) -> (Vec<Keyword>, &str) {
    let mut keywords = Vec::new();
    let mut rest = ce;

    loop {
        match rest.find(',') {
            Some(idx) => match Keyword::parse(&rest[..idx]) {
                Some(keyword) => {
                    keywords.push(keyword);
                    rest = &rest[idx + 1..];
                }
                None => break,
            },
            None => {
                // A keyword may also be the whole (remaining) expression.
                if let Some(keyword) = Keyword::parse(rest) {
                    keywords.push(keyword);
                    rest = "";
                }
                break;
            }
        }
    }

    (keywords, rest)
}

/// Hyperslabs from an earlier parse must not leak into this one.
fn clear_array_constraints(var: &mut Variable) {
    if let Value::Array(arr) = &mut var.value {
        arr.clear_constraints();
    }
    for child in var.value.children_mut() {
        clear_array_constraints(child);
    }
}

fn apply_projection(dataset: &mut Dataset, projection: &Projection) -> Result<(), DapError> {
    let segments = projection.path.segments();

    let no_such_variable = || {
        DapError::CeParse(format!(
            "No such variable: `{}`",
            projection.path,
        ))
    };

    let (first, rest) = segments.split_first().ok_or_else(no_such_variable)?;
    let mut var = dataset
        .vars_mut()
        .iter_mut()
        .find(|v| v.name == first.as_str())
        .ok_or_else(no_such_variable)?;

    // Projecting a nested variable keeps each ancestor in the output.
    var.projected = true;
    for segment in rest {
        var = var
            .child_mut(segment.as_str())
            .ok_or_else(no_such_variable)?;
        var.projected = true;
    }

    var.set_projected_recursive(true);

    if !projection.slices.is_empty() {
        apply_slices(var, &projection.slices, &projection.path.to_string())?;
    }

    Ok(())
}

fn apply_slices(
    var: &mut Variable,
    slices: &[dap_types::variable::Slice],
    path: &str,
) -> Result<(), DapError> {
    for slice in slices {
        if slice.stride == 0 {
            return Err(DapError::CeParse(format!(
                "`{path}`: a hyperslab stride of 0 is not valid",
            )));
        }
        if let Some(stop) = slice.stop {
            if stop < slice.start {
                return Err(DapError::CeParse(format!(
                    "`{path}`: hyperslab start {} is past its stop {stop}",
                    slice.start,
                )));
            }
        }
    }

    match &mut var.value {
        Value::Array(arr) => {
            if slices.len() > arr.dims.len() {
                return Err(DapError::CeParse(format!(
                    "`{path}` has {} dimensions but {} hyperslabs were given",
                    arr.dims.len(),
                    slices.len(),
                )));
            }
            for (dim, slice) in arr.dims.iter_mut().zip(slices) {
                check_slice_extent(dim.size, slice, path)?;
                dim.constraint = Some(*slice);
            }
            Ok(())
        }
        Value::Grid(grid) => {
            let Value::Array(arr) = &mut grid.array.value else {
                return Err(DapError::Internal(format!(
                    "grid `{path}` has a non-array data component",
                )));
            };
            if slices.len() > arr.dims.len() {
                return Err(DapError::CeParse(format!(
                    "`{path}` has {} dimensions but {} hyperslabs were given",
                    arr.dims.len(),
                    slices.len(),
                )));
            }
            for (dim, slice) in arr.dims.iter_mut().zip(slices) {
                check_slice_extent(dim.size, slice, path)?;
                dim.constraint = Some(*slice);
            }
            // Each map is 1-D over the matching dimension.
            for (map, slice) in grid.maps.iter_mut().zip(slices) {
                if let Value::Array(map_arr) = &mut map.value {
                    if let Some(dim) = map_arr.dims.first_mut() {
                        dim.constraint = Some(*slice);
                    }
                }
            }
            Ok(())
        }
        _ => Err(DapError::CeParse(format!(
            "`{path}` is not an array and cannot be hyperslabbed",
        ))),
    }
}

fn check_slice_extent(
    size: u32,
    slice: &dap_types::variable::Slice,
    path: &str,
) -> Result<(), DapError> {
    let stop = slice.stop.unwrap_or(slice.start);
    if slice.start >= size || stop >= size {
        return Err(DapError::CeParse(format!(
            "`{path}`: hyperslab [{}..{stop}] is outside the dimension's 0..{} extent",
            slice.start,
            size.saturating_sub(1),
        )));
    }
    Ok(())
}

/// A selection clause must name a variable, or a field of some sequence.
fn validate_selection(dataset: &Dataset, selection: &Selection) -> Result<(), DapError> {
    if dataset.var_by_path(selection.lhs.segments()).is_some() {
        return Ok(());
    }

    let leaf = selection.lhs.leaf();
    let found = dataset
        .vars()
        .iter()
        .any(|var| sequence_has_field(var, leaf.as_str()));

    if found {
        Ok(())
    } else {
        Err(DapError::CeParse(format!(
            "No such variable: `{}` in selection",
            selection.lhs,
        )))
    }
}

fn sequence_has_field(var: &Variable, leaf: &str) -> bool {
    match &var.value {
        Value::Sequence(seq) => seq
            .fields
            .iter()
            .any(|f| f.name == leaf || sequence_has_field(f, leaf)),
        value => value
            .children()
            .into_iter()
            .any(|child| sequence_has_field(child, leaf)),
    }
}

fn clause_matches(
    lhs: &ScalarValue,
    clause: &Selection,
    fields: &[Variable],
    row: &[Value],
) -> Result<bool, DapError> {
    match &clause.rhs {
        SelValue::Number(rhs) => {
            let Some(lhs) = lhs.as_f64() else {
                return Err(DapError::CeParse(format!(
                    "`{}` is not numeric and cannot be compared with {rhs}",
                    clause.lhs,
                )));
            };
            compare(clause.op, &clause.lhs.to_string(), lhs, *rhs)
        }
        SelValue::Str(rhs) => {
            let Some(lhs) = lhs.as_str() else {
                return Err(DapError::CeParse(format!(
                    "`{}` is not a string and cannot be compared with \"{rhs}\"",
                    clause.lhs,
                )));
            };
            if clause.op == RelOp::Match {
                let re = regex::Regex::new(rhs).map_err(|e| {
                    DapError::CeParse(format!("bad pattern in `=~` clause: {e}"))
                })?;
                return Ok(re.is_match(lhs));
            }
            compare(clause.op, &clause.lhs.to_string(), lhs, rhs.as_str())
        }
        SelValue::Path(path) => {
            // The right side names another field of the same row.
            let leaf = path.leaf();
            let rhs = fields
                .iter()
                .position(|f| f.name == leaf.as_str())
                .and_then(|i| row.get(i))
                .and_then(Value::scalar);
            let Some(rhs) = rhs else {
                return Ok(true);
            };

            match (lhs.as_f64(), rhs.as_f64()) {
                (Some(l), Some(r)) => compare(clause.op, &clause.lhs.to_string(), l, r),
                _ => match (lhs.as_str(), rhs.as_str()) {
                    (Some(l), Some(r)) => compare(clause.op, &clause.lhs.to_string(), l, r),
                    _ => Ok(true),
                },
            }
        }
    }
}

fn compare<T: PartialOrd>(op: RelOp, lhs_name: &str, lhs: T, rhs: T) -> Result<bool, DapError> {
    Ok(match op {
        RelOp::Less => lhs < rhs,
        RelOp::LessEqual => lhs <= rhs,
        RelOp::Greater => lhs > rhs,
        RelOp::GreaterEqual => lhs >= rhs,
        RelOp::Equal => lhs == rhs,
        RelOp::NotEqual => lhs != rhs,
        RelOp::Match => {
            return Err(DapError::CeParse(format!(
                "`=~` requires a string pattern on the right of `{lhs_name}`",
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use dap_types::VarName;
    use dap_types::variable::{
        ArrayValue, Dimension, ScalarType, SequenceValue, Slice,
    };

    use super::*;

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    fn sample() -> Dataset {
        let mut ds = Dataset::new("Sample");
        ds.add_var(Variable::new(name("t"), Value::Float64(Some(1.0))))
            .unwrap();

        let arr = ArrayValue::new(
            ScalarType::Int32,
            vec![Dimension::new(Some(name("time")), 10)],
        );
        ds.add_var(Variable::new(name("x"), Value::Array(arr)))
            .unwrap();

        let inner = Variable::new(name("temp"), Value::Float32(None));
        ds.add_var(Variable::new(
            name("station"),
            Value::Structure(vec![inner]),
        ))
        .unwrap();

        ds
    }

    #[test]
    fn test_empty_ce_projects_everything() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        eval.parse_constraint("", &mut ds).unwrap();

        assert!(ds.vars().iter().all(|v| v.projected));
    }

    #[test]
    fn test_simple_projection() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        eval.parse_constraint("t", &mut ds).unwrap();

        assert!(ds.var("t").unwrap().projected);
        assert!(!ds.var("x").unwrap().projected);
        assert!(!ds.var("station").unwrap().projected);
    }

    #[test]
    fn test_keywords_are_stripped() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        eval.parse_constraint("dap4.0,t,x", &mut ds).unwrap();

        assert_eq!(eval.keywords(), vec![Keyword::Dap4_0]);
        assert!(ds.var("t").unwrap().projected);
        assert!(ds.var("x").unwrap().projected);
    }

    #[test]
    fn test_unknown_keyword_stays_in_projection() {
        let mut ds = sample();
        ds.add_var(Variable::new(name("dap5"), Value::Int32(None)))
            .unwrap();
        let mut eval = Evaluator::new();

        eval.parse_constraint("dap5,t", &mut ds).unwrap();

        assert!(eval.keywords().is_empty());
        assert!(ds.var("dap5").unwrap().projected);
    }

    #[test]
    fn test_nested_projection_marks_ancestors() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        eval.parse_constraint("station.temp", &mut ds).unwrap();

        let station = ds.var("station").unwrap();
        assert!(station.projected);
        assert!(station.child("temp").unwrap().projected);
    }

    #[test]
    fn test_array_slicing() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        eval.parse_constraint("x[0:2:8]", &mut ds).unwrap();

        let Value::Array(arr) = &ds.var("x").unwrap().value else {
            unreachable!()
        };
        assert_eq!(arr.dims[0].constraint, Some(Slice::new(0, 2, Some(8))));
        assert_eq!(arr.constrained_len(), 5);
    }

    #[test]
    fn test_out_of_range_slice_is_an_error() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        let err = eval.parse_constraint("x[0:20]", &mut ds).unwrap_err();
        assert!(matches!(err, DapError::CeParse(_)));
    }

    #[test]
    fn test_unknown_variable_is_an_error() {
        let mut ds = sample();
        let mut eval = Evaluator::new();

        let err = eval.parse_constraint("bogus", &mut ds).unwrap_err();
        assert!(matches!(err, DapError::CeParse(_)));
    }

    #[test]
    fn test_functional_expression_flags() {
        fn btp(_: &[Argument], _: &Dataset) -> Result<Dataset, DapError> {
            let mut out = Dataset::new("out");
            out.add_var(Variable::new(name("m"), Value::Float64(Some(2.0))))
                .unwrap();
            Ok(out)
        }

        let mut ds = sample();
        let mut eval = Evaluator::new();
        eval.register("mean", ServerFunction::BaseType(btp));

        eval.parse_constraint("mean(x,0)", &mut ds).unwrap();
        assert!(eval.functional_expression());
        assert!(eval.has_function_clauses());

        let result = eval.eval_function_clauses(&ds).unwrap();
        assert_eq!(result.name, "function_result_Sample");
        let m = result.var("m").unwrap();
        assert!(m.projected && m.read);
    }

    #[test]
    fn test_row_matches() {
        let fields = vec![
            Variable::new(name("site"), Value::Str(None)),
            Variable::new(name("depth"), Value::Float64(None)),
        ];
        let mut ds = Dataset::new("Casts");
        ds.add_var(Variable::new(
            name("cast"),
            Value::Sequence(SequenceValue::new(fields.clone())),
        ))
        .unwrap();

        let mut eval = Evaluator::new();
        eval.parse_constraint("cast&depth>100", &mut ds).unwrap();

        let shallow = vec![
            Value::Str(Some("S1".into())),
            Value::Float64(Some(50.0)),
        ];
        let deep = vec![
            Value::Str(Some("S2".into())),
            Value::Float64(Some(150.0)),
        ];

        assert!(!eval.row_matches(&fields, &shallow).unwrap());
        assert!(eval.row_matches(&fields, &deep).unwrap());
    }

    #[test]
    fn test_row_matches_regex() {
        let fields = vec![Variable::new(name("site"), Value::Str(None))];
        let mut ds = Dataset::new("Casts");
        ds.add_var(Variable::new(
            name("cast"),
            Value::Sequence(SequenceValue::new(fields.clone())),
        ))
        .unwrap();

        let mut eval = Evaluator::new();
        eval.parse_constraint("cast&site=~\"^S[0-9]+$\"", &mut ds)
            .unwrap();

        let hit = vec![Value::Str(Some("S42".into()))];
        let miss = vec![Value::Str(Some("X1".into()))];

        assert!(eval.row_matches(&fields, &hit).unwrap());
        assert!(!eval.row_matches(&fields, &miss).unwrap());
    }
}
