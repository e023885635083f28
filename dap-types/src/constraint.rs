//! The constraint-expression AST.
//!
//! A CE has the shape `[keyword(,keyword)*,][projection][&selection]*`. The
//! projection selects variables (with optional hyperslabs) or calls server
//! functions; the selection is a conjunction of relational clauses applied to
//! sequence rows.

use std::fmt::{Display, Formatter};

use crate::core::{Keyword, VarName};
use crate::variable::Slice;

/// A dotted variable path, e.g. `station.temp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarPath(pub Vec<VarName>);

impl VarPath {
    pub fn segments(&self) -> &[VarName] {
        &self.0
    }

    /// The final path segment.
    pub fn leaf(&self) -> &VarName {
        self.0.last().expect("paths have at least one segment")
    }
}

impl Display for VarPath {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            first = false;
            f.write_str(segment.as_str())?;
        }
        Ok(())
    }
}

/// Relational operator of a selection clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    /// `=~`: the left side matches a regular expression.
    Match,
}

impl RelOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Match => "=~",
        }
    }
}

/// An argument to a server function.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Path(VarPath),
    Number(f64),
    Str(String),
}

/// A server-function invocation, `name(arg,arg,...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: VarName,
    pub args: Vec<Argument>,
}

/// A plain projection term: a variable path with optional per-dimension slices.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub path: VarPath,
    pub slices: Vec<Slice>,
}

/// One comma-separated projection term.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionTerm {
    Simple(Projection),
    Call(FunctionCall),
}

/// The right-hand side of a selection clause.
#[derive(Debug, Clone, PartialEq)]
pub enum SelValue {
    Path(VarPath),
    Number(f64),
    Str(String),
}

/// One `&`-joined selection clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub lhs: VarPath,
    pub op: RelOp,
    pub rhs: SelValue,
}

/// A parsed constraint expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintExpr {
    pub keywords: Vec<Keyword>,
    pub projections: Vec<ProjectionTerm>,
    pub selections: Vec<Selection>,
}

impl ConstraintExpr {
    /// True when the expression is nothing but function calls: no plain
    /// projections and no selection. Such a CE is only meaningful for data
    /// responses.
    pub fn is_functional(&self) -> bool {
        !self.projections.is_empty()
            && self.selections.is_empty()
            && self
                .projections
                .iter()
                .all(|term| matches!(term, ProjectionTerm::Call(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> VarName {
        VarName::try_from(s).unwrap()
    }

    #[test]
    fn test_var_path_display() {
        let path = VarPath(vec![name("station"), name("temp")]);
        assert_eq!(path.to_string(), "station.temp");
        assert_eq!(path.leaf().as_str(), "temp");
    }

    #[test]
    fn test_is_functional() {
        let call = ProjectionTerm::Call(FunctionCall {
            name: name("mean"),
            args: vec![Argument::Path(VarPath(vec![name("x")]))],
        });
        let simple = ProjectionTerm::Simple(Projection {
            path: VarPath(vec![name("x")]),
            slices: Vec::new(),
        });

        let functional = ConstraintExpr {
            projections: vec![call.clone()],
            ..Default::default()
        };
        assert!(functional.is_functional());

        let mixed = ConstraintExpr {
            projections: vec![call, simple],
            ..Default::default()
        };
        assert!(!mixed.is_functional());

        assert!(!ConstraintExpr::default().is_functional());
    }
}
