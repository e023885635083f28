//! nom parsers for the constraint-expression syntax.
//!
//! `constraint = [projection] *("&" selection)`
//!
//! Keywords are stripped by the evaluator before this grammar runs; they are
//! plain tokens (`dap4.0,`) that would not survive the path rules below.

use std::num::ParseIntError;

use dap_types::ValidationError;
use dap_types::constraint::{
    Argument, ConstraintExpr, FunctionCall, Projection, ProjectionTerm, RelOp, SelValue, Selection,
    VarPath,
};
use dap_types::core::VarName;
use dap_types::variable::Slice;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt, value};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::number::complete::double;
use nom::sequence::{delimited, preceded, tuple};

/// An extended version of [`nom::IResult`].
pub type CeResult<'a, O> = Result<(&'a str, O), nom::Err<CeFailure<'a>>>;

/// An extended version of [`nom::error::Error`].
#[derive(Debug)]
pub struct CeFailure<'a> {
    #[allow(unused)]
    pub input: &'a str,
    pub kind: CeFailureKind,
}

#[derive(Debug)]
pub enum CeFailureKind {
    BadNumber,
    BadName,
    Nom(ErrorKind),
}

impl<'a> ParseError<&'a str> for CeFailure<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        Self {
            input,
            kind: CeFailureKind::Nom(kind),
        }
    }

    fn append(input: &'a str, kind: ErrorKind, _: Self) -> Self {
        Self {
            input,
            kind: CeFailureKind::Nom(kind),
        }
    }
}

impl<'a> FromExternalError<&'a str, ParseIntError> for CeFailure<'a> {
    fn from_external_error(input: &'a str, _: ErrorKind, _: ParseIntError) -> Self {
        Self {
            input,
            kind: CeFailureKind::BadNumber,
        }
    }
}

impl<'a> FromExternalError<&'a str, ValidationError> for CeFailure<'a> {
    fn from_external_error(input: &'a str, _: ErrorKind, _: ValidationError) -> Self {
        Self {
            input,
            kind: CeFailureKind::BadName,
        }
    }
}

/// `name = (ALPHA / "_") *(ALPHA / DIGIT / "_")`
fn identifier(input: &str) -> CeResult<'_, VarName> {
    map_res(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        VarName::try_from,
    )(input)
}

/// `path = name *("." name)`
fn var_path(input: &str) -> CeResult<'_, VarPath> {
    map(separated_list1(char('.'), identifier), VarPath)(input)
}

fn number(input: &str) -> CeResult<'_, u32> {
    map_res(digit1, str::parse)(input)
}

/// `slice = "[" start [":" x [":" [stop]]] "]"`
///
/// The forms are `[i]`, `[start:stop]`, `[start:stride:stop]`, and the
/// open-ended `[start:stride:]` meaning "to the end".
fn slice(input: &str) -> CeResult<'_, Slice> {
    let (input, _) = char('[')(input)?;
    let (input, start) = number(input)?;

    let (input, slice) = match opt(char(':'))(input)? {
        (input, None) => (input, Slice::index(start)),
        (input, Some(_)) => {
            let (input, second) = number(input)?;
            match opt(char(':'))(input)? {
                (input, None) => (input, Slice::new(start, 1, Some(second))),
                (input, Some(_)) => {
                    let (input, stop) = opt(number)(input)?;
                    (input, Slice::new(start, second, stop))
                }
            }
        }
    };

    let (input, _) = char(']')(input)?;
    Ok((input, slice))
}

/// `quoted = DQUOTE *(any char except DQUOTE) DQUOTE`
fn quoted(input: &str) -> CeResult<'_, String> {
    map(
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
        str::to_owned,
    )(input)
}

/// `argument = quoted / number / path`
fn argument(input: &str) -> CeResult<'_, Argument> {
    alt((
        map(quoted, Argument::Str),
        map(double, Argument::Number),
        map(var_path, Argument::Path),
    ))(input)
}

/// `function-call = name "(" [argument *("," argument)] ")"`
fn function_call(input: &str) -> CeResult<'_, FunctionCall> {
    map(
        tuple((
            identifier,
            char('('),
            separated_list0(char(','), argument),
            char(')'),
        )),
        |(name, _, args, _)| FunctionCall { name, args },
    )(input)
}

/// `projection-term = function-call / (path *slice)`
fn projection_term(input: &str) -> CeResult<'_, ProjectionTerm> {
    alt((
        map(function_call, ProjectionTerm::Call),
        map(tuple((var_path, many0(slice))), |(path, slices)| {
            ProjectionTerm::Simple(Projection { path, slices })
        }),
    ))(input)
}

/// `rel-op = "<=" / ">=" / "!=" / "=~" / "<" / ">" / "="`
fn rel_op(input: &str) -> CeResult<'_, RelOp> {
    alt((
        value(RelOp::LessEqual, tag("<=")),
        value(RelOp::GreaterEqual, tag(">=")),
        value(RelOp::NotEqual, tag("!=")),
        value(RelOp::Match, tag("=~")),
        value(RelOp::Less, tag("<")),
        value(RelOp::Greater, tag(">")),
        value(RelOp::Equal, tag("=")),
    ))(input)
}

fn sel_value(input: &str) -> CeResult<'_, SelValue> {
    alt((
        map(quoted, SelValue::Str),
        map(double, SelValue::Number),
        map(var_path, SelValue::Path),
    ))(input)
}

/// `selection = path rel-op sel-value`
fn selection(input: &str) -> CeResult<'_, Selection> {
    map(tuple((var_path, rel_op, sel_value)), |(lhs, op, rhs)| {
        Selection { lhs, op, rhs }
    })(input)
}

/// `constraint = [projection-term *("," projection-term)] *("&" selection)`
///
/// The whole input must be consumed.
pub fn constraint(input: &str) -> CeResult<'_, ConstraintExpr> {
    let (input, projections) = separated_list0(char(','), projection_term)(input)?;
    let (input, selections) = many0(preceded(char('&'), selection))(input)?;

    if !input.is_empty() {
        return Err(nom::Err::Error(CeFailure::from_error_kind(
            input,
            ErrorKind::Eof,
        )));
    }

    Ok((
        input,
        ConstraintExpr {
            keywords: Vec::new(),
            projections,
            selections,
        },
    ))
}
