//! Error-related types.

use std::fmt::{Display, Formatter};
use std::io::Write;

use thiserror::Error;

use crate::utils::escape_quoted;

/// A validation error.
///
/// This error can be returned during validation of a value, e.g., a variable name.
#[derive(Clone, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub struct ValidationError {
    kind: ValidationErrorKind,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Validation failed: {}", self.kind)
    }
}

#[derive(Clone, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum ValidationErrorKind {
    #[error("Must not be empty")]
    Empty,
    #[error("Invalid byte b'\\x{byte:02x}' at index {at}")]
    InvalidByteAt { byte: u8, at: usize },
    #[error("Duplicate name `{name}`")]
    Duplicate { name: String },
}

impl ValidationError {
    pub(crate) fn new(kind: ValidationErrorKind) -> Self {
        Self { kind }
    }
}

/// Everything that can go wrong while building a response.
///
/// Errors raised before the first payload byte become a fresh error envelope;
/// errors raised mid-payload are serialized into the already-open stream.
#[derive(Debug, Error)]
pub enum DapError {
    /// The constraint expression is malformed or references an unknown variable.
    #[error("Constraint expression error: {0}")]
    CeParse(String),

    /// The projected response is larger than the configured limit.
    #[error(
        "The Request for {requested_kb}KB is too large; \
         requests for this user are limited to {limit_kb}KB."
    )]
    RequestTooLarge { requested_kb: u64, limit_kb: u64 },

    /// The whole CE is one function call but the response carries no data.
    #[error(
        "Function calls can only be used with data requests. To see the structure \
         of the underlying data source, reissue the URL without the function."
    )]
    FunctionalExpression,

    /// A cache lock could not be obtained, or a cache entry is corrupt.
    #[error("Cache error: {0}")]
    Cache(String),

    /// The output sink failed mid-write.
    #[error("Error writing the response: {0}")]
    EncoderIo(#[from] std::io::Error),

    /// The wall-clock deadline fired during emission.
    #[error("The request timed out while the response was being built.")]
    Timeout,

    /// The dataset adapter failed to provide a value.
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DapError {
    /// HTTP status line pieces for the error envelope.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::CeParse(_) => (400, "Malformed Constraint Expression"),
            Self::RequestTooLarge { .. } => (403, "Request Too Large"),
            Self::FunctionalExpression => (400, "Malformed Constraint Expression"),
            Self::Cache(_) => (500, "Internal Server Error"),
            Self::EncoderIo(_) => (500, "Internal Server Error"),
            Self::Timeout => (408, "Request Timeout"),
            Self::Dataset(_) => (500, "Dataset Error"),
            Self::Internal(_) => (500, "Internal Server Error"),
        }
    }

    /// Write the DAP2 text form of this error.
    ///
    /// ```text
    /// Error {
    ///     code = 400;
    ///     message = "...";
    /// };
    /// ```
    pub fn print(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let (code, _) = self.status();

        writeln!(out, "Error {{")?;
        writeln!(out, "    code = {code};")?;
        writeln!(out, "    message = \"{}\";", escape_quoted(&self.to_string()))?;
        writeln!(out, "}};")
    }
}
