#![deny(missing_debug_implementations)]
//! # Data structures for the Data Access Protocol (DAP)
//!
//! This crate provides the data model the `dap-server` response pipeline is
//! built on: validated identifiers, the typed variable tree, attribute tables,
//! the constraint-expression AST, response tags, and the error taxonomy.
//!
//! Values are materialized by dataset adapters (out of scope here); the tree
//! records per-variable `projected` and `read` flags that the constraint
//! evaluator and the serializer drive.

pub mod attribute;
pub mod constraint;
pub mod core;
pub mod dataset;
pub mod error;
pub mod request;
pub mod response;
pub mod utils;
pub mod variable;

pub use crate::core::{Keyword, VarName};
pub use crate::dataset::Dataset;
pub use crate::error::{DapError, ValidationError};
pub use crate::variable::{Value, Variable};
