#![deny(missing_debug_implementations)]
//! # The DAP response pipeline
//!
//! This crate builds server responses for the Data Access Protocol: dataset
//! attributes (DAS), structure (DDS), structure plus data (DataDDS),
//! XML structure (DDX), and the multipart DataDDX that bundles a DDX with a
//! binary blob.
//!
//! The pieces, leaves first:
//!
//! - [`xdr`] streams typed values in the portable big-endian wire form;
//! - [`mime`] writes the byte-exact response envelopes and part framing;
//! - [`ce`] splits, parses, and evaluates constraint expressions;
//! - [`cache`] keeps materialized server-function results on disk, shared
//!   across processes under advisory locks;
//! - [`timeout`] arms the per-response emission deadline;
//! - [`builder`] orchestrates all of the above, one response per call.
//!
//! # Example
//!
//! ```
//! use dap_server::builder::ResponseBuilder;
//! use dap_server::ce::Evaluator;
//! use dap_server::config::ServerConfig;
//! use dap_server::dap_types::{Dataset, Value, VarName, Variable};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let mut dataset = Dataset::new("Sample");
//! dataset.add_var(Variable::new(
//!     VarName::try_from("t")?,
//!     Value::Float64(Some(1.5)),
//! ))?;
//!
//! let config = ServerConfig {
//!     dataset: "Sample".to_owned(),
//!     cache_max_bytes: 0,
//!     ..ServerConfig::default()
//! };
//! let mut builder = ResponseBuilder::new(&config)?;
//! builder.set_ce("t");
//!
//! let mut eval = Evaluator::new();
//! let mut out = Vec::new();
//! builder.send_data(&mut out, &mut dataset, &mut eval, true)?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod ce;
pub mod config;
pub mod ddx;
pub mod mime;
pub mod timeout;
pub mod xdr;

pub use dap_types;
