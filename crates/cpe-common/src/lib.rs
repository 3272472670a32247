//! Commission Preview ETL common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Plumbing shared by every workspace member:
//!
//! - **Logging**: `tracing` subscriber setup (console, rolling file, JSON)
//! - **Errors**: decoding failures for shared configuration files, which the
//!   ETL taxonomy folds into its configuration errors

pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
