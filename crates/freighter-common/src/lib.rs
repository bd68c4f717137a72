//! Freighter Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Freighter workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all Freighter workspace
//! members:
//!
//! - **Error Handling**: the workspace-wide error and result types
//! - **Logging**: `tracing` subscriber configuration and initialization
//! - **Records**: the generic row/document model moved between the fetch
//!   and storage stages
//!
//! # Example
//!
//! ```no_run
//! use freighter_common::record::Record;
//!
//! fn row_count(body: &[u8]) -> freighter_common::Result<usize> {
//!     let records = Record::decode_json(body)?;
//!     Ok(records.len())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod record;

// Re-export commonly used types
pub use error::{FreighterError, Result};
pub use record::Record;
