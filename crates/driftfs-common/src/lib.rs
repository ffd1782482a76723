//! DriftFS Common - Shared types and utilities
//!
//! This crate provides the error type, protocol status codes, the
//! configuration property map and the basic network location type used
//! across all DriftFS components.

pub mod error;
pub mod props;
pub mod status;
pub mod types;

pub use error::{Error, Result};
pub use props::Properties;
pub use types::{LogSeq, ServerLocation};
