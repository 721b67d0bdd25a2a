//! Utility Functions and Common Components
//!
//! Shared error handling for the edge translation service.

pub mod error;

pub use error::{EdgeSrvError, ErrorExt, Result};
