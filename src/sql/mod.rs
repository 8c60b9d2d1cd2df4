//! SQL generation utilities.

pub mod sanitize;

pub use sanitize::{quote_identifier, validate_identifier};
