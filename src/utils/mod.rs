//! Shared utilities.

pub mod answer_extraction;

pub use answer_extraction::extract_json;
