//! # Output Extraction
//!
//! Recovers a single JSON object from model text that may be wrapped in
//! prose, markdown fences, or `<think>` reasoning blocks.
//!
//! | Function | Use Case |
//! |----------|----------|
//! | [`extract`] | Untyped `serde_json::Value` |
//! | [`extract_as`] | Typed deserialization |
//! | [`extract_span`] | The exact matched text, unparsed |
//! | [`strip_think_tags`] | Remove reasoning blocks |

pub mod error;
pub mod extract;
pub mod json;

pub use error::ParseError;
pub use extract::{preprocess, strip_think_tags};
pub use json::{extract, extract_as, extract_span};
