//! Output formatting module
//!
//! Renders session summaries and plan listings.

mod formatter;

pub use formatter::{write_results_to_file, Listing, OutputFormat, ResultFormatter};
