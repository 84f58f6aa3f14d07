//! Configuration for the history execution core.
//!
//! Loaded from environment variables with the `envy` crate.

mod history;

pub use history::HistoryConfig;
