//! Library side of the `stackscan` command-line interface.

pub mod commands;

pub use crate::commands::AnalyzeCommand;
