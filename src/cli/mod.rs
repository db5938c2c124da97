//! Command line interface module
//!
//! Argument parsing and the runner that turns a parsed command line into one export.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
