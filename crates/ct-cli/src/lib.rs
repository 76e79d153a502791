//! Compute cost tracker CLI library.
//!
//! This crate provides the CLI interface for the cost tracker.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, ObserveArgs, PeriodArg};
pub use config::Config;
