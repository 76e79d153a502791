//! CLI subcommand implementations.

pub mod calculate;
pub mod import;
pub mod observe;
pub mod status;
pub mod util;
