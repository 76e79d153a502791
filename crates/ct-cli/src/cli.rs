//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ct_core::Period;

/// Compute cost tracker.
///
/// Reconstructs running time from recorded resource state changes and prices
/// it against a catalog with declarative discount rules.
#[derive(Debug, Parser)]
#[command(name = "costctl", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Calculate costs for a billing period.
    Calculate {
        /// Period to calculate.
        #[arg(long, value_enum, default_value_t = PeriodArg::Current)]
        period: PeriodArg,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show running/shutdown state of tracked resources.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Record one observation of a resource.
    Observe(ObserveArgs),

    /// Import resource states from a JSON snapshot file.
    Import {
        /// Snapshot file with an `instances` map.
        file: PathBuf,
    },
}

/// Billing period selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PeriodArg {
    /// Today, local midnight to midnight.
    Daily,
    /// The whole current month.
    Monthly,
    /// Month to date.
    Current,
}

impl From<PeriodArg> for Period {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Daily => Self::Daily,
            PeriodArg::Monthly => Self::Monthly,
            PeriodArg::Current => Self::Current,
        }
    }
}

/// Arguments for `costctl observe`.
#[derive(Debug, Clone, Args)]
pub struct ObserveArgs {
    /// Provider-assigned resource ID.
    #[arg(long)]
    pub id: String,

    /// Display name of the resource.
    #[arg(long)]
    pub name: String,

    /// Price class (flavor or instance type).
    #[arg(long)]
    pub class: String,

    /// Provider status (e.g. ACTIVE, SHUTOFF).
    #[arg(long)]
    pub status: String,

    /// Provider power-state code (1 = running, 4 = shutdown).
    #[arg(long)]
    pub power_state: i32,

    /// Creation time, used only for resources seen for the first time.
    /// Defaults to the observation time.
    #[arg(long)]
    pub created_at: Option<String>,

    /// Provider-reported time of the last real state change.
    #[arg(long)]
    pub changed_at: Option<String>,

    /// Observation time. Defaults to now.
    #[arg(long)]
    pub at: Option<String>,
}
