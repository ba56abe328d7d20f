//! Common command line arguments of module operators, built on `clap`.
//!
//! ```no_run
//! use clap::Parser;
//! use module_operator::cli;
//!
//! #[derive(clap::Parser)]
//! #[command(name = "Module Operator", version)]
//! struct Opts {
//!     #[clap(subcommand)]
//!     command: cli::Command,
//! }
//!
//! let opts = Opts::parse();
//! match opts.command {
//!     cli::Command::Crd => {
//!         // Print CRD objects
//!     }
//!     cli::Command::Run(cli::RunArguments { watch_namespace, .. }) => {
//!         // Run the operator
//!     }
//! }
//! ```
use clap::{Args, Parser};

use crate::namespace::WatchNamespace;

mod environment;

pub use environment::*;

/// A common set of commands used by operators.
///
/// This enum is generic over the arguments available to the [`Command::Run`] subcommand. By
/// default, [`RunArguments`] is used, but a custom type can be used.
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(Run),
}

/// Default CLI arguments that module operators take when running.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// The address the metrics and health endpoints bind to. `:8080` binds all interfaces.
    #[arg(long, default_value = ":8080")]
    pub metrics_bind_address: String,

    /// Enable leader election, so that only one replica runs controllers at a time.
    #[arg(long)]
    pub leader_elect: bool,

    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Only `ModuleLifecycle` objects of this class are reconciled.
    #[arg(long, env, default_value = "helm")]
    pub lifecycle_class: String,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub operator_environment: OperatorEnvironmentOptions,
}
