//! CLI argument definitions using clap.

use agenda_billing_core::Job;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "billing-api")]
#[command(version)]
#[command(about = "Agenda subscription billing service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Serve the HTTP API and run the job timers (default)
    Serve,

    /// Run one scheduled job now and print its report
    Run {
        /// Job name, e.g. subscriptions:process or check-preapprovals
        job: Job,
    },
}

impl Cli {
    pub fn command(&self) -> &Commands {
        self.command.as_ref().unwrap_or(&Commands::Serve)
    }
}
