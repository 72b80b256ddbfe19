//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Queue-based notification delivery with retries, dead-lettering and bulk jobs.
#[derive(Parser, Debug)]
#[command(name = "delivery-pipeline", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/pipeline.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the queue consumers, dead-letter monitor and metrics server.
    Run(RunArgs),

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// Show message and consumer counts for every dead-letter queue.
    #[command(name = "dlq-stats")]
    DlqStats,

    /// List messages in a queue without removing them.
    #[command(name = "dlq-peek")]
    DlqPeek {
        /// Queue to inspect, usually a `-dlq` queue.
        queue: String,

        /// Maximum number of messages to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Move the next dead-lettered message back to its original queue.
    #[command(name = "dlq-reprocess")]
    DlqReprocess {
        dead_letter_queue: String,
        original_queue: String,
        /// Delivery tag reported by `dlq-peek`.
        delivery_tag: u64,
    },

    /// Move every message currently in a dead-letter queue back to its original queue.
    #[command(name = "dlq-reprocess-all")]
    DlqReprocessAll {
        dead_letter_queue: String,
        original_queue: String,
    },

    /// Delete all messages in a queue.
    #[command(name = "dlq-purge")]
    DlqPurge {
        queue: String,

        /// Confirm the purge. Nothing is deleted without it.
        #[arg(long)]
        yes: bool,
    },

    /// Show progress of a bulk job.
    #[command(name = "job-progress")]
    JobProgress { job_id: Uuid },

    /// Cancel a bulk job that has not finished.
    #[command(name = "job-cancel")]
    JobCancel { job_id: Uuid },

    /// Queue a run of a bulk job.
    #[command(name = "job-run")]
    JobRun { job_id: Uuid },
}

/// Arguments for the run subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Use an in-process broker and log messages instead of sending them.
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Only consume these queues (comma separated). Defaults to all.
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,
}
