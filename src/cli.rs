//! CLI argument parsing for the efd-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "efd-worker", about = "SPED EFD ingestion worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker pool (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Copy a file into the upload directory and queue it for ingestion
    Enqueue {
        /// Path of the EFD file to ingest
        file: PathBuf,
    },
    /// Print status and progress of a job
    Status {
        job_id: Uuid,
    },
    /// Request cancellation of a pending or running job
    Cancel {
        job_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_migrate_command_parses() {
        let cli = Cli::parse_from(["efd-worker", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_no_command_defaults_to_none() {
        let cli = Cli::parse_from(["efd-worker"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_enqueue_takes_path() {
        let cli = Cli::parse_from(["efd-worker", "enqueue", "/tmp/efd.txt"]);
        match cli.command {
            Some(Command::Enqueue { file }) => assert_eq!(file, PathBuf::from("/tmp/efd.txt")),
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_cli_cancel_requires_valid_uuid() {
        let ok = Cli::try_parse_from(["efd-worker", "cancel", "00000000-0000-0000-0000-000000000001"]);
        assert!(ok.is_ok());

        let bad = Cli::try_parse_from(["efd-worker", "cancel", "not-a-uuid"]);
        assert!(bad.is_err());
    }
}
