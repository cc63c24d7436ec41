//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Remit - Reconcile payment documents into canonical payments
#[derive(Parser)]
#[command(name = "remit")]
#[command(
    about = "Extract, reconcile and match payments from checks, deposit logs and online exports",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "remit.db", global = true)]
    pub db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set REMIT_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    /// Settings file (defaults to ~/.local/share/remit/config/remit.toml, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Show database, settings and extraction backend status
    Status,

    /// Manage the local payer directory
    Payers {
        #[command(subcommand)]
        action: Option<PayersAction>,
    },

    /// Run documents through extraction, merge and payer matching
    Process {
        /// Documents to process: images, text, .json model output or .csv exports
        #[arg(short, long = "file", required = true, num_args = 1..)]
        files: Vec<PathBuf>,

        /// Source kind for images and text: handwritten_check, printed_check, ledger_entry, online_payment
        /// (guessed from the file name if not specified)
        #[arg(short, long)]
        kind: Option<String>,

        /// Create directory entries for payers that matched nobody
        #[arg(long)]
        create_new: bool,

        /// Write the ready batch as interchange JSON
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Report only; do not store payments
        #[arg(long)]
        dry_run: bool,
    },

    /// Stored canonical payments
    Payments {
        #[command(subcommand)]
        action: Option<PaymentsAction>,
    },

    /// Record review decisions
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Record the outcome of sending a payment downstream
    Sync {
        /// Payment fingerprint
        fingerprint: String,

        /// Sync status: pending, sent, error
        status: String,
    },
}

#[derive(Subcommand)]
pub enum PayersAction {
    /// List payers
    List,

    /// Add a payer
    Add {
        /// Display name
        name: String,

        /// Directory id (generated if not specified)
        #[arg(long)]
        id: Option<String>,

        /// Other names this payer writes checks under (repeatable)
        #[arg(long = "alias")]
        aliases: Vec<String>,

        /// Organization name
        #[arg(long)]
        organization: Option<String>,

        /// Street address
        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        zip: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        phone: Option<String>,
    },

    /// Import payers from CSV (columns: name, id, aliases, organization, address, city, state, zip, email, phone)
    Import {
        /// CSV file to import
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum PaymentsAction {
    /// List stored payments
    List {
        /// Only payments with this match status: matched, matched_address_mismatch, new, rejected, unmatched
        #[arg(short, long)]
        status: Option<String>,

        /// Number of payments to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Export stored payments for the sync collaborator
    Export {
        /// Output format: json, csv
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Only payments with this match status
        #[arg(short, long)]
        status: Option<String>,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show one payment with its review state
    Show {
        /// Payment fingerprint
        fingerprint: String,
    },
}

#[derive(Subcommand)]
pub enum ReviewAction {
    /// Accept the directory address for a payment flagged with an address mismatch
    Dismiss {
        /// Payment fingerprint
        fingerprint: String,
    },

    /// Record that a creation request was sent for a new payer
    Requested {
        /// Payment fingerprint
        fingerprint: String,
    },
}
