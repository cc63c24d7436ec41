//! Remit CLI - Payment document reconciliation
//!
//! Usage:
//!   remit init                          Initialize database
//!   remit payers import --file CSV      Load the payer directory
//!   remit process --file a.jpg b.csv    Extract, merge and match a batch
//!   remit payments export --format csv  Hand ready payments downstream

mod cli;
mod commands;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Status => {
            commands::cmd_status(&cli.db, cli.config.as_deref(), cli.no_encrypt).await
        }
        Commands::Payers { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(PayersAction::List) => commands::cmd_payers_list(&db),
                Some(PayersAction::Add {
                    name,
                    id,
                    aliases,
                    organization,
                    address,
                    city,
                    state,
                    zip,
                    email,
                    phone,
                }) => commands::cmd_payers_add(
                    &db,
                    commands::NewPayerArgs {
                        name,
                        id,
                        aliases,
                        organization,
                        address,
                        city,
                        state,
                        zip,
                        email,
                        phone,
                    },
                ),
                Some(PayersAction::Import { file }) => commands::cmd_payers_import(&db, &file),
            }
        }
        Commands::Process {
            files,
            kind,
            create_new,
            out,
            dry_run,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let settings = commands::load_settings(cli.config.as_deref())?;
            commands::cmd_process(
                &db,
                settings,
                &files,
                commands::ProcessOptions {
                    kind: kind.as_deref(),
                    create_new,
                    out: out.as_deref(),
                    dry_run,
                },
            )
            .await
        }
        Commands::Payments { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None => commands::cmd_payments_list(&db, None, 50),
                Some(PaymentsAction::List { status, limit }) => {
                    commands::cmd_payments_list(&db, status.as_deref(), limit)
                }
                Some(PaymentsAction::Export {
                    format,
                    status,
                    output,
                }) => {
                    commands::cmd_payments_export(&db, &format, status.as_deref(), output.as_deref())
                }
                Some(PaymentsAction::Show { fingerprint }) => {
                    commands::cmd_payments_show(&db, &fingerprint)
                }
            }
        }
        Commands::Review { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                ReviewAction::Dismiss { fingerprint } => {
                    commands::cmd_review_dismiss(&db, &fingerprint)
                }
                ReviewAction::Requested { fingerprint } => {
                    commands::cmd_review_requested(&db, &fingerprint)
                }
            }
        }
        Commands::Sync {
            fingerprint,
            status,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_sync(&db, &fingerprint, &status)
        }
    }
}
