//! Status command implementation

use std::path::Path;

use anyhow::Result;
use remit_core::{
    ai::{DocumentExtractor, ExtractorClient},
    db::DB_KEY_ENV,
    models::MatchStatus,
};

use super::{load_settings, open_db};

pub async fn cmd_status(db_path: &Path, config: Option<&Path>, no_encrypt: bool) -> Result<()> {
    println!();
    println!("📊 Remit Status");
    println!("   ─────────────────────────────────────────────────────────────");

    println!("   Database: {}", db_path.display());

    if db_path.exists() {
        if let Ok(metadata) = std::fs::metadata(db_path) {
            let size_kb = metadata.len() as f64 / 1024.0;
            if size_kb < 1024.0 {
                println!("   Size: {:.1} KB", size_kb);
            } else {
                println!("   Size: {:.1} MB", size_kb / 1024.0);
            }
        }
    } else {
        println!("   Size: (database not initialized)");
    }

    let has_key = std::env::var(DB_KEY_ENV).is_ok();
    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else if has_key {
        println!("   🔒 Encryption: ENABLED ({}=***)", DB_KEY_ENV);
    } else {
        println!("   ❌ Encryption: REQUIRED but {} not set", DB_KEY_ENV);
    }

    if db_path.exists() {
        match open_db(db_path, no_encrypt) {
            Ok(db) => {
                println!();
                if let Ok(count) = db.count_payers() {
                    println!("   Payers: {}", count);
                }
                if let Ok(payments) = db.list_payments(None) {
                    println!("   Payments: {}", payments.len());
                    for status in [
                        MatchStatus::Matched,
                        MatchStatus::MatchedAddressMismatch,
                        MatchStatus::New,
                        MatchStatus::Rejected,
                        MatchStatus::Unmatched,
                    ] {
                        let n = payments
                            .iter()
                            .filter(|p| p.payment.match_status == status)
                            .count();
                        if n > 0 {
                            println!("     {:<26} {}", status.as_str(), n);
                        }
                    }
                }
            }
            Err(e) => {
                println!();
                println!("   ❌ Error opening database: {}", e);
                if !no_encrypt && !has_key {
                    println!("      Set {} or use --no-encrypt", DB_KEY_ENV);
                } else if has_key {
                    println!("      (Check if {} is correct)", DB_KEY_ENV);
                }
            }
        }
    }

    println!();
    match load_settings(config) {
        Ok(settings) => {
            match settings.source {
                Some(ref path) => println!("   Settings: {}", path.display()),
                None => println!("   Settings: built-in defaults"),
            }
            println!(
                "   Models: {} (text), {} (vision), {} at a time",
                settings.extraction.model,
                settings.extraction.vision_model,
                settings.extraction.concurrency
            );
        }
        Err(e) => println!("   ❌ Settings: {:#}", e),
    }

    match ExtractorClient::from_env() {
        Some(client) => {
            let healthy = client.health_check().await;
            println!(
                "   Extraction backend: {} {}",
                client.host(),
                if healthy { "✓ reachable" } else { "✗ unreachable" }
            );
        }
        None => println!("   Extraction backend: not configured (set OLLAMA_HOST)"),
    }

    println!();
    Ok(())
}
