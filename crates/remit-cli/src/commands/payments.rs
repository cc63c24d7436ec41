//! Stored payment, review and sync command implementations

use std::path::Path;

use anyhow::{Context, Result};
use remit_core::{
    db::Database,
    export::ExportFormat,
    models::{MatchStatus, SyncStatus},
};

use super::truncate;

fn parse_status(status: Option<&str>) -> Result<Option<MatchStatus>> {
    status
        .map(|s| s.parse::<MatchStatus>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

pub fn cmd_payments_list(db: &Database, status: Option<&str>, limit: usize) -> Result<()> {
    let status = parse_status(status)?;
    let stored = db.list_payments(status)?;

    if stored.is_empty() {
        println!("No payments stored. Process a batch with: remit process --file ...");
        return Ok(());
    }

    println!();
    println!(
        "{:<18} {:<12} {:>10} {:<10} {:<24} {:<26} {:<8}",
        "Fingerprint", "Date", "Amount", "Ref", "Payer", "Status", "Sync"
    );
    println!("{}", "-".repeat(114));
    for entry in stored.iter().take(limit) {
        let p = &entry.payment;
        let status = match p.payer_directory_id {
            Some(ref id) => format!("{} → {}", p.match_status, id),
            None => p.match_status.to_string(),
        };
        println!(
            "{:<18} {:<12} {:>10} {:<10} {:<24} {:<26} {:<8}",
            truncate(&p.fingerprint, 18),
            p.payment_date.to_string(),
            p.amount.to_string(),
            truncate(p.check_no_or_ref.as_deref().unwrap_or("-"), 10),
            truncate(p.display_name().unwrap_or("unknown"), 24),
            truncate(&status, 26),
            p.sync_status.as_str()
        );
    }
    if stored.len() > limit {
        println!("... and {} more", stored.len() - limit);
    }
    println!();

    Ok(())
}

pub fn cmd_payments_show(db: &Database, fingerprint: &str) -> Result<()> {
    let stored = db
        .get_payment(fingerprint)?
        .with_context(|| format!("No payment with fingerprint {}", fingerprint))?;
    let p = &stored.payment;

    println!();
    println!("💳 Payment {} (version {})", p.fingerprint, p.version);
    println!("   Amount:      {}", p.amount);
    println!("   Reference:   {}", p.check_no_or_ref.as_deref().unwrap_or("-"));
    println!("   Date:        {} ({:?})", p.payment_date, p.payment_date_source);
    if let Some(d) = p.deposit_date {
        println!("   Deposited:   {}", d);
    }
    if let Some(ref memo) = p.memo {
        println!("   Memo:        {}", memo);
    }
    println!("   Payer:       {}", p.display_name().unwrap_or("unknown"));
    if p.aliases.len() > 1 {
        println!("   Aliases:     {}", p.aliases.join("; "));
    }
    if let Some(ref address) = p.address {
        println!("   Address:     {}", address.one_line());
    }
    println!(
        "   Status:      {} (merge confidence: {})",
        p.match_status, p.merge_confidence
    );
    if let Some(ref id) = p.payer_directory_id {
        println!("   Directory:   {}", id);
    }
    if let Some(ref reason) = p.review_reason {
        println!("   Review:      {}", reason);
    }
    for flag in &p.flags {
        println!("   ⚠ {}", flag.describe());
    }
    println!("   Sync:        {}", p.sync_status.as_str());
    if stored.address_mismatch_dismissed {
        println!("   Address mismatch dismissed by reviewer");
    }
    if stored.creation_requested {
        println!("   Payer creation requested");
    }
    println!("   Sources:     {}", p.constituent_ids.iter().cloned().collect::<Vec<_>>().join(", "));
    println!();

    Ok(())
}

pub fn cmd_payments_export(
    db: &Database,
    format: &str,
    status: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let format: ExportFormat = format.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let status = parse_status(status)?;
    let content = db.export_payments(status, format)?;

    match output {
        Some(path) => {
            std::fs::write(path, &content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("✅ Exported payments to {}", path.display());
        }
        None => print!("{}", content),
    }

    Ok(())
}

pub fn cmd_review_dismiss(db: &Database, fingerprint: &str) -> Result<()> {
    db.dismiss_address_mismatch(fingerprint)
        .context("Failed to dismiss address mismatch")?;
    println!("✓ Address mismatch dismissed for {}", fingerprint);
    Ok(())
}

pub fn cmd_review_requested(db: &Database, fingerprint: &str) -> Result<()> {
    db.mark_creation_requested(fingerprint)
        .context("Failed to record creation request")?;
    println!("✓ Creation request recorded for {}", fingerprint);
    Ok(())
}

pub fn cmd_sync(db: &Database, fingerprint: &str, status: &str) -> Result<()> {
    let status: SyncStatus = status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    db.set_sync_status(fingerprint, status)
        .context("Failed to record sync status")?;
    println!("✓ {} marked {}", fingerprint, status.as_str());
    Ok(())
}
