//! Payer directory command implementations

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use remit_core::{
    aliases::aliases_for_names,
    db::Database,
    import::{parse_payer_csv, PayerImport},
    models::RawAddress,
    normalize::{normalize_address, normalize_email, normalize_phone},
};

use super::truncate;

/// Arguments of `remit payers add`
pub struct NewPayerArgs {
    pub name: String,
    pub id: Option<String>,
    pub aliases: Vec<String>,
    pub organization: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

pub fn cmd_payers_list(db: &Database) -> Result<()> {
    let payers = db.list_payers()?;

    if payers.is_empty() {
        println!("No payers yet. Load some with: remit payers import --file payers.csv");
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<28} {:<36} {:<24}",
        "ID", "Name", "Address", "Aliases"
    );
    println!("{}", "-".repeat(100));
    for payer in &payers {
        let address = payer
            .address
            .as_ref()
            .map(|a| a.one_line())
            .unwrap_or_default();
        println!(
            "{:<10} {:<28} {:<36} {:<24}",
            truncate(&payer.id, 10),
            truncate(&payer.display_name, 28),
            truncate(&address, 36),
            truncate(&payer.aliases.join("; "), 24)
        );
    }
    println!();
    println!("{} payers", payers.len());

    Ok(())
}

pub fn cmd_payers_add(db: &Database, args: NewPayerArgs) -> Result<()> {
    let mut names = vec![args.name.clone()];
    names.extend(args.aliases.iter().cloned());
    let mut aliases = aliases_for_names(&names);
    if aliases.is_empty() {
        aliases.push(args.name.clone());
    }

    let raw_address = RawAddress {
        line1: args.address,
        city: args.city,
        state: args.state,
        zip: args.zip,
    };

    let payer = PayerImport {
        external_id: args.id,
        display_name: args.name,
        aliases,
        organization_name: args.organization,
        address: normalize_address(&raw_address),
        email: args.email.as_deref().and_then(normalize_email),
        phone: args.phone.as_deref().and_then(normalize_phone),
    };

    let id = db.insert_payer(&payer).context("Failed to add payer")?;
    println!("✓ Added payer {} ({})", payer.display_name, id);
    println!("  Aliases: {}", payer.aliases.join("; "));
    Ok(())
}

pub fn cmd_payers_import(db: &Database, file: &Path) -> Result<()> {
    let csv_file =
        File::open(file).with_context(|| format!("Failed to open file: {}", file.display()))?;
    let payers = parse_payer_csv(csv_file)
        .with_context(|| format!("Failed to read payers from {}", file.display()))?;

    println!("📥 Importing {} payers from {}...", payers.len(), file.display());

    let before = db.count_payers()?;
    for payer in &payers {
        db.insert_payer(payer)
            .with_context(|| format!("Failed to import payer {}", payer.display_name))?;
    }
    let after = db.count_payers()?;

    println!(
        "✅ {} new, {} refreshed ({} total)",
        after - before,
        payers.len() as i64 - (after - before),
        after
    );
    Ok(())
}
