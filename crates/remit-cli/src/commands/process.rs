//! Batch processing command

use std::path::Path;

use anyhow::{bail, Context, Result};
use remit_core::{
    ai::{DocumentExtractor, ExtractorClient},
    db::Database,
    export::export_json,
    models::{DocumentContent, MatchStatus, SourceDocument, SourceKind},
    CancelFlag, DirectoryLookup, Pipeline, ReadyBatch, Settings,
};
use tracing::warn;

use super::truncate;

/// Flags of `remit process`
pub struct ProcessOptions<'a> {
    pub kind: Option<&'a str>,
    pub create_new: bool,
    pub out: Option<&'a Path>,
    pub dry_run: bool,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "bmp"];

/// Source kind from the file name when --kind is not given
pub fn guess_kind(path: &Path) -> SourceKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".csv") {
        SourceKind::OnlinePayment
    } else if ["deposit", "ledger", "slip"].iter().any(|w| name.contains(w)) {
        SourceKind::LedgerEntry
    } else if name.contains("printed") {
        SourceKind::PrintedCheck
    } else {
        SourceKind::HandwrittenCheck
    }
}

/// Read one file into a pipeline document
///
/// CSV exports are always online payments; the kind only applies to the
/// other documents.
pub fn load_document(path: &Path, kind: Option<SourceKind>) -> Result<SourceDocument> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let read_text = || {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))
    };

    let (content, kind) = match extension.as_str() {
        "csv" => (DocumentContent::Csv(read_text()?), SourceKind::OnlinePayment),
        "json" => (
            DocumentContent::ExtractionJson(read_text()?),
            kind.unwrap_or_else(|| guess_kind(path)),
        ),
        "txt" | "md" => (
            DocumentContent::Text(read_text()?),
            kind.unwrap_or_else(|| guess_kind(path)),
        ),
        ext if IMAGE_EXTENSIONS.contains(&ext) => (
            DocumentContent::Image(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read file: {}", path.display()))?,
            ),
            kind.unwrap_or_else(|| guess_kind(path)),
        ),
        other => bail!(
            "Unsupported document type '{}' for {}. Use images, .txt, .json or .csv",
            other,
            path.display()
        ),
    };

    Ok(SourceDocument {
        id: path.display().to_string(),
        kind_hint: kind,
        content,
    })
}

pub async fn cmd_process(
    db: &Database,
    settings: Settings,
    files: &[std::path::PathBuf],
    opts: ProcessOptions<'_>,
) -> Result<()> {
    let kind = opts
        .kind
        .map(|k| k.parse::<SourceKind>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;

    let documents = files
        .iter()
        .map(|path| load_document(path, kind))
        .collect::<Result<Vec<_>>>()?;

    let needs_model = documents
        .iter()
        .any(|d| matches!(d.content, DocumentContent::Image(_) | DocumentContent::Text(_)));
    let extractor = if needs_model {
        let client = ExtractorClient::from_env().with_context(|| {
            "Images and text need an extraction backend. Set OLLAMA_HOST (and optionally \
             OLLAMA_VISION_MODEL), or pass pre-extracted .json files"
        })?;
        let client = client.with_settings(&settings.extraction);
        println!("   🤖 Extraction: {} @ {}", client.model(), client.host());
        Some(client)
    } else {
        None
    };

    println!("🔄 Processing {} documents...", documents.len());

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling batch");
            on_interrupt.cancel();
        }
    });

    let pipeline = Pipeline::new(settings).with_cancel_flag(cancel);
    let ready = pipeline
        .run(documents, extractor.as_ref(), db, db)
        .await
        .context("Batch failed")?;

    print_report(&ready);

    if let Some(out) = opts.out {
        std::fs::write(out, export_json(&ready.payments)?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("   📄 Wrote {} payments to {}", ready.payments.len(), out.display());
    }

    if opts.dry_run {
        println!("   (dry run: nothing stored)");
        return Ok(());
    }

    db.save_payments(&ready.payments)?;

    if !ready.report.new_payers.is_empty() {
        if opts.create_new {
            for request in &ready.report.new_payers {
                let id = db.create_entry(request).await?;
                db.mark_creation_requested(&request.fingerprint)?;
                println!("   ➕ Created payer {} ({})", request.display_name, id);
            }
            println!("   Run the batch again to match payments to the new payers.");
        } else {
            println!(
                "   💡 {} payers are not in the directory. Re-run with --create-new to add them.",
                ready.report.new_payers.len()
            );
        }
    }

    if !ready.report.address_updates.is_empty() {
        println!(
            "   💡 {} address changes proposed. Accept the directory address with: remit review dismiss <fingerprint>",
            ready.report.address_updates.len()
        );
    }

    println!("✅ Stored {} payments", ready.payments.len());
    Ok(())
}

fn print_report(ready: &ReadyBatch) {
    let c = &ready.report.counters;
    println!();
    println!("📊 Batch Results");
    println!("   ─────────────────────────────");
    println!("   Documents:            {}", c.documents);
    println!("   Extraction failures:  {}", c.extraction_failed);
    println!("   Records read:         {}", c.raw);
    println!("   Invalid records:      {}", c.invalid);
    println!("   Canonical payments:   {}", c.canonical);
    println!("   Duplicates collapsed: {}", c.duplicates_collapsed);
    println!("   Records merged:       {}", c.records_merged);
    println!();
    println!("   ✓ Matched:            {}", c.matched);
    println!("   ⚠ Address mismatch:   {}", c.address_mismatch);
    println!("   ➕ New payers:         {}", c.new);
    println!("   ✗ Rejected:           {}", c.rejected);
    println!("   ? Unmatched:          {}", c.unmatched);

    if !ready.payments.is_empty() {
        println!();
        println!(
            "   {:<14} {:>10} {:<10} {:<12} {:<24} {:<24}",
            "Fingerprint", "Amount", "Ref", "Date", "Payer", "Status"
        );
        for p in &ready.payments {
            println!(
                "   {:<14} {:>10} {:<10} {:<12} {:<24} {:<24}",
                truncate(&p.fingerprint, 14),
                p.amount.to_string(),
                truncate(p.check_no_or_ref.as_deref().unwrap_or("-"), 10),
                p.payment_date.to_string(),
                truncate(p.display_name().unwrap_or("unknown"), 24),
                status_label(p.match_status, p.payer_directory_id.as_deref())
            );
        }
    }

    let issues = ready.issues();
    if !issues.is_empty() {
        println!();
        println!("⚠️  {} issues need review:", issues.len());
        for issue in &issues {
            println!("   - {}", issue);
        }
    }
    println!();
}

fn status_label(status: MatchStatus, payer: Option<&str>) -> String {
    match payer {
        Some(id) => format!("{} → {}", status, id),
        None => status.to_string(),
    }
}
