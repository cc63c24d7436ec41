//! CLI command tests

use std::io::Write;
use std::path::{Path, PathBuf};

use remit_core::db::Database;
use remit_core::models::{DocumentContent, MatchStatus, SourceKind, SyncStatus};
use remit_core::Settings;
use tempfile::TempDir;

use crate::commands::{self, guess_kind, load_document, truncate, NewPayerArgs, ProcessOptions};

const PAYERS: &str = "id,name,aliases,address,city,state,zip
C-101,Dalene Eimon,D. Eimon,805 Snead St,Paso Robles,CA,93446
C-102,Harlan Ostrow,,77 Creston Rd,Paso Robles,CA,93446
";

fn setup_test_db() -> Database {
    Database::in_memory().unwrap()
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

fn seeded_db(dir: &TempDir) -> Database {
    let db = setup_test_db();
    let csv = write_file(dir, "payers.csv", PAYERS);
    commands::cmd_payers_import(&db, &csv).unwrap();
    db
}

fn options<'a>(dry_run: bool) -> ProcessOptions<'a> {
    ProcessOptions {
        kind: None,
        create_new: false,
        out: None,
        dry_run,
    }
}

/// A pre-extracted printed check for Dalene Eimon and a Stripe export line
/// from a payer who is not in the directory
fn offline_batch(dir: &TempDir) -> Vec<PathBuf> {
    vec![
        write_file(
            dir,
            "printed-4531.json",
            r#"{"payment": {"amount": "1500.00", "check_no_or_ref": "004531", "check_date": "2025-01-16"},
                "payer": {"names": ["Dalene Eimon"]},
                "contact": {"address": {"line1": "805 Snead St", "city": "Paso Robles", "state": "CA", "zip": "93446"}}}"#,
        ),
        write_file(
            dir,
            "stripe.csv",
            "Payment_Ref,Amount,Date,Name,Email,Address,City,State,Zip,Memo
stripe_7001,25.00,2025-01-22,Mara Lind,mara@example.com,12 Vine St,Templeton,CA,93465,Dues
",
        ),
    ]
}

// ========== Helper Tests ==========

#[test]
fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("a longer payer name", 10), "a longe...");
}

#[test]
fn test_truncate_multibyte() {
    let result = truncate("Zoë Müller-Østergaard", 8);
    assert_eq!(result.chars().count(), 8);
    assert!(result.ends_with("..."));
}

#[test]
fn test_guess_kind_from_file_name() {
    assert_eq!(guess_kind(Path::new("stripe-jan.csv")), SourceKind::OnlinePayment);
    assert_eq!(guess_kind(Path::new("Deposit-0208.jpg")), SourceKind::LedgerEntry);
    assert_eq!(guess_kind(Path::new("bank_slip.png")), SourceKind::LedgerEntry);
    assert_eq!(guess_kind(Path::new("printed-4531.jpg")), SourceKind::PrintedCheck);
    assert_eq!(guess_kind(Path::new("scan-001.jpg")), SourceKind::HandwrittenCheck);
}

#[test]
fn test_load_document_by_extension() {
    let dir = TempDir::new().unwrap();

    let csv = write_file(&dir, "export.csv", "Payment_Ref,Amount\n");
    let doc = load_document(&csv, Some(SourceKind::PrintedCheck)).unwrap();
    // CSV is always an online export whatever --kind says
    assert_eq!(doc.kind_hint, SourceKind::OnlinePayment);
    assert!(matches!(doc.content, DocumentContent::Csv(_)));

    let json = write_file(&dir, "deposit.json", "{}");
    let doc = load_document(&json, None).unwrap();
    assert_eq!(doc.kind_hint, SourceKind::LedgerEntry);
    assert!(matches!(doc.content, DocumentContent::ExtractionJson(_)));

    let text = write_file(&dir, "check.txt", "Pay to the order of");
    let doc = load_document(&text, Some(SourceKind::PrintedCheck)).unwrap();
    assert_eq!(doc.kind_hint, SourceKind::PrintedCheck);
    assert!(matches!(doc.content, DocumentContent::Text(_)));

    let image = write_file(&dir, "check.JPG", "not really a jpeg");
    let doc = load_document(&image, None).unwrap();
    assert_eq!(doc.kind_hint, SourceKind::HandwrittenCheck);
    assert!(matches!(doc.content, DocumentContent::Image(_)));
    assert_eq!(doc.id, image.display().to_string());
}

#[test]
fn test_load_document_rejects_unknown_type() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "notes.docx", "binary");
    let err = load_document(&path, None).unwrap_err();
    assert!(err.to_string().contains("Unsupported document type"));
}

#[test]
fn test_load_document_missing_file() {
    assert!(load_document(Path::new("/nonexistent/check.json"), None).is_err());
}

// ========== Payer Command Tests ==========

#[test]
fn test_cmd_payers_import_and_list() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);

    assert_eq!(db.count_payers().unwrap(), 2);
    assert!(commands::cmd_payers_list(&db).is_ok());
}

#[test]
fn test_cmd_payers_import_twice_refreshes() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);
    let csv = write_file(&dir, "payers-again.csv", PAYERS);

    commands::cmd_payers_import(&db, &csv).unwrap();
    assert_eq!(db.count_payers().unwrap(), 2);
}

#[test]
fn test_cmd_payers_import_missing_file() {
    let db = setup_test_db();
    assert!(commands::cmd_payers_import(&db, Path::new("/nonexistent/payers.csv")).is_err());
}

#[test]
fn test_cmd_payers_list_empty() {
    let db = setup_test_db();
    assert!(commands::cmd_payers_list(&db).is_ok());
}

#[test]
fn test_cmd_payers_add() {
    let db = setup_test_db();
    let args = NewPayerArgs {
        name: "Mara Lind".into(),
        id: None,
        aliases: vec!["M. Lind".into()],
        organization: None,
        address: Some("12 Vine St".into()),
        city: Some("Templeton".into()),
        state: Some("California".into()),
        zip: Some("93465".into()),
        email: Some(" Mara@Example.com ".into()),
        phone: Some("(805) 555-0142".into()),
    };
    commands::cmd_payers_add(&db, args).unwrap();

    let payers = db.list_payers().unwrap();
    assert_eq!(payers.len(), 1);
    let payer = &payers[0];
    assert_eq!(payer.display_name, "Mara Lind");
    assert!(payer.aliases.iter().any(|a| a == "Mara Lind"));
    assert_eq!(payer.email.as_deref(), Some("mara@example.com"));
    assert_eq!(
        payer.address.as_ref().and_then(|a| a.state.as_deref()),
        Some("CA")
    );
}

// ========== Process Command Tests ==========

#[tokio::test]
async fn test_cmd_process_offline_files() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);
    let files = offline_batch(&dir);

    commands::cmd_process(&db, Settings::default(), &files, options(false))
        .await
        .unwrap();

    let stored = db.list_payments(None).unwrap();
    assert_eq!(stored.len(), 2);

    let matched = db.list_payments(Some(MatchStatus::Matched)).unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(
        matched[0].payment.payer_directory_id.as_deref(),
        Some("C-101")
    );
    assert_eq!(matched[0].payment.check_no_or_ref.as_deref(), Some("004531"));

    let new = db.list_payments(Some(MatchStatus::New)).unwrap();
    assert_eq!(new.len(), 1);
    assert!(!new[0].creation_requested);
}

#[tokio::test]
async fn test_cmd_process_dry_run_stores_nothing() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);
    let files = offline_batch(&dir);
    let out = dir.path().join("ready.json");

    let opts = ProcessOptions {
        out: Some(&out),
        ..options(true)
    };
    commands::cmd_process(&db, Settings::default(), &files, opts)
        .await
        .unwrap();

    assert!(db.list_payments(None).unwrap().is_empty());
    let written = std::fs::read_to_string(&out).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed.as_array().map(|a| a.len()), Some(2));
}

#[tokio::test]
async fn test_cmd_process_create_new_payers() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);
    let files = offline_batch(&dir);

    let opts = ProcessOptions {
        create_new: true,
        ..options(false)
    };
    commands::cmd_process(&db, Settings::default(), &files, opts)
        .await
        .unwrap();

    assert_eq!(db.count_payers().unwrap(), 3);
    let new = db.list_payments(Some(MatchStatus::New)).unwrap();
    assert_eq!(new.len(), 1);
    assert!(new[0].creation_requested);

    // The next run matches the created payer
    commands::cmd_process(&db, Settings::default(), &files, options(false))
        .await
        .unwrap();
    assert_eq!(db.list_payments(Some(MatchStatus::Matched)).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cmd_process_rejects_bad_kind() {
    let dir = TempDir::new().unwrap();
    let db = seeded_db(&dir);
    let files = offline_batch(&dir);

    let opts = ProcessOptions {
        kind: Some("postcard"),
        ..options(false)
    };
    let result = commands::cmd_process(&db, Settings::default(), &files, opts).await;
    assert!(result.is_err());
}

// ========== Payment Command Tests ==========

async fn processed_db(dir: &TempDir) -> Database {
    let db = seeded_db(dir);
    let files = offline_batch(dir);
    commands::cmd_process(&db, Settings::default(), &files, options(false))
        .await
        .unwrap();
    db
}

fn fingerprint_with(db: &Database, status: MatchStatus) -> String {
    db.list_payments(Some(status)).unwrap()[0]
        .payment
        .fingerprint
        .clone()
}

#[tokio::test]
async fn test_cmd_payments_list_and_show() {
    let dir = TempDir::new().unwrap();
    let db = processed_db(&dir).await;

    assert!(commands::cmd_payments_list(&db, None, 50).is_ok());
    assert!(commands::cmd_payments_list(&db, Some("new"), 1).is_ok());
    assert!(commands::cmd_payments_list(&db, Some("bogus"), 50).is_err());

    let fp = fingerprint_with(&db, MatchStatus::Matched);
    assert!(commands::cmd_payments_show(&db, &fp).is_ok());
    assert!(commands::cmd_payments_show(&db, "no-such-payment").is_err());
}

#[test]
fn test_cmd_payments_list_empty() {
    let db = setup_test_db();
    assert!(commands::cmd_payments_list(&db, None, 50).is_ok());
}

#[tokio::test]
async fn test_cmd_payments_export_to_file() {
    let dir = TempDir::new().unwrap();
    let db = processed_db(&dir).await;

    let json_out = dir.path().join("payments.json");
    commands::cmd_payments_export(&db, "json", None, Some(&json_out)).unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json_out).unwrap()).unwrap();
    let rows = parsed.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["schema_version"], 1);

    let csv_out = dir.path().join("matched.csv");
    commands::cmd_payments_export(&db, "csv", Some("matched"), Some(&csv_out)).unwrap();
    let csv = std::fs::read_to_string(&csv_out).unwrap();
    // Header plus the one matched payment
    assert_eq!(csv.lines().count(), 2);
    assert!(csv.contains("C-101"));
}

#[test]
fn test_cmd_payments_export_bad_format() {
    let db = setup_test_db();
    assert!(commands::cmd_payments_export(&db, "xml", None, None).is_err());
}

// ========== Review and Sync Command Tests ==========

#[tokio::test]
async fn test_cmd_review_dismiss_requires_mismatch() {
    let dir = TempDir::new().unwrap();
    let db = processed_db(&dir).await;

    let fp = fingerprint_with(&db, MatchStatus::Matched);
    assert!(commands::cmd_review_dismiss(&db, &fp).is_err());
    assert!(commands::cmd_review_dismiss(&db, "no-such-payment").is_err());
}

#[tokio::test]
async fn test_cmd_review_requested() {
    let dir = TempDir::new().unwrap();
    let db = processed_db(&dir).await;

    let matched = fingerprint_with(&db, MatchStatus::Matched);
    assert!(commands::cmd_review_requested(&db, &matched).is_err());

    let new = fingerprint_with(&db, MatchStatus::New);
    commands::cmd_review_requested(&db, &new).unwrap();
    assert!(db.get_payment(&new).unwrap().unwrap().creation_requested);
}

#[tokio::test]
async fn test_cmd_sync() {
    let dir = TempDir::new().unwrap();
    let db = processed_db(&dir).await;
    let fp = fingerprint_with(&db, MatchStatus::Matched);

    commands::cmd_sync(&db, &fp, "sent").unwrap();
    let stored = db.get_payment(&fp).unwrap().unwrap();
    assert_eq!(stored.payment.sync_status, SyncStatus::Sent);

    assert!(commands::cmd_sync(&db, &fp, "shipped").is_err());
    assert!(commands::cmd_sync(&db, "no-such-payment", "sent").is_err());
}

// ========== Init and Status Command Tests ==========

#[test]
fn test_cmd_init_unencrypted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("remit.db");

    commands::cmd_init(&path, true).unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_cmd_status_uninitialized() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.db");
    assert!(commands::cmd_status(&path, None, true).await.is_ok());
}

#[test]
fn test_load_settings_missing_file() {
    assert!(commands::load_settings(Some(Path::new("/nonexistent/remit.toml"))).is_err());
}
