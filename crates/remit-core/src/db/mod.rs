//! Local SQLite store with connection pooling and migrations
//!
//! Two collaborators of the pipeline live here:
//! - `payers` - the payer directory (`DirectoryLookup`)
//! - `reviews` - stored canonical payments and the review ledger (`ReviewLedger`)

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod payers;
mod reviews;

pub use reviews::StoredPayment;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "REMIT_DB_KEY";

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Changing this invalidates every existing encrypted database
    const APP_SALT: &[u8; 16] = b"remit-salt-v1-ok";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open an encrypted database
    ///
    /// Requires `REMIT_DB_KEY`. Payer addresses and contact details are
    /// personal data, so the store is encrypted with SQLCipher using a key
    /// derived from the passphrase. Use `new_unencrypted()` for development.
    pub fn new(path: &str) -> Result<Self> {
        match std::env::var(DB_KEY_ENV).ok() {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Open an unencrypted database (development and tests)
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Open a database with an explicit encryption passphrase
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);

        let pool = if let Some(pass) = passphrase {
            let key = derive_key(pass)?;
            let key_pragma = format!("PRAGMA key = 'x\"{}\"';", key);

            // Every pooled connection needs the key before its first statement
            let manager = manager.with_init(move |conn| {
                conn.execute_batch(&key_pragma)?;
                Ok(())
            });

            Pool::builder().max_size(10).build(manager)?
        } else {
            Pool::builder().max_size(10).build(manager)?
        };

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` because every pooled
    /// connection to `:memory:` would see its own empty database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "remit_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Check if the database is encrypted
    pub fn is_encrypted(&self) -> Result<bool> {
        let conn = self.conn()?;
        // SQLCipher answers cipher_version even for plaintext files, so the key must be set too
        let result: rusqlite::Result<String> =
            conn.query_row("PRAGMA cipher_version;", [], |row| row.get(0));
        Ok(result.is_ok() && std::env::var(DB_KEY_ENV).is_ok())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- WAL: readers don't block writers; creates -wal and -shm sidecar files
            PRAGMA journal_mode = WAL;
            PRAGMA cache_size = 2000;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Payer directory
            CREATE TABLE IF NOT EXISTS payers (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,                  -- directory id handed to the pipeline
                display_name TEXT NOT NULL,
                organization_name TEXT,
                address_line1 TEXT,
                city TEXT,
                state TEXT,                               -- two-letter code
                zip TEXT,                                 -- five characters
                email TEXT,
                phone TEXT,                               -- ten digits
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS payer_aliases (
                payer_id TEXT NOT NULL REFERENCES payers(id) ON DELETE CASCADE,
                alias TEXT NOT NULL,
                PRIMARY KEY (payer_id, alias)
            );

            -- Name tokens of display name, aliases and organization for candidate lookup
            CREATE TABLE IF NOT EXISTS payer_tokens (
                payer_id TEXT NOT NULL REFERENCES payers(id) ON DELETE CASCADE,
                token TEXT NOT NULL,
                PRIMARY KEY (payer_id, token)
            );

            CREATE INDEX IF NOT EXISTS idx_payer_tokens_token ON payer_tokens(token);

            -- Ready canonical payments, one row per fingerprint
            CREATE TABLE IF NOT EXISTS canonical_payments (
                fingerprint TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                match_status TEXT NOT NULL,
                payer_directory_id TEXT,
                payment_date DATE NOT NULL,
                amount TEXT NOT NULL,                     -- decimal as text, never REAL
                data TEXT NOT NULL,                       -- JSON of the full CanonicalPayment
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_canonical_payments_status ON canonical_payments(match_status);
            CREATE INDEX IF NOT EXISTS idx_canonical_payments_date ON canonical_payments(payment_date);

            -- Review ledger: human decisions and sync state, never written by the pipeline
            CREATE TABLE IF NOT EXISTS payment_reviews (
                fingerprint TEXT PRIMARY KEY,
                address_mismatch_dismissed BOOLEAN NOT NULL DEFAULT 0,
                creation_requested BOOLEAN NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        info!(path = %self.db_path, "Database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_db() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.count_payers().unwrap(), 0);
        assert!(db.list_payments(None).unwrap().is_empty());
    }

    #[test]
    fn test_schema_tables_exist() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('payers', 'payer_aliases', 'payer_tokens', 'canonical_payments', 'payment_reviews')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::in_memory().unwrap();
        let reopened = Database::new_unencrypted(db.path()).unwrap();
        assert_eq!(reopened.count_payers().unwrap(), 0);
    }

    #[test]
    fn test_derive_key_is_stable() {
        let a = derive_key("correct horse").unwrap();
        let b = derive_key("correct horse").unwrap();
        let c = derive_key("battery staple").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_new_requires_key() {
        if std::env::var(DB_KEY_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remit.db");
        let err = Database::new(path.to_str().unwrap()).err().unwrap();
        assert!(matches!(err, Error::Encryption(_)));
    }
}
