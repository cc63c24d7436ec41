//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Core commands (init) and shared utilities (open_db, load_settings)
//! - `payers` - Payer directory commands (list, add, import)
//! - `process` - Run a batch of documents through the pipeline
//! - `payments` - Stored payments, review decisions and sync status
//! - `status` - Database, settings and backend status

pub mod core;
pub mod payers;
pub mod payments;
pub mod process;
pub mod status;

// Re-export command functions for main.rs
pub use core::*;
pub use payers::*;
pub use payments::*;
pub use process::*;
pub use status::*;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
