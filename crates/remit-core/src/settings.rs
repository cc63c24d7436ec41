//! Pipeline settings
//!
//! Settings are loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/remit/config/remit.toml)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Keys missing from the file keep their built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::matcher::{AddressComparison, MatchConfig};
use crate::merge::MergeConfig;

/// Embedded default settings (compiled into binary)
const DEFAULT_SETTINGS: &str = include_str!("../../../config/remit.toml");

/// Extraction collaborator settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    pub model: String,
    pub vision_model: String,
    pub timeout: Duration,
    /// Documents in flight at once
    pub concurrency: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            model: "gemma3".to_string(),
            vision_model: "llama3.2-vision".to_string(),
            timeout: Duration::from_secs(120),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub extraction: ExtractionSettings,
    pub merge: MergeConfig,
    pub matching: MatchConfig,
    /// File the settings came from, if not the embedded defaults
    pub source: Option<PathBuf>,
}

impl Settings {
    /// Load from the default override location, falling back to embedded defaults
    pub fn load() -> Result<Self> {
        match default_settings_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Self::embedded(),
        }
    }

    /// Load from an explicit file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::InvalidData(format!("Failed to read settings: {}", e)))?;
        let mut settings = parse_settings(&content)?;
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn embedded() -> Result<Self> {
        parse_settings(DEFAULT_SETTINGS)
    }
}

/// Default settings override path
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("remit").join("config").join("remit.toml"))
}

/// Raw settings structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawSettings {
    extraction: Option<RawExtraction>,
    merge: Option<RawMerge>,
    matching: Option<RawMatching>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    model: Option<String>,
    vision_model: Option<String>,
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawMerge {
    amount_epsilon: Option<String>,
    date_tolerance_days: Option<i64>,
    memo_separator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMatching {
    accept_threshold: Option<f64>,
    dominance_margin: Option<f64>,
    org_fuzzy_threshold: Option<f64>,
    address: Option<RawAddressComparison>,
}

#[derive(Debug, Deserialize)]
struct RawAddressComparison {
    mode: Option<String>,
    max_normalized: Option<f64>,
}

/// Parse settings from TOML content
pub fn parse_settings(content: &str) -> Result<Settings> {
    let raw: RawSettings = toml::from_str(content)
        .map_err(|e| Error::InvalidData(format!("Invalid settings TOML: {}", e)))?;

    let mut settings = Settings::default();

    if let Some(extraction) = raw.extraction {
        if let Some(model) = extraction.model {
            settings.extraction.model = model;
        }
        if let Some(model) = extraction.vision_model {
            settings.extraction.vision_model = model;
        }
        if let Some(secs) = extraction.timeout_secs {
            settings.extraction.timeout = Duration::from_secs(secs);
        }
        if let Some(concurrency) = extraction.concurrency {
            settings.extraction.concurrency = concurrency.max(1);
        }
    }

    if let Some(merge) = raw.merge {
        if let Some(epsilon) = merge.amount_epsilon {
            let value = Decimal::from_str(epsilon.trim()).map_err(|e| {
                Error::InvalidData(format!("Invalid merge.amount_epsilon '{}': {}", epsilon, e))
            })?;
            if value.is_sign_negative() {
                return Err(Error::InvalidData(
                    "merge.amount_epsilon must not be negative".into(),
                ));
            }
            settings.merge.amount_epsilon = value;
        }
        if let Some(days) = merge.date_tolerance_days {
            settings.merge.date_tolerance_days = days.max(0);
        }
        if let Some(separator) = merge.memo_separator {
            settings.merge.memo_separator = separator;
        }
    }

    if let Some(matching) = raw.matching {
        if let Some(threshold) = matching.accept_threshold {
            settings.matching.accept_threshold = unit_interval("accept_threshold", threshold)?;
        }
        if let Some(margin) = matching.dominance_margin {
            settings.matching.dominance_margin = unit_interval("dominance_margin", margin)?;
        }
        if let Some(threshold) = matching.org_fuzzy_threshold {
            settings.matching.org_fuzzy_threshold =
                unit_interval("org_fuzzy_threshold", threshold)?;
        }
        if let Some(address) = matching.address {
            settings.matching.address_comparison =
                parse_address_comparison(address, settings.matching.address_comparison)?;
        }
    }

    Ok(settings)
}

fn unit_interval(name: &str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::InvalidData(format!(
            "matching.{} must be between 0 and 1, got {}",
            name, value
        )))
    }
}

fn parse_address_comparison(
    raw: RawAddressComparison,
    current: AddressComparison,
) -> Result<AddressComparison> {
    let current_max = match current {
        AddressComparison::EditDistance { max_normalized } => max_normalized,
        AddressComparison::Exact => 0.15,
    };
    let max_normalized = match raw.max_normalized {
        Some(value) => unit_interval("address.max_normalized", value)?,
        None => current_max,
    };

    match raw.mode.as_deref().map(str::trim) {
        None => Ok(match current {
            AddressComparison::Exact => AddressComparison::Exact,
            AddressComparison::EditDistance { .. } => {
                AddressComparison::EditDistance { max_normalized }
            }
        }),
        Some("exact") => Ok(AddressComparison::Exact),
        Some("edit_distance") | Some("edit-distance") => {
            Ok(AddressComparison::EditDistance { max_normalized })
        }
        Some(other) => Err(Error::InvalidData(format!(
            "Unknown matching.address.mode '{}' (expected exact or edit_distance)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_settings_match_defaults() {
        let settings = Settings::embedded().unwrap();
        let defaults = Settings::default();
        assert_eq!(settings.merge, defaults.merge);
        assert_eq!(settings.matching, defaults.matching);
        assert_eq!(settings.extraction.vision_model, "llama3.2-vision");
        assert!(settings.source.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let settings = parse_settings("[merge]\namount_epsilon = \"0.05\"\n").unwrap();
        assert_eq!(settings.merge.amount_epsilon, Decimal::new(5, 2));
        assert_eq!(settings.merge.memo_separator, " | ");
        assert_eq!(settings.matching, MatchConfig::default());
    }

    #[test]
    fn test_exact_address_mode() {
        let settings = parse_settings("[matching.address]\nmode = \"exact\"\n").unwrap();
        assert_eq!(settings.matching.address_comparison, AddressComparison::Exact);
    }

    #[test]
    fn test_edit_distance_threshold_override() {
        let settings = parse_settings("[matching.address]\nmax_normalized = 0.3\n").unwrap();
        assert_eq!(
            settings.matching.address_comparison,
            AddressComparison::EditDistance { max_normalized: 0.3 }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(parse_settings("[matching]\naccept_threshold = 1.5\n").is_err());
        assert!(parse_settings("[merge]\namount_epsilon = \"abc\"\n").is_err());
        assert!(parse_settings("[matching.address]\nmode = \"fuzzy\"\n").is_err());
    }

    #[test]
    fn test_from_file_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remit.toml");
        std::fs::write(&path, "[extraction]\nconcurrency = 0\n").unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.extraction.concurrency, 1);
        assert_eq!(settings.source.as_deref(), Some(path.as_path()));
    }
}
