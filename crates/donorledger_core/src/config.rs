//! Engine configuration loaded from TOML.
//!
//! # Responsibility
//! - Describe import policy, bulk column mapping, push verification and
//!   logging settings in one serde-backed document.
//! - Validate values that would make the engine misbehave silently.
//!
//! # Invariants
//! - Every section has defaults; an empty document is a valid config.
//! - The push signing secret is never printed by `Debug`.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

const DEFAULT_UNMAPPED_LABEL_MAX_CHARS: usize = 100;
const DEFAULT_MERGE_CHAIN_MAX_HOPS: usize = 32;
const DEFAULT_SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "config io error: {msg}"),
            Self::Parse(msg) => write!(f, "config parse error: {msg}"),
            Self::Invalid(msg) => write!(f, "config validation error: {msg}"),
        }
    }
}

impl Error for ConfigError {}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub import: ImportConfig,
    pub bulk: BulkColumns,
    pub push: PushConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.import.unmapped_label_max_chars == 0 {
            return Err(ConfigError::Invalid(
                "import.unmapped_label_max_chars must be at least 1".to_string(),
            ));
        }
        if self.import.merge_chain_max_hops == 0 {
            return Err(ConfigError::Invalid(
                "import.merge_chain_max_hops must be at least 1".to_string(),
            ));
        }
        if self
            .push
            .signing_secret
            .as_deref()
            .is_some_and(|secret| secret.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "push.signing_secret must not be blank when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// How one payment amount is booked when it funds several targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Every target receives the full payment amount.
    #[default]
    FullAmount,
    /// The amount is divided evenly; leftover cents go to the first targets.
    EvenSplit,
}

impl SplitPolicy {
    /// Returns one amount per target, or `None` when the amount cannot cover
    /// every target with at least one minor unit.
    pub fn amounts(self, total_cents: i64, targets: usize) -> Option<Vec<i64>> {
        if total_cents <= 0 || targets == 0 {
            return None;
        }
        match self {
            Self::FullAmount => Some(vec![total_cents; targets]),
            Self::EvenSplit => {
                let count = i64::try_from(targets).ok()?;
                let base = total_cents / count;
                if base == 0 {
                    return None;
                }
                let remainder = total_cents % count;
                Some(
                    (0..count)
                        .map(|index| base + i64::from(index < remainder))
                        .collect(),
                )
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub split_policy: SplitPolicy,
    /// Maximum characters of description kept in an unmapped project title.
    pub unmapped_label_max_chars: usize,
    /// Upper bound on donor forward-pointer hops during resolution.
    pub merge_chain_max_hops: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            split_policy: SplitPolicy::default(),
            unmapped_label_max_chars: DEFAULT_UNMAPPED_LABEL_MAX_CHARS,
            merge_chain_max_hops: DEFAULT_MERGE_CHAIN_MAX_HOPS,
        }
    }
}

/// Header names of the bulk payments export.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulkColumns {
    pub charge_id: String,
    pub amount: String,
    pub occurred_at: String,
    pub description: String,
    pub status: String,
    pub customer_id: String,
    pub payer_email: String,
    pub payer_name: String,
    pub invoice_id: String,
    pub subscription_id: String,
}

impl Default for BulkColumns {
    fn default() -> Self {
        Self {
            charge_id: "id".to_string(),
            amount: "Amount".to_string(),
            occurred_at: "Created (UTC)".to_string(),
            description: "Description".to_string(),
            status: "Status".to_string(),
            customer_id: "Customer ID".to_string(),
            payer_email: "Customer Email".to_string(),
            payer_name: "Customer Name".to_string(),
            invoice_id: "Invoice ID".to_string(),
            subscription_id: "Subscription ID".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub signing_secret: Option<String>,
    /// Accepted clock skew for signed timestamps; `0` disables the check.
    pub tolerance_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        }
    }
}

impl std::fmt::Debug for PushConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConfig")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Falls back to [`crate::default_log_level`] when unset.
    pub level: Option<String>,
    /// Absolute directory for rolling log files; logging stays off when unset.
    pub dir: Option<String>,
}
