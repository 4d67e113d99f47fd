//! Canonical payment record shared by every source adapter.
//!
//! # Responsibility
//! - Carry one payment event independent of its transport.
//! - Normalize optional text fields and timestamps at the adapter boundary.
//!
//! # Invariants
//! - Optional text fields are `None` rather than blank.
//! - `occurred_at` is always set; unparsable source values fall back to now.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Only records with this status are imported.
pub const STATUS_SUCCEEDED: &str = "succeeded";

/// Separates a charge id from the line number of a split donation.
pub const CHARGE_LINE_SEPARATOR: char = ':';

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Record-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    MissingField(&'static str),
    NonPositiveAmount(i64),
    InvalidAmount(String),
    /// The charge id contains the split-line separator.
    ReservedChargeId(String),
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field `{field}`"),
            Self::NonPositiveAmount(amount) => {
                write!(f, "amount_cents must be positive, got {amount}")
            }
            Self::InvalidAmount(value) => write!(f, "invalid amount `{value}`"),
            Self::ReservedChargeId(value) => write!(
                f,
                "charge id `{value}` must not contain `{CHARGE_LINE_SEPARATOR}`"
            ),
        }
    }
}

impl Error for RecordValidationError {}

/// Source-agnostic payment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub amount_cents: i64,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    /// Unix epoch milliseconds.
    pub occurred_at: i64,
    pub description_text: Option<String>,
    pub charge_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub transaction_status: String,
}

impl CanonicalRecord {
    /// Creates a succeeded record with only the required fields set.
    pub fn new(charge_id: impl Into<String>, amount_cents: i64, occurred_at: i64) -> Self {
        Self {
            amount_cents,
            payer_name: None,
            payer_email: None,
            occurred_at,
            description_text: None,
            charge_id: charge_id.into(),
            customer_id: None,
            subscription_id: None,
            invoice_id: None,
            transaction_status: STATUS_SUCCEEDED.to_string(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.transaction_status
            .trim()
            .eq_ignore_ascii_case(STATUS_SUCCEEDED)
    }

    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.charge_id.trim().is_empty() {
            return Err(RecordValidationError::MissingField("charge_id"));
        }
        if self.charge_id.contains(CHARGE_LINE_SEPARATOR) {
            return Err(RecordValidationError::ReservedChargeId(
                self.charge_id.clone(),
            ));
        }
        if self.amount_cents <= 0 {
            return Err(RecordValidationError::NonPositiveAmount(self.amount_cents));
        }
        Ok(())
    }
}

/// Trims `value` and maps blank input to `None`.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Parses a source timestamp into epoch milliseconds, falling back to `now_ms`.
///
/// Accepts RFC 3339, naive UTC date-times, bare dates and integer epoch seconds.
pub fn parse_occurred_at(value: Option<&str>, now_ms: i64) -> i64 {
    let Some(text) = value.map(str::trim).filter(|text| !text.is_empty()) else {
        return now_ms;
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return parsed.timestamp_millis();
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return parsed.and_utc().timestamp_millis();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return midnight.and_utc().timestamp_millis();
        }
    }
    if let Ok(epoch_secs) = text.parse::<i64>() {
        if let Some(parsed) = DateTime::<Utc>::from_timestamp(epoch_secs, 0) {
            return parsed.timestamp_millis();
        }
    }

    now_ms
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}
