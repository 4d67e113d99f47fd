//! Bulk CSV import adapter.
//!
//! # Responsibility
//! - Read a payments export with named columns, one row per payment.
//! - Feed every row through the importer and tally the outcomes.
//!
//! # Invariants
//! - A failing row never aborts the file; it becomes a `RowFailure`.
//! - Rows are imported sequentially, each in its own transaction.
//! - Row numbers are 1-based file lines, the header being line 1.

use super::CanonicalSource;
use crate::config::BulkColumns;
use crate::logging::log_field;
use crate::model::record::{
    non_blank, now_epoch_ms, parse_occurred_at, CanonicalRecord, RecordValidationError,
    STATUS_SUCCEEDED,
};
use crate::service::importer::{ImportResult, PaymentImporter};
use log::{info, warn};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Read;
use std::path::Path;
use std::time::Instant;

/// File-level failure that prevents reading any row.
#[derive(Debug)]
pub enum BulkImportError {
    Io(String),
    Csv(String),
    MissingColumn(String),
}

impl Display for BulkImportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Csv(msg) => write!(f, "CSV error: {msg}"),
            Self::MissingColumn(column) => write!(f, "missing required column '{column}'"),
        }
    }
}

impl Error for BulkImportError {}

/// One failed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_number: u64,
    pub charge_id: Option<String>,
    pub message: String,
}

/// Aggregate outcome of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkImportSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub donations_created: usize,
    pub failures: Vec<RowFailure>,
}

impl BulkImportSummary {
    fn record(&mut self, row_number: u64, charge_id: Option<String>, result: &ImportResult) {
        match result {
            ImportResult::Imported { donations, .. } => {
                self.succeeded += 1;
                self.donations_created += donations.len();
            }
            ImportResult::Skipped { .. } => self.skipped += 1,
            ImportResult::Failed { message, .. } => {
                self.fail(row_number, charge_id, message.clone());
            }
        }
    }

    fn fail(&mut self, row_number: u64, charge_id: Option<String>, message: String) {
        self.failed += 1;
        self.failures.push(RowFailure {
            row_number,
            charge_id,
            message,
        });
    }
}

/// Raw text values of one export row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkRow {
    pub charge_id: Option<String>,
    pub amount: Option<String>,
    pub occurred_at: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_id: Option<String>,
}

impl CanonicalSource for BulkRow {
    fn to_canonical(&self, now_ms: i64) -> Result<CanonicalRecord, RecordValidationError> {
        let charge_id = non_blank(self.charge_id.as_deref())
            .ok_or(RecordValidationError::MissingField("charge_id"))?;
        let amount = non_blank(self.amount.as_deref())
            .ok_or(RecordValidationError::MissingField("amount"))?;
        let status = non_blank(self.status.as_deref())
            .ok_or(RecordValidationError::MissingField("status"))?;

        Ok(CanonicalRecord {
            amount_cents: parse_amount_cents(&amount)?,
            payer_name: non_blank(self.payer_name.as_deref()),
            payer_email: non_blank(self.payer_email.as_deref()),
            occurred_at: parse_occurred_at(self.occurred_at.as_deref(), now_ms),
            description_text: non_blank(self.description.as_deref()),
            charge_id,
            customer_id: non_blank(self.customer_id.as_deref()),
            subscription_id: non_blank(self.subscription_id.as_deref()),
            invoice_id: non_blank(self.invoice_id.as_deref()),
            transaction_status: normalize_status(&status),
        })
    }
}

struct ColumnIndexes {
    charge_id: usize,
    amount: usize,
    status: usize,
    occurred_at: Option<usize>,
    description: Option<usize>,
    customer_id: Option<usize>,
    payer_email: Option<usize>,
    payer_name: Option<usize>,
    invoice_id: Option<usize>,
    subscription_id: Option<usize>,
}

impl ColumnIndexes {
    fn resolve(headers: &csv::StringRecord, columns: &BulkColumns) -> Result<Self, BulkImportError> {
        let find = |name: &str| headers.iter().position(|header| header == name);
        let require =
            |name: &str| find(name).ok_or_else(|| BulkImportError::MissingColumn(name.to_string()));

        Ok(Self {
            charge_id: require(&columns.charge_id)?,
            amount: require(&columns.amount)?,
            status: require(&columns.status)?,
            occurred_at: find(&columns.occurred_at),
            description: find(&columns.description),
            customer_id: find(&columns.customer_id),
            payer_email: find(&columns.payer_email),
            payer_name: find(&columns.payer_name),
            invoice_id: find(&columns.invoice_id),
            subscription_id: find(&columns.subscription_id),
        })
    }

    fn extract(&self, record: &csv::StringRecord) -> BulkRow {
        let cell = |index: Option<usize>| index.and_then(|i| record.get(i)).map(str::to_string);
        BulkRow {
            charge_id: cell(Some(self.charge_id)),
            amount: cell(Some(self.amount)),
            status: cell(Some(self.status)),
            occurred_at: cell(self.occurred_at),
            description: cell(self.description),
            customer_id: cell(self.customer_id),
            payer_email: cell(self.payer_email),
            payer_name: cell(self.payer_name),
            invoice_id: cell(self.invoice_id),
            subscription_id: cell(self.subscription_id),
        }
    }
}

/// Imports whole payment export files.
pub struct BulkImporter<'a> {
    importer: &'a PaymentImporter<'a>,
    columns: &'a BulkColumns,
}

impl<'a> BulkImporter<'a> {
    pub fn new(importer: &'a PaymentImporter<'a>, columns: &'a BulkColumns) -> Self {
        Self { importer, columns }
    }

    pub fn import_path(&self, path: impl AsRef<Path>) -> Result<BulkImportSummary, BulkImportError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|err| BulkImportError::Io(format!("{}: {err}", path.display())))?;
        self.import_reader(file)
    }

    /// Imports every row of `reader`; only unreadable headers abort.
    pub fn import_reader<R: Read>(&self, reader: R) -> Result<BulkImportSummary, BulkImportError> {
        let started_at = Instant::now();
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|err| BulkImportError::Csv(err.to_string()))?
            .clone();
        let indexes = ColumnIndexes::resolve(&headers, self.columns)?;

        let mut summary = BulkImportSummary::default();
        for (index, row) in csv_reader.records().enumerate() {
            let fallback_line = index as u64 + 2;
            let record = match row {
                Ok(record) => record,
                Err(err) => {
                    let line = err.position().map_or(fallback_line, |pos| pos.line());
                    warn!(
                        "event=bulk_row module=bulk status=error row={} error_code=csv_parse",
                        line
                    );
                    summary.fail(line, None, format!("unreadable row: {err}"));
                    continue;
                }
            };
            let row_number = record.position().map_or(fallback_line, |pos| pos.line());

            let row = indexes.extract(&record);
            let charge_id = non_blank(row.charge_id.as_deref());
            match row.to_canonical(now_epoch_ms()) {
                Ok(canonical) => {
                    let result = self.importer.import(&canonical);
                    summary.record(row_number, charge_id, &result);
                }
                Err(err) => {
                    warn!(
                        "event=bulk_row module=bulk status=error row={} error_code=invalid_row error={}",
                        row_number,
                        log_field(&err)
                    );
                    summary.fail(row_number, charge_id, err.to_string());
                }
            }
        }

        info!(
            "event=bulk_import module=bulk status=ok succeeded={} skipped={} failed={} donations={} duration_ms={}",
            summary.succeeded,
            summary.skipped,
            summary.failed,
            summary.donations_created,
            started_at.elapsed().as_millis()
        );
        Ok(summary)
    }
}

/// Converts a decimal major-unit amount (`"1,234.50"`, `"$100"`) to minor units.
pub fn parse_amount_cents(text: &str) -> Result<i64, RecordValidationError> {
    let invalid = || RecordValidationError::InvalidAmount(text.to_string());

    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | ' '))
        .collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };

    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > 2 || !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction_value: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };

    let cents = whole_value
        .checked_mul(100)
        .and_then(|value| value.checked_add(fraction_value))
        .ok_or_else(invalid)?;
    Ok(if negative { -cents } else { cents })
}

/// Maps export status labels onto canonical transaction statuses.
pub fn normalize_status(text: &str) -> String {
    let lowered = text.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "paid" | "succeeded" | "success" => STATUS_SUCCEEDED.to_string(),
        _ => lowered,
    }
}
