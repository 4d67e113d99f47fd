//! Source adapters.
//!
//! # Responsibility
//! - Convert transport-specific payment shapes (bulk export rows, push
//!   events) into [`CanonicalRecord`]s for the importer.
//!
//! # Invariants
//! - Adapters never talk to the ledger except through
//!   [`crate::service::importer::PaymentImporter`], with the single
//!   exception of subscription cancellation.

use crate::model::record::{CanonicalRecord, RecordValidationError};

pub mod bulk;
pub mod push;

/// A source-specific payment shape that maps onto one canonical record.
pub trait CanonicalSource {
    /// Builds the canonical record; `now_ms` backs unparsable timestamps.
    fn to_canonical(&self, now_ms: i64) -> Result<CanonicalRecord, RecordValidationError>;
}
