//! Core payment reconciliation engine for donorledger.
//! Every ledger invariant is enforced here; front ends only feed records in.

pub mod adapter;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use adapter::bulk::{BulkImportError, BulkImportSummary, BulkImporter, RowFailure};
pub use adapter::push::{sign_payload, verify_signature, PushError, PushHandler, PushOutcome};
pub use adapter::CanonicalSource;
pub use config::{ConfigError, EngineConfig, SplitPolicy};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::intent::Intent;
pub use model::ledger::{
    Child, Donation, DonationStatus, Donor, LedgerValidationError, Project, ProjectType,
    Sponsorship,
};
pub use model::record::{CanonicalRecord, RecordValidationError};
pub use repo::{RepoError, RepoResult};
pub use service::classifier::DescriptionClassifier;
pub use service::donor_merge::{DonorMergeService, MergeError, MergeOutcome};
pub use service::importer::{FailureKind, ImportResult, PaymentImporter, SkipReason};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
