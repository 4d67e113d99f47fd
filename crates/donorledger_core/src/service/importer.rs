//! Payment record importer.
//!
//! # Responsibility
//! - Reconcile one canonical record into the ledger: idempotency check,
//!   donor resolution, classification, target materialization and donation
//!   creation inside one atomic transaction.
//! - Convert every failure into a structured [`ImportResult`].
//!
//! # Invariants
//! - A record whose status is not `succeeded` causes no writes.
//! - At most one import per charge id commits; a lost race is a skip.
//! - Split donations share one invoice id; the first carries the payment's
//!   charge id and the rest carry `<charge_id>:<line>`.
//! - Nothing past `import` panics or returns `Err`.

use crate::config::{ImportConfig, SplitPolicy};
use crate::logging::log_field;
use crate::model::ledger::{Donation, DonationStatus};
use crate::model::record::{
    non_blank, CanonicalRecord, RecordValidationError, CHARGE_LINE_SEPARATOR,
};
use crate::repo::donor_repo::SqliteDonorRepository;
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::RepoError;
use crate::service::classifier::DescriptionClassifier;
use crate::service::donor_resolver::{DonorIdentity, DonorResolver, ResolveError};
use crate::service::materializer::{EntityMaterializer, MaterializeError, PaymentContext};
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

/// Why a record was deliberately not imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotSucceeded,
    AlreadyImported,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSucceeded => "not_succeeded",
            Self::AlreadyImported => "already_imported",
        }
    }
}

/// Failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad input or a violated ledger invariant; fixing the record helps.
    Validation,
    /// Stored ledger state is inconsistent (e.g. a donor merge cycle).
    DataIntegrity,
    /// Storage or other unexpected failure.
    System,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::DataIntegrity => "data_integrity",
            Self::System => "system",
        }
    }
}

/// Structured outcome of one import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportResult {
    Imported {
        donations: Vec<Donation>,
        donor_created: bool,
        intent: &'static str,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl ImportResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Imported { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn donations(&self) -> &[Donation] {
        match self {
            Self::Imported { donations, .. } => donations,
            _ => &[],
        }
    }
}

#[derive(Debug)]
pub enum ImportError {
    Validation(RecordValidationError),
    /// The split policy cannot give every target a positive amount.
    AmountNotSplittable { amount_cents: i64, targets: usize },
    Resolve(ResolveError),
    Materialize(MaterializeError),
    Repo(RepoError),
}

impl ImportError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::AmountNotSplittable { .. } => FailureKind::Validation,
            Self::Resolve(ResolveError::Repo(err)) | Self::Repo(err) => repo_failure_kind(err),
            Self::Resolve(_) => FailureKind::DataIntegrity,
            Self::Materialize(MaterializeError::Repo(err)) => repo_failure_kind(err),
            Self::Materialize(_) => FailureKind::Validation,
        }
    }

    fn is_duplicate_charge(&self) -> bool {
        matches!(self, Self::Repo(err) if err.is_duplicate_charge())
    }
}

fn repo_failure_kind(err: &RepoError) -> FailureKind {
    match err {
        RepoError::Validation(_) => FailureKind::Validation,
        RepoError::InvalidData(_) => FailureKind::DataIntegrity,
        RepoError::Db(_) | RepoError::NotFound { .. } => FailureKind::System,
    }
}

impl Display for ImportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::AmountNotSplittable {
                amount_cents,
                targets,
            } => write!(
                f,
                "amount {amount_cents} cannot be split across {targets} targets"
            ),
            Self::Resolve(err) => write!(f, "donor resolution failed: {err}"),
            Self::Materialize(err) => write!(f, "entity materialization failed: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ImportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::AmountNotSplittable { .. } => None,
            Self::Resolve(err) => Some(err),
            Self::Materialize(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<RecordValidationError> for ImportError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<ResolveError> for ImportError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<MaterializeError> for ImportError {
    fn from(value: MaterializeError) -> Self {
        Self::Materialize(value)
    }
}

impl From<RepoError> for ImportError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

enum Committed {
    Imported {
        donations: Vec<Donation>,
        donor_created: bool,
        intent: &'static str,
    },
    AlreadyImported,
}

/// Reconciles canonical records into the ledger, one transaction each.
pub struct PaymentImporter<'conn> {
    conn: &'conn Connection,
    classifier: DescriptionClassifier,
    split_policy: SplitPolicy,
    merge_chain_max_hops: usize,
}

impl<'conn> PaymentImporter<'conn> {
    pub fn new(conn: &'conn Connection, config: &ImportConfig) -> Self {
        Self {
            conn,
            classifier: DescriptionClassifier::new(config.unmapped_label_max_chars),
            split_policy: config.split_policy,
            merge_chain_max_hops: config.merge_chain_max_hops,
        }
    }

    /// Imports one record. Never fails; inspect the returned result.
    pub fn import(&self, record: &CanonicalRecord) -> ImportResult {
        let started_at = Instant::now();
        let charge_id = record.charge_id.trim();

        if !record.is_succeeded() {
            return skipped(SkipReason::NotSucceeded, charge_id);
        }
        if let Err(err) = record.validate() {
            warn!(
                "event=payment_import module=importer status=error kind=validation charge_id={} error={}",
                charge_id,
                log_field(&err)
            );
            return failed(ImportError::Validation(err));
        }

        match SqliteLedgerRepository::new(self.conn).charge_exists(charge_id) {
            Ok(true) => return skipped(SkipReason::AlreadyImported, charge_id),
            Ok(false) => {}
            Err(err) => return self.report_failure(charge_id, ImportError::Repo(err)),
        }

        match self.import_atomically(record, charge_id) {
            Ok(Committed::Imported {
                donations,
                donor_created,
                intent,
            }) => {
                info!(
                    "event=payment_import module=importer status=ok charge_id={} intent={} donations={} donor_created={} duration_ms={}",
                    charge_id,
                    intent,
                    donations.len(),
                    donor_created,
                    started_at.elapsed().as_millis()
                );
                ImportResult::Imported {
                    donations,
                    donor_created,
                    intent,
                }
            }
            Ok(Committed::AlreadyImported) => skipped(SkipReason::AlreadyImported, charge_id),
            Err(err) if err.is_duplicate_charge() => {
                skipped(SkipReason::AlreadyImported, charge_id)
            }
            Err(err) => self.report_failure(charge_id, err),
        }
    }

    fn import_atomically(
        &self,
        record: &CanonicalRecord,
        charge_id: &str,
    ) -> Result<Committed, ImportError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let ledger = SqliteLedgerRepository::new(&tx);

        // Another importer may have committed this charge since the first check.
        if ledger.charge_exists(charge_id)? {
            return Ok(Committed::AlreadyImported);
        }

        let resolver = DonorResolver::new(
            SqliteDonorRepository::new(&tx),
            self.merge_chain_max_hops,
        );
        let resolved =
            resolver.resolve(&DonorIdentity::from_record(record), record.occurred_at)?;

        let intent = self
            .classifier
            .classify(record.description_text.as_deref().unwrap_or(""));
        debug!(
            "event=payment_classify module=importer status=ok charge_id={} intent={} targets={}",
            charge_id,
            intent.kind_name(),
            intent.target_count()
        );
        let amounts = self
            .split_policy
            .amounts(record.amount_cents, intent.target_count())
            .ok_or(ImportError::AmountNotSplittable {
                amount_cents: record.amount_cents,
                targets: intent.target_count(),
            })?;

        let subscription_id = non_blank(record.subscription_id.as_deref());
        let materializer = EntityMaterializer::new(SqliteLedgerRepository::new(&tx));
        let targets = materializer.materialize(
            &intent,
            &PaymentContext {
                donor: resolved.donor.uuid,
                amounts,
                subscription_id: subscription_id.clone(),
                occurred_at: record.occurred_at,
            },
        )?;

        let invoice_id = non_blank(record.invoice_id.as_deref())
            .or_else(|| (targets.len() > 1).then(|| charge_id.to_string()));
        let customer_id = non_blank(record.customer_id.as_deref());

        let mut donations = Vec::with_capacity(targets.len());
        for (index, target) in targets.into_iter().enumerate() {
            let donation = Donation {
                uuid: Uuid::new_v4(),
                amount_cents: target.amount_cents,
                donated_at: record.occurred_at,
                donor_uuid: resolved.donor.uuid,
                project_uuid: target.project.uuid,
                child_uuid: target.child.as_ref().map(|child| child.uuid),
                sponsorship_uuid: target.sponsorship.as_ref().map(|item| item.uuid),
                charge_id: Some(line_charge_id(charge_id, index)),
                invoice_id: invoice_id.clone(),
                customer_id: customer_id.clone(),
                subscription_id: subscription_id.clone(),
                status: DonationStatus::Succeeded,
            };
            ledger.create_donation(&donation)?;
            donations.push(donation);
        }

        tx.commit()?;
        Ok(Committed::Imported {
            donations,
            donor_created: resolved.created,
            intent: intent.kind_name(),
        })
    }

    fn report_failure(&self, charge_id: &str, err: ImportError) -> ImportResult {
        match err.failure_kind() {
            FailureKind::Validation => warn!(
                "event=payment_import module=importer status=error kind=validation charge_id={} error={}",
                charge_id,
                log_field(&err)
            ),
            kind => error!(
                "event=payment_import module=importer status=error kind={} charge_id={} error={}",
                kind.as_str(),
                charge_id,
                log_field(&err)
            ),
        }
        failed(err)
    }
}

/// Charge id stored on the `index`-th donation of one payment.
pub fn line_charge_id(charge_id: &str, index: usize) -> String {
    if index == 0 {
        charge_id.to_string()
    } else {
        format!("{charge_id}{CHARGE_LINE_SEPARATOR}{}", index + 1)
    }
}

fn skipped(reason: SkipReason, charge_id: &str) -> ImportResult {
    info!(
        "event=payment_import module=importer status=skip reason={} charge_id={}",
        reason.as_str(),
        charge_id
    );
    ImportResult::Skipped { reason }
}

fn failed(err: ImportError) -> ImportResult {
    ImportResult::Failed {
        kind: err.failure_kind(),
        message: err.to_string(),
    }
}
