//! Donor merge use-case.
//!
//! # Responsibility
//! - Fold a duplicate donor into a surviving one: move donations and
//!   sponsorships, leave a forward pointer, archive the duplicate.
//!
//! # Invariants
//! - A merge runs in one immediate transaction.
//! - Merging into a forwarded donor merges into the end of its chain.
//! - A merge never closes a forward-pointer cycle.

use crate::model::ledger::DonorId;
use crate::repo::donor_repo::{DonorRepository, SqliteDonorRepository};
use crate::repo::RepoError;
use crate::service::donor_resolver::{DonorResolver, ResolveError};
use log::info;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result of a completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub duplicate: DonorId,
    /// Donor the duplicate now forwards to.
    pub survivor: DonorId,
    pub donations_moved: usize,
    pub sponsorships_moved: usize,
}

#[derive(Debug)]
pub enum MergeError {
    SelfMerge(DonorId),
    DonorNotFound(DonorId),
    AlreadyMerged { duplicate: DonorId, into: DonorId },
    /// Survivor is archived without forwarding anywhere.
    SurvivorArchived(DonorId),
    WouldCreateCycle { duplicate: DonorId, survivor: DonorId },
    Resolve(ResolveError),
    Repo(RepoError),
}

impl Display for MergeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfMerge(id) => write!(f, "donor {id} cannot be merged into itself"),
            Self::DonorNotFound(id) => write!(f, "donor not found: {id}"),
            Self::AlreadyMerged { duplicate, into } => {
                write!(f, "donor {duplicate} is already merged into {into}")
            }
            Self::SurvivorArchived(id) => write!(f, "survivor donor {id} is archived"),
            Self::WouldCreateCycle {
                duplicate,
                survivor,
            } => write!(
                f,
                "merging {duplicate} into {survivor} would create a forward cycle"
            ),
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resolve(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResolveError> for MergeError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<RepoError> for MergeError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for MergeError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

/// Transactional donor merge service.
pub struct DonorMergeService<'conn> {
    conn: &'conn Connection,
    max_hops: usize,
}

impl<'conn> DonorMergeService<'conn> {
    pub fn new(conn: &'conn Connection, max_hops: usize) -> Self {
        Self { conn, max_hops }
    }

    /// Merges `duplicate` into `survivor`.
    pub fn merge(&self, duplicate: DonorId, survivor: DonorId) -> Result<MergeOutcome, MergeError> {
        if duplicate == survivor {
            return Err(MergeError::SelfMerge(duplicate));
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let repo = SqliteDonorRepository::new(&tx);

        let duplicate_donor = repo
            .get_donor(duplicate)?
            .ok_or(MergeError::DonorNotFound(duplicate))?;
        if let Some(into) = duplicate_donor.merged_into {
            return Err(MergeError::AlreadyMerged { duplicate, into });
        }
        let survivor_donor = repo
            .get_donor(survivor)?
            .ok_or(MergeError::DonorNotFound(survivor))?;

        let resolver = DonorResolver::new(SqliteDonorRepository::new(&tx), self.max_hops);
        let target = resolver.follow_merge_chain(survivor_donor)?;
        if target.uuid == duplicate {
            return Err(MergeError::WouldCreateCycle {
                duplicate,
                survivor,
            });
        }
        if !target.is_active() {
            return Err(MergeError::SurvivorArchived(target.uuid));
        }

        let moved = repo.reassign_donor(duplicate, target.uuid)?;
        repo.mark_merged(duplicate, target.uuid)?;
        tx.commit()?;

        info!(
            "event=donor_merge module=merge status=ok duplicate={} survivor={} donations={} sponsorships={}",
            duplicate, target.uuid, moved.donations, moved.sponsorships
        );
        Ok(MergeOutcome {
            duplicate,
            survivor: target.uuid,
            donations_moved: moved.donations,
            sponsorships_moved: moved.sponsorships,
        })
    }
}
