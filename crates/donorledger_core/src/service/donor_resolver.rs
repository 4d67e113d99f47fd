//! Donor resolver.
//!
//! # Responsibility
//! - Find, create or refresh the donor behind one payment.
//! - Follow merge forward pointers to the surviving donor.
//!
//! # Invariants
//! - Lookup priority: customer id (via prior donations), then email, then create.
//! - No email and no customer id means a new donor; names are never matched.
//! - Forward chains are walked iteratively, bounded by `max_hops`; revisiting
//!   a donor is a fatal data error.
//! - Non-blank incoming values overwrite stored ones only when the record is
//!   newer than the donor's `updated_at`.
//! - An email reached through a forward pointer belongs to the merged
//!   duplicate and never replaces the survivor's stored email.

use crate::model::ledger::{Donor, DonorId};
use crate::model::record::{non_blank, CanonicalRecord};
use crate::repo::donor_repo::DonorRepository;
use crate::repo::RepoError;
use log::{debug, info};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Identity fields a payment carries about its payer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DonorIdentity {
    pub name: Option<String>,
    pub email: Option<String>,
    pub customer_id: Option<String>,
}

impl DonorIdentity {
    pub fn from_record(record: &CanonicalRecord) -> Self {
        Self {
            name: non_blank(record.payer_name.as_deref()),
            email: non_blank(record.payer_email.as_deref()),
            customer_id: non_blank(record.customer_id.as_deref()),
        }
    }
}

/// Resolution outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDonor {
    pub donor: Donor,
    pub created: bool,
}

#[derive(Debug)]
pub enum ResolveError {
    /// A forward chain loops back onto a donor already visited.
    MergeCycle { start: DonorId, repeated: DonorId },
    /// A forward chain is longer than the configured bound.
    MergeChainTooLong { start: DonorId, max_hops: usize },
    /// A forward pointer references a missing donor.
    DanglingForward { donor: DonorId, target: DonorId },
    Repo(RepoError),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MergeCycle { start, repeated } => write!(
                f,
                "donor merge chain starting at {start} loops back to {repeated}"
            ),
            Self::MergeChainTooLong { start, max_hops } => write!(
                f,
                "donor merge chain starting at {start} exceeds {max_hops} hops"
            ),
            Self::DanglingForward { donor, target } => {
                write!(f, "donor {donor} forwards to missing donor {target}")
            }
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ResolveError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Resolves payer identities to ledger donors.
pub struct DonorResolver<R: DonorRepository> {
    repo: R,
    max_hops: usize,
}

impl<R: DonorRepository> DonorResolver<R> {
    pub fn new(repo: R, max_hops: usize) -> Self {
        Self { repo, max_hops }
    }

    /// Resolves `identity` as of `timestamp` (epoch ms of the payment).
    pub fn resolve(
        &self,
        identity: &DonorIdentity,
        timestamp: i64,
    ) -> Result<ResolvedDonor, ResolveError> {
        let Some(found) = self.lookup(identity)? else {
            let donor = Donor::new(identity.name.clone(), identity.email.clone(), timestamp);
            self.repo.create_donor(&donor)?;
            info!(
                "event=donor_resolve module=resolver status=ok outcome=created donor={} has_email={} has_customer={}",
                donor.uuid,
                identity.email.is_some(),
                identity.customer_id.is_some()
            );
            return Ok(ResolvedDonor {
                donor,
                created: true,
            });
        };

        let (donor, hops) = self.walk_merge_chain(found)?;
        let donor = self.apply_identity(donor, identity, timestamp, hops > 0)?;
        debug!(
            "event=donor_resolve module=resolver status=ok outcome=matched donor={}",
            donor.uuid
        );
        Ok(ResolvedDonor {
            donor,
            created: false,
        })
    }

    /// Walks forward pointers from `donor` to the surviving record.
    pub fn follow_merge_chain(&self, donor: Donor) -> Result<Donor, ResolveError> {
        self.walk_merge_chain(donor).map(|(survivor, _)| survivor)
    }

    fn walk_merge_chain(&self, donor: Donor) -> Result<(Donor, usize), ResolveError> {
        let start = donor.uuid;
        let mut visited = HashSet::from([start]);
        let mut current = donor;
        let mut hops = 0usize;

        while let Some(next_id) = current.merged_into {
            if hops >= self.max_hops {
                return Err(ResolveError::MergeChainTooLong {
                    start,
                    max_hops: self.max_hops,
                });
            }
            if !visited.insert(next_id) {
                return Err(ResolveError::MergeCycle {
                    start,
                    repeated: next_id,
                });
            }
            current = self
                .repo
                .get_donor(next_id)?
                .ok_or(ResolveError::DanglingForward {
                    donor: current.uuid,
                    target: next_id,
                })?;
            hops += 1;
        }

        if hops > 0 {
            debug!(
                "event=donor_forward module=resolver status=ok start={} survivor={} hops={}",
                start, current.uuid, hops
            );
        }
        Ok((current, hops))
    }

    fn lookup(&self, identity: &DonorIdentity) -> Result<Option<Donor>, ResolveError> {
        if let Some(customer_id) = identity.customer_id.as_deref() {
            if let Some(donor_id) = self.repo.find_donor_by_customer_id(customer_id)? {
                let donor = self.repo.get_donor(donor_id)?.ok_or(RepoError::NotFound {
                    entity: "donor",
                    id: donor_id,
                })?;
                return Ok(Some(donor));
            }
        }
        if let Some(email) = identity.email.as_deref() {
            return Ok(self.repo.find_donor_by_email(email)?);
        }
        Ok(None)
    }

    fn apply_identity(
        &self,
        mut donor: Donor,
        identity: &DonorIdentity,
        timestamp: i64,
        forwarded: bool,
    ) -> Result<Donor, ResolveError> {
        let is_newer = timestamp > donor.updated_at;
        let mut changed = false;

        if let Some(name) = identity.name.as_deref() {
            let differs = donor.name.as_deref() != Some(name);
            if differs && (is_newer || donor.name.is_none()) {
                donor.name = Some(name.to_string());
                changed = true;
            }
        }
        if let Some(email) = identity.email.as_deref() {
            let differs = !donor
                .email
                .as_deref()
                .is_some_and(|stored| stored.eq_ignore_ascii_case(email));
            let may_overwrite = is_newer && !forwarded;
            if differs && (may_overwrite || donor.email.is_none()) {
                donor.email = Some(email.to_string());
                changed = true;
            }
        }

        if !changed {
            return Ok(donor);
        }
        if is_newer {
            donor.updated_at = timestamp;
        }
        self.repo.update_donor_identity(
            donor.uuid,
            donor.name.as_deref(),
            donor.email.as_deref(),
            donor.updated_at,
        )?;
        info!(
            "event=donor_update module=resolver status=ok donor={} newer={}",
            donor.uuid, is_newer
        );
        Ok(donor)
    }
}
