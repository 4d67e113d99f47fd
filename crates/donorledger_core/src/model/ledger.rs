//! Ledger entities: donors, children, projects, sponsorships, donations.
//!
//! # Invariants
//! - A donation on a `sponsorship` project carries a sponsorship reference.
//! - `charge_id` is unique across donations when set.
//! - A donor forward pointer (`merged_into`) never points at itself.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type DonorId = Uuid;
pub type ChildId = Uuid;
pub type ProjectId = Uuid;
pub type SponsorshipId = Uuid;
pub type DonationId = Uuid;

/// Title of the singleton system project for general giving.
pub const GENERAL_PROJECT_TITLE: &str = "General Donation";
/// Title prefix for placeholder projects created from unclassified text.
pub const UNMAPPED_PROJECT_PREFIX: &str = "UNMAPPED: ";

/// Validation errors raised before ledger writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerValidationError {
    /// Amounts are stored in minor units and must be positive.
    NonPositiveAmount(i64),
    /// Child names are identity keys and must not be blank.
    BlankChildName,
    /// Project titles must not be blank.
    BlankProjectTitle,
    /// Sponsorship projects must reference the sponsored child.
    SponsorshipProjectWithoutChild(ProjectId),
    /// A donation to a sponsorship project carries no sponsorship.
    SponsorshipReferenceMissing(DonationId),
    /// A donor cannot forward to itself.
    SelfForwardingDonor(DonorId),
}

impl Display for LedgerValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveAmount(amount) => {
                write!(f, "amount must be positive, got {amount}")
            }
            Self::BlankChildName => write!(f, "child name must not be blank"),
            Self::BlankProjectTitle => write!(f, "project title must not be blank"),
            Self::SponsorshipProjectWithoutChild(id) => {
                write!(f, "sponsorship project {id} has no child")
            }
            Self::SponsorshipReferenceMissing(id) => write!(
                f,
                "donation {id} targets a sponsorship project without a sponsorship"
            ),
            Self::SelfForwardingDonor(id) => write!(f, "donor {id} cannot forward to itself"),
        }
    }
}

impl Error for LedgerValidationError {}

/// A person or organization that gives money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    pub uuid: DonorId,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Surviving donor this record was merged into.
    pub merged_into: Option<DonorId>,
    pub is_deleted: bool,
    /// Epoch ms of the payment record that last supplied identity fields.
    pub updated_at: i64,
}

impl Donor {
    pub fn new(name: Option<String>, email: Option<String>, updated_at: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            email,
            merged_into: None,
            is_deleted: false,
            updated_at,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerValidationError> {
        if self.merged_into == Some(self.uuid) {
            return Err(LedgerValidationError::SelfForwardingDonor(self.uuid));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.merged_into.is_none()
    }
}

/// A sponsored child, identified by exact name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub uuid: ChildId,
    pub name: String,
}

impl Child {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LedgerValidationError> {
        if self.name.trim().is_empty() {
            return Err(LedgerValidationError::BlankChildName);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    General,
    Campaign,
    /// Dedicated to exactly one child.
    Sponsorship,
}

/// A fund a donation is booked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub uuid: ProjectId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ProjectType,
    /// Protected singleton managed by the engine.
    pub is_system: bool,
    pub description: Option<String>,
    /// Set only for sponsorship projects.
    pub child_uuid: Option<ChildId>,
}

impl Project {
    pub fn new(title: impl Into<String>, kind: ProjectType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            title: title.into(),
            kind,
            is_system: false,
            description: None,
            child_uuid: None,
        }
    }

    /// Creates the dedicated sponsorship project for one child.
    pub fn for_child(child: &Child) -> Self {
        let mut project = Self::new(format!("Sponsor {}", child.name), ProjectType::Sponsorship);
        project.child_uuid = Some(child.uuid);
        project
    }

    pub fn validate(&self) -> Result<(), LedgerValidationError> {
        if self.title.trim().is_empty() {
            return Err(LedgerValidationError::BlankProjectTitle);
        }
        if self.kind == ProjectType::Sponsorship && self.child_uuid.is_none() {
            return Err(LedgerValidationError::SponsorshipProjectWithoutChild(
                self.uuid,
            ));
        }
        Ok(())
    }
}

/// Recurring commitment of one donor to one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sponsorship {
    pub uuid: SponsorshipId,
    pub donor_uuid: DonorId,
    pub child_uuid: ChildId,
    pub project_uuid: ProjectId,
    pub monthly_amount_cents: i64,
    pub subscription_id: Option<String>,
    pub started_at: i64,
    /// Set when the backing subscription is cancelled.
    pub ended_at: Option<i64>,
}

impl Sponsorship {
    pub fn validate(&self) -> Result<(), LedgerValidationError> {
        if self.monthly_amount_cents <= 0 {
            return Err(LedgerValidationError::NonPositiveAmount(
                self.monthly_amount_cents,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Succeeded,
    Refunded,
    Failed,
}

/// One booked monetary gift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub uuid: DonationId,
    pub amount_cents: i64,
    /// Unix epoch milliseconds.
    pub donated_at: i64,
    pub donor_uuid: DonorId,
    pub project_uuid: ProjectId,
    pub child_uuid: Option<ChildId>,
    pub sponsorship_uuid: Option<SponsorshipId>,
    pub charge_id: Option<String>,
    pub invoice_id: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: DonationStatus,
}

impl Donation {
    pub fn validate(&self) -> Result<(), LedgerValidationError> {
        if self.amount_cents <= 0 {
            return Err(LedgerValidationError::NonPositiveAmount(self.amount_cents));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Child, Donor, LedgerValidationError, Project, ProjectType};

    #[test]
    fn child_project_is_titled_after_child() {
        let child = Child::new("Sangwan");
        let project = Project::for_child(&child);
        assert_eq!(project.title, "Sponsor Sangwan");
        assert_eq!(project.kind, ProjectType::Sponsorship);
        assert_eq!(project.child_uuid, Some(child.uuid));
        assert!(project.validate().is_ok());
    }

    #[test]
    fn sponsorship_project_requires_child() {
        let project = Project::new("Sponsor nobody", ProjectType::Sponsorship);
        assert_eq!(
            project.validate(),
            Err(LedgerValidationError::SponsorshipProjectWithoutChild(
                project.uuid
            ))
        );
    }

    #[test]
    fn forwarded_donor_is_not_active() {
        let mut donor = Donor::new(None, Some("a@x.com".to_string()), 0);
        assert!(donor.is_active());
        donor.merged_into = Some(uuid::Uuid::new_v4());
        assert!(!donor.is_active());

        donor.merged_into = Some(donor.uuid);
        assert!(donor.validate().is_err());
    }
}
