//! Entity materializer.
//!
//! # Responsibility
//! - Turn one classified intent into the child/project/sponsorship targets
//!   a payment is booked against, creating missing records on the way.
//!
//! # Invariants
//! - Children are reused by exact name.
//! - A child has at most one sponsorship project; it is reused across
//!   donors and payments.
//! - An active sponsorship for (donor, child) is reused and its monthly
//!   amount is never overwritten.
//! - "General Donation" is a lazily-created system singleton.
//! - Unmapped projects are keyed by their full title.

use crate::model::intent::Intent;
use crate::model::ledger::{
    Child, ChildId, DonorId, Project, ProjectId, ProjectType, Sponsorship, GENERAL_PROJECT_TITLE,
    UNMAPPED_PROJECT_PREFIX,
};
use crate::repo::ledger_repo::LedgerRepository;
use crate::repo::RepoError;
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Payment facts the materializer needs besides the intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentContext {
    pub donor: DonorId,
    /// One amount per target, in intent order.
    pub amounts: Vec<i64>,
    pub subscription_id: Option<String>,
    pub occurred_at: i64,
}

/// One booking target: the project plus optional sponsorship linkage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub project: Project,
    pub child: Option<Child>,
    pub sponsorship: Option<Sponsorship>,
    pub amount_cents: i64,
}

#[derive(Debug)]
pub enum MaterializeError {
    TargetCountMismatch { expected: usize, got: usize },
    /// A sponsorship points at a project that is not this child's
    /// sponsorship project.
    ProjectChildMismatch { project: ProjectId, child: ChildId },
    Repo(RepoError),
}

impl Display for MaterializeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TargetCountMismatch { expected, got } => {
                write!(f, "expected {expected} target amount(s), got {got}")
            }
            Self::ProjectChildMismatch { project, child } => write!(
                f,
                "project {project} is not the sponsorship project of child {child}"
            ),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MaterializeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for MaterializeError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Find-or-create logic for booking targets.
pub struct EntityMaterializer<R: LedgerRepository> {
    repo: R,
}

impl<R: LedgerRepository> EntityMaterializer<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Materializes every target implied by `intent`.
    pub fn materialize(
        &self,
        intent: &Intent,
        payment: &PaymentContext,
    ) -> Result<Vec<Target>, MaterializeError> {
        let expected = intent.target_count();
        if payment.amounts.len() != expected {
            return Err(MaterializeError::TargetCountMismatch {
                expected,
                got: payment.amounts.len(),
            });
        }

        match intent {
            Intent::Sponsorship { child_names } => child_names
                .iter()
                .zip(&payment.amounts)
                .map(|(name, amount)| self.sponsorship_target(name, *amount, payment))
                .collect(),
            Intent::General => {
                let project = self.general_project()?;
                Ok(vec![plain_target(project, payment.amounts[0])])
            }
            Intent::Campaign { campaign_id } => {
                let project = self.find_or_create_project(
                    &format!("Campaign {campaign_id}"),
                    ProjectType::Campaign,
                    None,
                )?;
                Ok(vec![plain_target(project, payment.amounts[0])])
            }
            Intent::Unmapped { raw_text, label } => {
                let project = self.find_or_create_project(
                    &format!("{UNMAPPED_PROJECT_PREFIX}{label}"),
                    ProjectType::General,
                    Some(raw_text.as_str()),
                )?;
                Ok(vec![plain_target(project, payment.amounts[0])])
            }
        }
    }

    fn sponsorship_target(
        &self,
        name: &str,
        amount_cents: i64,
        payment: &PaymentContext,
    ) -> Result<Target, MaterializeError> {
        let child = self.find_or_create_child(name)?;
        let existing = self.repo.find_active_sponsorship(payment.donor, child.uuid)?;
        let project = self.sponsorship_project(&child, existing.as_ref())?;

        let sponsorship = match existing {
            Some(mut sponsorship) => {
                if sponsorship.subscription_id.is_none() {
                    if let Some(subscription_id) = payment.subscription_id.as_deref() {
                        self.repo
                            .attach_subscription(sponsorship.uuid, subscription_id)?;
                        sponsorship.subscription_id = Some(subscription_id.to_string());
                    }
                }
                sponsorship
            }
            None => {
                let sponsorship = Sponsorship {
                    uuid: Uuid::new_v4(),
                    donor_uuid: payment.donor,
                    child_uuid: child.uuid,
                    project_uuid: project.uuid,
                    monthly_amount_cents: amount_cents,
                    subscription_id: payment.subscription_id.clone(),
                    started_at: payment.occurred_at,
                    ended_at: None,
                };
                self.repo.create_sponsorship(&sponsorship)?;
                info!(
                    "event=sponsorship_create module=materializer status=ok sponsorship={} child={} donor={}",
                    sponsorship.uuid, child.uuid, payment.donor
                );
                sponsorship
            }
        };

        Ok(Target {
            project,
            child: Some(child),
            sponsorship: Some(sponsorship),
            amount_cents,
        })
    }

    fn find_or_create_child(&self, name: &str) -> Result<Child, MaterializeError> {
        if let Some(child) = self.repo.find_child_by_name(name)? {
            return Ok(child);
        }
        let child = Child::new(name);
        self.repo.create_child(&child)?;
        info!(
            "event=child_create module=materializer status=ok child={}",
            child.uuid
        );
        Ok(child)
    }

    /// Reuses the project of the child's existing sponsorship, then any
    /// stored sponsorship project of the child, and creates one otherwise.
    fn sponsorship_project(
        &self,
        child: &Child,
        own_sponsorship: Option<&Sponsorship>,
    ) -> Result<Project, MaterializeError> {
        let linked = match own_sponsorship {
            Some(sponsorship) => Some(sponsorship.project_uuid),
            None => self
                .repo
                .latest_sponsorship_for_child(child.uuid)?
                .map(|sponsorship| sponsorship.project_uuid),
        };

        if let Some(project_id) = linked {
            let project = self
                .repo
                .get_project(project_id)?
                .ok_or(RepoError::NotFound {
                    entity: "project",
                    id: project_id,
                })?;
            if project.kind != ProjectType::Sponsorship || project.child_uuid != Some(child.uuid)
            {
                return Err(MaterializeError::ProjectChildMismatch {
                    project: project.uuid,
                    child: child.uuid,
                });
            }
            return Ok(project);
        }

        if let Some(project) = self.repo.find_sponsorship_project(child.uuid)? {
            return Ok(project);
        }

        let project = Project::for_child(child);
        self.repo.create_project(&project)?;
        info!(
            "event=project_create module=materializer status=ok project={} kind=sponsorship",
            project.uuid
        );
        Ok(project)
    }

    fn general_project(&self) -> Result<Project, MaterializeError> {
        if let Some(project) =
            self.repo
                .find_project_by_title(GENERAL_PROJECT_TITLE, ProjectType::General, true)?
        {
            return Ok(project);
        }
        let mut project = Project::new(GENERAL_PROJECT_TITLE, ProjectType::General);
        project.is_system = true;
        self.repo.create_project(&project)?;
        info!(
            "event=project_create module=materializer status=ok project={} kind=general system=true",
            project.uuid
        );
        Ok(project)
    }

    fn find_or_create_project(
        &self,
        title: &str,
        kind: ProjectType,
        description: Option<&str>,
    ) -> Result<Project, MaterializeError> {
        if let Some(project) = self.repo.find_project_by_title(title, kind, false)? {
            return Ok(project);
        }
        let mut project = Project::new(title, kind);
        project.description = description.map(str::to_string);
        self.repo.create_project(&project)?;
        info!(
            "event=project_create module=materializer status=ok project={} kind={:?}",
            project.uuid, kind
        );
        Ok(project)
    }
}

fn plain_target(project: Project, amount_cents: i64) -> Target {
    Target {
        project,
        child: None,
        sponsorship: None,
        amount_cents,
    }
}
