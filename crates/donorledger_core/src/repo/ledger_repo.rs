//! Ledger repository for children, projects, sponsorships and donations.
//!
//! # Responsibility
//! - Provide find/create primitives used by the entity materializer.
//! - Keep the donation-level invariants next to the SQL that writes them.
//!
//! # Invariants
//! - `create_donation` refuses a sponsorship-project donation without a
//!   sponsorship reference.
//! - Sponsorship lookups treat rows with `ended_at` set as inactive.

use super::{
    bool_to_int, parse_bool_column, parse_optional_uuid_column, parse_uuid_column, RepoError,
    RepoResult,
};
use crate::model::ledger::{
    Child, ChildId, Donation, DonationId, DonationStatus, DonorId, LedgerValidationError, Project,
    ProjectId, ProjectType, Sponsorship, SponsorshipId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PROJECT_SELECT_SQL: &str = "SELECT
    uuid,
    title,
    project_type,
    is_system,
    description,
    child_uuid
FROM projects";

const SPONSORSHIP_SELECT_SQL: &str = "SELECT
    uuid,
    donor_uuid,
    child_uuid,
    project_uuid,
    monthly_amount_cents,
    subscription_id,
    started_at,
    ended_at
FROM sponsorships";

const DONATION_SELECT_SQL: &str = "SELECT
    uuid,
    amount_cents,
    donated_at,
    donor_uuid,
    project_uuid,
    child_uuid,
    sponsorship_uuid,
    charge_id,
    invoice_id,
    customer_id,
    subscription_id,
    status
FROM donations";

/// Repository interface for the non-donor ledger entities.
pub trait LedgerRepository {
    fn find_child_by_name(&self, name: &str) -> RepoResult<Option<Child>>;
    fn create_child(&self, child: &Child) -> RepoResult<ChildId>;

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>>;
    /// Finds the first project with exactly this title, type and system flag.
    fn find_project_by_title(
        &self,
        title: &str,
        kind: ProjectType,
        is_system: bool,
    ) -> RepoResult<Option<Project>>;
    fn find_sponsorship_project(&self, child: ChildId) -> RepoResult<Option<Project>>;
    fn create_project(&self, project: &Project) -> RepoResult<ProjectId>;

    fn find_active_sponsorship(
        &self,
        donor: DonorId,
        child: ChildId,
    ) -> RepoResult<Option<Sponsorship>>;
    /// Most recently started sponsorship of `child` by any donor.
    fn latest_sponsorship_for_child(&self, child: ChildId) -> RepoResult<Option<Sponsorship>>;
    fn create_sponsorship(&self, sponsorship: &Sponsorship) -> RepoResult<SponsorshipId>;
    fn attach_subscription(&self, id: SponsorshipId, subscription_id: &str) -> RepoResult<()>;
    fn list_sponsorships_by_subscription(
        &self,
        subscription_id: &str,
    ) -> RepoResult<Vec<Sponsorship>>;
    /// Ends every active sponsorship billed by `subscription_id`.
    fn end_sponsorships_by_subscription(
        &self,
        subscription_id: &str,
        ended_at: i64,
    ) -> RepoResult<usize>;

    fn charge_exists(&self, charge_id: &str) -> RepoResult<bool>;
    fn create_donation(&self, donation: &Donation) -> RepoResult<DonationId>;
    fn find_donation_by_charge(&self, charge_id: &str) -> RepoResult<Option<Donation>>;
    fn list_donations_by_invoice(&self, invoice_id: &str) -> RepoResult<Vec<Donation>>;
}

/// SQLite-backed ledger repository.
pub struct SqliteLedgerRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLedgerRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_one<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        parse: fn(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Option<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse(row)?));
        }
        Ok(None)
    }

    fn query_all<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        parse: fn(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse(row)?);
        }
        Ok(items)
    }
}

impl LedgerRepository for SqliteLedgerRepository<'_> {
    fn find_child_by_name(&self, name: &str) -> RepoResult<Option<Child>> {
        self.query_one(
            "SELECT uuid, name FROM children WHERE name = ?1;",
            [name],
            parse_child_row,
        )
    }

    fn create_child(&self, child: &Child) -> RepoResult<ChildId> {
        child.validate()?;
        self.conn.execute(
            "INSERT INTO children (uuid, name) VALUES (?1, ?2);",
            params![child.uuid.to_string(), child.name.as_str()],
        )?;
        Ok(child.uuid)
    }

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>> {
        self.query_one(
            &format!("{PROJECT_SELECT_SQL} WHERE uuid = ?1;"),
            [id.to_string()],
            parse_project_row,
        )
    }

    fn find_project_by_title(
        &self,
        title: &str,
        kind: ProjectType,
        is_system: bool,
    ) -> RepoResult<Option<Project>> {
        self.query_one(
            &format!(
                "{PROJECT_SELECT_SQL}
                 WHERE title = ?1
                   AND project_type = ?2
                   AND is_system = ?3
                 ORDER BY rowid ASC
                 LIMIT 1;"
            ),
            params![title, project_type_to_db(kind), bool_to_int(is_system)],
            parse_project_row,
        )
    }

    fn find_sponsorship_project(&self, child: ChildId) -> RepoResult<Option<Project>> {
        self.query_one(
            &format!(
                "{PROJECT_SELECT_SQL}
                 WHERE child_uuid = ?1
                   AND project_type = 'sponsorship';"
            ),
            [child.to_string()],
            parse_project_row,
        )
    }

    fn create_project(&self, project: &Project) -> RepoResult<ProjectId> {
        project.validate()?;
        self.conn.execute(
            "INSERT INTO projects (
                uuid,
                title,
                project_type,
                is_system,
                description,
                child_uuid
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                project.uuid.to_string(),
                project.title.as_str(),
                project_type_to_db(project.kind),
                bool_to_int(project.is_system),
                project.description.as_deref(),
                project.child_uuid.map(|id| id.to_string()),
            ],
        )?;
        Ok(project.uuid)
    }

    fn find_active_sponsorship(
        &self,
        donor: DonorId,
        child: ChildId,
    ) -> RepoResult<Option<Sponsorship>> {
        self.query_one(
            &format!(
                "{SPONSORSHIP_SELECT_SQL}
                 WHERE donor_uuid = ?1
                   AND child_uuid = ?2
                   AND ended_at IS NULL
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1;"
            ),
            params![donor.to_string(), child.to_string()],
            parse_sponsorship_row,
        )
    }

    fn latest_sponsorship_for_child(&self, child: ChildId) -> RepoResult<Option<Sponsorship>> {
        self.query_one(
            &format!(
                "{SPONSORSHIP_SELECT_SQL}
                 WHERE child_uuid = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1;"
            ),
            [child.to_string()],
            parse_sponsorship_row,
        )
    }

    fn create_sponsorship(&self, sponsorship: &Sponsorship) -> RepoResult<SponsorshipId> {
        sponsorship.validate()?;
        self.conn.execute(
            "INSERT INTO sponsorships (
                uuid,
                donor_uuid,
                child_uuid,
                project_uuid,
                monthly_amount_cents,
                subscription_id,
                started_at,
                ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                sponsorship.uuid.to_string(),
                sponsorship.donor_uuid.to_string(),
                sponsorship.child_uuid.to_string(),
                sponsorship.project_uuid.to_string(),
                sponsorship.monthly_amount_cents,
                sponsorship.subscription_id.as_deref(),
                sponsorship.started_at,
                sponsorship.ended_at,
            ],
        )?;
        Ok(sponsorship.uuid)
    }

    fn attach_subscription(&self, id: SponsorshipId, subscription_id: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE sponsorships SET subscription_id = ?2 WHERE uuid = ?1;",
            params![id.to_string(), subscription_id],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "sponsorship",
                id,
            });
        }
        Ok(())
    }

    fn list_sponsorships_by_subscription(
        &self,
        subscription_id: &str,
    ) -> RepoResult<Vec<Sponsorship>> {
        self.query_all(
            &format!(
                "{SPONSORSHIP_SELECT_SQL}
                 WHERE subscription_id = ?1
                 ORDER BY started_at ASC, rowid ASC;"
            ),
            [subscription_id],
            parse_sponsorship_row,
        )
    }

    fn end_sponsorships_by_subscription(
        &self,
        subscription_id: &str,
        ended_at: i64,
    ) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE sponsorships
             SET ended_at = ?2
             WHERE subscription_id = ?1
               AND ended_at IS NULL;",
            params![subscription_id, ended_at],
        )?;
        Ok(changed)
    }

    fn charge_exists(&self, charge_id: &str) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM donations WHERE charge_id = ?1);",
            [charge_id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn create_donation(&self, donation: &Donation) -> RepoResult<DonationId> {
        donation.validate()?;

        let project_type: Option<String> = self
            .conn
            .query_row(
                "SELECT project_type FROM projects WHERE uuid = ?1;",
                [donation.project_uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(project_type) = project_type else {
            return Err(RepoError::NotFound {
                entity: "project",
                id: donation.project_uuid,
            });
        };
        if parse_project_type(&project_type) == Some(ProjectType::Sponsorship)
            && donation.sponsorship_uuid.is_none()
        {
            return Err(LedgerValidationError::SponsorshipReferenceMissing(donation.uuid).into());
        }

        self.conn.execute(
            "INSERT INTO donations (
                uuid,
                amount_cents,
                donated_at,
                donor_uuid,
                project_uuid,
                child_uuid,
                sponsorship_uuid,
                charge_id,
                invoice_id,
                customer_id,
                subscription_id,
                status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
            params![
                donation.uuid.to_string(),
                donation.amount_cents,
                donation.donated_at,
                donation.donor_uuid.to_string(),
                donation.project_uuid.to_string(),
                donation.child_uuid.map(|id| id.to_string()),
                donation.sponsorship_uuid.map(|id| id.to_string()),
                donation.charge_id.as_deref(),
                donation.invoice_id.as_deref(),
                donation.customer_id.as_deref(),
                donation.subscription_id.as_deref(),
                donation_status_to_db(donation.status),
            ],
        )?;
        Ok(donation.uuid)
    }

    fn find_donation_by_charge(&self, charge_id: &str) -> RepoResult<Option<Donation>> {
        self.query_one(
            &format!("{DONATION_SELECT_SQL} WHERE charge_id = ?1;"),
            [charge_id],
            parse_donation_row,
        )
    }

    fn list_donations_by_invoice(&self, invoice_id: &str) -> RepoResult<Vec<Donation>> {
        self.query_all(
            &format!(
                "{DONATION_SELECT_SQL}
                 WHERE invoice_id = ?1
                 ORDER BY rowid ASC;"
            ),
            [invoice_id],
            parse_donation_row,
        )
    }
}

fn parse_child_row(row: &Row<'_>) -> RepoResult<Child> {
    let child = Child {
        uuid: parse_uuid_column(row, "uuid")?,
        name: row.get("name")?,
    };
    child.validate()?;
    Ok(child)
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<Project> {
    let type_text: String = row.get("project_type")?;
    let kind = parse_project_type(&type_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid project type `{type_text}` in projects.project_type"
        ))
    })?;

    let project = Project {
        uuid: parse_uuid_column(row, "uuid")?,
        title: row.get("title")?,
        kind,
        is_system: parse_bool_column(row, "is_system")?,
        description: row.get("description")?,
        child_uuid: parse_optional_uuid_column(row, "child_uuid")?,
    };
    project.validate()?;
    Ok(project)
}

fn parse_sponsorship_row(row: &Row<'_>) -> RepoResult<Sponsorship> {
    let sponsorship = Sponsorship {
        uuid: parse_uuid_column(row, "uuid")?,
        donor_uuid: parse_uuid_column(row, "donor_uuid")?,
        child_uuid: parse_uuid_column(row, "child_uuid")?,
        project_uuid: parse_uuid_column(row, "project_uuid")?,
        monthly_amount_cents: row.get("monthly_amount_cents")?,
        subscription_id: row.get("subscription_id")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    };
    sponsorship.validate()?;
    Ok(sponsorship)
}

fn parse_donation_row(row: &Row<'_>) -> RepoResult<Donation> {
    let status_text: String = row.get("status")?;
    let status = parse_donation_status(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid donation status `{status_text}` in donations.status"
        ))
    })?;

    let donation = Donation {
        uuid: parse_uuid_column(row, "uuid")?,
        amount_cents: row.get("amount_cents")?,
        donated_at: row.get("donated_at")?,
        donor_uuid: parse_uuid_column(row, "donor_uuid")?,
        project_uuid: parse_uuid_column(row, "project_uuid")?,
        child_uuid: parse_optional_uuid_column(row, "child_uuid")?,
        sponsorship_uuid: parse_optional_uuid_column(row, "sponsorship_uuid")?,
        charge_id: row.get("charge_id")?,
        invoice_id: row.get("invoice_id")?,
        customer_id: row.get("customer_id")?,
        subscription_id: row.get("subscription_id")?,
        status,
    };
    donation.validate()?;
    Ok(donation)
}

fn project_type_to_db(kind: ProjectType) -> &'static str {
    match kind {
        ProjectType::General => "general",
        ProjectType::Campaign => "campaign",
        ProjectType::Sponsorship => "sponsorship",
    }
}

fn parse_project_type(value: &str) -> Option<ProjectType> {
    match value {
        "general" => Some(ProjectType::General),
        "campaign" => Some(ProjectType::Campaign),
        "sponsorship" => Some(ProjectType::Sponsorship),
        _ => None,
    }
}

fn donation_status_to_db(status: DonationStatus) -> &'static str {
    match status {
        DonationStatus::Succeeded => "succeeded",
        DonationStatus::Refunded => "refunded",
        DonationStatus::Failed => "failed",
    }
}

fn parse_donation_status(value: &str) -> Option<DonationStatus> {
    match value {
        "succeeded" => Some(DonationStatus::Succeeded),
        "refunded" => Some(DonationStatus::Refunded),
        "failed" => Some(DonationStatus::Failed),
        _ => None,
    }
}
