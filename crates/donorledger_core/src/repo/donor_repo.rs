//! Donor repository contracts and SQLite implementation.
//!
//! # Invariants
//! - Email lookups are case-insensitive and ignore archived donors that do
//!   not forward anywhere.
//! - Merging never hard-deletes a donor row.

use super::{
    bool_to_int, parse_bool_column, parse_optional_uuid_column, parse_uuid_column, RepoError,
    RepoResult,
};
use crate::model::ledger::{Donor, DonorId};
use rusqlite::{params, Connection, OptionalExtension, Row};

const DONOR_SELECT_SQL: &str = "SELECT
    uuid,
    name,
    email,
    merged_into_uuid,
    is_deleted,
    updated_at
FROM donors";

/// Counts of rows moved from one donor to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReassignCounts {
    pub donations: usize,
    pub sponsorships: usize,
}

/// Repository interface for donor identity storage.
pub trait DonorRepository {
    fn create_donor(&self, donor: &Donor) -> RepoResult<DonorId>;
    /// Overwrites identity fields and stamps `updated_at`.
    fn update_donor_identity(
        &self,
        id: DonorId,
        name: Option<&str>,
        email: Option<&str>,
        updated_at: i64,
    ) -> RepoResult<()>;
    /// Loads a donor including merged and archived rows.
    fn get_donor(&self, id: DonorId) -> RepoResult<Option<Donor>>;
    fn find_donor_by_email(&self, email: &str) -> RepoResult<Option<Donor>>;
    /// Finds the donor of the most recent donation paid by `customer_id`.
    fn find_donor_by_customer_id(&self, customer_id: &str) -> RepoResult<Option<DonorId>>;
    /// Moves every donation and sponsorship of `from` onto `to`.
    fn reassign_donor(&self, from: DonorId, to: DonorId) -> RepoResult<ReassignCounts>;
    /// Sets the forward pointer of `duplicate` and archives it.
    fn mark_merged(&self, duplicate: DonorId, survivor: DonorId) -> RepoResult<()>;
}

/// SQLite-backed donor repository.
pub struct SqliteDonorRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDonorRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl DonorRepository for SqliteDonorRepository<'_> {
    fn create_donor(&self, donor: &Donor) -> RepoResult<DonorId> {
        donor.validate()?;

        self.conn.execute(
            "INSERT INTO donors (
                uuid,
                name,
                email,
                merged_into_uuid,
                is_deleted,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                donor.uuid.to_string(),
                donor.name.as_deref(),
                donor.email.as_deref(),
                donor.merged_into.map(|id| id.to_string()),
                bool_to_int(donor.is_deleted),
                donor.updated_at,
            ],
        )?;

        Ok(donor.uuid)
    }

    fn update_donor_identity(
        &self,
        id: DonorId,
        name: Option<&str>,
        email: Option<&str>,
        updated_at: i64,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE donors
             SET
                name = ?2,
                email = ?3,
                updated_at = ?4
             WHERE uuid = ?1;",
            params![id.to_string(), name, email, updated_at],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound { entity: "donor", id });
        }
        Ok(())
    }

    fn get_donor(&self, id: DonorId) -> RepoResult<Option<Donor>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{DONOR_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_donor_row(row)?));
        }
        Ok(None)
    }

    fn find_donor_by_email(&self, email: &str) -> RepoResult<Option<Donor>> {
        // Active donors first, then forwarders; oldest row first within each group.
        let mut stmt = self.conn.prepare(&format!(
            "{DONOR_SELECT_SQL}
             WHERE email = ?1
               AND (is_deleted = 0 OR merged_into_uuid IS NOT NULL)
             ORDER BY merged_into_uuid IS NOT NULL ASC, rowid ASC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query([email])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_donor_row(row)?));
        }
        Ok(None)
    }

    fn find_donor_by_customer_id(&self, customer_id: &str) -> RepoResult<Option<DonorId>> {
        let donor_uuid: Option<String> = self
            .conn
            .query_row(
                "SELECT donor_uuid
                 FROM donations
                 WHERE customer_id = ?1
                 ORDER BY donated_at DESC, rowid DESC
                 LIMIT 1;",
                [customer_id],
                |row| row.get(0),
            )
            .optional()?;

        donor_uuid
            .map(|text| {
                uuid::Uuid::parse_str(&text).map_err(|_| {
                    RepoError::InvalidData(format!(
                        "invalid uuid value `{text}` in donations.donor_uuid"
                    ))
                })
            })
            .transpose()
    }

    fn reassign_donor(&self, from: DonorId, to: DonorId) -> RepoResult<ReassignCounts> {
        let donations = self.conn.execute(
            "UPDATE donations SET donor_uuid = ?2 WHERE donor_uuid = ?1;",
            params![from.to_string(), to.to_string()],
        )?;
        let sponsorships = self.conn.execute(
            "UPDATE sponsorships SET donor_uuid = ?2 WHERE donor_uuid = ?1;",
            params![from.to_string(), to.to_string()],
        )?;
        Ok(ReassignCounts {
            donations,
            sponsorships,
        })
    }

    fn mark_merged(&self, duplicate: DonorId, survivor: DonorId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE donors
             SET
                merged_into_uuid = ?2,
                is_deleted = 1
             WHERE uuid = ?1;",
            params![duplicate.to_string(), survivor.to_string()],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "donor",
                id: duplicate,
            });
        }
        Ok(())
    }
}

fn parse_donor_row(row: &Row<'_>) -> RepoResult<Donor> {
    let donor = Donor {
        uuid: parse_uuid_column(row, "uuid")?,
        name: row.get("name")?,
        email: row.get("email")?,
        merged_into: parse_optional_uuid_column(row, "merged_into_uuid")?,
        is_deleted: parse_bool_column(row, "is_deleted")?,
        updated_at: row.get("updated_at")?,
    };
    donor.validate()?;
    Ok(donor)
}
