//! Ledger schema versions.
//!
//! Version 1 creates donors, children, projects, sponsorships and donations
//! with the uniqueness rules imports depend on (one row per `charge_id`, one
//! sponsorship project per child, one system project per title). Version 2
//! adds subscription tracking to sponsorships.
//!
//! Every pending step runs in a single transaction and bumps
//! `PRAGMA user_version`, so a half-migrated ledger is never observed.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const LEDGER_SCHEMA: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "ledger",
        sql: include_str!("0001_ledger.sql"),
    },
    SchemaStep {
        version: 2,
        name: "sponsorship_subscriptions",
        sql: include_str!("0002_sponsorship_subscriptions.sql"),
    },
];

/// Newest ledger schema this build can read and write.
pub fn latest_version() -> u32 {
    LEDGER_SCHEMA.last().map_or(0, |step| step.version)
}

/// Brings the ledger at `conn` up to [`latest_version`].
///
/// Fails with [`DbError::UnsupportedSchemaVersion`] when the file was written
/// by a newer build; nothing is changed in that case.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from_version = schema_version(conn)?;
    let latest = latest_version();
    if from_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from_version,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = LEDGER_SCHEMA
        .iter()
        .filter(|step| step.version > from_version)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        info!(
            "event=db_migrate_step module=db status=ok version={} name={}",
            step.version, step.name
        );
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={}",
        from_version, latest
    );
    Ok(())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}
