//! Ledger domain model.
//!
//! # Responsibility
//! - Define the normalized ledger entities produced by reconciliation.
//! - Define the source-agnostic canonical payment record and typed intents.
//!
//! # Invariants
//! - Every ledger entity is identified by a stable UUID.
//! - Donors are soft-deleted; no other entity is deleted by the engine.

pub mod intent;
pub mod ledger;
pub mod record;
