//! Reconciliation services.
//!
//! # Responsibility
//! - Orchestrate repository calls into the reconciliation use-cases.
//! - Keep adapters and the CLI decoupled from storage details.

pub mod classifier;
pub mod donor_merge;
pub mod donor_resolver;
pub mod importer;
pub mod materializer;
