use donorledger_core::config::{ImportConfig, SplitPolicy};
use donorledger_core::db::{open_db, open_db_in_memory};
use donorledger_core::model::ledger::{ProjectType, GENERAL_PROJECT_TITLE};
use donorledger_core::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use donorledger_core::service::importer::{
    FailureKind, ImportResult, PaymentImporter, SkipReason,
};
use donorledger_core::CanonicalRecord;
use rusqlite::Connection;
use std::sync::{Arc, Barrier};
use std::thread;

const T0: i64 = 1_700_000_000_000;

fn record(charge_id: &str, amount_cents: i64, description: &str) -> CanonicalRecord {
    let mut record = CanonicalRecord::new(charge_id, amount_cents, T0);
    record.payer_email = Some("a@x.com".to_string());
    record.payer_name = Some("Ann Donor".to_string());
    record.description_text = Some(description.to_string());
    record
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

fn project_titles(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT title FROM projects ORDER BY rowid;")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

#[test]
fn sponsorship_record_creates_child_project_sponsorship_and_donation() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let result = importer.import(&record(
        "ch_1",
        10_000,
        "Monthly Sponsorship Donation for Sangwan",
    ));

    let ImportResult::Imported {
        donations,
        donor_created,
        intent,
    } = &result
    else {
        panic!("unexpected result: {result:?}");
    };
    assert!(donor_created);
    assert_eq!(*intent, "sponsorship");
    assert_eq!(donations.len(), 1);

    let repo = SqliteLedgerRepository::new(&conn);
    let child = repo.find_child_by_name("Sangwan").unwrap().unwrap();
    let project = repo.find_sponsorship_project(child.uuid).unwrap().unwrap();
    assert_eq!(project.title, "Sponsor Sangwan");
    assert_eq!(project.kind, ProjectType::Sponsorship);

    let donation = repo.find_donation_by_charge("ch_1").unwrap().unwrap();
    assert_eq!(donation.amount_cents, 10_000);
    assert_eq!(donation.project_uuid, project.uuid);
    assert_eq!(donation.child_uuid, Some(child.uuid));
    let sponsorship = repo
        .find_active_sponsorship(donation.donor_uuid, child.uuid)
        .unwrap()
        .unwrap();
    assert_eq!(donation.sponsorship_uuid, Some(sponsorship.uuid));
    assert_eq!(sponsorship.monthly_amount_cents, 10_000);
}

#[test]
fn replaying_a_charge_is_skipped_without_new_rows() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let input = record("ch_1", 10_000, "Monthly Sponsorship Donation for Sangwan");

    assert!(importer.import(&input).is_success());
    let replay = importer.import(&input);

    assert_eq!(replay.skip_reason(), Some(SkipReason::AlreadyImported));
    assert_eq!(count(&conn, "donations"), 1);
    assert_eq!(count(&conn, "sponsorships"), 1);
    assert_eq!(count(&conn, "donors"), 1);
}

#[test]
fn general_donations_share_the_system_singleton() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let first = importer.import(&record("ch_1", 5_000, "$50 - General Monthly Donation"));
    let second = importer.import(&record("ch_2", 5_000, "$50 - General Monthly Donation"));

    assert_eq!(
        first.donations()[0].project_uuid,
        second.donations()[0].project_uuid
    );
    let repo = SqliteLedgerRepository::new(&conn);
    let project = repo
        .find_project_by_title(GENERAL_PROJECT_TITLE, ProjectType::General, true)
        .unwrap()
        .unwrap();
    assert!(project.is_system);
    assert_eq!(project.uuid, first.donations()[0].project_uuid);
    assert_eq!(count(&conn, "projects"), 1);
}

#[test]
fn bare_email_description_is_booked_as_general() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let result = importer.import(&record("ch_1", 2_500, "a@x.com"));

    assert!(result.is_success());
    assert_eq!(project_titles(&conn), vec![GENERAL_PROJECT_TITLE.to_string()]);
}

#[test]
fn campaign_description_creates_campaign_project() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    importer.import(&record("ch_1", 2_500, "Donation for campaign #spring24"));
    importer.import(&record("ch_2", 1_000, "donation for CAMPAIGN spring24"));

    assert_eq!(project_titles(&conn), vec!["Campaign spring24".to_string()]);
    assert_eq!(count(&conn, "donations"), 2);
}

#[test]
fn unmapped_text_reuses_by_text_and_splits_on_different_text() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    importer.import(&record("ch_1", 1_000, "Random unmapped text"));
    importer.import(&record("ch_2", 1_000, "Random unmapped text"));
    importer.import(&record("ch_3", 1_000, "Something else entirely"));

    assert_eq!(
        project_titles(&conn),
        vec![
            "UNMAPPED: Random unmapped text".to_string(),
            "UNMAPPED: Something else entirely".to_string(),
        ]
    );
    let description: String = conn
        .query_row(
            "SELECT description FROM projects WHERE title = 'UNMAPPED: Random unmapped text';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(description, "Random unmapped text");
}

#[test]
fn unmapped_title_is_truncated_but_description_keeps_full_text() {
    let conn = open_db_in_memory().unwrap();
    let config = ImportConfig {
        unmapped_label_max_chars: 10,
        ..ImportConfig::default()
    };
    let importer = PaymentImporter::new(&conn, &config);

    importer.import(&record("ch_1", 1_000, "Thank you for everything"));

    let (title, description): (String, String) = conn
        .query_row("SELECT title, description FROM projects;", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(title, "UNMAPPED: Thank you ");
    assert_eq!(description, "Thank you for everything");
}

#[test]
fn multi_child_payment_shares_invoice_with_full_amount_by_default() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let mut input = record(
        "ch_multi",
        6_000,
        "Sponsorship Donation for Mina, Arun, Mina",
    );
    input.invoice_id = Some("in_1".to_string());

    let result = importer.import(&input);

    let donations = result.donations();
    assert_eq!(donations.len(), 2);
    assert!(donations.iter().all(|d| d.amount_cents == 6_000));
    assert_eq!(donations[0].charge_id.as_deref(), Some("ch_multi"));
    assert_eq!(donations[1].charge_id.as_deref(), Some("ch_multi:2"));

    let repo = SqliteLedgerRepository::new(&conn);
    let by_invoice = repo.list_donations_by_invoice("in_1").unwrap();
    assert_eq!(by_invoice.len(), 2);
    assert_eq!(count(&conn, "children"), 2);
    assert_eq!(count(&conn, "sponsorships"), 2);

    assert_eq!(
        importer.import(&input).skip_reason(),
        Some(SkipReason::AlreadyImported)
    );
    assert_eq!(count(&conn, "donations"), 2);
}

#[test]
fn even_split_policy_divides_amount_and_falls_back_to_charge_as_invoice() {
    let conn = open_db_in_memory().unwrap();
    let config = ImportConfig {
        split_policy: SplitPolicy::EvenSplit,
        ..ImportConfig::default()
    };
    let importer = PaymentImporter::new(&conn, &config);

    let result = importer.import(&record(
        "ch_split",
        1_001,
        "Sponsorship Donation for Mina, Arun",
    ));

    let amounts: Vec<i64> = result.donations().iter().map(|d| d.amount_cents).collect();
    assert_eq!(amounts, vec![501, 500]);
    assert!(result
        .donations()
        .iter()
        .all(|d| d.invoice_id.as_deref() == Some("ch_split")));
}

#[test]
fn even_split_that_cannot_cover_every_child_fails_without_writes() {
    let conn = open_db_in_memory().unwrap();
    let config = ImportConfig {
        split_policy: SplitPolicy::EvenSplit,
        ..ImportConfig::default()
    };
    let importer = PaymentImporter::new(&conn, &config);

    let result = importer.import(&record("ch_tiny", 1, "Sponsorship Donation for Mina, Arun"));

    assert!(matches!(
        result,
        ImportResult::Failed {
            kind: FailureKind::Validation,
            ..
        }
    ));
    assert_eq!(count(&conn, "donors"), 0);
    assert_eq!(count(&conn, "donations"), 0);
}

#[test]
fn second_payment_reuses_sponsorship_and_keeps_monthly_amount() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let first = importer.import(&record("ch_1", 3_000, "Sponsorship Donation for Sangwan"));
    let second = importer.import(&record("ch_2", 4_500, "Sponsorship Donation for Sangwan"));

    assert_eq!(
        first.donations()[0].sponsorship_uuid,
        second.donations()[0].sponsorship_uuid
    );
    assert_eq!(count(&conn, "sponsorships"), 1);
    let monthly: i64 = conn
        .query_row("SELECT monthly_amount_cents FROM sponsorships;", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(monthly, 3_000);
}

#[test]
fn another_donor_for_same_child_reuses_child_project() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let first = importer.import(&record("ch_1", 3_000, "Sponsorship Donation for Sangwan"));
    let mut other = record("ch_2", 3_000, "Sponsorship Donation for Sangwan");
    other.payer_email = Some("b@y.com".to_string());
    let second = importer.import(&other);

    assert_ne!(
        first.donations()[0].donor_uuid,
        second.donations()[0].donor_uuid
    );
    assert_eq!(
        first.donations()[0].project_uuid,
        second.donations()[0].project_uuid
    );
    assert_eq!(count(&conn, "projects"), 1);
    assert_eq!(count(&conn, "sponsorships"), 2);
}

#[test]
fn reused_sponsorship_adopts_subscription_id() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    importer.import(&record("ch_1", 3_000, "Sponsorship Donation for Sangwan"));
    let mut recurring = record("ch_2", 3_000, "Sponsorship Donation for Sangwan");
    recurring.subscription_id = Some("sub_9".to_string());
    importer.import(&recurring);

    let repo = SqliteLedgerRepository::new(&conn);
    let sponsorships = repo.list_sponsorships_by_subscription("sub_9").unwrap();
    assert_eq!(sponsorships.len(), 1);
}

#[test]
fn failed_status_has_no_side_effects() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let mut input = record("ch_1", 10_000, "Sponsorship Donation for Sangwan");
    input.transaction_status = "failed".to_string();

    let result = importer.import(&input);

    assert_eq!(result.skip_reason(), Some(SkipReason::NotSucceeded));
    for table in ["donors", "children", "projects", "sponsorships", "donations"] {
        assert_eq!(count(&conn, table), 0, "{table} should stay empty");
    }
}

#[test]
fn invalid_records_fail_as_validation() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());

    let zero_amount = importer.import(&record("ch_1", 0, "$5 - general monthly donation"));
    let blank_charge = importer.import(&record("  ", 500, "$5 - general monthly donation"));

    for result in [zero_amount, blank_charge] {
        assert!(matches!(
            result,
            ImportResult::Failed {
                kind: FailureKind::Validation,
                ..
            }
        ));
    }
    assert_eq!(count(&conn, "donors"), 0);
}

#[test]
fn merge_cycle_rolls_back_and_reports_data_integrity() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    importer.import(&record("ch_1", 1_000, "$10 - general monthly donation"));

    let mut other = record("ch_2", 1_000, "$10 - general monthly donation");
    other.payer_email = Some("b@y.com".to_string());
    importer.import(&other);
    conn.execute_batch(
        "UPDATE donors SET merged_into_uuid = (SELECT uuid FROM donors WHERE email = 'b@y.com'),
                is_deleted = 1
         WHERE email = 'a@x.com';
         UPDATE donors SET merged_into_uuid = (SELECT uuid FROM donors WHERE email = 'a@x.com'),
                is_deleted = 1
         WHERE email = 'b@y.com';",
    )
    .unwrap();

    let result = importer.import(&record("ch_3", 1_000, "$10 - general monthly donation"));

    assert!(matches!(
        result,
        ImportResult::Failed {
            kind: FailureKind::DataIntegrity,
            ..
        }
    ));
    assert_eq!(count(&conn, "donations"), 2);
}

#[test]
fn charge_id_shaped_like_a_split_line_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    importer.import(&record("ch_1", 2_000, "Sponsorship Donation for Mina, Arun"));

    let result = importer.import(&record("ch_1:2", 2_000, "$20 - general monthly donation"));

    assert!(matches!(
        result,
        ImportResult::Failed {
            kind: FailureKind::Validation,
            ..
        }
    ));
    assert_eq!(count(&conn, "donations"), 2);
}

#[test]
fn concurrent_imports_of_one_charge_book_it_once() {
    const WORKERS: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite3");
    let conn = open_db(&path).unwrap();

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let importer = PaymentImporter::new(&conn, &ImportConfig::default());
                let input = record("ch_race", 2_500, "Sponsorship Donation for Mina");
                barrier.wait();
                importer.import(&input)
            })
        })
        .collect();
    let results: Vec<ImportResult> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 1);
    assert!(results.iter().all(|r| r.is_success()
        || r.skip_reason() == Some(SkipReason::AlreadyImported)));
    assert_eq!(count(&conn, "donations"), 1);
    assert_eq!(count(&conn, "sponsorships"), 1);
}
