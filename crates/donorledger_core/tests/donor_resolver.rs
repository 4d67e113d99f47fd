use donorledger_core::config::ImportConfig;
use donorledger_core::db::open_db_in_memory;
use donorledger_core::model::ledger::Donor;
use donorledger_core::repo::donor_repo::{DonorRepository, SqliteDonorRepository};
use donorledger_core::service::donor_resolver::{DonorIdentity, DonorResolver, ResolveError};
use donorledger_core::service::importer::PaymentImporter;
use donorledger_core::CanonicalRecord;
use rusqlite::Connection;

const T0: i64 = 1_700_000_000_000;

fn identity(name: Option<&str>, email: Option<&str>, customer_id: Option<&str>) -> DonorIdentity {
    DonorIdentity {
        name: name.map(str::to_string),
        email: email.map(str::to_string),
        customer_id: customer_id.map(str::to_string),
    }
}

fn donor_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM donors;", [], |row| row.get(0))
        .unwrap()
}

fn forward(conn: &Connection, from: &Donor, to: &Donor) {
    conn.execute(
        "UPDATE donors SET merged_into_uuid = ?2, is_deleted = 1 WHERE uuid = ?1;",
        [from.uuid.to_string(), to.uuid.to_string()],
    )
    .unwrap();
}

#[test]
fn unknown_identity_creates_donor() {
    let conn = open_db_in_memory().unwrap();
    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);

    let resolved = resolver
        .resolve(&identity(Some("Ann"), Some("ann@x.com"), None), T0)
        .unwrap();

    assert!(resolved.created);
    assert_eq!(resolved.donor.name.as_deref(), Some("Ann"));
    assert_eq!(resolved.donor.updated_at, T0);
    assert_eq!(donor_count(&conn), 1);
}

#[test]
fn email_match_is_case_insensitive() {
    let conn = open_db_in_memory().unwrap();
    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);

    let first = resolver
        .resolve(&identity(None, Some("Ann@X.com"), None), T0)
        .unwrap();
    let second = resolver
        .resolve(&identity(None, Some("ann@x.COM"), None), T0)
        .unwrap();

    assert!(!second.created);
    assert_eq!(first.donor.uuid, second.donor.uuid);
    assert_eq!(donor_count(&conn), 1);
}

#[test]
fn missing_email_and_customer_always_creates() {
    let conn = open_db_in_memory().unwrap();
    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);

    let first = resolver.resolve(&identity(Some("Ann"), None, None), T0).unwrap();
    let second = resolver.resolve(&identity(Some("Ann"), None, None), T0).unwrap();

    assert!(first.created && second.created);
    assert_ne!(first.donor.uuid, second.donor.uuid);
}

#[test]
fn customer_id_wins_over_email() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let mut paid = CanonicalRecord::new("ch_1", 1_000, T0);
    paid.payer_email = Some("old@x.com".to_string());
    paid.customer_id = Some("cus_1".to_string());
    let customer_donor = importer.import(&paid).donations()[0].donor_uuid;

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let other = resolver
        .resolve(&identity(None, Some("other@x.com"), None), T0)
        .unwrap();
    let resolved = resolver
        .resolve(&identity(None, Some("other@x.com"), Some("cus_1")), T0)
        .unwrap();

    assert_ne!(other.donor.uuid, customer_donor);
    assert_eq!(resolved.donor.uuid, customer_donor);
}

#[test]
fn newer_record_overwrites_and_older_record_does_not() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let created = resolver
        .resolve(&identity(Some("Ann"), Some("ann@x.com"), None), T0)
        .unwrap();

    resolver
        .resolve(&identity(Some("Annie"), Some("ann@x.com"), None), T0 - 1)
        .unwrap();
    let stored = repo.get_donor(created.donor.uuid).unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("Ann"));

    resolver
        .resolve(&identity(Some("Ann Lee"), Some("ann@x.com"), None), T0 + 1)
        .unwrap();
    let stored = repo.get_donor(created.donor.uuid).unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("Ann Lee"));
    assert_eq!(stored.updated_at, T0 + 1);
}

#[test]
fn blank_incoming_values_never_erase() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let mut first = CanonicalRecord::new("ch_1", 1_000, T0);
    first.payer_email = Some("ann@x.com".to_string());
    first.payer_name = Some("Ann".to_string());
    importer.import(&first);

    let mut later = CanonicalRecord::new("ch_2", 1_000, T0 + 10);
    later.payer_email = Some("ann@x.com".to_string());
    later.payer_name = Some("   ".to_string());
    let donor_id = importer.import(&later).donations()[0].donor_uuid;

    let stored = SqliteDonorRepository::new(&conn)
        .get_donor(donor_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.name.as_deref(), Some("Ann"));
}

#[test]
fn missing_name_is_filled_from_older_record() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let created = resolver
        .resolve(&identity(None, Some("ann@x.com"), None), T0)
        .unwrap();

    resolver
        .resolve(&identity(Some("Ann"), Some("ann@x.com"), None), T0 - 100)
        .unwrap();

    let stored = repo.get_donor(created.donor.uuid).unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("Ann"));
    assert_eq!(stored.updated_at, T0);
}

#[test]
fn merge_chain_is_followed_to_the_end() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let a = Donor::new(None, Some("a@x.com".to_string()), T0);
    let b = Donor::new(None, Some("b@x.com".to_string()), T0);
    let c = Donor::new(None, Some("c@x.com".to_string()), T0);
    for donor in [&a, &b, &c] {
        repo.create_donor(donor).unwrap();
    }
    forward(&conn, &a, &b);
    forward(&conn, &b, &c);

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let resolved = resolver
        .resolve(&identity(None, Some("a@x.com"), None), T0)
        .unwrap();

    assert_eq!(resolved.donor.uuid, c.uuid);
    assert!(!resolved.created);
}

#[test]
fn merge_chain_is_followed_from_customer_id() {
    let conn = open_db_in_memory().unwrap();
    let importer = PaymentImporter::new(&conn, &ImportConfig::default());
    let mut paid = CanonicalRecord::new("ch_1", 1_000, T0);
    paid.payer_email = Some("a@x.com".to_string());
    paid.customer_id = Some("cus_a".to_string());
    let a_id = importer.import(&paid).donations()[0].donor_uuid;

    let repo = SqliteDonorRepository::new(&conn);
    let a = repo.get_donor(a_id).unwrap().unwrap();
    let b = Donor::new(None, Some("b@x.com".to_string()), T0);
    let c = Donor::new(None, Some("c@x.com".to_string()), T0);
    repo.create_donor(&b).unwrap();
    repo.create_donor(&c).unwrap();
    forward(&conn, &a, &b);
    forward(&conn, &b, &c);

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let resolved = resolver
        .resolve(&identity(None, None, Some("cus_a")), T0 + 1_000)
        .unwrap();

    assert_eq!(resolved.donor.uuid, c.uuid);
    assert!(!resolved.created);
    assert_eq!(donor_count(&conn), 3);
}

#[test]
fn merge_cycle_is_reported() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let a = Donor::new(None, Some("a@x.com".to_string()), T0);
    let b = Donor::new(None, Some("b@x.com".to_string()), T0);
    repo.create_donor(&a).unwrap();
    repo.create_donor(&b).unwrap();
    forward(&conn, &a, &b);
    forward(&conn, &b, &a);

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let err = resolver
        .resolve(&identity(None, Some("a@x.com"), None), T0)
        .unwrap_err();

    match err {
        ResolveError::MergeCycle { start, repeated } => {
            assert_eq!(start, a.uuid);
            assert_eq!(repeated, a.uuid);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn overlong_merge_chain_is_reported() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let donors: Vec<Donor> = (0..4)
        .map(|index| Donor::new(None, Some(format!("d{index}@x.com")), T0))
        .collect();
    for donor in &donors {
        repo.create_donor(donor).unwrap();
    }
    for pair in donors.windows(2) {
        forward(&conn, &pair[0], &pair[1]);
    }

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 2);
    let err = resolver
        .resolve(&identity(None, Some("d0@x.com"), None), T0)
        .unwrap_err();

    assert!(matches!(
        err,
        ResolveError::MergeChainTooLong { max_hops: 2, .. }
    ));
}

#[test]
fn archived_donor_without_forward_is_not_matched() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDonorRepository::new(&conn);
    let archived = Donor::new(None, Some("a@x.com".to_string()), T0);
    repo.create_donor(&archived).unwrap();
    conn.execute(
        "UPDATE donors SET is_deleted = 1 WHERE uuid = ?1;",
        [archived.uuid.to_string()],
    )
    .unwrap();

    let resolver = DonorResolver::new(SqliteDonorRepository::new(&conn), 32);
    let resolved = resolver
        .resolve(&identity(None, Some("a@x.com"), None), T0)
        .unwrap();

    assert!(resolved.created);
    assert_ne!(resolved.donor.uuid, archived.uuid);
}
