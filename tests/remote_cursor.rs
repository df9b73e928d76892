#[path = "common/session.rs"]
mod common;

use common::{full_item, item_layout, Session, TestResult};
use remora::config::PROTOCOL_VERSION_START_MARKER;
use remora::server::ProcedureRegistry;
use remora::{ClientOptions, ClientStorage, RelOp, RepositoryError};
use std::time::Duration;

fn populate(storage: &ClientStorage, rows: i32) -> TestResult {
    let layout = storage.layout().clone();
    for id in 0..rows {
        storage.insert(&mut full_item(&layout, id, &format!("row-{id}")))?;
    }
    Ok(())
}

#[test]
fn streams_every_record_across_batches() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 299)?;

    let mut cursor = storage.query().order_by("id").fetch()?;
    let mut seen = 0;
    while cursor.has_next()? {
        let record = cursor.next_record()?;
        assert_eq!(record.get_i32("id"), Some(seen));
        seen += 1;
    }
    assert_eq!(seen, 299);
    assert!(cursor.is_closed());
    assert!(matches!(
        cursor.next_record(),
        Err(RepositoryError::NoSuchElement)
    ));
    Ok(())
}

#[test]
fn has_next_is_idempotent() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 2)?;

    let mut cursor = storage.query().order_by("id").fetch()?;
    assert!(cursor.has_next()?);
    assert!(cursor.has_next()?);
    assert_eq!(cursor.next_record()?.get_i32("id"), Some(0));
    assert!(cursor.has_next()?);
    assert_eq!(cursor.next_record()?.get_i32("id"), Some(1));
    assert!(!cursor.has_next()?);
    assert!(!cursor.has_next()?);
    Ok(())
}

#[test]
fn slices_select_positions_of_the_ordered_result() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 20)?;

    let ids: Vec<i32> = storage
        .query()
        .order_by_descending("id")
        .fetch_slice(5, Some(8))?
        .to_vec()?
        .iter()
        .filter_map(|record| record.get_i32("id"))
        .collect();
    assert_eq!(ids, vec![14, 13, 12]);

    let tail = storage.query().order_by("id").fetch_slice(18, None)?.to_vec()?;
    assert_eq!(tail.len(), 2);

    let err = storage.query().fetch_slice(4, Some(2)).err().unwrap();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    Ok(())
}

#[test]
fn skip_next_reports_how_far_it_went() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 10)?;

    let mut cursor = storage
        .query()
        .filter("id", RelOp::Lt, 5)
        .order_by("id")
        .fetch()?;
    assert_eq!(cursor.skip_next(3)?, 3);
    assert_eq!(cursor.next_record()?.get_i32("id"), Some(3));
    assert_eq!(cursor.skip_next(10)?, 1);
    assert!(!cursor.has_next()?);
    Ok(())
}

#[test]
fn iterator_yields_records_then_stops() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 150)?;

    let cursor = storage.query().fetch()?;
    let records = cursor.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(records.len(), 150);
    Ok(())
}

#[test]
fn expired_timeout_surfaces_as_fetch_timeout() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 3)?;

    let mut cursor = storage.query().timeout(Duration::ZERO).fetch()?;
    let err = cursor.has_next().unwrap_err();
    assert!(matches!(err, RepositoryError::FetchTimeout(_)));
    assert!(cursor.is_closed());
    Ok(())
}

#[test]
fn closed_session_rejects_fetch() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 3)?;

    session.server.close();
    let mut cursor = storage.query().fetch()?;
    let err = cursor.has_next().unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    Ok(())
}

#[test]
fn closing_early_stops_the_stream() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 250)?;

    let mut cursor = storage.query().fetch()?;
    assert!(cursor.has_next()?);
    cursor.close()?;
    assert!(cursor.is_closed());
    assert!(!cursor.has_next()?);
    assert_eq!(storage.query().count()?, 250);
    Ok(())
}

#[test]
fn transactional_fetch_sees_uncommitted_writes() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 5)?;

    let txn = session.client.enter_transaction()?;
    let layout = storage.layout().clone();
    storage.insert(&mut full_item(&layout, 100, "pending"))?;
    let mut cursor = storage.query().filter("id", RelOp::Ge, 4).fetch()?;
    assert!(cursor.has_next()?);
    // Same transaction, while the cursor is still open.
    storage.insert(&mut full_item(&layout, 101, "later"))?;
    assert_eq!(cursor.to_vec()?.len(), 2);
    txn.exit()?;

    assert_eq!(storage.query().filter("id", RelOp::Ge, 4).count()?, 1);
    Ok(())
}

#[test]
fn start_marker_protocol_awaits_the_transaction() -> TestResult {
    let session = Session::with(
        ProcedureRegistry::new(),
        ClientOptions::new().protocol_version(PROTOCOL_VERSION_START_MARKER),
        100,
    );
    let storage = session.client.storage_for(item_layout())?;
    assert_eq!(
        storage.binding().protocol_version(),
        PROTOCOL_VERSION_START_MARKER
    );
    populate(&storage, 120)?;

    let mut txn = session.client.enter_transaction()?;
    let records = storage.query().order_by("id").fetch()?.to_vec()?;
    assert_eq!(records.len(), 120);
    assert!(txn.commit()?);
    txn.exit()?;

    // Outside a transaction no marker is written.
    assert_eq!(storage.query().fetch()?.to_vec()?.len(), 120);
    Ok(())
}

#[test]
fn small_batches_still_deliver_in_order() -> TestResult {
    let session = Session::with(ProcedureRegistry::new(), ClientOptions::default(), 7);
    let storage = session.client.storage_for(item_layout())?;
    populate(&storage, 50)?;

    let _txn = session.client.enter_transaction()?;
    let ids: Vec<i32> = storage
        .query()
        .order_by("id")
        .fetch()?
        .to_vec()?
        .iter()
        .filter_map(|record| record.get_i32("id"))
        .collect();
    assert_eq!(ids, (0..50).collect::<Vec<_>>());
    Ok(())
}
