#[path = "common/session.rs"]
mod common;

use common::{full_item, item, item_layout, Session, TestResult};
use remora::server::ProcedureRegistry;
use remora::{ClientOptions, IsolationLevel, RepositoryError, ServerOptions};
use std::thread;
use std::time::Duration;

#[test]
fn commit_publishes_and_exit_rolls_back() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(&layout, 1, "kept"))?;
    assert!(txn.commit()?);
    txn.exit()?;

    let txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(&layout, 2, "dropped"))?;
    assert!(storage.try_load(&mut item(&layout, 2))?);
    txn.exit()?;

    assert!(storage.try_load(&mut item(&layout, 1))?);
    assert!(!storage.try_load(&mut item(&layout, 2))?);
    assert_eq!(session.server.active_transactions(), 0);
    Ok(())
}

#[test]
fn dropping_a_transaction_exits_it() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    {
        let _txn = session.client.enter_transaction()?;
        storage.insert(&mut full_item(storage.layout(), 3, "scoped"))?;
        assert_eq!(session.server.active_transactions(), 1);
    }
    assert_eq!(session.server.active_transactions(), 0);
    assert!(!storage.try_load(&mut item(storage.layout(), 3))?);
    Ok(())
}

#[test]
fn nested_commit_waits_for_the_outer_one() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut outer = session.client.enter_transaction()?;
    {
        let mut inner = session.client.enter_transaction()?;
        storage.insert(&mut full_item(&layout, 4, "nested"))?;
        assert!(inner.commit()?);
        inner.exit()?;
    }
    // Visible through the outer transaction only.
    assert!(storage.try_load(&mut item(&layout, 4))?);
    let top = session
        .client
        .enter_top_transaction(IsolationLevel::ReadCommitted)?;
    assert!(!storage.try_load(&mut item(&layout, 4))?);
    top.exit()?;

    assert!(outer.commit()?);
    outer.exit()?;
    assert!(storage.try_load(&mut item(&layout, 4))?);
    Ok(())
}

#[test]
fn transaction_properties_travel_to_the_server() -> TestResult {
    let session = Session::new();
    let txn = session
        .client
        .enter_transaction_with(IsolationLevel::Serializable, Some(Duration::from_millis(250)))?;
    assert_eq!(txn.isolation_level(), IsolationLevel::Serializable);
    assert_eq!(txn.remote_isolation_level()?, IsolationLevel::Serializable);
    assert!(!txn.is_for_update()?);
    txn.set_for_update(true)?;
    assert!(txn.is_for_update()?);
    txn.exit()?;
    Ok(())
}

#[test]
fn reconnect_invalidates_open_transactions() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    storage.insert(&mut full_item(&layout, 5, "before"))?;

    let mut txn = session.client.enter_transaction()?;
    let old_session = session.client.session_id();
    session
        .client
        .reconnect(session.restart(ProcedureRegistry::new()))?;
    assert_ne!(session.client.session_id(), old_session);

    let mut changed = item(&layout, 5);
    changed.set("stringProp", "after")?;
    let err = storage.update(&mut changed).unwrap_err();
    assert!(err.is_persist());
    assert!(err.is_transaction_invalid());

    let err = storage.try_load(&mut item(&layout, 5)).unwrap_err();
    assert!(err.is_fetch());
    assert!(err.is_transaction_invalid());

    let err = storage.query().fetch().err().unwrap();
    assert!(err.is_transaction_invalid());

    let err = txn.commit().unwrap_err();
    assert!(err.is_persist());
    assert!(err.is_transaction_invalid());
    assert!(matches!(
        txn.set_for_update(true),
        Err(RepositoryError::TransactionInvalid)
    ));
    txn.exit()?;

    // Outside the lost transaction the new session works as usual.
    let mut reloaded = item(&layout, 5);
    storage.load(&mut reloaded)?;
    assert_eq!(reloaded.get_str("stringProp"), Some("before"));
    Ok(())
}

#[test]
fn nesting_under_an_invalid_transaction_fails_fast() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let outer = session.client.enter_transaction()?;
    session
        .client
        .reconnect(session.restart(ProcedureRegistry::new()))?;
    let mut inner = session.client.enter_transaction()?;
    assert!(inner.is_failed());

    let err = storage
        .insert(&mut full_item(&layout, 6, "never"))
        .unwrap_err();
    assert!(err.is_transaction_invalid());
    assert!(txn_commit_is_invalid(&mut inner));
    inner.exit()?;
    outer.exit()?;

    storage.insert(&mut full_item(&layout, 6, "fresh"))?;
    Ok(())
}

fn txn_commit_is_invalid(txn: &mut remora::ClientTransaction) -> bool {
    txn.commit()
        .err()
        .map(|err| err.is_persist() && err.is_transaction_invalid())
        .unwrap_or(false)
}

#[test]
fn sequences_survive_a_reconnect() -> TestResult {
    let session = Session::new();
    let sequence = session.client.sequence("orders")?;
    assert_eq!(sequence.next_long()?, 1);
    assert_eq!(sequence.next_int()?, 2);
    assert_eq!(sequence.next_decimal()?, "3");
    assert_eq!(sequence.next_numerical(16, 3)?, "004");
    assert!(!sequence.return_reserved_values()?);

    session
        .client
        .reconnect(session.restart(ProcedureRegistry::new()))?;
    let same = session.client.sequence("orders")?;
    assert!(std::sync::Arc::ptr_eq(&sequence, &same));
    assert_eq!(sequence.next_long()?, 5);
    Ok(())
}

#[test]
fn closing_the_session_aborts_its_transactions() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(&layout, 9, "orphan"))?;
    session.server.close();
    assert_eq!(session.server.active_transactions(), 0);

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, RepositoryError::TransactionAborted(_)));
    assert!(err.is_persist());
    drop(txn);
    session.transport.close();
    assert!(session.transport.is_closed());

    let reader = session.restart(ProcedureRegistry::new());
    let fresh = remora::ClientRepository::connect(reader)?;
    let storage = fresh.storage_for(item_layout())?;
    assert!(!storage.try_load(&mut item(&layout, 9))?);
    Ok(())
}

#[test]
fn reconnect_to_the_same_server_invalidates_open_transactions() -> TestResult {
    let session = Session::with(
        ProcedureRegistry::new(),
        ClientOptions::new().keepalive_interval(None),
        100,
    );
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(&layout, 1, "before"))?;
    session.client.reconnect(session.transport.clone())?;
    assert_eq!(session.server.active_transactions(), 0);

    // Rejected locally: neither call reaches the server.
    let calls = session.transport.calls();
    let err = storage
        .insert(&mut full_item(&layout, 2, "stale"))
        .unwrap_err();
    assert!(err.is_transaction_invalid());
    let err = txn.commit().unwrap_err();
    assert!(err.is_transaction_invalid());
    assert!(txn.is_failed());
    txn.exit()?;
    assert_eq!(session.transport.calls(), calls);

    assert!(!storage.try_load(&mut item(&layout, 1))?);
    assert!(!storage.try_load(&mut item(&layout, 2))?);
    Ok(())
}

#[test]
fn commit_right_after_reconnect_is_invalid() -> TestResult {
    let session = Session::new();
    let mut txn = session.client.enter_transaction()?;
    session
        .client
        .reconnect(session.restart(ProcedureRegistry::new()))?;
    let err = txn.commit().unwrap_err();
    assert!(err.is_persist());
    assert!(err.is_transaction_invalid());
    Ok(())
}

#[test]
fn records_loaded_before_a_reconnect_still_update() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    storage.insert(&mut full_item(&layout, 7, "loaded"))?;
    let mut loaded = item(&layout, 7);
    storage.load(&mut loaded)?;

    session
        .client
        .reconnect(session.restart(ProcedureRegistry::new()))?;
    loaded.set("stringProp", "updated after reconnect")?;
    storage.update(&mut loaded)?;
    assert_eq!(loaded.get_i32("intProp"), Some(70));

    let mut reloaded = item(&layout, 7);
    storage.load(&mut reloaded)?;
    assert_eq!(reloaded.get_str("stringProp"), Some("updated after reconnect"));
    Ok(())
}

#[test]
fn keepalive_holds_the_lease_of_a_quiet_client() -> TestResult {
    let session = Session::with_server(
        ProcedureRegistry::new(),
        ClientOptions::new().keepalive_interval(Some(Duration::from_millis(30))),
        ServerOptions::new().client_idle_timeout(Duration::from_millis(200)),
    );
    let storage = session.client.storage_for(item_layout())?;
    let mut txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(storage.layout(), 8, "quiet"))?;

    thread::sleep(Duration::from_millis(500));
    session.server.expire_idle_clients();
    assert!(txn.commit()?);
    txn.exit()?;
    assert!(storage.try_load(&mut item(storage.layout(), 8))?);
    Ok(())
}

#[test]
fn silent_client_loses_its_transactions() -> TestResult {
    let session = Session::with_server(
        ProcedureRegistry::new(),
        ClientOptions::new().keepalive_interval(None),
        ServerOptions::new().client_idle_timeout(Duration::from_millis(100)),
    );
    let storage = session.client.storage_for(item_layout())?;
    let mut txn = session.client.enter_transaction()?;
    storage.insert(&mut full_item(storage.layout(), 9, "abandoned"))?;

    thread::sleep(Duration::from_millis(250));
    assert_eq!(session.server.expire_idle_clients(), 1);
    assert_eq!(session.server.active_transactions(), 0);
    let err = txn.commit().unwrap_err();
    assert!(err.is_transaction_invalid());
    drop(txn);

    session.client.reconnect(session.transport.clone())?;
    assert!(!storage.try_load(&mut item(storage.layout(), 9))?);
    Ok(())
}
