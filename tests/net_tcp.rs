#![cfg(feature = "net")]

#[path = "common/session.rs"]
mod common;

use common::{full_item, item, item_layout, next_loopback, TestResult};
use remora::engine::MapRepository;
use remora::net::RepositoryNetworkServer;
use remora::transport::TcpConnector;
use remora::{
    ClientOptions, ClientRepository, RelOp, RemoteRepositoryServer, RepositoryError,
    ServerOptions, TcpConnectorOptions, TcpServerConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn engine() -> MapRepository {
    let engine = MapRepository::new("tcp");
    engine.define(item_layout()).expect("define item");
    engine
}

#[test]
fn tcp_session_round_trip() -> TestResult {
    let session = RemoteRepositoryServer::new(Arc::new(engine()));
    let mut handle = RepositoryNetworkServer::spawn(
        TcpServerConfig::new("127.0.0.1:0".parse()?).max_connections(64),
        session,
    )?;
    let connector = Arc::new(TcpConnector::to_addr(handle.local_addr()));
    let client = ClientRepository::connect(connector)?;
    assert_eq!(client.name(), "tcp");
    assert_eq!(client.session_id(), handle.session().session_id());

    let storage = client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    for id in 0..130 {
        storage.insert(&mut full_item(&layout, id, "tcp"))?;
    }

    let mut txn = client.enter_transaction()?;
    let mut record = item(&layout, 7);
    record.set("stringProp", "updated")?;
    storage.update(&mut record)?;
    let rows = storage
        .query()
        .filter("id", RelOp::Lt, 120)
        .order_by("id")
        .fetch()?
        .to_vec()?;
    assert_eq!(rows.len(), 120);
    assert_eq!(rows[7].get_str("stringProp"), Some("updated"));
    assert!(txn.commit()?);
    txn.exit()?;

    handle.try_shutdown(Duration::from_secs(5))?;
    assert!(handle.session().is_closed());
    Ok(())
}

#[test]
fn connector_gives_up_after_its_retries() -> TestResult {
    let addr = next_loopback();
    let options = TcpConnectorOptions::new()
        .socket_timeout(Duration::from_millis(200))
        .retry_backoff(2, Duration::from_millis(5));
    let connector = Arc::new(TcpConnector::with_options(
        addr.ip().to_string(),
        addr.port(),
        options,
    ));
    let err = ClientRepository::connect(connector).err().unwrap();
    assert!(matches!(err, RepositoryError::Io(_)));
    Ok(())
}

#[test]
fn reconnect_moves_to_a_new_listener() -> TestResult {
    let shared = engine();
    let first = RepositoryNetworkServer::spawn(
        TcpServerConfig::new("127.0.0.1:0".parse()?),
        RemoteRepositoryServer::new(Arc::new(shared.clone())),
    )?;
    let client = ClientRepository::connect(Arc::new(TcpConnector::to_addr(first.local_addr())))?;
    let storage = client.storage_for(item_layout())?;
    storage.insert(&mut full_item(storage.layout(), 1, "first"))?;
    let txn = client.enter_transaction()?;
    drop(first);

    let second = RepositoryNetworkServer::spawn(
        TcpServerConfig::new("127.0.0.1:0".parse()?),
        RemoteRepositoryServer::new(Arc::new(shared)),
    )?;
    client.reconnect(Arc::new(TcpConnector::to_addr(second.local_addr())))?;
    let err = storage
        .insert(&mut full_item(storage.layout(), 2, "lost"))
        .unwrap_err();
    assert!(err.is_transaction_invalid());
    txn.exit()?;
    assert!(storage.try_load(&mut item(storage.layout(), 1))?);
    Ok(())
}

#[test]
fn reconnect_to_the_same_listener_invalidates_transactions() -> TestResult {
    let handle = RepositoryNetworkServer::spawn(
        TcpServerConfig::new("127.0.0.1:0".parse()?),
        RemoteRepositoryServer::new(Arc::new(engine())),
    )?;
    let client = ClientRepository::connect(Arc::new(TcpConnector::to_addr(handle.local_addr())))?;
    let storage = client.storage_for(item_layout())?;
    storage.insert(&mut full_item(storage.layout(), 1, "committed"))?;

    let mut txn = client.enter_transaction()?;
    assert_eq!(handle.session().active_transactions(), 1);
    let session = client.session_id();
    client.reconnect(Arc::new(TcpConnector::to_addr(handle.local_addr())))?;
    assert_eq!(client.session_id(), session);
    assert_eq!(handle.session().active_transactions(), 0);

    let err = storage
        .insert(&mut full_item(storage.layout(), 2, "lost"))
        .unwrap_err();
    assert!(err.is_transaction_invalid());
    let err = txn.commit().unwrap_err();
    assert!(err.is_transaction_invalid());
    txn.exit()?;

    assert!(storage.try_load(&mut item(storage.layout(), 1))?);
    assert!(!storage.try_load(&mut item(storage.layout(), 2))?);
    Ok(())
}

#[test]
fn listener_reaps_leases_of_vanished_clients() -> TestResult {
    let session = RemoteRepositoryServer::builder(Arc::new(engine()))
        .options(ServerOptions::new().client_idle_timeout(Duration::from_millis(100)))
        .build();
    let handle = RepositoryNetworkServer::spawn(
        TcpServerConfig::new("127.0.0.1:0".parse()?),
        session,
    )?;
    let client = ClientRepository::connect_with(
        Arc::new(TcpConnector::to_addr(handle.local_addr())),
        ClientOptions::new().keepalive_interval(None),
    )?;
    let storage = client.storage_for(item_layout())?;
    let txn = client.enter_transaction()?;
    storage.insert(&mut full_item(storage.layout(), 3, "vanished"))?;
    assert_eq!(handle.session().active_transactions(), 1);

    // No further calls arrive; the listener's own sweep retires the lease.
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.session().active_transactions() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(handle.session().active_transactions(), 0);
    assert_eq!(handle.session().client_count(), 0);
    drop(txn);
    Ok(())
}
