#[path = "common/session.rs"]
mod common;

use common::{full_item, item, item_layout, Session, TestResult};
use remora::engine::Repository;
use remora::server::{ProcedureRegistry, ProcedureRequest};
use remora::{ClientOptions, ProcedureItem, Record, RepositoryError};
use serde_json::json;

fn echo(_repository: &dyn Repository, request: &mut ProcedureRequest<'_>) -> remora::Result<()> {
    let mut received = Vec::new();
    while let Some(item) = request.receive()? {
        received.push(item);
    }
    let mut reply = request.begin_reply()?;
    reply.send(json!({ "received": received.len() }))?;
    reply.send_all(received)?;
    reply.finish()
}

/// Inserts every record it receives into the caller's transaction.
fn store(repository: &dyn Repository, request: &mut ProcedureRequest<'_>) -> remora::Result<()> {
    let storage = repository.storage_for("Item")?;
    let mut record = storage.prepare();
    let mut stored = 0u32;
    while request.receive_into(&mut record)? {
        if storage.try_insert(request.transaction(), &mut record)? {
            stored += 1;
        }
        record = storage.prepare();
    }
    let bound = request.is_transaction_bound();
    let mut reply = request.begin_reply()?;
    reply.send(json!({ "stored": stored, "bound": bound }))?;
    reply.finish()
}

fn procedures() -> ProcedureRegistry {
    let mut registry = ProcedureRegistry::new();
    registry.register_fn("echo", echo);
    registry.register_fn("store", store);
    registry.register_fn("early", |_repository, request| {
        let mut reply = request.begin_reply()?;
        reply.send(json!("too soon"))?;
        reply.finish()
    });
    registry.register_fn("failing", |_repository, request| {
        while request.receive()?.is_some() {}
        Err(RepositoryError::persist("rejected by procedure"))
    });
    registry.register_fn("panicking", |_repository, _request| panic!("procedure bug"));
    registry.register_fn("silent", |_repository, _request| Ok(()));
    registry
}

fn session() -> Session {
    Session::with(procedures(), ClientOptions::default(), 100)
}

#[test]
fn echo_returns_records_and_payloads() -> TestResult {
    let session = session();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut call = session.client.procedure("echo")?;
    assert!(!call.is_transaction_bound());
    call.send(full_item(&layout, 1, "one"))?;
    call.send(full_item(&layout, 2, "two"))?;
    call.send(ProcedureItem::payload(&vec![1, 2, 3])?)?;
    call.reset()?;
    call.send(full_item(&layout, 3, "three"))?;

    let items = call.fetch_reply()?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(items.len(), 5);
    let header: serde_json::Value = items[0].clone().into_payload()?;
    assert_eq!(header["received"], 4);
    let first = items[1].as_record().expect("record");
    assert_eq!(first.get_str("stringProp"), Some("one"));
    assert_eq!(items[2].as_record().and_then(|r| r.get_i32("id")), Some(2));
    let numbers: Vec<i32> = items[3].clone().into_payload()?;
    assert_eq!(numbers, vec![1, 2, 3]);
    let last: Record = items[4].clone().into_record()?;
    assert_eq!(last.get_f64("doubleProp"), Some(0.75));
    Ok(())
}

#[test]
fn procedure_writes_join_the_callers_transaction() -> TestResult {
    let session = session();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let txn = session.client.enter_transaction()?;
    let mut call = session.client.procedure("store")?;
    assert!(call.is_transaction_bound());
    call.send_all((10..13).map(|id| full_item(&layout, id, "proc")))?;
    let mut reply = call.fetch_reply()?;
    let summary: serde_json::Value = reply.next_item()?.expect("summary").into_payload()?;
    assert_eq!(summary, json!({ "stored": 3, "bound": true }));
    assert!(reply.next_item()?.is_none());
    assert!(reply.is_closed());

    assert!(storage.try_load(&mut item(&layout, 11))?);
    txn.exit()?;
    assert!(!storage.try_load(&mut item(&layout, 11))?);
    Ok(())
}

#[test]
fn execute_runs_to_completion() -> TestResult {
    let session = session();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut call = session.client.procedure("store")?;
    call.send(full_item(&layout, 20, "executed"))?;
    call.execute()?;
    assert!(storage.try_load(&mut item(&layout, 20))?);
    Ok(())
}

#[test]
fn replying_before_reading_the_request_fails_both_sides() -> TestResult {
    let session = session();
    let storage = session.client.storage_for(item_layout())?;

    let mut call = session.client.procedure("early")?;
    call.send(full_item(storage.layout(), 1, "ignored"))?;
    let mut reply = call.fetch_reply()?;
    let err = reply.next_item().unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    assert!(reply.is_closed());
    Ok(())
}

#[test]
fn handler_errors_reach_the_caller() -> TestResult {
    let session = session();
    let mut call = session.client.procedure("failing")?;
    call.send(json!("input"))?;
    let err = call.execute().unwrap_err();
    assert!(err.is_persist());

    let err = session.client.procedure("panicking")?.execute().unwrap_err();
    assert!(matches!(err, RepositoryError::Repository(_)));
    Ok(())
}

#[test]
fn unknown_procedures_are_unsupported() -> TestResult {
    let session = session();
    let err = session.client.procedure("missing")?.execute().unwrap_err();
    assert!(matches!(err, RepositoryError::Unsupported(_)));
    Ok(())
}

#[test]
fn silent_procedures_still_terminate() -> TestResult {
    let session = session();
    let txn = session.client.enter_transaction()?;
    let mut reply = session.client.procedure("silent")?.fetch_reply()?;
    assert!(reply.next_item()?.is_none());
    txn.exit()?;
    Ok(())
}

#[test]
fn async_execution_is_refused_inside_a_transaction() -> TestResult {
    let session = session();
    let txn = session.client.enter_transaction()?;
    let err = session.client.procedure("echo")?.execute_async().unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    txn.exit()?;

    let mut call = session.client.procedure("echo")?;
    call.send(json!({ "fire": "and forget" }))?;
    call.execute_async()?;
    Ok(())
}

#[test]
fn procedures_in_a_lost_transaction_are_invalid() -> TestResult {
    let session = session();
    let txn = session.client.enter_transaction()?;
    session.client.reconnect(session.restart(procedures()))?;

    let err = session.client.procedure("echo")?.execute().unwrap_err();
    assert!(err.is_transaction_invalid());
    txn.exit()?;
    Ok(())
}
