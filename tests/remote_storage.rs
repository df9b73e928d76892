#[path = "common/session.rs"]
mod common;

use common::{full_item, item, item_layout, Session, TestResult};
use remora::{RecordLayout, RelOp, RepositoryError, ValueKind};

#[test]
fn inserted_record_loads_back_unchanged() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let mut record = item(&layout, 2);
    record.set("stringProp", "world")?;
    record.set("intProp", 321)?;
    record.set("longProp", 313_244_232_323_432i64)?;
    record.set("doubleProp", 1.423423)?;
    storage.insert(&mut record)?;
    assert_eq!(record.dirty_properties().count(), 0);

    let mut loaded = item(&layout, 2);
    storage.load(&mut loaded)?;
    assert_eq!(loaded.get_str("stringProp"), Some("world"));
    assert_eq!(loaded.get_i32("intProp"), Some(321));
    assert_eq!(loaded.get_i64("longProp"), Some(313_244_232_323_432));
    assert_eq!(loaded.get_f64("doubleProp"), Some(1.423423));
    Ok(())
}

#[test]
fn strict_wrappers_raise_typed_failures() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();

    let err = storage.load(&mut item(&layout, 7)).unwrap_err();
    assert!(matches!(err, RepositoryError::FetchNone(_)));
    assert!(!storage.try_load(&mut item(&layout, 7))?);

    storage.insert(&mut full_item(&layout, 7, "seven"))?;
    let err = storage.insert(&mut full_item(&layout, 7, "again")).unwrap_err();
    assert!(matches!(err, RepositoryError::UniqueConstraint(_)));

    let err = storage.update(&mut full_item(&layout, 8, "missing")).unwrap_err();
    assert!(matches!(err, RepositoryError::PersistNone(_)));
    let err = storage.delete(&mut item(&layout, 8)).unwrap_err();
    assert!(matches!(err, RepositoryError::PersistNone(_)));

    assert!(storage.try_delete(&mut item(&layout, 7))?);
    assert!(!storage.try_load(&mut item(&layout, 7))?);
    Ok(())
}

#[test]
fn update_returns_the_merged_row() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    storage.insert(&mut full_item(&layout, 3, "before"))?;

    let mut partial = item(&layout, 3);
    partial.set("stringProp", "after")?;
    storage.update(&mut partial)?;
    assert_eq!(partial.get_str("stringProp"), Some("after"));
    assert_eq!(partial.get_i32("intProp"), Some(30));
    assert_eq!(partial.dirty_properties().count(), 0);
    Ok(())
}

#[test]
fn truncate_removes_every_record() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    for id in 0..5 {
        storage.insert(&mut full_item(&layout, id, "row"))?;
    }
    assert_eq!(storage.query().count()?, 5);
    storage.truncate()?;
    assert_eq!(storage.query().count()?, 0);
    Ok(())
}

#[test]
fn storage_proxies_are_shared_per_type() -> TestResult {
    let session = Session::new();
    let first = session.client.storage_for(item_layout())?;
    let second = session.client.storage_for(item_layout())?;
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let other = RecordLayout::builder("Item")
        .key("id", ValueKind::Int)
        .build()?;
    let err = session.client.storage_for(other).err().unwrap();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    Ok(())
}

#[test]
fn supported_properties_follow_the_server_layout() -> TestResult {
    let session = Session::new();
    let extended = RecordLayout::builder("Item")
        .key("id", ValueKind::Int)
        .property("stringProp", ValueKind::String)
        .property("localOnly", ValueKind::Bool)
        .build()?;
    let storage = session.client.storage_for(extended)?;
    assert!(storage.is_property_supported("stringProp"));
    assert!(!storage.is_property_supported("localOnly"));
    Ok(())
}

#[test]
fn query_actions_run_on_the_server() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let layout = storage.layout().clone();
    for id in 0..10 {
        storage.insert(&mut full_item(&layout, id, &format!("n{id}")))?;
    }

    let high = storage.query().filter("id", RelOp::Ge, 6);
    assert_eq!(high.count()?, 4);
    assert!(high.exists()?);

    let one = storage.query().filter("id", RelOp::Eq, 4).load_one()?;
    assert_eq!(one.get_str("stringProp"), Some("n4"));
    assert!(storage
        .query()
        .filter("id", RelOp::Eq, 40)
        .try_load_one()?
        .is_none());

    storage.query().filter("id", RelOp::Eq, 4).delete_one()?;
    assert!(!storage.query().filter("id", RelOp::Eq, 4).try_delete_one()?);
    let err = storage
        .query()
        .filter("id", RelOp::Eq, 4)
        .delete_one()
        .unwrap_err();
    assert!(err.is_persist());

    high.delete_all()?;
    assert_eq!(storage.query().count()?, 5);

    let plan = storage.query().filter("id", RelOp::Lt, 3).print_plan(0)?;
    assert!(plan.unwrap_or_default().starts_with("scan Item where"));
    assert_eq!(storage.query().print_native(0)?, None);
    Ok(())
}

#[test]
fn unknown_query_property_is_rejected() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    let err = storage
        .query()
        .filter("missing", RelOp::Eq, 1)
        .count()
        .unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    Ok(())
}

#[test]
fn closed_client_refuses_calls() -> TestResult {
    let session = Session::new();
    let storage = session.client.storage_for(item_layout())?;
    session.client.close();
    assert!(session.client.is_closed());
    let err = storage
        .try_load(&mut item(storage.layout(), 1))
        .unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalState(_)));
    assert!(session.client.enter_transaction().is_err());
    Ok(())
}
