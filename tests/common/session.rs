#![allow(dead_code)]

use remora::engine::MapRepository;
use remora::server::{ProcedureRegistry, RemoteRepositoryServer};
use remora::{
    ClientOptions, ClientRepository, MemoryTransport, Record, RecordLayout, ServerOptions,
    ValueKind,
};
use std::error::Error;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Layout of the `Item` type every test session defines.
pub fn item_layout() -> RecordLayout {
    RecordLayout::builder("Item")
        .key("id", ValueKind::Int)
        .property("stringProp", ValueKind::String)
        .property("intProp", ValueKind::Int)
        .property("longProp", ValueKind::Long)
        .property("doubleProp", ValueKind::Double)
        .build()
        .expect("item layout is valid")
}

/// An engine repository, the session serving it and a client connected to
/// that session in process.
pub struct Session {
    pub engine: MapRepository,
    pub server: Arc<RemoteRepositoryServer>,
    pub transport: Arc<MemoryTransport>,
    pub client: ClientRepository,
}

impl Session {
    pub fn new() -> Self {
        Self::with(ProcedureRegistry::new(), ClientOptions::default(), 100)
    }

    pub fn with(procedures: ProcedureRegistry, options: ClientOptions, batch_size: usize) -> Self {
        Self::with_server(
            procedures,
            options,
            ServerOptions::new().fetch_batch_size(batch_size),
        )
    }

    pub fn with_server(
        procedures: ProcedureRegistry,
        options: ClientOptions,
        server_options: ServerOptions,
    ) -> Self {
        let engine = MapRepository::new("test");
        engine.define(item_layout()).expect("define item");
        let server = serve(&engine, procedures, server_options);
        let transport = MemoryTransport::new(server.clone());
        let client = ClientRepository::connect_with(transport.clone(), options)
            .expect("client connects");
        Self {
            engine,
            server,
            transport,
            client,
        }
    }

    /// A fresh session over the same engine, as a restarted server would
    /// offer after a reconnect.
    pub fn restart(&self, procedures: ProcedureRegistry) -> Arc<MemoryTransport> {
        MemoryTransport::new(serve(
            &self.engine,
            procedures,
            ServerOptions::new().fetch_batch_size(100),
        ))
    }
}

fn serve(
    engine: &MapRepository,
    procedures: ProcedureRegistry,
    options: ServerOptions,
) -> Arc<RemoteRepositoryServer> {
    RemoteRepositoryServer::builder(Arc::new(engine.clone()))
        .options(options)
        .procedures(procedures)
        .build()
}

pub fn item(layout: &Arc<RecordLayout>, id: i32) -> Record {
    let mut record = Record::new(layout.clone());
    record.set("id", id).expect("id is a key");
    record
}

pub fn full_item(layout: &Arc<RecordLayout>, id: i32, text: &str) -> Record {
    let mut record = item(layout, id);
    record.set("stringProp", text).expect("stringProp");
    record.set("intProp", id * 10).expect("intProp");
    record.set("longProp", i64::from(id) * 1_000).expect("longProp");
    record.set("doubleProp", f64::from(id) / 4.0).expect("doubleProp");
    record
}

/// Reserves and returns an ephemeral loopback address.
pub fn next_loopback() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}
