//! End-to-end proxy request flows over in-memory streams.

use std::sync::Arc;

use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use mail_core::{
    attr::{AttrReader, AttrWriter},
    proto::{
        ProxyStatus, ATTR_FLAGS, ATTR_KEY, ATTR_REQUEST, ATTR_STATUS, ATTR_TABLE, ATTR_VALUE,
        REQ_PROXY_LOOKUP, REQ_PROXY_OPEN,
    },
    server::ConnectionError,
    table::{MemoryTable, Table, TableError},
};
use proxymap::{ApprovedSet, ProxyWorker};

struct Client {
    reader: AttrReader<ReadHalf<DuplexStream>>,
    writer: AttrWriter<WriteHalf<DuplexStream>>,
}

fn connect(worker: &Arc<ProxyWorker>) -> (Client, JoinHandle<Result<(), ConnectionError>>) {
    let (client_side, server_side) = duplex(4096);
    let worker = worker.clone();
    let server = tokio::spawn(async move { worker.handle_stream(server_side).await });
    let (read_half, write_half) = tokio::io::split(client_side);
    (
        Client {
            reader: AttrReader::wrapping(read_half),
            writer: AttrWriter::wrapping(write_half),
        },
        server,
    )
}

impl Client {
    async fn open(&mut self, table: &str, flags: i64) -> (i64, i64) {
        self.writer
            .write_string(ATTR_REQUEST, REQ_PROXY_OPEN)
            .write_string(ATTR_TABLE, table)
            .write_number(ATTR_FLAGS, flags);
        self.writer.finish().await.unwrap();
        let status = self.reader.read_number(ATTR_STATUS).await.unwrap();
        let handle_flags = self.reader.read_number(ATTR_FLAGS).await.unwrap();
        self.reader.expect_end().await.unwrap();
        (status, handle_flags)
    }

    async fn lookup(&mut self, table: &str, flags: i64, key: &str) -> (i64, String) {
        self.writer
            .write_string(ATTR_REQUEST, REQ_PROXY_LOOKUP)
            .write_string(ATTR_TABLE, table)
            .write_number(ATTR_FLAGS, flags)
            .write_string(ATTR_KEY, key);
        self.writer.finish().await.unwrap();
        let status = self.reader.read_number(ATTR_STATUS).await.unwrap();
        let value = self.reader.read_string(ATTR_VALUE).await.unwrap();
        self.reader.expect_end().await.unwrap();
        (status, value)
    }

    async fn read_status_only(&mut self) -> i64 {
        let status = self.reader.read_number(ATTR_STATUS).await.unwrap();
        self.reader.expect_end().await.unwrap();
        status
    }
}

fn seeded_worker() -> Arc<ProxyWorker> {
    let approved = ApprovedSet::parse("proxy:memory:a proxy:proxy:memory:b proxy:memory:seeded non:x");
    let worker = Arc::new(ProxyWorker::new(approved));
    let seeded = MemoryTable::new("seeded", 0);
    seeded.update("root", "postmaster").unwrap();
    worker.register_table("memory:seeded", 0, Arc::new(seeded));
    worker
}

#[tokio::test]
async fn canonicalization_gates_open_requests() {
    let worker = seeded_worker();
    let (mut client, server) = connect(&worker);

    // Any number of leading proxy: prefixes canonicalizes away.
    let (status, _) = client.open("proxy:proxy:memory:a", 0).await;
    assert_eq!(status, ProxyStatus::Ok.code());

    // The bare canonical form is gated identically.
    let (status, _) = client.open("memory:b", 0).await;
    assert_eq!(status, ProxyStatus::Ok.code());
    let (status, _) = client.open("memory:a", 0).await;
    assert_eq!(status, ProxyStatus::Ok.code());

    // Not on the list at all.
    let (status, flags) = client.open("memory:c", 0).await;
    assert_eq!(status, ProxyStatus::Deny.code());
    assert_eq!(flags, 0);

    // Operator tokens without the proxy: prefix are not approved here.
    let (status, _) = client.open("non:x", 0).await;
    assert_eq!(status, ProxyStatus::Deny.code());

    // No type separator left after stripping.
    let (status, _) = client.open("proxy:proxy:", 0).await;
    assert_eq!(status, ProxyStatus::Bad.code());

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_opens_share_one_handle() {
    let worker = seeded_worker();
    let (mut client, server) = connect(&worker);

    let (status, first_flags) = client.open("proxy:memory:a", 0o1).await;
    assert_eq!(status, ProxyStatus::Ok.code());
    assert_eq!(worker.open_table_count(), 2, "seeded handle plus this one");

    let (status, second_flags) = client.open("memory:a", 0o1).await;
    assert_eq!(status, ProxyStatus::Ok.code());
    assert_eq!(second_flags, first_flags);
    assert_eq!(worker.open_table_count(), 2, "no additional backend open");

    // A different flag value is a different handle, intentionally.
    let (status, _) = client.open("memory:a", 0o2).await;
    assert_eq!(status, ProxyStatus::Ok.code());
    assert_eq!(worker.open_table_count(), 3);

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn lookup_statuses() {
    let worker = seeded_worker();
    let (mut client, server) = connect(&worker);

    // A first-time lookup opens the table implicitly; no prior open needed.
    let (status, value) = client.lookup("proxy:memory:seeded", 0, "root").await;
    assert_eq!(status, ProxyStatus::Ok.code());
    assert_eq!(value, "postmaster");

    let (status, value) = client.lookup("memory:seeded", 0, "nobody").await;
    assert_eq!(status, ProxyStatus::NoKey.code());
    assert_eq!(value, "");

    let (status, value) = client.lookup("memory:c", 0, "root").await;
    assert_eq!(status, ProxyStatus::Deny.code());
    assert_eq!(value, "");

    let (status, _) = client.lookup("bare-name", 0, "root").await;
    assert_eq!(status, ProxyStatus::Bad.code());

    drop(client);
    server.await.unwrap().unwrap();
}

struct FlakyTable;

impl Table for FlakyTable {
    fn lookup(&self, _key: &str) -> Result<Option<String>, TableError> {
        Err(TableError::Io(std::io::Error::other("backend down")))
    }

    fn update(&self, _key: &str, _value: &str) -> Result<(), TableError> {
        Err(TableError::Io(std::io::Error::other("backend down")))
    }

    fn delete(&self, _key: &str) -> Result<bool, TableError> {
        Err(TableError::Io(std::io::Error::other("backend down")))
    }

    fn flags(&self) -> u32 {
        0
    }
}

#[tokio::test]
async fn transient_backend_error_maps_to_retry() {
    let approved = ApprovedSet::parse("proxy:flaky:backend");
    let worker = Arc::new(ProxyWorker::new(approved));
    worker.register_table("flaky:backend", 0, Arc::new(FlakyTable));
    let (mut client, server) = connect(&worker);

    let (status, value) = client.lookup("flaky:backend", 0, "anything").await;
    assert_eq!(status, ProxyStatus::Retry.code());
    assert_eq!(value, "");

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_request_keeps_connection_open() {
    let worker = seeded_worker();
    let (mut client, server) = connect(&worker);

    client.writer.write_string(ATTR_REQUEST, "close");
    client.writer.finish().await.unwrap();
    assert_eq!(client.read_status_only().await, ProxyStatus::Bad.code());

    // The connection is still good for real requests.
    let (status, _) = client.open("memory:a", 0).await;
    assert_eq!(status, ProxyStatus::Ok.code());

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_body_collapses_to_bad() {
    let worker = seeded_worker();
    let (mut client, server) = connect(&worker);

    // A lookup frame with the wrong field name in place of `table`.
    client
        .writer
        .write_string(ATTR_REQUEST, REQ_PROXY_LOOKUP)
        .write_string("tabel", "memory:a")
        .write_number(ATTR_FLAGS, 0)
        .write_string(ATTR_KEY, "root");
    client.writer.finish().await.unwrap();
    let status = client.reader.read_number(ATTR_STATUS).await.unwrap();
    let value = client.reader.read_string(ATTR_VALUE).await.unwrap();
    client.reader.expect_end().await.unwrap();
    assert_eq!(status, ProxyStatus::Bad.code());
    assert_eq!(value, "");

    let (status, _) = client.open("memory:b", 0).await;
    assert_eq!(status, ProxyStatus::Ok.code());

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn approved_but_unopenable_table_aborts_the_worker() {
    let approved = ApprovedSet::parse("proxy:file:/nonexistent/dir/map.db");
    let worker = Arc::new(ProxyWorker::new(approved));
    let (mut client, server) = connect(&worker);

    client
        .writer
        .write_string(ATTR_REQUEST, REQ_PROXY_OPEN)
        .write_string(ATTR_TABLE, "file:/nonexistent/dir/map.db")
        .write_number(ATTR_FLAGS, 0);
    client.writer.finish().await.unwrap();

    assert!(matches!(
        server.await.unwrap(),
        Err(ConnectionError::Fatal(_))
    ));
}
