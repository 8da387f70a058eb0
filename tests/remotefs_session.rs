//! End-to-end exercise of the full stack: a duplex pipe stands in for
//! the network connection, one [`Session`] serves a [`RemoteFsService`]
//! over a real snapshot directory, and the other drives it through
//! [`RemoteFsClient`].

use pbs_agent_core::manager::SessionManager;
use pbs_agent_core::mux::Multiplex;
use pbs_agent_core::remotefs::client::RemoteFsClient;
use pbs_agent_core::remotefs::server::RemoteFsService;
use pbs_agent_core::remotefs::SnapshotHandle;
use pbs_agent_core::session::Session;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    tempdir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        std::fs::write(tempdir.path().join("test1.txt"), b"test file 1 content").unwrap();
        std::fs::write(tempdir.path().join("test2.txt"), b"second file").unwrap();
        std::fs::create_dir(tempdir.path().join("subdir")).unwrap();
        Fixture { tempdir }
    }

    fn snapshot(&self) -> SnapshotHandle {
        SnapshotHandle {
            snapshot_path: self.tempdir.path().to_path_buf(),
            drive_letter: "C".to_string(),
        }
    }
}

async fn connected_pair(job_id: &str, snapshot: SnapshotHandle) -> (Arc<Session>, Arc<RemoteFsClient>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (c_read, c_write) = tokio::io::split(client_io);
    let (s_read, s_write) = tokio::io::split(server_io);
    let client_mux = Multiplex::new(c_read, c_write, true);
    let server_mux = Multiplex::new(s_read, s_write, false);

    let manager = Arc::new(SessionManager::new());
    let server_session = manager
        .get_or_create("agent-under-test", server_mux, "pbs-agent-core/test")
        .await;
    let service = RemoteFsService::new(job_id.to_string(), snapshot);
    service.register(&server_session.router);
    tokio::spawn(server_session.clone().serve_forever());

    let client_session = Session::new(client_mux, "pbs-agent-core/test");
    let fs_client = RemoteFsClient::new(client_session, job_id.to_string());
    (server_session, fs_client)
}

#[tokio::test]
async fn stat_read_dir_and_read_at_round_trip() {
    let fixture = Fixture::new();
    let (_server, client) = connected_pair("job-1", fixture.snapshot()).await;

    let info = client.stat("test1.txt").await.expect("stat succeeds");
    assert_eq!(info.size, 20);
    assert!(!info.is_dir);

    let entries = client.read_dir("").await.expect("read_dir succeeds");
    let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["subdir", "test1.txt", "test2.txt"]);

    let file = client.open("test1.txt", 0).await.expect("open succeeds");
    let mut buf = [0u8; 64];
    let n = file.read_at(&mut buf, 0).await.expect("read_at succeeds");
    assert_eq!(&buf[..n], b"test file 1 content");
    file.close().await.expect("close succeeds");
}

#[tokio::test]
async fn write_open_is_rejected_end_to_end() {
    let fixture = Fixture::new();
    let (_server, client) = connected_pair("job-2", fixture.snapshot()).await;

    let err = client
        .open("test1.txt", pbs_agent_core::remotefs::open_flags::WRONLY)
        .await
        .unwrap_err();
    assert!(matches!(err, pbs_agent_core::Error::Invalid(_)));
}

#[tokio::test]
async fn stat_cache_avoids_a_second_round_trip() {
    let fixture = Fixture::new();
    let (server, client) = connected_pair("job-3", fixture.snapshot()).await;

    client.stat("test2.txt").await.unwrap();
    server.close().await;

    // The connection is now closed server-side, so a second stat for the
    // same path must come from the client's cache rather than retrying
    // the call.
    let info = client.stat("test2.txt").await.expect("cached stat succeeds");
    assert_eq!(info.size, 11);
}

#[tokio::test]
async fn path_traversal_is_rejected_end_to_end() {
    let fixture = Fixture::new();
    let (_server, client) = connected_pair("job-4", fixture.snapshot()).await;

    let err = client.stat("../../etc/passwd").await.unwrap_err();
    assert!(matches!(err, pbs_agent_core::Error::PathError { .. }));
}
