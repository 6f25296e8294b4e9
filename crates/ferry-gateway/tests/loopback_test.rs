/// Integration tests: run the real listener on loopback and talk to it with
/// the requester side of the protocol.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};

use ferry_gateway::{Listener, ListenerConfig, Registry};
use ferry_proto::{
    Error, FileRoot, MAX_LINE_BYTES, NullLogger, ReasonCode, Response, TcpChannel, request_file,
};

struct TestServer {
    addr: SocketAddr,
    registry: Registry,
    _tmp: tempfile::TempDir,
    downloads: FileRoot,
    files: FileRoot,
}

async fn start(config: ListenerConfig) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let files = FileRoot::new(tmp.path().join("server_files")).await.unwrap();
    let downloads = FileRoot::new(tmp.path().join("downloads")).await.unwrap();

    let listener = Listener::new(files.clone(), config, Arc::new(NullLogger));
    let registry = listener.registry().clone();
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(listener.run(socket));

    TestServer { addr, registry, _tmp: tmp, downloads, files }
}

async fn connect(server: &TestServer) -> TcpChannel {
    TcpChannel::from_tcp(TcpStream::connect(server.addr).await.unwrap())
}

async fn wait_for_peers(registry: &Registry, n: usize) {
    for _ in 0..300 {
        if registry.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} peers, have {}", n, registry.len());
}

fn write_pattern(path: &Path, size: usize) -> String {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, &data).unwrap();
    hex::encode(Sha256::digest(&data))
}

#[tokio::test]
async fn transfer_one_megabyte() {
    let server = start(ListenerConfig::default()).await;
    let expected = write_pattern(&server.files.dir().join("report.pdf"), 1_048_576);

    let mut client = connect(&server).await;
    let outcome = request_file(&mut client, &server.downloads, "report.pdf", &NullLogger)
        .await
        .unwrap();

    assert_eq!(outcome.metadata.name, "report.pdf");
    assert_eq!(outcome.metadata.size, 1_048_576);
    assert_eq!(outcome.metadata.checksum, expected);
    assert_eq!(outcome.actual_checksum, expected);
    assert_eq!(
        std::fs::read(server.files.dir().join("report.pdf")).unwrap(),
        std::fs::read(&outcome.path).unwrap()
    );

    // The connection is still usable afterwards.
    let again = request_file(&mut client, &server.downloads, "report.pdf", &NullLogger)
        .await
        .unwrap();
    assert!(again.verified());
}

#[tokio::test]
async fn raw_handshake_matches_wire_format() {
    let server = start(ListenerConfig::default()).await;
    let expected = write_pattern(&server.files.dir().join("small.bin"), 300);

    let mut client = connect(&server).await;
    client.send_line("FILE small.bin").await.unwrap();
    let ok = client.recv_line(MAX_LINE_BYTES).await.unwrap().unwrap();
    assert_eq!(ok, format!("OK small.bin 300 {}", expected));

    client.send_line("READY").await.unwrap();
    let mut payload = vec![0u8; 300];
    client.recv_exact(&mut payload).await.unwrap();
    assert_eq!(hex::encode(Sha256::digest(&payload)), expected);
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let server = start(ListenerConfig::default()).await;
    let mut client = connect(&server).await;

    let err = request_file(&mut client, &server.downloads, "nope.txt", &NullLogger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ReasonCode::NotFound)));
    assert!(!server.downloads.dir().join("nope.txt").exists());
}

#[tokio::test]
async fn zero_length_file() {
    let server = start(ListenerConfig::default()).await;
    std::fs::write(server.files.dir().join("empty.txt"), b"").unwrap();

    let mut client = connect(&server).await;
    let outcome = request_file(&mut client, &server.downloads, "empty.txt", &NullLogger)
        .await
        .unwrap();
    assert_eq!(outcome.metadata.size, 0);
    assert_eq!(outcome.metadata.checksum, hex::encode(Sha256::digest(b"")));
    assert!(outcome.verified());
}

#[tokio::test]
async fn chat_reaches_everyone_but_sender() {
    let server = start(ListenerConfig::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let mut carol = connect(&server).await;
    wait_for_peers(&server.registry, 3).await;

    alice.send_line("CHAT hello all").await.unwrap();
    for peer in [&mut bob, &mut carol] {
        let line = peer.recv_line(MAX_LINE_BYTES).await.unwrap().unwrap();
        assert!(line.starts_with("CHAT_FROM_SERVER 127.0.0.1:"), "{}", line);
        assert!(line.ends_with(": hello all"), "{}", line);
    }

    // Alice got nothing; her next line is the answer to her next request.
    alice.send_line("BOGUS").await.unwrap();
    assert_eq!(
        alice.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(),
        Some("ERROR unknown-command")
    );
}

#[tokio::test]
async fn chat_waits_for_payload_to_finish() {
    let server = start(ListenerConfig::default()).await;
    let expected = write_pattern(&server.files.dir().join("big.bin"), 512 * 1024);

    let mut client = connect(&server).await;
    wait_for_peers(&server.registry, 1).await;

    client.send_line("FILE big.bin").await.unwrap();
    let ok = client.recv_line(MAX_LINE_BYTES).await.unwrap().unwrap();
    let Response::Ok(meta) = Response::parse(&ok).unwrap() else {
        panic!("expected OK, got {}", ok);
    };

    // Queued while the handler sits in the handshake.
    let report = server.registry.broadcast(None, "server: mid-transfer");
    assert_eq!(report.delivered, 1);

    client.send_line("READY").await.unwrap();
    let mut payload = vec![0u8; meta.size as usize];
    client.recv_exact(&mut payload).await.unwrap();
    assert_eq!(hex::encode(Sha256::digest(&payload)), expected);

    assert_eq!(
        client.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(),
        Some("CHAT_FROM_SERVER server: mid-transfer")
    );
}

#[tokio::test]
async fn quit_and_disconnect_unregister() {
    let server = start(ListenerConfig::default()).await;
    let mut quitter = connect(&server).await;
    let dropper = connect(&server).await;
    wait_for_peers(&server.registry, 2).await;

    quitter.send_line("QUIT").await.unwrap();
    assert!(quitter.recv_line(MAX_LINE_BYTES).await.unwrap().is_none());
    wait_for_peers(&server.registry, 1).await;

    drop(dropper);
    wait_for_peers(&server.registry, 0).await;
}

#[tokio::test]
async fn connections_beyond_cap_are_closed() {
    let config = ListenerConfig { max_connections: 1, ..ListenerConfig::default() };
    let server = start(config).await;

    let mut first = connect(&server).await;
    wait_for_peers(&server.registry, 1).await;

    let mut second = connect(&server).await;
    assert!(second.recv_line(MAX_LINE_BYTES).await.unwrap_or(None).is_none());
    assert_eq!(server.registry.len(), 1);

    // A slot frees up once the first client leaves.
    first.send_line("QUIT").await.unwrap();
    wait_for_peers(&server.registry, 0).await;
    // The permit is released just after the registry entry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut third = connect(&server).await;
    wait_for_peers(&server.registry, 1).await;
    third.send_line("FILE").await.unwrap();
    assert_eq!(
        third.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(),
        Some("ERROR missing-filename")
    );
}
