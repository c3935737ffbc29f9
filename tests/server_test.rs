use fileshare::{
    AppState, ConnectionTimeouts, GateLimits, RequestGate, ShareRoot, TOKEN_HEADER, router, serve,
};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start(header_read: Duration, idle: Duration) -> (TempDir, AppState, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello over tcp").unwrap();

    let limits = GateLimits {
        session: Duration::from_secs(3600),
        rate_limit: 100,
        rate_window: Duration::from_secs(60),
        backoff: Duration::from_secs(2),
    };
    let gate = RequestGate::new(ShareRoot::open(dir.path()).unwrap(), limits).unwrap();
    let state = AppState::new(gate);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone(), Duration::from_secs(15));
    tokio::spawn(serve(listener, app, ConnectionTimeouts { header_read, idle }));

    (dir, state, addr)
}

async fn roundtrip(addr: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn serves_download_over_tcp() {
    let (_dir, state, addr) = start(Duration::from_secs(5), Duration::from_secs(5)).await;
    let token = state.gate.tokens().snapshot().value().to_string();

    let response = roundtrip(
        addr,
        format!(
            "GET /api/download/hello.txt HTTP/1.1\r\nHost: localhost\r\n{TOKEN_HEADER}: {token}\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello over tcp"), "{response}");
}

#[tokio::test]
async fn peer_address_drives_cooldown() {
    let (_dir, state, addr) = start(Duration::from_secs(5), Duration::from_secs(5)).await;
    let token = state.gate.tokens().snapshot().value().to_string();

    let bad = "GET /api/files HTTP/1.1\r\nHost: localhost\r\nX-Auth-Token: nope\r\nConnection: close\r\n\r\n";
    let response = roundtrip(addr, bad.to_string()).await;
    assert!(response.starts_with("HTTP/1.1 401"), "{response}");

    // Same loopback source, correct token, still inside the cooldown.
    let good = format!(
        "GET /api/files HTTP/1.1\r\nHost: localhost\r\nX-Auth-Token: {token}\r\nConnection: close\r\n\r\n"
    );
    let response = roundtrip(addr, good).await;
    assert!(response.starts_with("HTTP/1.1 429"), "{response}");
}

#[tokio::test]
async fn silent_connection_is_closed() {
    let (_dir, _state, addr) =
        start(Duration::from_millis(200), Duration::from_millis(300)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Send a partial request head and stall.
    stream.write_all(b"GET /api/files HTTP/1.1\r\n").await.unwrap();

    let mut buf = [0u8; 1024];
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    assert!(result.is_ok(), "connection stayed open");
}

/// Open descriptors of this process that point at `path`.
#[cfg(target_os = "linux")]
fn open_handles(path: &std::path::Path) -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|fd| std::fs::read_link(fd.ok()?.path()).ok())
        .filter(|target| target == path)
        .count()
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn aborted_download_releases_file() {
    let (dir, state, addr) = start(Duration::from_secs(5), Duration::from_secs(5)).await;
    let token = state.gate.tokens().snapshot().value().to_string();

    // Far larger than the socket buffers, so the transfer is still running
    // when the client goes away.
    let big = dir.path().join("big.bin");
    std::fs::write(&big, vec![0x5au8; 64 * 1024 * 1024]).unwrap();
    let big = std::fs::canonicalize(&big).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/download/big.bin HTTP/1.1\r\nHost: localhost\r\n{TOKEN_HEADER}: {token}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = 0;
    let mut buf = [0u8; 4096];
    while received < 16 * 1024 {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "server closed the connection early");
        received += n;
    }
    assert_eq!(open_handles(&big), 1);

    drop(stream);

    let released = async {
        while open_handles(&big) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(3), released)
        .await
        .expect("file handle still open after the client went away");
}
