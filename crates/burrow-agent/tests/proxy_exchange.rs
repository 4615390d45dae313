use std::sync::Arc;
use std::time::Duration;

use burrow_agent::agent::AgentCore;
use burrow_agent::proxy::{ProxyConfig, ProxyServer};
use burrow_tls::{client_config_trusting_ca, AuthorityConfig, LeafCertStore};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

async fn start_proxy() -> (std::net::SocketAddr, Arc<LeafCertStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let certs = Arc::new(
        LeafCertStore::new(AuthorityConfig {
            cert_cache_dir: dir.path().to_path_buf(),
            ..AuthorityConfig::default()
        })
        .expect("cert store"),
    );

    // No live tunnel sessions: every forward synthesizes an error reply,
    // which is exactly what these tests assert on.
    let agent = Arc::new(AgentCore::new(Duration::from_secs(2)));
    let proxy = ProxyServer::bind(
        ProxyConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            read_timeout: Duration::from_secs(5),
        },
        agent,
        Arc::clone(&certs),
    )
    .await
    .expect("bind proxy");
    let addr = proxy.local_addr();
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    (addr, certs, dir)
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head byte");
        assert!(read > 0, "stream closed before head completed");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("utf8 head")
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().expect("content length"))
        })
        .expect("Content-Length header present")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_request_without_tunnel_renders_a_complete_500_response() {
    let (addr, _certs, _dir) = start_proxy().await;

    let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
    stream
        .write_all(b"GET http://example.local/ HTTP/1.1\r\nHost: example.local\r\n\r\n")
        .await
        .expect("write request");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{head}");

    let expected = content_length(&head);
    let mut body = vec![0_u8; expected];
    stream.read_exact(&mut body).await.expect("read body");
    assert_eq!(body.len(), expected);
    assert!(
        String::from_utf8_lossy(&body).contains("tunnel"),
        "body should explain the tunnel failure"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_connection_serves_sequential_requests() {
    let (addr, _certs, _dir) = start_proxy().await;

    let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
    for round in 0..2 {
        stream
            .write_all(
                format!(
                    "GET http://example.local/round-{round} HTTP/1.1\r\nHost: example.local\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .expect("write request");

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 500"), "round {round}: {head}");
        let mut body = vec![0_u8; content_length(&head)];
        stream.read_exact(&mut body).await.expect("read body");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_line_is_answered_with_400() {
    let (addr, _certs, _dir) = start_proxy().await;

    let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
    stream
        .write_all(b"GET /missing-version\r\n\r\n")
        .await
        .expect("write request");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_mints_a_leaf_and_serves_decrypted_requests() {
    let (addr, certs, _dir) = start_proxy().await;

    let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
    stream
        .write_all(b"CONNECT example.local:443 HTTP/1.1\r\nHost: example.local:443\r\n\r\n")
        .await
        .expect("write CONNECT");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");

    // The handshake only succeeds if the minted chain verifies against the
    // store's CA and the leaf actually names example.local.
    let connector = TlsConnector::from(
        client_config_trusting_ca(certs.ca_certificate_pem()).expect("client config"),
    );
    let server_name = ServerName::try_from("example.local".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, stream)
        .await
        .expect("TLS handshake with proxy");

    tls.write_all(b"GET / HTTP/1.1\r\nHost: example.local\r\nConnection: close\r\n\r\n")
        .await
        .expect("write tunneled request");

    let head = read_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 500"), "{head}");
    let mut body = vec![0_u8; content_length(&head)];
    tls.read_exact(&mut body).await.expect("read body");

    assert_eq!(certs.metrics().leaves_minted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_connect_to_the_same_host_reuses_the_cached_leaf() {
    let (addr, certs, _dir) = start_proxy().await;

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
        stream
            .write_all(b"CONNECT cached.local:443 HTTP/1.1\r\nHost: cached.local:443\r\n\r\n")
            .await
            .expect("write CONNECT");
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");

        let connector = TlsConnector::from(
            client_config_trusting_ca(certs.ca_certificate_pem()).expect("client config"),
        );
        let server_name = ServerName::try_from("cached.local".to_string()).expect("server name");
        let tls = connector
            .connect(server_name, stream)
            .await
            .expect("TLS handshake");
        drop(tls);
    }

    assert_eq!(certs.metrics().leaves_minted, 1);
}
