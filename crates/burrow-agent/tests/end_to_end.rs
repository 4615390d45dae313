//! Full-path tests: browser-side proxy -> agent tunnel -> remote endpoint
//! -> (intercept registry | outbound execution) -> local web server.

use std::sync::Arc;
use std::time::Duration;

use burrow_agent::agent::AgentCore;
use burrow_agent::config::ServerTargetConfig;
use burrow_agent::proxy::{ProxyConfig, ProxyServer};
use burrow_agent::session::{LocalExecutor, ServerSession};
use burrow_filter::FilterPattern;
use burrow_proto::HttpRequestInfo;
use burrow_server::{EndpointConfig, InterceptRegistry, TunnelListener};
use burrow_tls::{AuthorityConfig, LeafCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal HTTP/1.1 responder standing in for the developer's local web
/// server (and for the remote side's outbound targets).
async fn start_web_server(body: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind web server");
    let addr = listener.local_addr().expect("web server addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0_u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => head.push(byte[0]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

struct Tunnel {
    registry: Arc<InterceptRegistry>,
    agent: Arc<AgentCore>,
}

async fn establish_tunnel(web_addr: std::net::SocketAddr, filters: Vec<FilterPattern>) -> Tunnel {
    let endpoint_config = EndpointConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        forward_timeout: Duration::from_secs(5),
        ..EndpointConfig::default()
    };
    let registry = Arc::new(InterceptRegistry::new(endpoint_config.forward_timeout));
    let listener = TunnelListener::bind(&endpoint_config)
        .await
        .expect("bind endpoint");
    let endpoint_addr = listener.local_addr();
    let run_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let _ = listener.run(run_registry, endpoint_config).await;
    });

    let executor = Arc::new(LocalExecutor::new(format!("http://{web_addr}")));
    let session = ServerSession::connect(&endpoint_addr.to_string(), executor)
        .await
        .expect("connect session");
    session
        .bootstrap("e2e-test-agent", &filters, &ServerTargetConfig::default())
        .await
        .expect("bootstrap session");

    for _ in 0..200 {
        if !registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!registry.is_empty(), "session must register at the endpoint");

    let agent = Arc::new(AgentCore::new(Duration::from_secs(5)));
    agent.add_session(session);
    Tunnel { registry, agent }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_inbound_request_reaches_the_local_web_server() {
    let web_addr = start_web_server("hello-local").await;
    let tunnel = establish_tunnel(
        web_addr,
        vec![FilterPattern::new("$.uri", "/api/.*")],
    )
    .await;

    let intercepted = tunnel
        .registry
        .intercept(&HttpRequestInfo::new("GET", "/api/foo"))
        .await
        .expect("matching request is intercepted");
    assert_eq!(intercepted.http_status, 200);
    assert_eq!(intercepted.payload, Some(b"hello-local".to_vec()));

    let fallthrough = tunnel
        .registry
        .intercept(&HttpRequestInfo::new("GET", "/health"))
        .await;
    assert!(fallthrough.is_none(), "non-matching request falls through");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outbound_forwarding_executes_against_the_remote_side() {
    let web_addr = start_web_server("hello-remote").await;
    let tunnel = establish_tunnel(web_addr, Vec::new()).await;

    let response = tunnel
        .agent
        .forward_to_remote(HttpRequestInfo::new(
            "GET",
            format!("http://{web_addr}/external-service"),
        ))
        .await;
    assert_eq!(response.http_status, 200);
    assert_eq!(response.payload, Some(b"hello-remote".to_vec()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn browser_request_travels_the_whole_proxy_tunnel_path() {
    let web_addr = start_web_server("hello-via-tunnel").await;
    let tunnel = establish_tunnel(web_addr, Vec::new()).await;

    let cert_dir = tempfile::tempdir().expect("tempdir");
    let certs = Arc::new(
        LeafCertStore::new(AuthorityConfig {
            cert_cache_dir: cert_dir.path().to_path_buf(),
            ..AuthorityConfig::default()
        })
        .expect("cert store"),
    );
    let proxy = ProxyServer::bind(
        ProxyConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            read_timeout: Duration::from_secs(5),
        },
        Arc::clone(&tunnel.agent),
        certs,
    )
    .await
    .expect("bind proxy");
    let proxy_addr = proxy.local_addr();
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    let mut stream = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    stream
        .write_all(
            format!(
                "GET http://{web_addr}/through-proxy HTTP/1.1\r\nHost: {web_addr}\r\nProxy-Connection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("write proxied request");

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read proxied response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("hello-via-tunnel"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_loss_makes_the_proxy_answer_with_a_synthetic_error() {
    let web_addr = start_web_server("soon-gone").await;
    let tunnel = establish_tunnel(web_addr, Vec::new()).await;

    tunnel.agent.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = tunnel
        .agent
        .forward_to_remote(HttpRequestInfo::new("GET", "http://anywhere.local/"))
        .await;
    assert_eq!(response.http_status, 500);
}
