use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use burrow_proto::HttpRequestInfo;
use burrow_tls::LeafCertStore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::agent::AgentCore;
use crate::httpio::{
    parse_request, write_error_response, write_response, BufferedStream, HttpParseError,
    RawHttpRequest,
};

pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// CONNECT re-enters the same exchange loop over the decrypted stream, so
/// the stream type is erased instead of nesting TLS generics.
type DynStream = Box<dyn StreamIo>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Idle read timeout per request on a keep-alive connection.
    pub read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8888,
            read_timeout: Duration::from_secs(600),
        }
    }
}

struct ProxyContext {
    agent: Arc<AgentCore>,
    certs: Arc<LeafCertStore>,
    read_timeout: Duration,
}

/// Local HTTP/HTTPS proxy: plain requests are forwarded through the
/// tunnel, CONNECT is terminated locally with a minted certificate and the
/// decrypted stream is served by the same loop.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    pub async fn bind(
        config: ProxyConfig,
        agent: Arc<AgentCore>,
        certs: Arc<LeafCertStore>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "proxy listening");
        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ProxyContext {
                agent,
                certs,
                read_timeout: config.read_timeout,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                tracing::debug!(%peer_addr, "proxy connection opened");
                let conn = BufferedStream::new(Box::new(stream) as DynStream);
                if let Err(error) = serve_exchanges(conn, false, context).await {
                    tracing::debug!(%peer_addr, %error, "proxy connection ended with error");
                }
                tracing::debug!(%peer_addr, "proxy connection closed");
            });
        }
    }
}

fn serve_exchanges(
    mut conn: BufferedStream<DynStream>,
    https: bool,
    context: Arc<ProxyContext>,
) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
    Box::pin(async move {
        loop {
            let request = match parse_request(&mut conn, context.read_timeout).await {
                Ok(request) => request,
                // Peer hangup or an idle keep-alive connection: done.
                Err(HttpParseError::Eof) | Err(HttpParseError::Timeout) => return Ok(()),
                Err(HttpParseError::Io(error)) => return Err(error),
                Err(error) => {
                    tracing::debug!(%error, "rejecting unparseable request");
                    let _ = write_error_response(&mut conn.stream, 400, &error.to_string()).await;
                    return Ok(());
                }
            };

            if request.is_connect() {
                if https {
                    let _ = write_error_response(
                        &mut conn.stream,
                        400,
                        "CONNECT inside an established tunnel is not supported",
                    )
                    .await;
                    return Ok(());
                }
                return handle_connect(conn, request, context).await;
            }

            let close_after = request.wants_close();
            if !serve_plain_exchange(&mut conn, request, &context, https).await? {
                return Ok(());
            }
            if close_after {
                return Ok(());
            }
        }
    })
}

/// Returns false when the exchange could not produce a response and the
/// connection should be dropped.
async fn serve_plain_exchange(
    conn: &mut BufferedStream<DynStream>,
    request: RawHttpRequest,
    context: &ProxyContext,
    https: bool,
) -> io::Result<bool> {
    let url = match request.target_url(https) {
        Ok(url) => url,
        Err(error) => {
            let _ = write_error_response(&mut conn.stream, 400, &error.to_string()).await;
            return Ok(false);
        }
    };

    let mut info = HttpRequestInfo::new(request.method.clone(), url);
    for (name, value) in &request.headers {
        // Hop-specific header, meaningless past this proxy.
        if name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        info.headers.insert(name.clone(), value.clone());
    }
    if !request.body.is_empty() {
        info.payload = Some(request.body.clone());
    }

    tracing::debug!(method = %info.method, uri = %info.uri, "forwarding proxied request");
    let response = context.agent.forward_to_remote(info).await;
    write_response(&mut conn.stream, &request.version, &response).await?;
    Ok(true)
}

async fn handle_connect(
    mut conn: BufferedStream<DynStream>,
    request: RawHttpRequest,
    context: Arc<ProxyContext>,
) -> io::Result<()> {
    let Some((host, port)) = request.connect_authority() else {
        let _ = write_error_response(&mut conn.stream, 400, "invalid CONNECT authority").await;
        return Ok(());
    };
    tracing::debug!(host = %host, port, "terminating CONNECT locally");

    // Leaf minting failure affects only this CONNECT attempt.
    let issued = match context.certs.server_config_for_host(&host) {
        Ok(issued) => issued,
        Err(error) => {
            tracing::error!(host = %host, %error, "leaf certificate issuance failed");
            let _ = write_error_response(
                &mut conn.stream,
                502,
                "certificate generation for the requested host failed",
            )
            .await;
            return Ok(());
        }
    };

    let established = format!("{} 200 Connection Established\r\n\r\n", request.version);
    conn.stream.write_all(established.as_bytes()).await?;
    conn.stream.flush().await?;

    let acceptor = TlsAcceptor::from(issued.server_config);
    let tls_stream = match acceptor.accept(conn.into_inner()).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(host = %host, %error, "TLS handshake with proxy client failed");
            return Ok(());
        }
    };
    tracing::debug!(
        host = %host,
        cache = issued.cache_status.as_str(),
        "TLS established, serving decrypted exchanges"
    );

    let conn = BufferedStream::new(Box::new(tls_stream) as DynStream);
    serve_exchanges(conn, true, context).await
}
