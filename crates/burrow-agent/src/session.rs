use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use burrow_channel::{Channel, ChannelConfig, ChannelError, Dispatch, InboundHandler};
use burrow_filter::FilterPattern;
use burrow_proto::{
    Command, CommandRequest, CommandResponse, HttpRequestInfo, HttpResponseInfo,
    STATUS_INTERNAL_ERROR,
};
use tokio::net::TcpStream;

use crate::config::ServerTargetConfig;

/// Bootstrap commands are quick control-plane exchanges; they get a much
/// tighter deadline than forwarded application requests.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel request failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("server rejected {command} with status {status}")]
    Rejected { command: &'static str, status: u16 },
    #[error("cannot download {remote_path} to {local_path}: {reason}")]
    Download {
        remote_path: String,
        local_path: String,
        reason: String,
    },
    #[error("payload error: {0}")]
    Payload(#[from] burrow_proto::PayloadError),
}

/// Merged environment/property view produced by one server bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOverlay {
    pub environments: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
}

/// Executes tunneled CLIENT_EXECUTE_HTTP_REQUEST commands against the
/// developer's local web server.
pub struct LocalExecutor {
    web_base: String,
    client: reqwest::Client,
}

impl LocalExecutor {
    pub fn new(web_base: String) -> Self {
        Self {
            web_base,
            client: reqwest::Client::new(),
        }
    }

    async fn execute_local(&self, info: &HttpRequestInfo) -> Result<HttpResponseInfo, String> {
        let url = format!("{}{}", self.web_base, info.uri);
        let method = reqwest::Method::from_bytes(info.method.as_bytes())
            .map_err(|_| format!("invalid method {:?}", info.method))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in &info.headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(payload) = &info.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send().await.map_err(|error| error.to_string())?;
        let http_status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        let payload = response.bytes().await.map_err(|error| error.to_string())?;

        let mut info = HttpResponseInfo {
            http_status,
            headers,
            payload: (!payload.is_empty()).then(|| payload.to_vec()),
        };
        info.remove_encoding_headers();
        Ok(info)
    }
}

#[async_trait]
impl InboundHandler for LocalExecutor {
    async fn handle(&self, request: CommandRequest) -> Dispatch {
        match request.command {
            Command::ClientExecuteHttpRequest => {
                let info: HttpRequestInfo = match request.decode_json() {
                    Ok(info) => info,
                    Err(error) => {
                        return Dispatch::Reply(CommandResponse::error(
                            STATUS_INTERNAL_ERROR,
                            error.to_string(),
                        ))
                    }
                };
                tracing::debug!(uri = %info.uri, method = %info.method, "executing tunneled request locally");
                match self.execute_local(&info).await {
                    Ok(response) => match CommandResponse::ok_json(&response) {
                        Ok(reply) => Dispatch::Reply(reply),
                        Err(error) => Dispatch::Reply(CommandResponse::error(
                            STATUS_INTERNAL_ERROR,
                            error.to_string(),
                        )),
                    },
                    Err(reason) => {
                        tracing::error!(uri = %info.uri, error = %reason, "local execution failed");
                        Dispatch::Reply(CommandResponse::error(STATUS_INTERNAL_ERROR, reason))
                    }
                }
            }
            Command::HeartBeat => Dispatch::Reply(CommandResponse::ok()),
            other => Dispatch::Reply(CommandResponse::error(
                STATUS_INTERNAL_ERROR,
                format!("unsupported command {}", other.as_str()),
            )),
        }
    }
}

/// One established tunnel to a remote debug endpoint.
pub struct ServerSession {
    address: String,
    channel: Arc<Channel>,
}

impl ServerSession {
    pub async fn connect(
        address: &str,
        executor: Arc<LocalExecutor>,
    ) -> Result<Arc<Self>, SessionError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| SessionError::Connect {
                address: address.to_string(),
                source,
            })?;
        let channel = Channel::spawn(
            stream,
            executor,
            ChannelConfig {
                id_prefix: "CLIENT",
                label: format!("server-{address}"),
                ..ChannelConfig::default()
            },
        );
        tracing::info!(address, "connected to debug endpoint");
        Ok(Arc::new(Self {
            address: address.to_string(),
            channel,
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_running()
    }

    pub async fn closed(&self) {
        self.channel.closed().await;
    }

    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
    }

    /// Startup sequence against one server: identify, fetch files, sync
    /// environment/properties, push filters. A file download failure is
    /// fatal to the whole agent startup.
    pub async fn bootstrap(
        &self,
        client_name: &str,
        filters: &[FilterPattern],
        target: &ServerTargetConfig,
    ) -> Result<SessionOverlay, SessionError> {
        self.set_client_name(client_name).await;

        for (remote_path, local_path) in &target.files {
            self.download_file(remote_path, local_path).await?;
        }

        let environments =
            merge_overlay(self.fetch_map(Command::ServerGetEnv).await?, &target.environments);
        let properties =
            merge_overlay(self.fetch_map(Command::ServerGetProp).await?, &target.properties);

        if !filters.is_empty() {
            self.push_filters(filters).await?;
        }

        Ok(SessionOverlay {
            environments,
            properties,
        })
    }

    pub async fn forward(
        &self,
        request: &HttpRequestInfo,
        timeout: Duration,
    ) -> Result<HttpResponseInfo, SessionError> {
        let command = CommandRequest::with_json(Command::ServerExecuteHttpRequest, request)?;
        let response = self.channel.request(command, timeout).await?;
        if !response.is_ok() {
            return Err(SessionError::Rejected {
                command: Command::ServerExecuteHttpRequest.as_str(),
                status: response.status,
            });
        }
        Ok(response.decode_json()?)
    }

    /// Best effort: the server keeps working without a display name.
    async fn set_client_name(&self, client_name: &str) {
        let request = match CommandRequest::with_json(
            Command::ServerSetClientName,
            &client_name.to_string(),
        ) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(%error, "cannot encode client name");
                return;
            }
        };
        match self.channel.request(request, BOOTSTRAP_TIMEOUT).await {
            Ok(response) if response.is_ok() => {}
            Ok(response) => {
                tracing::error!(
                    address = %self.address,
                    status = response.status,
                    "server rejected client name"
                );
            }
            Err(error) => {
                tracing::error!(address = %self.address, %error, "cannot set client name");
            }
        }
    }

    async fn download_file(&self, remote_path: &str, local_path: &str) -> Result<(), SessionError> {
        let fail = |reason: String| SessionError::Download {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_string(),
            reason,
        };

        let request =
            CommandRequest::with_json(Command::ServerDownloadFile, &remote_path.to_string())
                .map_err(|error| fail(error.to_string()))?;
        let response = self
            .channel
            .request(request, BOOTSTRAP_TIMEOUT)
            .await
            .map_err(|error| fail(error.to_string()))?;

        if !response.is_ok() {
            let detail = response
                .payload_text()
                .unwrap_or_else(|| format!("status {}", response.status));
            return Err(fail(detail));
        }
        let content = response.payload.unwrap_or_default();

        let destination = Path::new(local_path);
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| fail(error.to_string()))?;
            }
        }
        std::fs::write(destination, &content).map_err(|error| fail(error.to_string()))?;
        tracing::info!(remote_path, local_path, bytes = content.len(), "downloaded file");
        Ok(())
    }

    async fn fetch_map(
        &self,
        command: Command,
    ) -> Result<BTreeMap<String, String>, SessionError> {
        let response = self
            .channel
            .request(CommandRequest::new(command), BOOTSTRAP_TIMEOUT)
            .await?;
        if !response.is_ok() {
            return Err(SessionError::Rejected {
                command: command.as_str(),
                status: response.status,
            });
        }
        Ok(response.decode_json()?)
    }

    async fn push_filters(&self, filters: &[FilterPattern]) -> Result<(), SessionError> {
        let request = CommandRequest::with_json(Command::ServerAddFilterPattern, &filters)?;
        let response = self.channel.request(request, BOOTSTRAP_TIMEOUT).await?;
        if !response.is_ok() {
            return Err(SessionError::Rejected {
                command: Command::ServerAddFilterPattern.as_str(),
                status: response.status,
            });
        }
        tracing::info!(address = %self.address, count = filters.len(), "pushed filter patterns");
        Ok(())
    }
}

/// Applies local overrides on top of the server map: a present value wins
/// over the server's, an explicit null removes the key entirely.
fn merge_overlay(
    mut base: BTreeMap<String, String>,
    overrides: &BTreeMap<String, Option<String>>,
) -> BTreeMap<String, String> {
    for (key, value) in overrides {
        match value {
            Some(value) => {
                base.insert(key.clone(), value.clone());
            }
            None => {
                base.remove(key);
            }
        }
    }
    base
}
