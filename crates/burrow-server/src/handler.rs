use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use burrow_channel::{Channel, ChannelConfig, ChannelError, Dispatch, InboundHandler};
use burrow_filter::{FilterPattern, FilterSet};
use burrow_proto::{
    Command, CommandRequest, CommandResponse, HttpRequestInfo, HttpResponseInfo, PayloadError,
    STATUS_INTERNAL_ERROR, DEFAULT_MAX_FRAME_BYTES,
};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::commands;
use crate::properties;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Upper bound for one forwarded request round trip.
    pub forward_timeout: Duration,
    /// When set, the endpoint probes each client with HEART_BEAT at this
    /// interval and tears the connection down on a missed beat.
    pub heartbeat_interval: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 9977,
            forward_timeout: Duration::from_secs(600),
            heartbeat_interval: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    NotRunning,
    Running,
    Stopped,
}

impl HandlerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client did not answer within {after:?}")]
    Timeout { after: Duration },
    #[error("client connection is gone")]
    ConnectionClosed,
    #[error("client answered with status {0}")]
    RemoteStatus(u16),
    #[error("client answer could not be decoded: {0}")]
    Decode(#[from] PayloadError),
}

impl From<ChannelError> for ForwardError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Timeout { after } => Self::Timeout { after },
            ChannelError::ConnectionClosed | ChannelError::Wire(_) => Self::ConnectionClosed,
        }
    }
}

struct HandlerState {
    client_id: Uuid,
    client_name: RwLock<Option<String>>,
    status: RwLock<HandlerStatus>,
    filters: RwLock<FilterSet>,
    http: reqwest::Client,
}

impl HandlerState {
    fn set_status(&self, status: HandlerStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    fn status(&self) -> HandlerStatus {
        *self.status.read().expect("status lock poisoned")
    }

    fn mark_running(&self) {
        let mut status = self.status.write().expect("status lock poisoned");
        if *status == HandlerStatus::NotRunning {
            *status = HandlerStatus::Running;
        }
    }
}

/// One connected client-agent: identity, lifecycle status, its filter set
/// and the channel used to reach it.
pub struct ClientHandler {
    state: Arc<HandlerState>,
    channel: Arc<Channel>,
}

impl ClientHandler {
    pub fn spawn(stream: TcpStream, config: &EndpointConfig) -> Arc<Self> {
        let client_id = Uuid::new_v4();
        let state = Arc::new(HandlerState {
            client_id,
            client_name: RwLock::new(None),
            status: RwLock::new(HandlerStatus::NotRunning),
            filters: RwLock::new(FilterSet::default()),
            http: reqwest::Client::new(),
        });

        let dispatcher = Arc::new(CommandDispatcher {
            state: Arc::clone(&state),
        });
        let channel = Channel::spawn(
            stream,
            dispatcher,
            ChannelConfig {
                id_prefix: "SERVER",
                default_timeout: config.forward_timeout,
                max_frame_bytes: config.max_frame_bytes,
                label: format!("client-{client_id}"),
                ..ChannelConfig::default()
            },
        );

        // The handler leaves the candidate list as soon as the socket dies.
        {
            let state = Arc::clone(&state);
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel.closed().await;
                state.set_status(HandlerStatus::Stopped);
                tracing::info!(client_id = %state.client_id, "client connection closed");
            });
        }

        if let Some(interval) = config.heartbeat_interval {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                heartbeat_loop(channel, interval).await;
            });
        }

        Arc::new(Self { state, channel })
    }

    pub fn client_id(&self) -> Uuid {
        self.state.client_id
    }

    pub fn client_name(&self) -> Option<String> {
        self.state
            .client_name
            .read()
            .expect("name lock poisoned")
            .clone()
    }

    pub fn status(&self) -> HandlerStatus {
        self.state.status()
    }

    pub fn is_running(&self) -> bool {
        self.state.status() == HandlerStatus::Running
    }

    /// Evaluates this client's filter set against the projected request.
    pub fn matches(&self, document: &serde_json::Value) -> bool {
        self.state
            .filters
            .read()
            .expect("filter lock poisoned")
            .matches(document)
    }

    pub async fn forward_to_client(
        &self,
        request: &HttpRequestInfo,
        timeout: Duration,
    ) -> Result<HttpResponseInfo, ForwardError> {
        let command = CommandRequest::with_json(Command::ClientExecuteHttpRequest, request)?;
        let response = self.channel.request(command, timeout).await?;
        if !response.is_ok() {
            return Err(ForwardError::RemoteStatus(response.status));
        }
        Ok(response.decode_json()?)
    }

    pub async fn close(&self) {
        self.channel.shutdown().await;
        self.state.set_status(HandlerStatus::Stopped);
    }
}

async fn heartbeat_loop(channel: Arc<Channel>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !channel.is_running() {
            return;
        }
        let probe = channel
            .request(
                CommandRequest::new(Command::HeartBeat),
                Duration::from_secs(5),
            )
            .await;
        if probe.is_err() {
            tracing::info!("heart beat failed, closing client connection");
            channel.shutdown().await;
            return;
        }
    }
}

struct CommandDispatcher {
    state: Arc<HandlerState>,
}

#[async_trait]
impl InboundHandler for CommandDispatcher {
    async fn handle(&self, request: CommandRequest) -> Dispatch {
        self.state.mark_running();

        if request.command == Command::ServerExit {
            self.state.set_status(HandlerStatus::Stopped);
            return Dispatch::Stop;
        }

        let response = match dispatch_command(&self.state, &request).await {
            Ok(response) => response,
            // A failed command never takes the connection down with it.
            Err(message) => {
                tracing::error!(
                    client_id = %self.state.client_id,
                    command = request.command.as_str(),
                    error = %message,
                    "command execution failed"
                );
                CommandResponse::error(STATUS_INTERNAL_ERROR, message)
            }
        };
        Dispatch::Reply(response)
    }
}

async fn dispatch_command(
    state: &HandlerState,
    request: &CommandRequest,
) -> Result<CommandResponse, String> {
    match request.command {
        Command::ServerGetEnv => {
            CommandResponse::ok_json(&commands::env_snapshot()).map_err(|e| e.to_string())
        }
        Command::ServerGetProp => {
            CommandResponse::ok_json(&properties::snapshot()).map_err(|e| e.to_string())
        }
        Command::ServerAddFilterPattern => {
            let mut patterns: Vec<FilterPattern> =
                request.decode_json().map_err(|e| e.to_string())?;
            // Compile before anything is stored: one malformed pattern
            // rejects the whole batch.
            for pattern in &mut patterns {
                pattern.compile().map_err(|e| e.to_string())?;
            }
            state
                .filters
                .write()
                .expect("filter lock poisoned")
                .add_all(patterns);
            Ok(CommandResponse::ok())
        }
        Command::ServerGetAllFilterPattern => {
            let patterns: Vec<FilterPattern> = state
                .filters
                .read()
                .expect("filter lock poisoned")
                .patterns()
                .to_vec();
            CommandResponse::ok_json(&patterns).map_err(|e| e.to_string())
        }
        Command::ServerClearAllFilterPattern => {
            state
                .filters
                .write()
                .expect("filter lock poisoned")
                .clear();
            Ok(CommandResponse::ok())
        }
        Command::ServerExecuteHttpRequest => {
            let info: HttpRequestInfo = request.decode_json().map_err(|e| e.to_string())?;
            let response = commands::execute_http_request(&state.http, &info)
                .await
                .map_err(|e| e.to_string())?;
            CommandResponse::ok_json(&response).map_err(|e| e.to_string())
        }
        Command::ServerDownloadFile => {
            let path: String = request.decode_json().map_err(|e| e.to_string())?;
            Ok(commands::download_file(&path))
        }
        Command::ServerSetClientName => {
            let name: String = request.decode_json().map_err(|e| e.to_string())?;
            tracing::info!(client_id = %state.client_id, client_name = %name, "client identified");
            *state.client_name.write().expect("name lock poisoned") = Some(name);
            Ok(CommandResponse::ok())
        }
        Command::HeartBeat => Ok(CommandResponse::ok()),
        Command::ServerExit => unreachable!("handled before dispatch"),
        Command::ClientExecuteHttpRequest => {
            Err("CLIENT_EXECUTE_HTTP_REQUEST is not valid on the server side".to_string())
        }
    }
}
