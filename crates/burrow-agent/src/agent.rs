use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use burrow_proto::{HttpRequestInfo, HttpResponseInfo};

use crate::session::{ServerSession, SessionError, SessionOverlay};

const STATUS_GATEWAY_TIMEOUT: u16 = 504;

/// Owns the established server sessions and routes outbound requests over
/// the first one that is still alive. Never fails upward: the proxy always
/// gets an HTTP response it can render to the browser.
pub struct AgentCore {
    sessions: RwLock<Vec<Arc<ServerSession>>>,
    forward_timeout: Duration,
}

impl AgentCore {
    pub fn new(forward_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            forward_timeout,
        }
    }

    pub fn add_session(&self, session: Arc<ServerSession>) {
        self.sessions
            .write()
            .expect("session list lock poisoned")
            .push(session);
    }

    pub fn live_sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .read()
            .expect("session list lock poisoned")
            .iter()
            .filter(|session| session.is_running())
            .cloned()
            .collect()
    }

    pub fn has_live_session(&self) -> bool {
        !self.live_sessions().is_empty()
    }

    pub async fn forward_to_remote(&self, request: HttpRequestInfo) -> HttpResponseInfo {
        let sessions = self.live_sessions();
        if sessions.is_empty() {
            tracing::error!(uri = %request.uri, "no live tunnel for request");
            return synthetic_response(500, "debug tunnel has no live server connection");
        }

        for session in sessions {
            match session.forward(&request, self.forward_timeout).await {
                Ok(response) => return response,
                Err(SessionError::Channel(burrow_channel::ChannelError::Timeout { after })) => {
                    tracing::error!(
                        uri = %request.uri,
                        address = session.address(),
                        timeout = ?after,
                        "tunneled request timed out"
                    );
                    return synthetic_response(
                        STATUS_GATEWAY_TIMEOUT,
                        "debug tunnel timed out waiting for the remote server",
                    );
                }
                Err(error) => {
                    // Dead or refusing session: try the next configured
                    // server before giving up.
                    tracing::error!(
                        uri = %request.uri,
                        address = session.address(),
                        %error,
                        "tunneled request failed, trying next server"
                    );
                }
            }
        }
        synthetic_response(500, "debug tunnel request failed on every server")
    }

    /// Resolves when every session has gone away; the agent is useless at
    /// that point and the process exits.
    pub async fn run_until_all_closed(&self) {
        loop {
            if !self.has_live_session() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn shutdown(&self) {
        for session in self.live_sessions() {
            session.shutdown().await;
        }
    }
}

fn synthetic_response(status: u16, message: &str) -> HttpResponseInfo {
    let mut response = HttpResponseInfo::with_status(status);
    response
        .headers
        .insert("Content-Type".to_string(), "text/plain".to_string());
    response.payload = Some(message.as_bytes().to_vec());
    response
}

/// Writes the merged environment/property view as overlay files the
/// developer applies before starting the local server process. Runtime
/// mutation of this process's globals is deliberately not done.
pub fn write_overlay_files(
    overlay_dir: &Path,
    overlays: &[SessionOverlay],
) -> std::io::Result<()> {
    let mut environments = BTreeMap::new();
    let mut properties = BTreeMap::new();
    for overlay in overlays {
        environments.extend(overlay.environments.clone());
        properties.extend(overlay.properties.clone());
    }

    std::fs::create_dir_all(overlay_dir)?;
    std::fs::write(
        overlay_dir.join("overlay.env"),
        render_key_values(&environments),
    )?;
    std::fs::write(
        overlay_dir.join("overlay.properties"),
        render_key_values(&properties),
    )?;
    tracing::info!(
        dir = %overlay_dir.display(),
        environments = environments.len(),
        properties = properties.len(),
        "wrote configuration overlay"
    );
    Ok(())
}

fn render_key_values(map: &BTreeMap<String, String>) -> String {
    let mut output = String::new();
    for (key, value) in map {
        output.push_str(key);
        output.push('=');
        output.push_str(value);
        output.push('\n');
    }
    output
}
