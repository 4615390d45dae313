use std::sync::{Arc, RwLock};
use std::time::Duration;

use burrow_filter::project_request;
use burrow_proto::{HttpRequestInfo, HttpResponseInfo};

use crate::handler::{ClientHandler, HandlerStatus};

/// Boundary consulted by the host's request filter chain: registered
/// handlers are scanned in registration order and the first RUNNING one
/// whose filter matches receives the request. `None` tells the caller to
/// continue with its normal handling.
pub struct InterceptRegistry {
    handlers: RwLock<Vec<Arc<ClientHandler>>>,
    forward_timeout: Duration,
}

impl InterceptRegistry {
    pub fn new(forward_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            forward_timeout,
        }
    }

    pub fn register(&self, handler: Arc<ClientHandler>) {
        tracing::info!(client_id = %handler.client_id(), "registering client handler");
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live candidates; stopped handlers are pruned on the way.
    fn candidates(&self) -> Vec<Arc<ClientHandler>> {
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        handlers.retain(|handler| {
            let stopped = handler.status() == HandlerStatus::Stopped;
            if stopped {
                tracing::info!(
                    client_id = %handler.client_id(),
                    client_name = handler.client_name().as_deref().unwrap_or("<unnamed>"),
                    "removing stopped client handler"
                );
            }
            !stopped
        });
        handlers.clone()
    }

    pub async fn intercept(&self, request: &HttpRequestInfo) -> Option<HttpResponseInfo> {
        // Claims ride along so filters can target JWT fields.
        let enriched = request.clone().with_decoded_authorization();
        let document = project_request(&enriched);

        for handler in self.candidates() {
            if !handler.is_running() || !handler.matches(&document) {
                continue;
            }

            tracing::info!(
                uri = %enriched.uri,
                client_id = %handler.client_id(),
                client_name = handler.client_name().as_deref().unwrap_or("<unnamed>"),
                "request matched, forwarding to client"
            );
            match handler
                .forward_to_client(&enriched, self.forward_timeout)
                .await
            {
                Ok(response) => return Some(response),
                Err(error) => {
                    // Fall through to normal handling rather than failing
                    // the host request.
                    tracing::error!(
                        uri = %enriched.uri,
                        client_id = %handler.client_id(),
                        %error,
                        "forward to client failed"
                    );
                    return None;
                }
            }
        }
        None
    }
}
