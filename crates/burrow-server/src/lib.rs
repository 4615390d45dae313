mod commands;
mod handler;
mod listener;
pub mod properties;
mod registry;

pub use commands::{download_file, env_snapshot, execute_http_request, CommandError};
pub use handler::{ClientHandler, EndpointConfig, ForwardError, HandlerStatus};
pub use listener::TunnelListener;
pub use registry::InterceptRegistry;
