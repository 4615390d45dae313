use std::path::PathBuf;
use std::sync::Arc;

use burrow_tls::{AuthorityConfig, LeafCertStore};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow_agent::agent::{write_overlay_files, AgentCore};
use burrow_agent::config::AgentConfig;
use burrow_agent::proxy::{ProxyConfig, ProxyServer};
use burrow_agent::session::{LocalExecutor, ServerSession, SessionError};

#[derive(Debug, Parser)]
#[command(name = "burrow-agent", about = "Developer-side tunnel agent and MITM proxy")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "burrow-agent.json")]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    StartupFailed,
    StartupTimeout,
    TunnelLost,
    ProxyFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::StartupFailed => 21,
            Self::StartupTimeout => 22,
            Self::TunnelLost => 23,
            Self::ProxyFailed => 24,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::StartupFailed => "startup_failed",
            Self::StartupTimeout => "startup_timeout",
            Self::TunnelLost => "tunnel_lost",
            Self::ProxyFailed => "proxy_failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no configured server could be reached")]
    NoLiveServers,
    #[error("certificate store init failed: {0}")]
    Tls(#[from] burrow_tls::TlsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit = run(cli).await;
    if exit != ExitClass::Ok {
        tracing::error!(exit_class = exit.label(), exit_code = exit.code(), "agent exiting");
    }
    std::process::exit(exit.code());
}

async fn run(cli: Cli) -> ExitClass {
    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            return ExitClass::ConfigInvalid;
        }
    };

    // Readiness gate: either the tunnel and the proxy come up inside the
    // startup window or the process dies visibly.
    let startup = tokio::time::timeout(config.startup_timeout(), start_agent(&config)).await;
    let (agent, proxy) = match startup {
        Ok(Ok(started)) => started,
        Ok(Err(error)) => {
            tracing::error!(%error, "agent startup failed");
            return ExitClass::StartupFailed;
        }
        Err(_) => {
            tracing::error!(
                timeout_secs = config.startup_timeout_secs,
                "agent startup timed out"
            );
            return ExitClass::StartupTimeout;
        }
    };

    tracing::info!(
        proxy_addr = %proxy.local_addr(),
        client_name = %config.client_name,
        "agent loaded"
    );

    let mut proxy_task = tokio::spawn(proxy.run());
    tokio::select! {
        _ = agent.run_until_all_closed() => {
            tracing::error!("every server connection is gone, shutting down");
            proxy_task.abort();
            ExitClass::TunnelLost
        }
        result = &mut proxy_task => {
            tracing::error!(?result, "proxy stopped unexpectedly");
            agent.shutdown().await;
            ExitClass::ProxyFailed
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            proxy_task.abort();
            agent.shutdown().await;
            ExitClass::Ok
        }
    }
}

async fn start_agent(config: &AgentConfig) -> Result<(Arc<AgentCore>, ProxyServer), StartupError> {
    let executor = Arc::new(LocalExecutor::new(config.web_base()));
    let agent = Arc::new(AgentCore::new(config.forward_timeout()));
    let mut overlays = Vec::new();

    for (name, target) in &config.servers {
        let session = match ServerSession::connect(&target.address, Arc::clone(&executor)).await {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(server = %name, %error, "cannot reach server, skipping");
                continue;
            }
        };
        match session
            .bootstrap(&config.client_name, &config.filters, target)
            .await
        {
            Ok(overlay) => {
                overlays.push(overlay);
                agent.add_session(session);
            }
            Err(error @ SessionError::Download { .. }) => {
                // Missing files leave the local server unable to start;
                // bail out instead of limping along.
                return Err(error.into());
            }
            Err(error) => {
                tracing::error!(server = %name, %error, "bootstrap failed, skipping server");
                session.shutdown().await;
            }
        }
    }

    if !agent.has_live_session() {
        return Err(StartupError::NoLiveServers);
    }

    write_overlay_files(&config.local.overlay_dir, &overlays)?;

    let certs = LeafCertStore::new(AuthorityConfig {
        ca_cert_pem_path: config.local.ca_cert_pem.clone(),
        ca_key_pem_path: config.local.ca_key_pem.clone(),
        cert_cache_dir: config.local.cert_dir.clone(),
        ..AuthorityConfig::default()
    })?;

    let proxy = ProxyServer::bind(
        ProxyConfig {
            port: config.local.proxy_port,
            ..ProxyConfig::default()
        },
        Arc::clone(&agent),
        Arc::new(certs),
    )
    .await?;

    Ok((agent, proxy))
}
