pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod limit;
pub mod security;
pub mod server;

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::info;

//
// Re-export
//
pub use api::{TOKEN_HEADER, router};
pub use app_state::AppState;
pub use auth::{AccessToken, TokenAuthority};
pub use config::Config;
pub use error::{RateLimitReason, ShareError};
pub use gate::{GateLimits, RequestGate, ShareRoot};
pub use limit::{Backoff, RateLimiter};
pub use security::{FileAccessGuard, PathResolver};
pub use server::{ConnectionTimeouts, IdleTimeoutIo, serve};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(&config).context("Failed to open shared path")?;

    let addr = SocketAddr::new(config.bind, config.listen_on_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    let share_url = share_url(local);
    log_banner(&share_url, state.gate.root(), &state.gate.tokens().snapshot());

    state.spawn_compaction(config.compaction_interval);
    #[cfg(unix)]
    state
        .spawn_rotation_on_sighup(share_url)
        .context("Failed to install SIGHUP handler")?;

    let app = router(state, config.request_timeout);
    let timeouts = ConnectionTimeouts {
        header_read: config.read_timeout,
        idle: config.idle_timeout,
    };

    info!(%local, "Listening");
    tokio::select! {
        _ = serve(listener, app, timeouts) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }
    Ok(())
}

/// The only place the access token is ever logged.
pub fn log_banner(share_url: &str, root: &ShareRoot, token: &AccessToken) {
    let valid_for = token
        .expires_at()
        .duration_since(token.issued_at())
        .unwrap_or_default();
    let expires_at = DateTime::<Utc>::from(token.expires_at()).to_rfc3339();
    let mode = if root.is_directory() { "directory" } else { "file" };

    info!(
        path = %root.path().display(),
        mode,
        valid_for = %humantime::format_duration(valid_for),
        %expires_at,
        "Sharing session started"
    );
    info!("Files:    {share_url}/api/files?token={}", token.value());
    info!("Download: {share_url}/api/download?token={}", token.value());
}

fn share_url(local: SocketAddr) -> String {
    let host = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(host, local.port()))
}
