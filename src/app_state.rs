use crate::config::Config;
use crate::error::ShareError;
use crate::gate::{RequestGate, ShareRoot};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<RequestGate>,
}

impl AppState {
    pub fn new(gate: RequestGate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }

    /// Open the shared path and build the gate from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ShareError> {
        let root = ShareRoot::open(&config.path)?;
        let gate = RequestGate::new(root, config.gate_limits())?;
        Ok(Self::new(gate))
    }

    /// Periodically drop rate-limit and backoff entries that no longer
    /// affect admission.
    pub fn spawn_compaction(&self, every: Duration) -> JoinHandle<()> {
        let gate = self.gate.clone();
        info!(?every, "Compaction task started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let (limiter, backoff) = gate.compact(Instant::now());
                let (tracked, cooling) = gate.tracked_sources();
                debug!(
                    removed_limiter = limiter,
                    removed_backoff = backoff,
                    tracked,
                    cooling,
                    "Compacted source tables"
                );
            }
        })
    }

    /// Rotate the access token every time the process receives SIGHUP.
    #[cfg(unix)]
    pub fn spawn_rotation_on_sighup(&self, share_url: String) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangups = signal(SignalKind::hangup())?;
        let gate = self.gate.clone();

        Ok(tokio::spawn(async move {
            while hangups.recv().await.is_some() {
                match gate.rotate() {
                    Ok(token) => crate::log_banner(&share_url, gate.root(), &token),
                    Err(error) => error!(%error, "Failed to rotate access token"),
                }
            }
        }))
    }
}
