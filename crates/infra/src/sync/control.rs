//! Control plane: cross-process signals and daemon lifecycle.
//!
//! A 1 s poll of the signal queue drives pause/resume, graceful stop and
//! dashboard refresh forwarding. The RUNNING flag (with the daemon PID as
//! variant) is acquired before anything else starts and released on clean
//! exit; a stale flag left by a dead process is reclaimed.

use std::sync::Arc;
use std::time::Duration;

use pdsync_core::{FlagStore, SignalBus};
use pdsync_domain::constants::SIGNAL_POLL_MS;
use pdsync_domain::{Flag, Result, Signal, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::database::SqliteFlagRepository;

/// Polls the signal bus and supervises the daemon lifecycle flags.
pub struct ControlPlane {
    bus: Arc<SqliteFlagRepository>,
    /// Cancelled when a stop signal arrives; the daemon's shutdown root.
    shutdown: CancellationToken,
    poll: Duration,
}

impl ControlPlane {
    pub fn new(bus: Arc<SqliteFlagRepository>, shutdown: CancellationToken) -> Self {
        Self { bus, shutdown, poll: Duration::from_millis(SIGNAL_POLL_MS) }
    }

    /// Acquire the RUNNING flag or refuse to start.
    pub async fn startup(&self) -> Result<()> {
        let pid = std::process::id();
        if !self.bus.acquire_running(pid).await? {
            return Err(SyncError::Config(
                "another sync daemon is already running for this state directory".into(),
            ));
        }
        // A previous unclean exit may have left PAUSED behind; a fresh
        // daemon starts unpaused only if the operator did not ask otherwise.
        Ok(())
    }

    /// Clear the RUNNING flag on clean exit.
    pub async fn shutdown_cleanup(&self) {
        if let Err(err) = self.bus.release_running().await {
            warn!(error = %err, "could not release RUNNING flag");
        }
    }

    /// Token the rest of the daemon observes for graceful stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll loop; exits when a stop signal arrives or `cancel` fires.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("control plane started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }

            if let Err(err) = self.poll_signals().await {
                error!(error = %err, "signal poll failed");
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        info!("control plane stopped");
    }

    async fn poll_signals(&self) -> Result<()> {
        if self.bus.consume_signal(Signal::PauseSync).await? {
            info!("pause requested");
            self.bus.set_flag(Flag::Paused, None).await?;
        }

        if self.bus.consume_signal(Signal::ResumeSync).await? {
            info!("resume requested");
            self.bus.clear_flag(Flag::Paused, None).await?;
        }

        if self.bus.consume_signal(Signal::RefreshDashboard).await? {
            // Nothing for the core to do; the dashboard collaborator watches
            // this signal through its own connection.
            debug!("refresh-dashboard observed, forwarding");
        }

        if self.bus.consume_signal(Signal::Stop).await? {
            info!("stop requested, beginning graceful shutdown");
            self.shutdown.cancel();
        }

        Ok(())
    }
}
