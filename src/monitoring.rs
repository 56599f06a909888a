//! Background status polling
//!
//! A [`StatusPoller`] logs in on its own terminal session and periodically
//! queries the RCP slot and the PC threads, publishing each result as a
//! [`StatusSnapshot`] on a watch channel. Because it never shares a session
//! with command traffic, polling cannot desynchronize a controller's exchanges.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::connect_session;
use crate::json_output::current_timestamp;
use crate::protocol::ThreadMask;
use crate::session::Session;
use crate::status::{RcpState, ThreadState};
use crate::Result;

/// One polling round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// System timestamp (Unix epoch seconds when the round finished)
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub rcp: RcpState,
    pub threads: [ThreadState; 5],
}

impl StatusSnapshot {
    pub fn new(rcp: RcpState, threads: [ThreadState; 5]) -> Self {
        Self {
            stime: current_timestamp(),
            event_type: "status".to_string(),
            rcp,
            threads,
        }
    }

    /// Same controller state, ignoring the timestamp
    pub fn same_state(&self, other: &StatusSnapshot) -> bool {
        self.rcp == other.rcp && self.threads == other.threads
    }
}

/// Periodic status poller with its own session
pub struct StatusPoller {
    pub snapshot_receiver: watch::Receiver<Option<StatusSnapshot>>,
    shutdown: Arc<Notify>,
    task_handle: Option<JoinHandle<Result<()>>>,
}

impl StatusPoller {
    /// Connects a dedicated session and starts polling as configured
    pub async fn start(config: &Config) -> Result<Self> {
        let session = connect_session(config).await?;
        let mask = ThreadMask::from_threads(&config.polling.threads())?;
        Ok(Self::spawn_with_session(session, config.polling.interval(), mask))
    }

    pub fn spawn_with_session(session: Session, interval: Duration, mask: ThreadMask) -> Self {
        let (snapshot_sender, snapshot_receiver) = watch::channel(None);
        let shutdown = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&shutdown);

        info!("Polling controller status every {:?}", interval);
        let task_handle = tokio::spawn(async move {
            let mut session = session;
            let result = poll_loop(&mut session, interval, mask, &snapshot_sender, &stop_signal).await;
            if let Err(e) = session.close().await {
                debug!("Closing polling session: {}", e);
            }
            result
        });

        Self {
            snapshot_receiver,
            shutdown,
            task_handle: Some(task_handle),
        }
    }

    /// Most recent snapshot, `None` before the first round completes
    pub fn latest_snapshot(&self) -> Option<StatusSnapshot> {
        self.snapshot_receiver.borrow().clone()
    }

    /// Waits for the next snapshot; `None` once polling has ended
    pub async fn next_snapshot(&mut self) -> Option<StatusSnapshot> {
        self.snapshot_receiver.changed().await.ok()?;
        self.snapshot_receiver.borrow().clone()
    }

    /// Stops polling and reports why the polling task ended
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.notify_one();
        match self.task_handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        if let Some(handle) = &self.task_handle {
            handle.abort();
        }
    }
}

async fn poll_loop(
    session: &mut Session,
    interval: Duration,
    mask: ThreadMask,
    sender: &watch::Sender<Option<StatusSnapshot>>,
    shutdown: &Notify,
) -> Result<()> {
    loop {
        match poll_once(session, mask).await {
            Ok(snapshot) => {
                if sender.send(Some(snapshot)).is_err() {
                    debug!("No snapshot receivers left, stopping poller");
                    return Ok(());
                }
            }
            Err(e) if e.is_transport() => {
                warn!("Status polling stopped: {}", e);
                return Err(e);
            }
            Err(e) => warn!("Status poll failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.notified() => {
                info!("Status poller stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn poll_once(session: &mut Session, mask: ThreadMask) -> Result<StatusSnapshot> {
    let rcp = session.get_rcp_status().await?;
    let threads = session.get_pc_status(mask).await?;
    Ok(StatusSnapshot::new(rcp, threads))
}

/// Change detection for printed snapshots
pub struct SnapshotFilter {
    last: Option<StatusSnapshot>,
    dynamic_mode: bool,
}

impl SnapshotFilter {
    /// With `dynamic_mode` only snapshots that differ from the previous one pass
    pub fn new(dynamic_mode: bool) -> Self {
        Self {
            last: None,
            dynamic_mode,
        }
    }

    pub fn should_output(&mut self, snapshot: &StatusSnapshot) -> bool {
        if self.dynamic_mode {
            if let Some(last) = &self.last {
                if last.same_state(snapshot) {
                    return false;
                }
            }
        }
        self.last = Some(snapshot.clone());
        true
    }
}
