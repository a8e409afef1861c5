use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    events::SharedObserver,
    process::ProcessSupervisor,
    reconciler::{TaskReconciler, reconcile},
};

pub const FAST_INTERVAL: Duration = Duration::from_secs(1);
pub const SLOW_INTERVAL: Duration = Duration::from_secs(3);
const DAEMON_GONE: &str = "not connected: aria2c is not running";

/// Drives the two refresh loops: task diffs every second while connected and
/// service liveness every few seconds regardless of connection state.
pub struct StatusBroadcaster {
    reconciler: Arc<TaskReconciler>,
    supervisor: Arc<ProcessSupervisor>,
    observer: SharedObserver,
    delivered: Mutex<HashSet<String>>,
    fast_interval: Duration,
    slow_interval: Duration,
}

pub struct BroadcasterHandle {
    stop_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl BroadcasterHandle {
    /// Signals both loops and waits for them; an in-flight cycle finishes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for handle in self.loops {
            if let Err(err) = handle.await {
                warn!("broadcaster loop ended abnormally: {err}");
            }
        }
    }
}

impl StatusBroadcaster {
    pub fn new(
        reconciler: Arc<TaskReconciler>,
        supervisor: Arc<ProcessSupervisor>,
        observer: SharedObserver,
    ) -> Self {
        Self {
            reconciler,
            supervisor,
            observer,
            delivered: Mutex::new(HashSet::new()),
            fast_interval: FAST_INTERVAL,
            slow_interval: SLOW_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, fast: Duration, slow: Duration) -> Self {
        self.fast_interval = fast;
        self.slow_interval = slow;
        self
    }

    /// One task refresh. Returns whether a diff was delivered.
    pub async fn fast_cycle(&self) -> bool {
        if !self.reconciler.session().is_connected() {
            return false;
        }
        let fresh = match self.reconciler.poll().await {
            Ok(tasks) => tasks,
            // Disconnected between the check and the poll; nothing to report.
            Err(err) if matches!(err.downcast_ref::<AppError>(), Some(AppError::NotConnected)) => {
                return false;
            }
            Err(err) => {
                debug!("task refresh failed: {err:#}");
                self.observer
                    .on_poll_failed(&format!("connected (refresh failed: {err:#})"));
                return false;
            }
        };

        let mut delivered = self.delivered.lock().await;
        let diff = reconcile(&delivered, fresh);
        self.observer.on_task_diff(&diff.upserts, &diff.deletes);
        *delivered = diff.upserts.iter().map(|t| t.gid.clone()).collect();
        true
    }

    /// One liveness check; the process table scan runs on the blocking pool.
    /// Also drops the session once the daemon is no longer running.
    pub async fn slow_cycle(&self) {
        let supervisor = self.supervisor.clone();
        let status = match tokio::task::spawn_blocking(move || supervisor.status()).await {
            Ok(status) => status,
            Err(err) => {
                warn!("service status check panicked: {err}");
                return;
            }
        };
        self.observer.on_service_status_change(
            status.running,
            &status.status_text(),
            status.color_hint(),
        );

        // A dead daemon takes the session with it; task polling stops until the
        // next explicit connect.
        let session = self.reconciler.session();
        if !status.running && session.is_connected() {
            warn!("aria2c is gone, dropping rpc session");
            session.disconnect_with_reason(DAEMON_GONE).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> BroadcasterHandle {
        let (stop_tx, stop_rx) = watch::channel(false);

        let fast = {
            let this = self.clone();
            let mut stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(this.fast_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            this.fast_cycle().await;
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
                debug!("fast refresh loop stopped");
            })
        };

        let slow = {
            let this = self;
            let mut stop_rx = stop_rx;
            tokio::spawn(async move {
                let mut interval = time::interval(this.slow_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => this.slow_cycle().await,
                        _ = stop_rx.changed() => break,
                    }
                }
                debug!("service status loop stopped");
            })
        };

        BroadcasterHandle {
            stop_tx,
            loops: vec![fast, slow],
        }
    }
}
