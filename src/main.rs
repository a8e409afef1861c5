use std::sync::Arc;

use anyhow::Result;
use aria2_supervisor::{
    commands,
    config_store::ConfigStore,
    events::{ChannelObserver, StatusEvent},
    init_backend,
    models::{TaskDiff, TaskRegistry},
    process::SystemProcessLister,
    rpc::HttpConnector,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = ConfigStore::open_default()?;
    info!(config = %store.config_path().display(), log = %store.log_path().display(), "using config");

    let (tx, rx) = mpsc::unbounded_channel();
    let handles = init_backend(
        store,
        Arc::new(SystemProcessLister),
        Arc::new(HttpConnector),
        Arc::new(ChannelObserver::new(tx)),
    );
    let consumer = tokio::spawn(drain_events(rx));

    if let Err(err) = commands::auto_connect(&handles).await {
        warn!("auto connect failed, watching service status only: {err:#}");
    }

    let broadcaster = handles.broadcaster.clone().spawn();
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    broadcaster.stop().await;
    handles.session.disconnect().await;
    drop(handles);
    let _ = consumer.await;
    Ok(())
}

/// Owns the task table; every change arrives as an event from the backend.
async fn drain_events(mut rx: mpsc::UnboundedReceiver<StatusEvent>) {
    let mut registry = TaskRegistry::default();
    let mut last_status = None;
    while let Some(event) = rx.recv().await {
        match event {
            StatusEvent::ServiceStatus { running, text, .. } => {
                if last_status.as_ref() != Some(&text) {
                    info!(running, "aria2 {text}");
                    last_status = Some(text);
                }
            }
            StatusEvent::Connection { connected, message } => info!(connected, "{message}"),
            StatusEvent::PollFailed { message } => warn!("{message}"),
            StatusEvent::TaskDiff { upserts, deletes } => {
                let diff = TaskDiff { upserts, deletes };
                if !diff.deletes.is_empty() {
                    info!(gone = ?diff.deletes, "tasks left aria2");
                }
                registry.apply(&diff);
                for task in registry.ordered() {
                    debug!(
                        gid = %task.gid,
                        status = %task.status.label(),
                        progress = task.progress_percent(),
                        size = %task.size_label(),
                        speed = %task.speed_label(),
                        eta = %task.eta_label(),
                        "{}",
                        task.filename
                    );
                }
            }
        }
    }
}
