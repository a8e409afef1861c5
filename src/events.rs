use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::models::Task;

/// Receives everything the backend wants the presentation layer to show.
/// Implementations must not block; hop to the owning thread instead.
pub trait StatusObserver: Send + Sync {
    fn on_service_status_change(&self, running: bool, text: &str, color_hint: &str);
    fn on_connection_change(&self, connected: bool, message: &str);
    fn on_task_diff(&self, upserts: &[Task], deletes: &BTreeSet<String>);

    /// A refresh cycle failed while the session is still considered connected.
    fn on_poll_failed(&self, message: &str) {
        self.on_connection_change(true, message);
    }
}

pub type SharedObserver = Arc<dyn StatusObserver>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    ServiceStatus {
        running: bool,
        text: String,
        color_hint: String,
    },
    Connection {
        connected: bool,
        message: String,
    },
    TaskDiff {
        upserts: Vec<Task>,
        deletes: BTreeSet<String>,
    },
    PollFailed {
        message: String,
    },
}

/// Forwards observations as messages so the thread that owns the registry can
/// drain them in order.
pub struct ChannelObserver {
    tx: UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("status receiver dropped");
        }
    }
}

impl StatusObserver for ChannelObserver {
    fn on_service_status_change(&self, running: bool, text: &str, color_hint: &str) {
        self.send(StatusEvent::ServiceStatus {
            running,
            text: text.to_string(),
            color_hint: color_hint.to_string(),
        });
    }

    fn on_connection_change(&self, connected: bool, message: &str) {
        self.send(StatusEvent::Connection {
            connected,
            message: message.to_string(),
        });
    }

    fn on_task_diff(&self, upserts: &[Task], deletes: &BTreeSet<String>) {
        self.send(StatusEvent::TaskDiff {
            upserts: upserts.to_vec(),
            deletes: deletes.clone(),
        });
    }

    fn on_poll_failed(&self, message: &str) {
        self.send(StatusEvent::PollFailed {
            message: message.to_string(),
        });
    }
}
