pub mod broadcaster;
pub mod commands;
pub mod config_store;
pub mod daemon_log;
pub mod error;
pub mod events;
pub mod models;
pub mod naming;
pub mod process;
pub mod reconciler;
pub mod rpc;

use std::sync::Arc;

use broadcaster::StatusBroadcaster;
use config_store::ConfigStore;
use events::SharedObserver;
use process::{ProcessSupervisor, SharedLister};
use reconciler::TaskReconciler;
use rpc::{RpcConnector, RpcSession};

pub struct BackendHandles {
    pub supervisor: Arc<ProcessSupervisor>,
    pub session: Arc<RpcSession>,
    pub reconciler: Arc<TaskReconciler>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub observer: SharedObserver,
}

impl BackendHandles {
    pub fn config_store(&self) -> &ConfigStore {
        self.supervisor.config_store()
    }
}

/// Wires the components together. Nothing is started or connected here; see
/// [`commands::auto_connect`] and [`StatusBroadcaster::spawn`].
pub fn init_backend(
    store: ConfigStore,
    lister: SharedLister,
    connector: Arc<dyn RpcConnector>,
    observer: SharedObserver,
) -> BackendHandles {
    let supervisor = Arc::new(ProcessSupervisor::new(store, lister));
    let session = Arc::new(RpcSession::new(connector, observer.clone()));
    let reconciler = Arc::new(TaskReconciler::new(session.clone()));
    let broadcaster = Arc::new(StatusBroadcaster::new(
        reconciler.clone(),
        supervisor.clone(),
        observer.clone(),
    ));
    BackendHandles {
        supervisor,
        session,
        reconciler,
        broadcaster,
        observer,
    }
}
