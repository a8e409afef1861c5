use std::{
    collections::HashSet,
    fs,
    ops::Deref,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    events::SharedObserver,
    models::{Aria2FileSnapshot, Aria2TaskSnapshot, Config},
};

const STATUS_KEYS: [&str; 6] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "files",
];
const STOPPED_PAGE: u32 = 1000;

/// The daemon operations this crate consumes.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn get_global_stat(&self) -> Result<Value>;
    /// Active, waiting and stopped tasks from one consistent daemon response.
    async fn tell_all(&self) -> Result<Vec<Aria2TaskSnapshot>>;
    async fn add_uri(&self, uris: Vec<String>, options: Option<Value>) -> Result<String>;
    /// Returns the gids the daemon accepted. A refused gid does not stop the rest.
    async fn pause(&self, gids: &[String]) -> Result<Vec<String>>;
    async fn unpause(&self, gids: &[String]) -> Result<Vec<String>>;
    /// With `delete_files` the on-disk files go too, and a running task must stop
    /// gracefully; without it running tasks are force-removed and files are kept.
    /// Returns the gids that were removed.
    async fn remove(&self, gids: &[String], delete_files: bool) -> Result<Vec<String>>;
}

pub type SharedRpc = Arc<dyn DaemonRpc>;

/// Builds a client for an endpoint; swapped out in tests.
pub trait RpcConnector: Send + Sync {
    fn build(&self, host: &str, port: u16, secret: Option<&str>) -> Result<SharedRpc>;
}

#[derive(Default)]
pub struct HttpConnector;

impl RpcConnector for HttpConnector {
    fn build(&self, host: &str, port: u16, secret: Option<&str>) -> Result<SharedRpc> {
        let client = Aria2Client::new(endpoint_url(host, port), secret.map(ToString::to_string))?;
        Ok(Arc::new(client))
    }
}

pub fn endpoint_url(host: &str, port: u16) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}:{port}/jsonrpc")
    } else {
        format!("http://{host}:{port}/jsonrpc")
    }
}

#[derive(Clone)]
pub struct Aria2Client {
    endpoint: String,
    secret: Option<String>,
    http: Client,
}

impl Aria2Client {
    pub fn new(endpoint: String, secret: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            endpoint,
            secret: secret.filter(|s| !s.is_empty()),
            http,
        })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let result = self.post(method, self.with_token(params)).await?;
        serde_json::from_value(result).map_err(Into::into)
    }

    /// Runs several calls in one `system.multicall` request. The outer error is
    /// transport or protocol failure; each entry carries its own call's outcome.
    pub async fn multicall(&self, calls: Vec<(&str, Vec<Value>)>) -> Result<Vec<Result<Value>>> {
        let methods = calls.iter().map(|(m, _)| m.to_string()).collect::<Vec<_>>();
        let batch = calls
            .into_iter()
            .map(|(method, params)| json!({ "methodName": method, "params": self.with_token(params) }))
            .collect::<Vec<_>>();
        let Value::Array(entries) = self.post("system.multicall", vec![Value::Array(batch)]).await?
        else {
            bail!("system.multicall: expected an array result");
        };
        if entries.len() != methods.len() {
            bail!(
                "system.multicall: {} results for {} calls",
                entries.len(),
                methods.len()
            );
        }
        Ok(entries
            .into_iter()
            .zip(methods)
            .map(|(entry, method)| multicall_entry(&method, entry))
            .collect())
    }

    fn with_token(&self, mut params: Vec<Value>) -> Vec<Value> {
        if let Some(secret) = &self.secret {
            params.insert(0, json!(format!("token:{secret}")));
        }
        params
    }

    async fn post(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": params
        });

        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let payload: Value = response.json().await?;

        if let Some(err) = payload.get("error") {
            return Err(AppError::Rpc(format!("{method}: {err}")).into());
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("aria2 rpc invalid response: missing result"))
    }

    async fn per_gid(&self, method: &str, gids: &[String]) -> Result<Vec<String>> {
        if gids.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes = self
            .multicall(gids.iter().map(|gid| (method, vec![json!(gid)])).collect())
            .await?;
        Ok(gids
            .iter()
            .zip(outcomes)
            .filter_map(|(gid, outcome)| match outcome {
                Ok(_) => Some(gid.clone()),
                Err(err) => {
                    warn!(%gid, "{method} refused: {err:#}");
                    None
                }
            })
            .collect())
    }
}

// A successful entry is a one-element array; a failed one is a fault object.
fn multicall_entry(method: &str, entry: Value) -> Result<Value> {
    match entry {
        Value::Array(mut values) if values.len() == 1 => Ok(values.remove(0)),
        other => {
            let message = other
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unexpected multicall entry");
            Err(AppError::Rpc(format!("{method}: {message}")).into())
        }
    }
}

#[async_trait]
impl DaemonRpc for Aria2Client {
    async fn get_global_stat(&self) -> Result<Value> {
        self.call("aria2.getGlobalStat", vec![]).await
    }

    async fn tell_all(&self) -> Result<Vec<Aria2TaskSnapshot>> {
        let lists = self
            .multicall(vec![
                ("aria2.tellActive", vec![json!(STATUS_KEYS)]),
                (
                    "aria2.tellWaiting",
                    vec![json!(0), json!(STOPPED_PAGE), json!(STATUS_KEYS)],
                ),
                (
                    "aria2.tellStopped",
                    vec![json!(0), json!(STOPPED_PAGE), json!(STATUS_KEYS)],
                ),
            ])
            .await?;

        let mut seen = HashSet::new();
        let mut snapshots = Vec::new();
        for list in lists {
            let Value::Array(items) = list? else {
                bail!("aria2 task list is not an array");
            };
            for snapshot in items.into_iter().filter_map(parse_snapshot) {
                if seen.insert(snapshot.gid.clone()) {
                    snapshots.push(snapshot);
                }
            }
        }
        Ok(snapshots)
    }

    async fn add_uri(&self, uris: Vec<String>, options: Option<Value>) -> Result<String> {
        let mut params = vec![json!(uris)];
        if let Some(o) = options {
            params.push(o);
        }
        self.call("aria2.addUri", params).await
    }

    async fn pause(&self, gids: &[String]) -> Result<Vec<String>> {
        self.per_gid("aria2.pause", gids).await
    }

    async fn unpause(&self, gids: &[String]) -> Result<Vec<String>> {
        self.per_gid("aria2.unpause", gids).await
    }

    async fn remove(&self, gids: &[String], delete_files: bool) -> Result<Vec<String>> {
        if gids.is_empty() {
            return Ok(Vec::new());
        }
        let statuses = self
            .multicall(
                gids.iter()
                    .map(|gid| ("aria2.tellStatus", vec![json!(gid), json!(["status", "files"])]))
                    .collect(),
            )
            .await?;

        let mut targets = Vec::new();
        let mut calls = Vec::new();
        for (gid, status) in gids.iter().zip(statuses) {
            match status {
                Ok(status) => {
                    let state = status.get("status").and_then(Value::as_str).unwrap_or_default();
                    calls.push((removal_method(state, delete_files), vec![json!(gid)]));
                    targets.push((gid, status));
                }
                Err(err) => warn!(%gid, "cannot remove, status unknown: {err:#}"),
            }
        }
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self.multicall(calls).await?;
        let mut removed = Vec::new();
        for ((gid, status), outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => {
                    if delete_files && let Err(err) = delete_task_files(&status) {
                        warn!(%gid, "task removed but files remain: {err:#}");
                    }
                    removed.push(gid.clone());
                }
                Err(err) => warn!(%gid, "remove refused: {err:#}"),
            }
        }
        Ok(removed)
    }
}

/// Finished tasks only have a result entry left; live ones are removed
/// gracefully when their files go too, forcibly otherwise.
pub fn removal_method(status: &str, delete_files: bool) -> &'static str {
    match status {
        "complete" | "error" | "removed" => "aria2.removeDownloadResult",
        _ if delete_files => "aria2.remove",
        _ => "aria2.forceRemove",
    }
}

/// Deletes each file of a `tellStatus` result plus its `.aria2` control file.
fn delete_task_files(status: &Value) -> Result<()> {
    let paths = status
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.get("path").and_then(Value::as_str))
                .filter(|p| !p.trim().is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    for path in paths {
        let control = format!("{path}.aria2");
        for candidate in [path.as_str(), control.as_str()] {
            let p = Path::new(candidate);
            if p.is_file() {
                fs::remove_file(p).with_context(|| format!("delete {}", p.display()))?;
            }
        }
    }
    Ok(())
}

pub(crate) fn parse_snapshot(value: Value) -> Option<Aria2TaskSnapshot> {
    let gid = value.get("gid")?.as_str()?.to_string();
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("waiting")
        .to_string();
    let files = value
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .map(|f| Aria2FileSnapshot {
                    path: f
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    uris: f
                        .get("uris")
                        .and_then(Value::as_array)
                        .map(|uris| {
                            uris.iter()
                                .filter_map(|u| u.get("uri").and_then(Value::as_str))
                                .map(ToString::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(Aria2TaskSnapshot {
        gid,
        status,
        total_length: parse_u64(&value, "totalLength"),
        completed_length: parse_u64(&value, "completedLength"),
        download_speed: parse_u64(&value, "downloadSpeed"),
        files,
    })
}

// aria2 sends every number as a decimal string.
fn parse_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or_default()
}

/// The one live connection to the daemon. Every call holds the session lock, so
/// the underlying client never sees two operations at once.
pub struct RpcSession {
    connector: Arc<dyn RpcConnector>,
    observer: SharedObserver,
    client: Mutex<Option<SharedRpc>>,
    connected: AtomicBool,
}

pub struct SessionGuard<'a> {
    _lock: MutexGuard<'a, Option<SharedRpc>>,
    rpc: SharedRpc,
}

impl Deref for SessionGuard<'_> {
    type Target = dyn DaemonRpc;

    fn deref(&self) -> &Self::Target {
        self.rpc.as_ref()
    }
}

impl RpcSession {
    pub fn new(connector: Arc<dyn RpcConnector>, observer: SharedObserver) -> Self {
        Self {
            connector,
            observer,
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// A handle is only kept once a `getGlobalStat` call succeeds.
    pub async fn connect(&self, host: &str, port: u16, secret: Option<&str>) -> Result<()> {
        let mut slot = self.client.lock().await;
        *slot = None;
        self.connected.store(false, Ordering::SeqCst);

        let checked = match self.connector.build(host, port, secret) {
            Ok(rpc) => rpc.get_global_stat().await.map(|_| rpc),
            Err(e) => Err(e),
        };
        match checked {
            Ok(rpc) => {
                *slot = Some(rpc);
                self.connected.store(true, Ordering::SeqCst);
                let message = format!("connected to aria2 at {host}:{port}");
                info!("{message}");
                self.observer.on_connection_change(true, &message);
                Ok(())
            }
            Err(err) => {
                let message = format!("connection failed: {err:#}");
                warn!(host, port, "{message}");
                self.observer.on_connection_change(false, &message);
                Err(AppError::Connect(format!("{err:#}")).into())
            }
        }
    }

    pub async fn connect_with_config(&self, config: &Config) -> Result<()> {
        self.connect(&config.host, config.port, config.secret.as_deref())
            .await
    }

    pub async fn disconnect(&self) {
        self.disconnect_with_reason("disconnected").await;
    }

    /// Idempotent; the observer hears `reason` only if a handle was dropped.
    pub async fn disconnect_with_reason(&self, reason: &str) {
        let mut slot = self.client.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        if slot.take().is_some() {
            debug!(reason, "rpc session dropped");
            self.observer.on_connection_change(false, reason);
        }
    }

    /// Exclusive access to the client for one or more calls.
    pub async fn lock(&self) -> Result<SessionGuard<'_>, AppError> {
        let guard = self.client.lock().await;
        let rpc = guard.as_ref().cloned().ok_or(AppError::NotConnected)?;
        Ok(SessionGuard { _lock: guard, rpc })
    }
}
