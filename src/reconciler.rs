use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::AppError,
    models::{Aria2TaskSnapshot, Task, TaskDiff, TaskStatus},
    naming::{derive_filename, filename_from_path},
    rpc::RpcSession,
};

const DEFAULT_SPLIT: u32 = 16;

/// Mirrors the daemon's task list into upsert/delete diffs and runs batch
/// operations against whatever tasks still exist.
pub struct TaskReconciler {
    session: Arc<RpcSession>,
}

impl TaskReconciler {
    pub fn new(session: Arc<RpcSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<RpcSession> {
        &self.session
    }

    /// One `tell_all` round trip, mapped to [`Task`]s.
    pub async fn poll(&self) -> Result<Vec<Task>> {
        let rpc = self.session.lock().await?;
        let snapshots = rpc.tell_all().await?;
        Ok(snapshots.into_iter().map(task_from_snapshot).collect())
    }

    /// Pauses every resolved task the daemon accepts. Returns how many were paused.
    pub async fn pause(&self, gids: &[String]) -> Result<usize> {
        let rpc = self.session.lock().await?;
        let resolved = resolve(gids, &rpc.tell_all().await?);
        if resolved.is_empty() {
            return Ok(0);
        }
        let paused = rpc.pause(&resolved).await?;
        log_batch("paused", resolved.len(), paused.len());
        Ok(paused.len())
    }

    pub async fn resume(&self, gids: &[String]) -> Result<usize> {
        let rpc = self.session.lock().await?;
        let resolved = resolve(gids, &rpc.tell_all().await?);
        if resolved.is_empty() {
            return Ok(0);
        }
        let resumed = rpc.unpause(&resolved).await?;
        log_batch("resumed", resolved.len(), resumed.len());
        Ok(resumed.len())
    }

    /// Tries a full removal first, then a batch that keeps files on disk, then
    /// each remaining gid on its own. Each pass only sees what earlier passes
    /// left behind. Returns how many tasks were removed.
    pub async fn remove(&self, gids: &[String]) -> Result<usize> {
        let rpc = self.session.lock().await?;
        let mut pending = resolve(gids, &rpc.tell_all().await?);
        if pending.is_empty() {
            return Ok(0);
        }
        let requested = pending.len();

        let mut removed = 0;
        for delete_files in [true, false] {
            match rpc.remove(&pending, delete_files).await {
                Ok(done) => {
                    removed += done.len();
                    pending.retain(|gid| !done.contains(gid));
                }
                Err(err) => warn!(delete_files, "batch remove failed: {err:#}"),
            }
            if pending.is_empty() {
                log_batch("removed", requested, removed);
                return Ok(removed);
            }
        }

        for gid in &pending {
            match rpc.remove(std::slice::from_ref(gid), false).await {
                Ok(done) => removed += done.len(),
                Err(err) => warn!(%gid, "remove failed: {err:#}"),
            }
        }
        log_batch("removed", requested, removed);
        Ok(removed)
    }

    pub async fn add(&self, url: &str, download_dir: Option<&Path>) -> Result<String> {
        validate_url(url)?;
        let mut options = Map::new();
        options.insert(
            "max-connection-per-server".to_string(),
            json!(DEFAULT_SPLIT.to_string()),
        );
        options.insert("split".to_string(), json!(DEFAULT_SPLIT.to_string()));
        if let Some(dir) = download_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create download dir {}", dir.display()))?;
            options.insert("dir".to_string(), json!(dir.to_string_lossy()));
        }

        let rpc = self.session.lock().await?;
        let gid = rpc
            .add_uri(vec![url.to_string()], Some(Value::Object(options)))
            .await?;
        info!(%gid, url, "download added");
        Ok(gid)
    }

    /// Adds each URL independently; returns the gids that were accepted.
    pub async fn add_batch(&self, urls: &[String], download_dir: Option<&Path>) -> Vec<String> {
        let mut gids = Vec::with_capacity(urls.len());
        for url in urls {
            match self.add(url, download_dir).await {
                Ok(gid) => gids.push(gid),
                Err(err) => warn!(url, "add failed: {err:#}"),
            }
        }
        gids
    }
}

/// Everything fresh is an upsert; every previously known gid missing from the
/// fresh list is a delete. Re-running on the same input gives the same diff.
pub fn reconcile(previous: &HashSet<String>, fresh: Vec<Task>) -> TaskDiff {
    let live = fresh.iter().map(|t| t.gid.as_str()).collect::<HashSet<_>>();
    let deletes = previous
        .iter()
        .filter(|gid| !live.contains(gid.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>();
    TaskDiff {
        upserts: fresh,
        deletes,
    }
}

pub fn task_from_snapshot(snapshot: Aria2TaskSnapshot) -> Task {
    let first = snapshot.files.first();
    let source_url = first.and_then(|f| f.uris.first()).cloned();
    let file_path = first
        .map(|f| f.path.trim())
        .filter(|path| filename_from_path(path).is_some())
        .map(PathBuf::from);
    let filename = derive_filename(
        &snapshot.gid,
        first.map(|f| f.path.as_str()),
        source_url.as_deref(),
    );
    let total_bytes = snapshot.total_length;
    let completed_bytes = if total_bytes > 0 {
        snapshot.completed_length.min(total_bytes)
    } else {
        snapshot.completed_length
    };
    Task {
        status: TaskStatus::from_aria2_status(&snapshot.status),
        gid: snapshot.gid,
        filename,
        total_bytes,
        completed_bytes,
        download_speed_bps: snapshot.download_speed,
        source_url,
        file_path,
    }
}

/// Requested gids still known to the daemon, deduplicated, in request order.
fn resolve(requested: &[String], live: &[Aria2TaskSnapshot]) -> Vec<String> {
    let known = live.iter().map(|s| s.gid.as_str()).collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    let resolved = requested
        .iter()
        .filter(|gid| known.contains(gid.as_str()) && seen.insert(gid.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if resolved.len() < requested.len() {
        debug!(
            requested = requested.len(),
            resolved = resolved.len(),
            "some gids are no longer known to aria2"
        );
    }
    resolved
}

fn log_batch(action: &str, requested: usize, affected: usize) {
    if affected < requested {
        warn!(requested, affected, "only some tasks were {action}");
    } else {
        info!(count = affected, "{action} tasks");
    }
}

fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidInput(format!("invalid url: {e}")))?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(AppError::InvalidInput(format!("url has no host: {url}")));
    }
    Ok(())
}
