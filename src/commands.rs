use std::{collections::HashMap, path::PathBuf};

use anyhow::Result;
use tracing::info;

use crate::{
    BackendHandles,
    daemon_log::{LogSeverity, read_log_tail},
    error::AppError,
    models::Config,
};

pub const DEFAULT_LOG_LINES: usize = 200;

/// Starts the daemon and publishes the resulting status.
pub async fn start_service(handles: &BackendHandles) -> Result<bool> {
    let config = handles.config_store().load();
    let started = handles.supervisor.start(&config).await;
    handles.broadcaster.slow_cycle().await;
    started
}

/// Drops the RPC session first so the refresh loop stops talking to a dying
/// daemon.
pub async fn stop_service(handles: &BackendHandles) -> bool {
    handles.session.disconnect().await;
    let stopped = handles.supervisor.stop();
    handles.broadcaster.slow_cycle().await;
    stopped
}

/// Makes sure the daemon runs, then connects with the persisted settings.
pub async fn auto_connect(handles: &BackendHandles) -> Result<()> {
    let config = handles.config_store().load();
    if !handles.supervisor.is_running() {
        info!("aria2c not running, starting it before connecting");
        if !start_service(handles).await? {
            return Err(AppError::Launch("aria2c did not appear after launch".to_string()).into());
        }
    }
    handles.session.connect_with_config(&config).await
}

pub async fn add_download(handles: &BackendHandles, url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::InvalidInput("url is empty".to_string()).into());
    }
    let config = handles.config_store().load();
    handles
        .reconciler
        .add(url, Some(&config.download_dir))
        .await
}

/// One URL per line; blank lines are skipped. Returns the accepted gids.
pub async fn add_downloads(handles: &BackendHandles, text: &str) -> Result<Vec<String>> {
    let urls = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if urls.is_empty() {
        return Err(AppError::InvalidInput("no urls given".to_string()).into());
    }
    ensure_connected(handles)?;
    let config = handles.config_store().load();
    Ok(handles
        .reconciler
        .add_batch(&urls, Some(&config.download_dir))
        .await)
}

pub async fn pause_selected(handles: &BackendHandles, gids: &[String]) -> Result<usize> {
    check_selection(handles, gids)?;
    handles.reconciler.pause(gids).await
}

pub async fn resume_selected(handles: &BackendHandles, gids: &[String]) -> Result<usize> {
    check_selection(handles, gids)?;
    handles.reconciler.resume(gids).await
}

pub async fn remove_selected(handles: &BackendHandles, gids: &[String]) -> Result<usize> {
    check_selection(handles, gids)?;
    handles.reconciler.remove(gids).await
}

/// Folder holding a task's file. Uses the path aria2 reports and falls back to
/// the configured download directory joined with the task's display name.
pub async fn task_location(handles: &BackendHandles, gid: &str) -> Result<PathBuf> {
    ensure_connected(handles)?;
    let tasks = handles.reconciler.poll().await?;
    let task = tasks
        .into_iter()
        .find(|t| t.gid == gid)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown task {gid}")))?;
    let file = match task.file_path {
        Some(path) => path,
        None => handles.config_store().load().download_dir.join(&task.filename),
    };
    if !file.exists() {
        return Err(
            AppError::InvalidInput(format!("file does not exist: {}", file.display())).into(),
        );
    }
    let dir = file
        .parent()
        .ok_or_else(|| AppError::InvalidInput(format!("no parent folder: {}", file.display())))?;
    Ok(dir.to_path_buf())
}

pub fn service_logs(handles: &BackendHandles, lines: usize) -> Vec<(LogSeverity, String)> {
    read_log_tail(handles.config_store().log_path(), lines)
        .into_iter()
        .map(|line| (LogSeverity::classify(&line), line))
        .collect()
}

pub fn load_settings(handles: &BackendHandles) -> Config {
    handles.config_store().load()
}

/// Persists form input. Takes effect on the next start/connect.
pub fn save_settings(handles: &BackendHandles, fields: &HashMap<String, String>) -> Result<Config> {
    handles.config_store().save_fields(fields)
}

fn check_selection(handles: &BackendHandles, gids: &[String]) -> Result<(), AppError> {
    if gids.is_empty() {
        return Err(AppError::InvalidInput("no tasks selected".to_string()));
    }
    ensure_connected(handles)
}

fn ensure_connected(handles: &BackendHandles) -> Result<(), AppError> {
    if handles.session.is_connected() {
        Ok(())
    } else {
        Err(AppError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        events::{StatusEvent, tests::RecordingObserver},
        init_backend,
        models::ProcessInfo,
        process::tests::{FakeLister, proc, temp_store},
        rpc::tests::{MockConnector, MockRpc, snapshot},
    };

    struct Fixture {
        handles: BackendHandles,
        mock: Arc<MockRpc>,
        lister: Arc<FakeLister>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(procs: Vec<ProcessInfo>) -> Fixture {
        let mock = Arc::new(MockRpc::with_tasks(vec![
            snapshot("a1", "active", "http://x/a.bin"),
            snapshot("b2", "paused", "http://x/b.bin"),
        ]));
        let lister = Arc::new(FakeLister::with(procs));
        let observer = Arc::new(RecordingObserver::default());
        let handles = init_backend(
            temp_store(),
            lister.clone(),
            Arc::new(MockConnector(mock.clone())),
            observer.clone(),
        );
        Fixture {
            handles,
            mock,
            lister,
            observer,
        }
    }

    fn running_daemon() -> Vec<ProcessInfo> {
        vec![proc(31, "aria2c", &["aria2c", "--enable-rpc=true"])]
    }

    fn app_error(err: &anyhow::Error) -> Option<&AppError> {
        err.downcast_ref::<AppError>()
    }

    #[tokio::test]
    async fn auto_connect_reuses_running_daemon() {
        let f = fixture(running_daemon());
        auto_connect(&f.handles).await.expect("auto connect");
        assert!(f.handles.session.is_connected());
        assert_eq!(f.mock.calls(), vec!["get_global_stat"]);
        assert!(f.observer.events().iter().any(|e| matches!(
            e,
            StatusEvent::Connection { connected: true, .. }
        )));
    }

    #[tokio::test]
    async fn start_service_publishes_status() {
        let f = fixture(running_daemon());
        assert!(start_service(&f.handles).await.expect("start"));
        assert!(f.observer.events().contains(&StatusEvent::ServiceStatus {
            running: true,
            text: "running (pid 31)".to_string(),
            color_hint: "green".to_string(),
        }));
    }

    #[tokio::test]
    async fn stop_service_disconnects_and_signals() {
        let f = fixture(running_daemon());
        auto_connect(&f.handles).await.expect("auto connect");

        assert!(stop_service(&f.handles).await);
        assert!(!f.handles.session.is_connected());
        assert_eq!(*f.lister.terminated.lock().expect("terminated mutex"), vec![31]);
        assert!(f.observer.events().iter().any(|e| matches!(
            e,
            StatusEvent::Connection { connected: false, message } if message == "disconnected"
        )));
    }

    #[tokio::test]
    async fn selection_is_checked_before_daemon_is_contacted() {
        let f = fixture(running_daemon());

        let err = pause_selected(&f.handles, &["a1".to_string()])
            .await
            .expect_err("not connected");
        assert!(matches!(app_error(&err), Some(AppError::NotConnected)));

        auto_connect(&f.handles).await.expect("auto connect");
        let err = remove_selected(&f.handles, &[]).await.expect_err("empty");
        assert!(matches!(app_error(&err), Some(AppError::InvalidInput(_))));
        assert!(!f.mock.calls().iter().any(|c| c.starts_with("remove")));

        assert_eq!(
            resume_selected(&f.handles, &["b2".to_string()])
                .await
                .expect("resume"),
            1
        );
        assert!(f.mock.calls().contains(&"unpause:b2".to_string()));
    }

    #[tokio::test]
    async fn downloads_go_to_configured_dir() {
        let f = fixture(running_daemon());
        auto_connect(&f.handles).await.expect("auto connect");

        let gid = add_download(&f.handles, "  https://example.com/file.iso ")
            .await
            .expect("add");
        assert_eq!(gid, "gid-added");
        assert!(load_settings(&f.handles).download_dir.is_dir());

        let gids = add_downloads(&f.handles, "https://example.com/1\n\nnot a url\n")
            .await
            .expect("batch");
        assert_eq!(gids.len(), 1);

        let err = add_downloads(&f.handles, " \n").await.expect_err("nothing to add");
        assert!(matches!(app_error(&err), Some(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn task_location_prefers_daemon_path() {
        let f = fixture(running_daemon());
        auto_connect(&f.handles).await.expect("auto connect");

        let dir = std::env::temp_dir().join(format!("aria2-loc-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = dir.join("b.bin");
        std::fs::write(&file, b"x").expect("write");
        f.mock.tasks.lock().expect("tasks mutex")[1].files[0].path =
            file.to_string_lossy().to_string();

        assert_eq!(task_location(&f.handles, "b2").await.expect("located"), dir);

        // a1 has no daemon path and nothing named a.bin in the download dir
        let err = task_location(&f.handles, "a1").await.expect_err("missing file");
        assert!(err.to_string().contains("file does not exist"));

        let download_dir = load_settings(&f.handles).download_dir;
        std::fs::create_dir_all(&download_dir).expect("mkdir downloads");
        std::fs::write(download_dir.join("a.bin"), b"y").expect("write");
        assert_eq!(
            task_location(&f.handles, "a1").await.expect("fallback"),
            download_dir
        );

        let err = task_location(&f.handles, "zz").await.expect_err("unknown gid");
        assert!(matches!(app_error(&err), Some(AppError::InvalidInput(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn settings_round_trip_through_store() {
        let f = fixture(Vec::new());
        let fields = HashMap::from([
            ("port".to_string(), "6801".to_string()),
            ("max_downloads".to_string(), "lots".to_string()),
        ]);
        let saved = save_settings(&f.handles, &fields).expect("save");
        assert_eq!(saved.port, 6801);
        assert_eq!(saved.max_downloads, 0);
        assert_eq!(load_settings(&f.handles), saved);
    }

    #[test]
    fn logs_are_classified() {
        let f = fixture(Vec::new());
        let path = f.handles.config_store().log_path().to_path_buf();
        std::fs::create_dir_all(path.parent().expect("log dir")).expect("mkdir");
        std::fs::write(&path, "[NOTICE] started\n[ERROR] disk full\n").expect("write log");

        let lines = service_logs(&f.handles, DEFAULT_LOG_LINES);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], (LogSeverity::Error, "[ERROR] disk full".to_string()));
    }
}
