use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use chrono::{Local, TimeZone};
use sysinfo::{Pid, Signal, System};
use tokio::{process::Command, time};
use tracing::{info, warn};

use crate::{
    config_store::ConfigStore,
    error::AppError,
    models::{Config, ProcessInfo, ServiceStatus},
};

pub const DAEMON_NAME: &str = "aria2c";
pub const RPC_ENABLE_FLAG: &str = "--enable-rpc";

/// Process-table access, kept behind a trait so tests can fake the OS.
pub trait ProcessLister: Send + Sync {
    fn find_by_name_and_arg(&self, name: &str, arg: &str) -> Option<ProcessInfo>;
    /// Sends a graceful terminate signal. Returns whether it was dispatched.
    fn terminate(&self, pid: u32) -> bool;
}

pub type SharedLister = Arc<dyn ProcessLister>;

/// Both the executable name and an argument containing `arg` must match.
pub fn is_matching_process(info: &ProcessInfo, name: &str, arg: &str) -> bool {
    let proc_name = info.name.strip_suffix(".exe").unwrap_or(&info.name);
    proc_name == name && info.cmd.iter().any(|a| a.contains(arg))
}

#[derive(Default)]
pub struct SystemProcessLister;

impl ProcessLister for SystemProcessLister {
    fn find_by_name_and_arg(&self, name: &str, arg: &str) -> Option<ProcessInfo> {
        let mut sys = System::new();
        sys.refresh_processes();
        sys.processes().iter().find_map(|(pid, process)| {
            let info = ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cmd: process.cmd().to_vec(),
                start_time: Some(process.start_time()).filter(|t| *t > 0),
            };
            is_matching_process(&info, name, arg).then_some(info)
        })
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut sys = System::new();
        sys.refresh_processes();
        let Some(process) = sys.process(Pid::from_u32(pid)) else {
            return false;
        };
        // Platforms without SIGTERM report None; fall back to the default kill.
        process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill())
    }
}

pub struct ProcessSupervisor {
    store: ConfigStore,
    lister: SharedLister,
    bin_override: Option<PathBuf>,
    settle_delay: Duration,
}

impl ProcessSupervisor {
    pub fn new(store: ConfigStore, lister: SharedLister) -> Self {
        Self {
            store,
            lister,
            bin_override: None,
            settle_delay: Duration::from_secs(2),
        }
    }

    pub fn with_binary(mut self, bin: impl Into<PathBuf>) -> Self {
        self.bin_override = Some(bin.into());
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    fn find_daemon(&self) -> Option<ProcessInfo> {
        self.lister.find_by_name_and_arg(DAEMON_NAME, RPC_ENABLE_FLAG)
    }

    pub fn is_running(&self) -> bool {
        self.find_daemon().is_some()
    }

    /// Launches the daemon detached. Success means it shows up in the process
    /// table after the settle delay; aria2c forks away so its exit code says nothing.
    pub async fn start(&self, config: &Config) -> Result<bool> {
        if self.is_running() {
            return Ok(true);
        }

        let bin = self.resolve_binary()?;
        let log_path = self.store.log_path().to_path_buf();
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = tokio::fs::create_dir_all(&config.download_dir).await {
            warn!(dir = %config.download_dir.display(), %err, "could not create download dir");
        }

        let args = build_launch_args(config, &log_path);
        let mut command = Command::new(&bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);
        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::BinaryNotFound(bin.display().to_string()),
            _ => AppError::Launch(format!("{}: {e}", bin.display())),
        })?;
        info!(bin = %bin.display(), port = config.port, "aria2c launched");
        // Reap the foreground parent once it daemonizes.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        time::sleep(self.settle_delay).await;
        let running = self.is_running();
        if !running {
            warn!("aria2c not found in process table after launch");
        }
        Ok(running)
    }

    /// Does not wait for the daemon to exit.
    pub fn stop(&self) -> bool {
        let Some(process) = self.find_daemon() else {
            return true;
        };
        let sent = self.lister.terminate(process.pid);
        if sent {
            info!(pid = process.pid, "terminate signal sent to aria2c");
        } else {
            warn!(pid = process.pid, "failed to signal aria2c");
        }
        sent
    }

    pub fn status(&self) -> ServiceStatus {
        let found = self.find_daemon();
        ServiceStatus {
            running: found.is_some(),
            pid: found.as_ref().map(|p| p.pid),
            start_time: found
                .as_ref()
                .and_then(|p| p.start_time)
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Local.timestamp_opt(secs, 0).single()),
            config_path: self.store.config_path().to_path_buf(),
            log_path: self.store.log_path().to_path_buf(),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, AppError> {
        if let Some(bin) = &self.bin_override {
            return if bin.exists() {
                Ok(bin.clone())
            } else {
                Err(AppError::BinaryNotFound(bin.display().to_string()))
            };
        }
        system_daemon_candidates()
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| AppError::BinaryNotFound(format!("{DAEMON_NAME} is not on PATH")))
    }
}

pub fn build_launch_args(config: &Config, log_path: &Path) -> Vec<String> {
    let mut args = vec![
        format!("{RPC_ENABLE_FLAG}=true"),
        "--rpc-listen-all=true".to_string(),
        "--rpc-allow-origin-all=true".to_string(),
        format!("--rpc-listen-port={}", config.port),
        format!("--dir={}", config.download_dir.display()),
        format!("--max-connection-per-server={}", config.max_connections),
        format!("--max-concurrent-downloads={}", config.max_downloads),
        format!("--split={}", config.max_connections),
        "--min-split-size=1M".to_string(),
        "--continue=true".to_string(),
        "--max-tries=5".to_string(),
        "--retry-wait=3".to_string(),
        "--disk-cache=32M".to_string(),
        "--file-allocation=falloc".to_string(),
        format!("--log={}", log_path.display()),
        format!("--log-level={}", config.log_level.as_str()),
        "--daemon=true".to_string(),
    ];
    if let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) {
        args.push(format!("--rpc-secret={secret}"));
    }
    if let Some(proxy) = config.proxy_url.as_deref().filter(|s| !s.is_empty()) {
        args.push(format!("--all-proxy={proxy}"));
    }
    args
}

fn system_daemon_candidates() -> Vec<PathBuf> {
    let exe = if cfg!(target_os = "windows") {
        format!("{DAEMON_NAME}.exe")
    } else {
        DAEMON_NAME.to_string()
    };
    let mut candidates = Vec::new();
    if let Some(path_var) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path_var).map(|dir| dir.join(&exe)));
    }
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/bin/aria2c"));
        candidates.push(PathBuf::from("/usr/local/bin/aria2c"));
    }
    if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/usr/bin/aria2c"));
        candidates.push(PathBuf::from("/usr/local/bin/aria2c"));
    }
    candidates
}
