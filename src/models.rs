use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    path::PathBuf,
};

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Notice,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Unknown names fall back to `info`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "notice" => Self::Notice,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Persisted daemon settings. Field order is the on-disk key order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    #[serde(serialize_with = "empty_if_none")]
    pub secret: Option<String>,
    pub download_dir: PathBuf,
    pub max_connections: u32,
    pub max_downloads: u32,
    #[serde(rename = "all_proxy", serialize_with = "empty_if_none")]
    pub proxy_url: Option<String>,
    pub log_level: LogLevel,
}

impl Config {
    pub fn with_defaults(download_dir: PathBuf) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6800,
            secret: None,
            download_dir,
            max_connections: 16,
            max_downloads: 10,
            proxy_url: None,
            log_level: LogLevel::Info,
        }
    }
}

fn empty_if_none<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_deref().unwrap_or_default())
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Local>>,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
}

impl ServiceStatus {
    pub fn status_text(&self) -> String {
        match (self.running, self.pid) {
            (true, Some(pid)) => format!("running (pid {pid})"),
            (true, None) => "running".to_string(),
            (false, _) => "not running".to_string(),
        }
    }

    pub fn color_hint(&self) -> &'static str {
        if self.running { "green" } else { "red" }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    /// Seconds since the Unix epoch.
    pub start_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Waiting,
    Active,
    Paused,
    Complete,
    Error,
    Removed,
    /// A daemon status string this crate does not know, kept verbatim.
    Other(String),
}

impl TaskStatus {
    pub fn from_aria2_status(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "waiting" => Self::Waiting,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "removed" => Self::Removed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Removed => "removed",
            Self::Other(s) => s,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Waiting => "Waiting",
            Self::Active => "Downloading",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Removed => "Removed",
            Self::Other(s) => s,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Removed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Task {
    pub gid: String,
    pub status: TaskStatus,
    pub filename: String,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub download_speed_bps: u64,
    pub source_url: Option<String>,
    /// Where the daemon writes the file, when it has said so.
    pub file_path: Option<PathBuf>,
}

impl Task {
    pub fn progress_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = u128::from(self.completed_bytes) * 100 / u128::from(self.total_bytes);
        pct.min(100) as u8
    }

    pub fn size_label(&self) -> String {
        if self.total_bytes == 0 {
            return "unknown".to_string();
        }
        format!(
            "{}/{}",
            format_size(self.completed_bytes),
            format_size(self.total_bytes)
        )
    }

    pub fn speed_label(&self) -> String {
        if self.download_speed_bps == 0 {
            return "0 B/s".to_string();
        }
        format!("{}/s", format_size(self.download_speed_bps))
    }

    pub fn eta_label(&self) -> String {
        if self.download_speed_bps == 0 || self.total_bytes <= self.completed_bytes {
            return "unknown".to_string();
        }
        let remaining = self.total_bytes - self.completed_bytes;
        format_duration(remaining / self.download_speed_bps)
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Raw task entry as reported by `tellActive`/`tellWaiting`/`tellStopped`.
#[derive(Debug, Clone, Default)]
pub struct Aria2TaskSnapshot {
    pub gid: String,
    pub status: String,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub files: Vec<Aria2FileSnapshot>,
}

#[derive(Debug, Clone, Default)]
pub struct Aria2FileSnapshot {
    pub path: String,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskDiff {
    pub upserts: Vec<Task>,
    pub deletes: BTreeSet<String>,
}

impl TaskDiff {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Presentation-side task table. Only [`TaskRegistry::apply`] mutates it.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

impl TaskRegistry {
    pub fn apply(&mut self, diff: &TaskDiff) {
        if !diff.deletes.is_empty() {
            for gid in &diff.deletes {
                self.tasks.remove(gid);
            }
            self.order.retain(|gid| !diff.deletes.contains(gid));
        }
        for task in &diff.upserts {
            if self
                .tasks
                .insert(task.gid.clone(), task.clone())
                .is_none()
            {
                self.order.push(task.gid.clone());
            }
        }
    }

    pub fn get(&self, gid: &str) -> Option<&Task> {
        self.tasks.get(gid)
    }

    pub fn gids(&self) -> HashSet<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Tasks in the order they were first seen.
    pub fn ordered(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|gid| self.tasks.get(gid))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(gid: &str, total: u64, completed: u64, speed: u64) -> Task {
        Task {
            gid: gid.to_string(),
            status: TaskStatus::Active,
            filename: format!("{gid}.bin"),
            total_bytes: total,
            completed_bytes: completed,
            download_speed_bps: speed,
            source_url: None,
            file_path: None,
        }
    }

    #[test]
    fn progress_is_floored_and_safe_on_zero_total() {
        assert_eq!(task("a", 200, 50, 0).progress_percent(), 25);
        assert_eq!(task("b", 3, 1, 0).progress_percent(), 33);
        assert_eq!(task("c", 0, 0, 0).progress_percent(), 0);
        assert_eq!(task("d", 0, 10, 0).progress_percent(), 0);
    }

    #[test]
    fn labels_follow_source_fields() {
        let t = task("a", 2048, 1024, 512);
        assert_eq!(t.size_label(), "1.0 KB/2.0 KB");
        assert_eq!(t.speed_label(), "512.0 B/s");
        assert_eq!(t.eta_label(), "2s");

        let idle = task("b", 0, 0, 0);
        assert_eq!(idle.size_label(), "unknown");
        assert_eq!(idle.speed_label(), "0 B/s");
        assert_eq!(idle.eta_label(), "unknown");
    }

    #[test]
    fn duration_formatting_buckets() {
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3725), "1h 2m");
    }

    #[test]
    fn unknown_status_passes_through_verbatim() {
        let status = TaskStatus::from_aria2_status("seeding");
        assert_eq!(status, TaskStatus::Other("seeding".to_string()));
        assert_eq!(status.label(), "seeding");
        assert_eq!(TaskStatus::from_aria2_status("waiting"), TaskStatus::Waiting);
    }

    #[test]
    fn registry_keeps_first_seen_order() {
        let mut registry = TaskRegistry::default();
        registry.apply(&TaskDiff {
            upserts: vec![task("a", 1, 0, 0), task("b", 1, 0, 0)],
            deletes: BTreeSet::new(),
        });
        registry.apply(&TaskDiff {
            upserts: vec![task("c", 1, 0, 0), task("b", 1, 1, 0)],
            deletes: BTreeSet::from(["a".to_string()]),
        });

        let gids = registry.ordered().map(|t| t.gid.as_str()).collect::<Vec<_>>();
        assert_eq!(gids, vec!["b", "c"]);
        assert_eq!(registry.get("b").map(|t| t.completed_bytes), Some(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn config_serializes_with_persisted_key_names() {
        let cfg = Config::with_defaults(PathBuf::from("/tmp/dl"));
        let value = serde_json::to_value(&cfg).expect("serialize config");
        assert_eq!(value["secret"], "");
        assert_eq!(value["all_proxy"], "");
        assert_eq!(value["log_level"], "info");
        assert_eq!(value["port"], 6800);
    }
}
