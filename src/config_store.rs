use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Config, LogLevel};

const APP_DIR_NAME: &str = "aria2-gui";
const CONFIG_FILE_NAME: &str = "aria2.conf";
const LOG_FILE_NAME: &str = "aria2.log";

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
    pub log_file: PathBuf,
    pub default_download_dir: PathBuf,
}

impl ConfigPaths {
    /// Everything under one directory; used by tests and portable installs.
    pub fn in_dir(dir: &Path, default_download_dir: PathBuf) -> Self {
        Self {
            config_file: dir.join(CONFIG_FILE_NAME),
            log_file: dir.join(LOG_FILE_NAME),
            default_download_dir,
        }
    }
}

/// File-backed daemon settings. One instance per run, passed to whoever needs it.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    paths: ConfigPaths,
}

impl ConfigStore {
    pub fn new(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn open_default() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("no per-user config directory on this platform"))?
            .join(APP_DIR_NAME);
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("create config dir: {}", config_dir.display()))?;
        let download_dir = dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(|| config_dir.join("downloads"));
        Ok(Self::new(ConfigPaths::in_dir(&config_dir, download_dir)))
    }

    pub fn config_path(&self) -> &Path {
        &self.paths.config_file
    }

    pub fn log_path(&self) -> &Path {
        &self.paths.log_file
    }

    pub fn defaults(&self) -> Config {
        Config::with_defaults(self.paths.default_download_dir.clone())
    }

    /// Never fails: a missing or unreadable file yields the defaults, which are
    /// written back so the user has something to edit.
    pub fn load(&self) -> Config {
        let raw = match fs::read_to_string(&self.paths.config_file) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.paths.config_file.display(), %err, "config not readable, using defaults");
                return self.persist_defaults();
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => self.merge_with_defaults(|key| map.get(key).cloned()),
            Ok(_) | Err(_) => {
                warn!(path = %self.paths.config_file.display(), "config is corrupt, resetting to defaults");
                self.persist_defaults()
            }
        }
    }

    /// Writes the config as `load` will read it back: empty secret and proxy
    /// become unset, an empty download dir becomes the default one.
    pub fn save(&self, config: &Config) -> Result<()> {
        let payload = serde_json::to_string_pretty(&self.normalized(config))?;
        write_replace(&self.paths.config_file, payload.as_bytes())
    }

    pub fn normalized(&self, config: &Config) -> Config {
        let mut config = config.clone();
        config.secret = config.secret.filter(|s| !s.is_empty());
        config.proxy_url = config.proxy_url.filter(|s| !s.is_empty());
        if config.download_dir.as_os_str().is_empty() {
            config.download_dir = self.paths.default_download_dir.clone();
        }
        config
    }

    /// Saves raw form input. Numeric fields that do not parse become 0.
    pub fn save_fields(&self, fields: &HashMap<String, String>) -> Result<Config> {
        let config =
            self.merge_with_defaults(|key| fields.get(key).map(|v| Value::String(v.trim().to_string())));
        self.save(&config)?;
        Ok(config)
    }

    fn persist_defaults(&self) -> Config {
        let defaults = self.defaults();
        if let Err(err) = self.save(&defaults) {
            warn!("failed to persist default config: {err:#}");
        }
        defaults
    }

    fn merge_with_defaults(&self, get: impl Fn(&str) -> Option<Value>) -> Config {
        let mut config = self.defaults();
        if let Some(v) = get("host").and_then(|v| as_string(&v)) {
            config.host = v;
        }
        if let Some(v) = get("port") {
            config.port = u16::try_from(coerce_int(&v)).unwrap_or(0);
        }
        if let Some(v) = get("secret") {
            config.secret = as_string(&v).filter(|s| !s.is_empty());
        }
        if let Some(v) = get("download_dir").and_then(|v| as_string(&v))
            && !v.is_empty()
        {
            config.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get("max_connections") {
            config.max_connections = u32::try_from(coerce_int(&v)).unwrap_or(0);
        }
        if let Some(v) = get("max_downloads") {
            config.max_downloads = u32::try_from(coerce_int(&v)).unwrap_or(0);
        }
        if let Some(v) = get("all_proxy") {
            config.proxy_url = as_string(&v).filter(|s| !s.is_empty());
        }
        if let Some(v) = get("log_level").and_then(|v| as_string(&v)) {
            config.log_level = LogLevel::parse_lenient(&v);
        }
        config
    }
}

/// Lenient integer coercion: floats truncate, numeric strings parse, anything else is 0.
pub fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn write_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("conf.tmp");
    fs::write(&tmp_path, bytes).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn temp_store() -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("aria2-supervisor-cfg-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp config dir");
        let store = ConfigStore::new(ConfigPaths::in_dir(&dir, dir.join("downloads")));
        (store, dir)
    }

    #[test]
    fn missing_file_yields_defaults_and_writes_them() {
        let (store, dir) = temp_store();
        let loaded = store.load();
        assert_eq!(loaded, store.defaults());
        assert!(store.config_path().exists(), "defaults should be persisted");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let (store, dir) = temp_store();
        fs::write(store.config_path(), "{ not json").expect("write corrupt config");
        let loaded = store.load();
        assert_eq!(loaded, store.defaults());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let (store, dir) = temp_store();
        fs::write(store.config_path(), r#"{"port": "6900", "secret": "s3"}"#)
            .expect("write partial config");
        let loaded = store.load();
        assert_eq!(loaded.port, 6900);
        assert_eq!(loaded.secret.as_deref(), Some("s3"));
        assert_eq!(loaded.host, "localhost");
        assert_eq!(loaded.max_downloads, 10);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (store, dir) = temp_store();
        let cfg = Config {
            host: "127.0.0.1".to_string(),
            port: 16800,
            secret: Some("token".to_string()),
            download_dir: dir.join("dl"),
            max_connections: 4,
            max_downloads: 2,
            proxy_url: Some("http://proxy:8080".to_string()),
            log_level: LogLevel::Warn,
        };
        store.save(&cfg).expect("save config");
        assert_eq!(store.load(), cfg);

        let raw = fs::read_to_string(store.config_path()).expect("read config");
        let host_at = raw.find("\"host\"").expect("host key");
        let level_at = raw.find("\"log_level\"").expect("log_level key");
        assert!(host_at < level_at, "keys keep declaration order");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_optional_fields_round_trip_as_unset() {
        let (store, dir) = temp_store();
        let cfg = Config {
            secret: Some(String::new()),
            proxy_url: Some(String::new()),
            download_dir: PathBuf::new(),
            ..store.defaults()
        };
        store.save(&cfg).expect("save config");

        let loaded = store.load();
        assert_eq!(loaded, store.normalized(&cfg));
        assert_eq!(loaded.secret, None);
        assert_eq!(loaded.proxy_url, None);
        assert_eq!(loaded.download_dir, dir.join("downloads"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn form_fields_are_coerced_leniently() {
        let (store, dir) = temp_store();
        let fields = HashMap::from([
            ("port".to_string(), "abc".to_string()),
            ("max_connections".to_string(), "8".to_string()),
            ("max_downloads".to_string(), "".to_string()),
            ("log_level".to_string(), "debug".to_string()),
            ("unrelated".to_string(), "ignored".to_string()),
        ]);
        let saved = store.save_fields(&fields).expect("save fields");
        assert_eq!(saved.port, 0);
        assert_eq!(saved.max_connections, 8);
        assert_eq!(saved.max_downloads, 0);
        assert_eq!(saved.log_level, LogLevel::Debug);
        assert_eq!(store.load(), saved);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn coerce_int_handles_mixed_inputs() {
        assert_eq!(coerce_int(&Value::from(12)), 12);
        assert_eq!(coerce_int(&Value::from(12.9)), 12);
        assert_eq!(coerce_int(&Value::from("7")), 7);
        assert_eq!(coerce_int(&Value::from("x7")), 0);
        assert_eq!(coerce_int(&Value::Null), 0);
    }
}
