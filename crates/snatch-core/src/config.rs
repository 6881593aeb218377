use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{SnatchError, SnatchResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnatchConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SnatchConfig {
    /// Load from a TOML file. A missing file is not an error: the daemon
    /// logs a warning and proceeds with defaults, matching how `tcfsd` treats
    /// a missing config file.
    pub fn load(path: &std::path::Path) -> SnatchResult<SnatchConfig> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| SnatchError::Validation(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(SnatchConfig::default())
            }
            Err(e) => Err(SnatchError::Io(e)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            api_key: None,
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default = "default_profiles_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub default_ssh_key_path: Option<PathBuf>,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        ProfilesConfig {
            path: default_profiles_path(),
            default_ssh_key_path: None,
        }
    }
}

fn default_profiles_path() -> PathBuf {
    PathBuf::from("/var/lib/snatchd/profiles.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            path: default_registry_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/snatchd/tasks.db")
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub telegram_config_path: Option<PathBuf>,
    #[serde(default)]
    pub cloudflare_config_path: Option<PathBuf>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            telegram_config_path: None,
            cloudflare_config_path: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn default_notify_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: i64,
    #[serde(default = "default_launch_wait_secs")]
    pub launch_wait_secs: u64,
    #[serde(default = "default_micro_shape_quota")]
    pub micro_shape_quota: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_delay_secs: default_min_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            progress_interval_secs: default_progress_interval_secs(),
            launch_wait_secs: default_launch_wait_secs(),
            micro_shape_quota: default_micro_shape_quota(),
        }
    }
}

fn default_min_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_progress_interval_secs() -> i64 {
    5
}

fn default_launch_wait_secs() -> u64 {
    600
}

fn default_micro_shape_quota() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let cfg: SnatchConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.daemon.listen_addr, "127.0.0.1:8080");
        assert_eq!(cfg.registry.busy_timeout_ms, 5000);
        assert_eq!(cfg.engine.micro_shape_quota, 2);
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
            [daemon]
            listen_addr = "0.0.0.0:9000"
        "#;
        let cfg: SnatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.daemon.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.daemon.metrics_addr, "127.0.0.1:9090");
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            [daemon]
            listen_addr = "0.0.0.0:8080"
            metrics_addr = "0.0.0.0:9090"
            api_key = "secret"
            worker_concurrency = 8

            [profiles]
            path = "/tmp/profiles.json"

            [registry]
            path = "/tmp/tasks.db"
            busy_timeout_ms = 10000

            [notify]
            timeout_secs = 20

            [engine]
            min_delay_secs = 10
            max_delay_secs = 20
            progress_interval_secs = 2
            launch_wait_secs = 300
            micro_shape_quota = 1
        "#;
        let cfg: SnatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.daemon.worker_concurrency, 8);
        assert_eq!(cfg.engine.max_delay_secs, 20);
        assert_eq!(cfg.registry.busy_timeout_ms, 10000);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let cfg = SnatchConfig::load(&path).unwrap();
        assert_eq!(cfg.daemon.listen_addr, "127.0.0.1:8080");
    }
}
