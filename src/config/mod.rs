//! Desired-state configuration.
//!
//! The document is read once at startup from YAML, JSON or TOML (chosen by
//! file extension), merged over defaults and validated. A handful of values
//! can be overridden from the environment (after `.env` is loaded):
//!
//! | Variable | Overrides |
//! |---|---|
//! | `HARBORMASTER_LOG_LEVEL` | `logLevel` |
//! | `HARBORMASTER_SCALE_INTERVAL` | `scaleInterval` |
//! | `HARBORMASTER_GC_INTERVAL` | `gcInterval` |
//!
//! Any error here is fatal.

mod container_set;
pub(crate) mod helpers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub use container_set::{
    ByteSize, ContainerSet, ContainerSetInput, PortEntry, RandomPort, Ulimit,
    normalize_image_reference,
};

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Supported document encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension. Unknown extensions read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// Registry credentials used when pulling images.
#[derive(Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
    pub server_address: Option<String>,
}

impl RegistryAuth {
    /// Expose the password for the runtime call.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("server_address", &self.server_address)
            .finish()
    }
}

/// Connection details for the idle-worker detector.
#[derive(Clone)]
pub struct IdleDetectorConfig {
    /// Base URL of the job-scheduling service.
    pub url: String,
    /// Script body sent for execution.
    pub script: String,
    pub user: Option<String>,
    pub password: Option<SecretString>,
}

impl std::fmt::Debug for IdleDetectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleDetectorConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.is_some())
            .finish()
    }
}

/// Global controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Containers older than this are retired by the age sweep. `None` disables it.
    pub max_age: Option<Duration>,
    pub scale_interval: Duration,
    /// Period of the image puller. `None` disables it.
    pub pull_interval: Option<Duration>,
    pub age_check_interval: Duration,
    pub gc_interval: Duration,
    /// Max containers retired per age sweep. 0 means unlimited.
    pub slow_kill: usize,
    /// Retry delay when the age sweep had to defer candidates.
    pub slow_kill_wait: Duration,
    /// Container sets, ordered by id.
    pub containers: Vec<ContainerSet>,
    pub log_level: String,
    pub min_port: u16,
    pub max_port: u16,
    pub auth: Option<RegistryAuth>,
    pub extra_hosts: Vec<String>,
    pub remove_dangling_images: bool,
    pub remove_dangling_volumes: bool,
    /// Remove every managed container when the controller exits.
    pub cleanup_on_exit: bool,
    /// Remove excess running workers when a set is over its instance count.
    pub scale_down: bool,
    pub idle_detector: Option<IdleDetectorConfig>,
    /// Directory relative host paths in volume specs resolve against.
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_age: None,
            scale_interval: Duration::from_secs(10),
            pull_interval: None,
            age_check_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(60),
            slow_kill: 0,
            slow_kill_wait: Duration::from_secs(10),
            containers: Vec::new(),
            log_level: "info".to_string(),
            min_port: 20000,
            max_port: 30000,
            auth: None,
            extra_hosts: Vec::new(),
            remove_dangling_images: false,
            remove_dangling_volumes: false,
            cleanup_on_exit: false,
            scale_down: false,
            idle_detector: None,
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load, merge and validate the document at `path`, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let raw = RawConfig::parse(&contents, ConfigFormat::from_path(path)).map_err(|reason| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        let mut config = Self::from_raw(raw, base_dir)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse a document held in memory. No env overrides are applied.
    pub fn parse_document(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let raw = RawConfig::parse(contents, format).map_err(|reason| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason,
        })?;
        Self::from_raw(raw, PathBuf::from("."))
    }

    fn from_raw(raw: RawConfig, base_dir: PathBuf) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
        let positive = |v: Option<u64>| v.filter(|s| *s > 0).map(Duration::from_secs);

        if raw.containers.is_empty() {
            return Err(ConfigError::Missing {
                key: "containers".to_string(),
            });
        }

        let containers = raw
            .containers
            .into_iter()
            .map(|(id, input)| ContainerSet::from_input(&id, input, &raw.extra_hosts))
            .collect::<Result<Vec<_>, _>>()?;

        let auth = raw.auth.map(|a| RegistryAuth {
            username: a.username,
            password: SecretString::from(a.password.unwrap_or_default()),
            server_address: a.serveraddress,
        });

        let idle_detector = raw.idle_detector.map(|d| IdleDetectorConfig {
            url: d.url.trim_end_matches('/').to_string(),
            script: d.script,
            user: d.user,
            password: d.password.map(SecretString::from),
        });

        let config = Self {
            max_age: positive(raw.max_age),
            scale_interval: secs(raw.scale_interval, defaults.scale_interval),
            pull_interval: positive(raw.pull_interval),
            age_check_interval: secs(raw.age_check_interval, defaults.age_check_interval),
            gc_interval: secs(raw.gc_interval, defaults.gc_interval),
            slow_kill: raw.slow_kill.unwrap_or(defaults.slow_kill),
            slow_kill_wait: secs(raw.slow_kill_wait, defaults.slow_kill_wait),
            containers,
            log_level: raw.log_level.unwrap_or(defaults.log_level),
            min_port: raw.min_port.unwrap_or(defaults.min_port),
            max_port: raw.max_port.unwrap_or(defaults.max_port),
            auth,
            extra_hosts: raw.extra_hosts,
            remove_dangling_images: raw.remove_dangling_images.unwrap_or(false),
            remove_dangling_volumes: raw.remove_dangling_volumes.unwrap_or(false),
            cleanup_on_exit: raw.cleanup_on_exit.unwrap_or(false),
            scale_down: raw.scale_down.unwrap_or(false),
            idle_detector,
            base_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_port > self.max_port {
            return Err(ConfigError::InvalidValue {
                key: "minPort".to_string(),
                message: format!(
                    "minPort {} is greater than maxPort {}",
                    self.min_port, self.max_port
                ),
            });
        }
        for (key, interval) in [
            ("scaleInterval", self.scale_interval),
            ("ageCheckInterval", self.age_check_interval),
            ("gcInterval", self.gc_interval),
            ("slowKillWait", self.slow_kill_wait),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        for set in &self.containers {
            for other in &set.volumes_from {
                if self.container_set(other).is_none() {
                    return Err(ConfigError::InvalidValue {
                        key: format!("containers.{}.volumesFrom", set.id),
                        message: format!("unknown container set '{other}'"),
                    });
                }
                if other == &set.id {
                    return Err(ConfigError::InvalidValue {
                        key: format!("containers.{}.volumesFrom", set.id),
                        message: "a set cannot take volumes from itself".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(level) = optional_env("HARBORMASTER_LOG_LEVEL")? {
            self.log_level = level;
        }
        self.scale_interval = Duration::from_secs(parse_optional_env(
            "HARBORMASTER_SCALE_INTERVAL",
            self.scale_interval.as_secs(),
        )?);
        self.gc_interval = Duration::from_secs(parse_optional_env(
            "HARBORMASTER_GC_INTERVAL",
            self.gc_interval.as_secs(),
        )?);
        self.validate()
    }

    /// Look up a set by id.
    pub fn container_set(&self, id: &str) -> Option<&ContainerSet> {
        self.containers.iter().find(|s| s.id == id)
    }
}

/// The document exactly as written.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    max_age: Option<u64>,
    scale_interval: Option<u64>,
    pull_interval: Option<u64>,
    age_check_interval: Option<u64>,
    gc_interval: Option<u64>,
    slow_kill: Option<usize>,
    slow_kill_wait: Option<u64>,
    #[serde(default)]
    containers: BTreeMap<String, ContainerSetInput>,
    log_level: Option<String>,
    min_port: Option<u16>,
    max_port: Option<u16>,
    auth: Option<RawAuth>,
    #[serde(rename = "ExtraHosts", default)]
    extra_hosts: Vec<String>,
    remove_dangling_images: Option<bool>,
    remove_dangling_volumes: Option<bool>,
    cleanup_on_exit: Option<bool>,
    scale_down: Option<bool>,
    idle_detector: Option<RawIdleDetector>,
}

impl RawConfig {
    fn parse(contents: &str, format: ConfigFormat) -> Result<Self, String> {
        match format {
            ConfigFormat::Yaml => serde_yml::from_str(contents).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    username: String,
    password: Option<String>,
    serveraddress: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIdleDetector {
    url: String,
    script: String,
    user: Option<String>,
    password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
scaleInterval: 5
maxAge: 3600
slowKill: 2
minPort: 31000
maxPort: 31010
removeDanglingImages: true
ExtraHosts:
  - "registry:10.0.0.9"
auth:
  username: deploy
  password: hunter2
containers:
  web:
    image: nginx
    instances: 3
    env:
      - "MODE=prod"
    randomPort: true
  db:
    image: postgres:16
    isDataContainer: true
    volumes:
      - "/var/lib/postgresql/data"
  app:
    image: Acme/App
    volumesFrom:
      - db
"#;

    #[test]
    fn test_parse_yaml_document() {
        let config = Config::parse_document(SAMPLE, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.scale_interval, Duration::from_secs(5));
        assert_eq!(config.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.slow_kill, 2);
        assert_eq!(config.pull_interval, None);
        assert!(config.remove_dangling_images);
        assert!(!config.remove_dangling_volumes);
        assert_eq!(config.containers.len(), 3);

        // BTreeMap order: app, db, web
        let ids: Vec<&str> = config.containers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["app", "db", "web"]);

        let web = config.container_set("web").unwrap();
        assert_eq!(web.image, "nginx:latest");
        assert_eq!(web.extra_hosts, vec!["registry:10.0.0.9"]);
        assert_eq!(web.random_ports, vec!["PORT"]);

        let app = config.container_set("app").unwrap();
        assert_eq!(app.image, "acme/app:latest");
        assert_eq!(app.volumes_from, vec!["db"]);

        let auth = config.auth.as_ref().unwrap();
        assert_eq!(auth.password(), "hunter2");
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[test]
    fn test_parse_json_and_toml() {
        let json = r#"{"containers": {"web": {"image": "nginx", "instances": 2}}}"#;
        let config = Config::parse_document(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.containers[0].instances, 2);

        let toml = "scaleInterval = 3\n[containers.web]\nimage = \"nginx\"\n";
        let config = Config::parse_document(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.scale_interval, Duration::from_secs(3));
        assert_eq!(config.containers[0].image, "nginx:latest");
    }

    #[test]
    fn test_empty_containers_rejected() {
        let err = Config::parse_document("scaleInterval: 5\n", ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn test_port_range_validated() {
        let doc = "minPort: 500\nmaxPort: 100\ncontainers:\n  web:\n    image: nginx\n";
        let err = Config::parse_document(doc, ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "minPort"));
    }

    #[test]
    fn test_unknown_volumes_from_rejected() {
        let doc = "containers:\n  web:\n    image: nginx\n    volumesFrom: [ghost]\n";
        assert!(Config::parse_document(doc, ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_load_from_file_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yml");
        std::fs::write(&path, "containers:\n  web:\n    image: nginx\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.TOML")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("fleet")), ConfigFormat::Yaml);
    }
}
