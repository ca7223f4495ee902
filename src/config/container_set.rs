//! Desired-state unit: one logical group of containers.

use serde::{Deserialize, Serialize};

use crate::config::helpers::parse_byte_size;
use crate::error::ConfigError;

/// Registry prefixes that name Docker Hub and are dropped during normalization.
const DEFAULT_REGISTRY_PREFIXES: &[&str] = &[
    "docker.io/",
    "index.docker.io/",
    "registry.hub.docker.com/",
];

/// Env variable name used when `randomPort: true` is given without a name.
const DEFAULT_RANDOM_PORT_NAME: &str = "PORT";

/// Normalize an image reference so it matches the runtime's repo tags.
///
/// Lower-cases, drops the Docker Hub registry prefix (and the implicit
/// `library/` namespace), and appends `:latest` when no tag or digest is given.
/// Applying it twice yields the same result as applying it once.
pub fn normalize_image_reference(reference: &str) -> String {
    let mut image = reference.trim().to_lowercase();

    for prefix in DEFAULT_REGISTRY_PREFIXES {
        if let Some(rest) = image.strip_prefix(prefix) {
            image = rest.to_string();
            if let Some(rest) = image.strip_prefix("library/") {
                image = rest.to_string();
            }
            break;
        }
    }

    if image.contains('@') {
        return image;
    }

    let last_segment = image.rsplit('/').next().unwrap_or(&image);
    if !last_segment.contains(':') {
        image.push_str(":latest");
    }
    image
}

/// A process resource limit passed through to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Soft")]
    pub soft: i64,
    #[serde(alias = "Hard")]
    pub hard: i64,
}

/// A container set after merging input over defaults and normalizing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSet {
    /// Unique key; stamped on every container as `group-id`.
    pub id: String,
    /// Normalized image reference.
    pub image: String,
    /// Desired running count. Always 1 for data sets.
    pub instances: usize,
    pub is_data_container: bool,
    /// Whether the periodic puller refreshes this image.
    pub pull: bool,
    /// Whether created containers get an `always` restart policy.
    pub restart: bool,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_percent: Option<i64>,
    pub ulimits: Vec<Ulimit>,
    pub network_mode: Option<String>,
    pub extra_hosts: Vec<String>,
    /// Ordered `KEY=VALUE` entries; order matters for templating.
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    /// Ids of other sets whose newest container's mounts are shared.
    pub volumes_from: Vec<String>,
    /// Static `host:container` or `container` port entries.
    pub ports: Vec<String>,
    /// Env names that receive a randomly chosen published port.
    pub random_ports: Vec<String>,
    /// Explicit container name. Only sensible with a single instance.
    pub name: Option<String>,
}

impl ContainerSet {
    /// Defaults every set starts from before its own input is merged in.
    pub fn defaults(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: String::new(),
            instances: 1,
            is_data_container: false,
            pull: true,
            restart: false,
            memory: None,
            memory_swap: None,
            cpu_percent: None,
            ulimits: Vec::new(),
            network_mode: None,
            extra_hosts: Vec::new(),
            env: Vec::new(),
            volumes: Vec::new(),
            volumes_from: Vec::new(),
            ports: Vec::new(),
            random_ports: Vec::new(),
            name: None,
        }
    }

    /// Build a set by merging raw input over [`ContainerSet::defaults`].
    ///
    /// `global_extra_hosts` are placed before the set's own entries.
    pub fn from_input(
        id: &str,
        input: ContainerSetInput,
        global_extra_hosts: &[String],
    ) -> Result<Self, ConfigError> {
        let mut set = Self::defaults(id);
        let key = |field: &str| format!("containers.{id}.{field}");

        set.image = input
            .image
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing { key: key("image") })?;
        if let Some(pull) = input.pull {
            set.pull = pull;
        }
        if let Some(restart) = input.restart {
            set.restart = restart;
        }
        if let Some(is_data) = input.is_data_container {
            set.is_data_container = is_data;
        }
        if let Some(instances) = input.instances {
            set.instances = instances;
        }
        if set.is_data_container && set.instances != 1 {
            tracing::warn!(
                set = %id,
                instances = set.instances,
                "Data sets always run a single generation, ignoring instances"
            );
            set.instances = 1;
        }

        set.memory = input
            .memory
            .map(|m| m.to_bytes(&key("Memory")))
            .transpose()?;
        set.memory_swap = input
            .memory_swap
            .map(|m| m.to_bytes(&key("MemorySwap")))
            .transpose()?;
        if let Some(cpu) = input.cpu_percent {
            if !(1..=100).contains(&cpu) {
                return Err(ConfigError::InvalidValue {
                    key: key("CpuPercent"),
                    message: format!("{cpu} is not between 1 and 100"),
                });
            }
            set.cpu_percent = Some(cpu);
        }
        set.ulimits = input.ulimits;
        set.network_mode = input.network_mode;

        for host in global_extra_hosts.iter().chain(input.extra_hosts.iter()) {
            if !set.extra_hosts.contains(host) {
                set.extra_hosts.push(host.clone());
            }
        }

        for entry in &input.env {
            if !entry.contains('=') {
                return Err(ConfigError::InvalidValue {
                    key: key("env"),
                    message: format!("'{entry}' is not KEY=VALUE"),
                });
            }
        }
        set.env = input.env;
        for entry in &input.volumes {
            let valid = match entry.split_once(':') {
                Some((host, rest)) => !host.is_empty() && !rest.is_empty(),
                None => entry.starts_with('/'),
            };
            if !valid {
                return Err(ConfigError::InvalidValue {
                    key: key("volumes"),
                    message: format!("'{entry}' is not host:container[:mode] or /path"),
                });
            }
        }
        set.volumes = input.volumes;
        set.volumes_from = input.volumes_from;
        set.ports = input
            .ports
            .into_iter()
            .map(|p| p.into_string(&key("ports")))
            .collect::<Result<_, _>>()?;

        match input.random_port {
            Some(RandomPort::Flag(true)) => set.random_ports.push(DEFAULT_RANDOM_PORT_NAME.into()),
            Some(RandomPort::Name(name)) => set.random_ports.push(name),
            Some(RandomPort::Flag(false)) | None => {}
        }
        for name in input.random_ports {
            if !set.random_ports.contains(&name) {
                set.random_ports.push(name);
            }
        }

        set.name = input.name;
        if set.name.is_some() && set.instances > 1 {
            return Err(ConfigError::InvalidValue {
                key: key("name"),
                message: "an explicit name requires instances: 1".to_string(),
            });
        }

        set.normalize();
        Ok(set)
    }

    /// Normalize in place. Idempotent.
    pub fn normalize(&mut self) {
        self.image = normalize_image_reference(&self.image);
    }

    /// Env value for `key`, if present.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Raw per-set input as it appears in the desired-state document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSetInput {
    pub pull: Option<bool>,
    pub image: Option<String>,
    pub instances: Option<usize>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    pub restart: Option<bool>,
    #[serde(rename = "volumesFrom", default)]
    pub volumes_from: Vec<String>,
    #[serde(rename = "isDataContainer")]
    pub is_data_container: Option<bool>,
    #[serde(rename = "Memory")]
    pub memory: Option<ByteSize>,
    #[serde(rename = "Ulimits", default)]
    pub ulimits: Vec<Ulimit>,
    #[serde(rename = "MemorySwap")]
    pub memory_swap: Option<ByteSize>,
    #[serde(rename = "NetworkMode")]
    pub network_mode: Option<String>,
    #[serde(rename = "CpuPercent")]
    pub cpu_percent: Option<i64>,
    #[serde(rename = "ExtraHosts", default)]
    pub extra_hosts: Vec<String>,
    #[serde(rename = "randomPort")]
    pub random_port: Option<RandomPort>,
    #[serde(rename = "randomPorts", default)]
    pub random_ports: Vec<String>,
    pub name: Option<String>,
}

/// `randomPort` accepts either a flag or the env name to publish under.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RandomPort {
    Flag(bool),
    Name(String),
}

/// A byte size given as a number or a suffixed string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ByteSize {
    Bytes(i64),
    Text(String),
}

impl ByteSize {
    fn to_bytes(&self, key: &str) -> Result<i64, ConfigError> {
        match self {
            Self::Bytes(b) => Ok(*b),
            Self::Text(s) => parse_byte_size(key, s),
        }
    }
}

/// A static port entry given as a number or `host:container` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Text(String),
}

impl PortEntry {
    fn into_string(self, key: &str) -> Result<String, ConfigError> {
        match self {
            Self::Number(p) => Ok(p.to_string()),
            Self::Text(s) => {
                let (ports, proto) = s.split_once('/').unwrap_or((s.as_str(), "tcp"));
                let valid = matches!(proto, "tcp" | "udp" | "sctp")
                    && ports.split(':').count() <= 2
                    && ports.split(':').all(|part| part.trim().parse::<u16>().is_ok());
                if valid {
                    Ok(s)
                } else {
                    Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: format!("'{s}' is not 'port' or 'host:container[/proto]'"),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image_reference() {
        assert_eq!(normalize_image_reference("FOO/bar"), "foo/bar:latest");
        assert_eq!(normalize_image_reference("nginx"), "nginx:latest");
        assert_eq!(normalize_image_reference("nginx:1.25"), "nginx:1.25");
        assert_eq!(normalize_image_reference("docker.io/library/redis"), "redis:latest");
        assert_eq!(normalize_image_reference("docker.io/acme/app:v2"), "acme/app:v2");
        assert_eq!(
            normalize_image_reference("localhost:5000/team/app"),
            "localhost:5000/team/app:latest"
        );
        assert_eq!(
            normalize_image_reference("alpine@sha256:abcd"),
            "alpine@sha256:abcd"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["FOO/bar", "docker.io/library/Redis:7", "quay.io/x/y", "a@sha256:1"] {
            let once = normalize_image_reference(raw);
            assert_eq!(normalize_image_reference(&once), once);
        }
    }

    #[test]
    fn test_from_input_merges_over_defaults() {
        let input = ContainerSetInput {
            image: Some("Nginx".into()),
            instances: Some(3),
            extra_hosts: vec!["db:10.0.0.2".into(), "cache:10.0.0.3".into()],
            random_port: Some(RandomPort::Flag(true)),
            random_ports: vec!["ADMIN_PORT".into()],
            memory: Some(ByteSize::Text("256m".into())),
            ..Default::default()
        };
        let set = ContainerSet::from_input("web", input, &["db:10.0.0.2".to_string()]).unwrap();

        assert_eq!(set.id, "web");
        assert_eq!(set.image, "nginx:latest");
        assert_eq!(set.instances, 3);
        assert!(set.pull);
        assert!(!set.is_data_container);
        assert_eq!(set.extra_hosts, vec!["db:10.0.0.2", "cache:10.0.0.3"]);
        assert_eq!(set.random_ports, vec!["PORT", "ADMIN_PORT"]);
        assert_eq!(set.memory, Some(256 * 1024 * 1024));
    }

    #[test]
    fn test_data_set_forces_single_instance() {
        let input = ContainerSetInput {
            image: Some("postgres:16".into()),
            instances: Some(4),
            is_data_container: Some(true),
            ..Default::default()
        };
        let set = ContainerSet::from_input("db", input, &[]).unwrap();
        assert_eq!(set.instances, 1);
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let err = ContainerSet::from_input("web", ContainerSetInput::default(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "containers.web.image"));
    }

    #[test]
    fn test_bad_port_entry_rejected() {
        let input = ContainerSetInput {
            image: Some("nginx".into()),
            ports: vec![PortEntry::Text("eighty".into())],
            ..Default::default()
        };
        assert!(ContainerSet::from_input("web", input, &[]).is_err());

        let input = ContainerSetInput {
            image: Some("coredns".into()),
            ports: vec![
                PortEntry::Text("5353:53/udp".into()),
                PortEntry::Number(9153),
            ],
            ..Default::default()
        };
        let set = ContainerSet::from_input("dns", input, &[]).unwrap();
        assert_eq!(set.ports, vec!["5353:53/udp", "9153"]);
    }

    #[test]
    fn test_volume_entries_validated() {
        let input = ContainerSetInput {
            image: Some("postgres:16".into()),
            volumes: vec!["/var/lib/postgresql/data".into(), "pgconf:/etc/postgresql".into()],
            ..Default::default()
        };
        let set = ContainerSet::from_input("db", input, &[]).unwrap();
        assert_eq!(set.volumes.len(), 2);

        for bad in ["data", ":/data", "/srv:"] {
            let input = ContainerSetInput {
                image: Some("postgres:16".into()),
                volumes: vec![bad.into()],
                ..Default::default()
            };
            let err = ContainerSet::from_input("db", input, &[]).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "containers.db.volumes"),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_env_value_lookup() {
        let mut set = ContainerSet::defaults("web");
        set.env = vec!["A=1".into(), "B=two=2".into()];
        assert_eq!(set.env_value("A"), Some("1"));
        assert_eq!(set.env_value("B"), Some("two=2"));
        assert_eq!(set.env_value("C"), None);
    }
}
