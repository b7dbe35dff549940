//! Configuration for a VCR Node
//!
//! Loaded from a TOML file or from environment variables.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | VCR_HOSTNAME | localhost | Hostname this node registers under |
//! | VCR_PORT | 1174 | Port this node registers under |
//! | VCR_PARTITIONS | - | Comma-separated partition ids assigned to this node |
//! | VCR_DESTINATION | memory | memory, localfs, or s3 |
//! | VCR_DATA_PATH | /data/vcr | LocalFs root directory |
//! | VCR_S3_BUCKET | - | S3 bucket name (required for s3) |
//! | VCR_S3_PREFIX | vcr | S3 key prefix |
//! | VCR_S3_REGION | us-east-1 | S3 region |
//! | VCR_S3_ENDPOINT | - | Custom endpoint (MinIO, LocalStack) |
//! | VCR_KEY_MAPPING_PATH | - | JSON table of superseded store keys |

use crate::clustermap::PartitionId;
use crate::store::key_converter::KeyConverterConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_PORT: u16 = 1174;
const DEFAULT_DATA_PATH: &str = "/data/vcr";
const DEFAULT_S3_PREFIX: &str = "vcr";
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(IoError),
    /// Config file is not valid TOML for this schema
    Toml(toml::de::Error),
    /// Values parsed but are inconsistent
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Toml(e) => write!(f, "Config parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<IoError> for ConfigError {
    fn from(e: IoError) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub node: NodeConfig,
    pub destination: DestinationConfig,
    pub key_converter: KeyConverterConfig,
}

/// Identity of this node and the partitions it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub hostname: String,
    pub port: u16,
    pub partitions: Vec<PartitionId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            partitions: Vec::new(),
        }
    }
}

/// Type of destination backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    /// In-memory (tests, experiments)
    #[serde(alias = "memory")]
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    S3,
}

impl FromStr for DestinationType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "inmemory" => Ok(DestinationType::InMemory),
            "localfs" => Ok(DestinationType::LocalFs),
            "s3" => Ok(DestinationType::S3),
            other => Err(ConfigError::Invalid(format!(
                "Unknown destination type: {}. Use 'memory', 'localfs', or 's3'",
                other
            ))),
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::InMemory => f.write_str("memory"),
            DestinationType::LocalFs => f.write_str("localfs"),
            DestinationType::S3 => f.write_str("s3"),
        }
    }
}

/// Where partition data is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub store_type: DestinationType,
    /// Root directory (LocalFs)
    pub local_path: Option<PathBuf>,
    /// S3 settings (S3)
    pub s3: Option<S3Config>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig {
            store_type: DestinationType::InMemory,
            local_path: None,
            s3: None,
        }
    }
}

impl DestinationConfig {
    /// Config for local development
    pub fn local(path: PathBuf) -> Self {
        DestinationConfig {
            store_type: DestinationType::LocalFs,
            local_path: Some(path),
            s3: None,
        }
    }

    /// Config for tests (in-memory)
    pub fn test() -> Self {
        DestinationConfig::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.store_type {
            DestinationType::InMemory => Ok(()),
            DestinationType::LocalFs if self.local_path.is_none() => Err(ConfigError::Invalid(
                "destination.local_path is required for localfs".to_string(),
            )),
            DestinationType::LocalFs => Ok(()),
            DestinationType::S3 => match &self.s3 {
                Some(s3) if !s3.bucket.is_empty() => Ok(()),
                _ => Err(ConfigError::Invalid(
                    "destination.s3.bucket is required for s3".to_string(),
                )),
            },
        }
    }
}

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix within the bucket
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
}

fn default_s3_prefix() -> String {
    DEFAULT_S3_PREFIX.to_string()
}

fn default_s3_region() -> String {
    DEFAULT_S3_REGION.to_string()
}

impl CloudConfig {
    /// Config for tests: in-memory destination, no partitions
    pub fn test() -> Self {
        CloudConfig {
            node: NodeConfig::default(),
            destination: DestinationConfig::test(),
            key_converter: KeyConverterConfig::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CloudConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hostname = lookup("VCR_HOSTNAME").unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
        let port = match lookup("VCR_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("VCR_PORT is not a port: {}", raw)))?,
            None => DEFAULT_PORT,
        };
        let partitions = match lookup("VCR_PARTITIONS") {
            Some(raw) => parse_partition_list(&raw)?,
            None => Vec::new(),
        };

        let store_type = match lookup("VCR_DESTINATION") {
            Some(raw) => raw.parse()?,
            None => DestinationType::InMemory,
        };
        let local_path = (store_type == DestinationType::LocalFs).then(|| {
            lookup("VCR_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH))
        });
        let s3 = lookup("VCR_S3_BUCKET").map(|bucket| S3Config {
            bucket,
            prefix: lookup("VCR_S3_PREFIX").unwrap_or_else(default_s3_prefix),
            region: lookup("VCR_S3_REGION").unwrap_or_else(default_s3_region),
            endpoint: lookup("VCR_S3_ENDPOINT"),
        });

        let config = CloudConfig {
            node: NodeConfig {
                hostname,
                port,
                partitions,
            },
            destination: DestinationConfig {
                store_type,
                local_path,
                s3,
            },
            key_converter: KeyConverterConfig {
                mapping_path: lookup("VCR_KEY_MAPPING_PATH").map(PathBuf::from),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.hostname.is_empty() {
            return Err(ConfigError::Invalid("node.hostname must not be empty".to_string()));
        }
        self.destination.validate()
    }
}

/// Parse "1, 2,3" into partition ids
fn parse_partition_list(raw: &str) -> Result<Vec<PartitionId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(PartitionId)
                .map_err(|_| ConfigError::Invalid(format!("Invalid partition id: {}", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CloudConfig::default();
        assert_eq!(config.destination.store_type, DestinationType::InMemory);
        assert_eq!(config.node.port, DEFAULT_PORT);
        assert!(config.node.partitions.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_localfs() {
        let config = CloudConfig::from_toml_str(
            r#"
            [node]
            hostname = "vcr-0"
            partitions = [1, 2, 3]

            [destination]
            store_type = "localfs"
            local_path = "/tmp/vcr"

            [key_converter]
            mapping_path = "/etc/vcr/keys.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.hostname, "vcr-0");
        assert_eq!(config.node.port, DEFAULT_PORT);
        assert_eq!(
            config.node.partitions,
            vec![PartitionId(1), PartitionId(2), PartitionId(3)]
        );
        assert_eq!(config.destination.store_type, DestinationType::LocalFs);
        assert_eq!(config.destination.local_path, Some(PathBuf::from("/tmp/vcr")));
        assert_eq!(
            config.key_converter.mapping_path,
            Some(PathBuf::from("/etc/vcr/keys.json"))
        );
    }

    #[test]
    fn test_toml_s3_defaults() {
        let config = CloudConfig::from_toml_str(
            r#"
            [destination]
            store_type = "s3"
            s3 = { bucket = "vcr-bucket" }
            "#,
        )
        .unwrap();

        let s3 = config.destination.s3.unwrap();
        assert_eq!(s3.bucket, "vcr-bucket");
        assert_eq!(s3.prefix, DEFAULT_S3_PREFIX);
        assert_eq!(s3.region, DEFAULT_S3_REGION);
    }

    #[test]
    fn test_localfs_requires_path() {
        let err = CloudConfig::from_toml_str(
            r#"
            [destination]
            store_type = "localfs"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = CloudConfig::from_toml_str("[node\nhostname=").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_env_config() {
        let config = CloudConfig::from_lookup(lookup_from(&[
            ("VCR_HOSTNAME", "vcr-2"),
            ("VCR_PORT", "2000"),
            ("VCR_PARTITIONS", "4, 5,6"),
            ("VCR_DESTINATION", "localfs"),
            ("VCR_DATA_PATH", "/var/vcr"),
        ]))
        .unwrap();

        assert_eq!(config.node.hostname, "vcr-2");
        assert_eq!(config.node.port, 2000);
        assert_eq!(
            config.node.partitions,
            vec![PartitionId(4), PartitionId(5), PartitionId(6)]
        );
        assert_eq!(config.destination.local_path, Some(PathBuf::from("/var/vcr")));
    }

    #[test]
    fn test_env_defaults_to_memory() {
        let config = CloudConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.destination.store_type, DestinationType::InMemory);
        assert!(config.destination.local_path.is_none());
    }

    #[test]
    fn test_env_rejects_bad_values() {
        assert!(CloudConfig::from_lookup(lookup_from(&[("VCR_PORT", "http")])).is_err());
        assert!(CloudConfig::from_lookup(lookup_from(&[("VCR_PARTITIONS", "1,x")])).is_err());
        assert!(CloudConfig::from_lookup(lookup_from(&[("VCR_DESTINATION", "tape")])).is_err());
        assert!(CloudConfig::from_lookup(lookup_from(&[("VCR_DESTINATION", "s3")])).is_err());
    }

    #[test]
    fn test_destination_type_round_trip() {
        for ty in [DestinationType::InMemory, DestinationType::LocalFs, DestinationType::S3] {
            assert_eq!(ty.to_string().parse::<DestinationType>().unwrap(), ty);
        }
    }
}
