use crate::entry::Attributes;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server time limit when the configuration does not give one.
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 10;
/// Largest accepted LDAPMessage, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Base DNs advertised in the root DSE and served by the directory.
    #[serde(default)]
    pub naming_contexts: Vec<String>,
    #[serde(default)]
    pub schema: SchemaConfig,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// `ldap://host:port`, `ldaps://host:port` or `ldap://:port`.
    pub url: String,
}

impl ListenConfig {
    pub fn is_ldaps(&self) -> bool {
        self.url.starts_with("ldaps://")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// When set, clients must present a certificate signed by one of these CAs.
    pub ca_file: Option<PathBuf>,
    /// Offer the StartTLS extended operation on plain listeners.
    #[serde(default = "default_true")]
    pub start_tls: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Server-wide cap on entries returned by one search; none when absent.
    pub size_limit: Option<usize>,
    /// Server-wide cap on search duration, in seconds.
    #[serde(default = "default_time_limit")]
    pub time_limit: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_time_limit() -> u64 {
    DEFAULT_TIME_LIMIT_SECS
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            size_limit: None,
            time_limit: DEFAULT_TIME_LIMIT_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl LimitsConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Preload the built-in base schema.
    #[serde(default)]
    pub system: bool,
    /// OpenLDAP-format schema files, loaded in order after the base schema.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl SchemaConfig {
    pub fn is_enabled(&self) -> bool {
        self.system || !self.files.is_empty()
    }
}

/// Seed data for the in-memory directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub root_dn: Option<String>,
    pub root_password: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,
    pub attributes: BTreeMap<String, Values>,
}

/// An attribute given as a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Values {
    One(String),
    Many(Vec<String>),
}

impl EntryConfig {
    pub fn attributes(&self) -> Attributes {
        self.attributes
            .iter()
            .map(|(name, values)| {
                let values = match values {
                    Values::One(v) => vec![v.clone()],
                    Values::Many(v) => v.clone(),
                };
                (name.clone(), values)
            })
            .collect()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_ldaps() && self.tls.is_none() {
            bail!("listen url {} requires a tls section", self.listen.url);
        }
        if self.directory.root_dn.is_some() != self.directory.root_password.is_some() {
            bail!("directory.root_dn and directory.root_password must be given together");
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be positive");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            tls: None,
            limits: LimitsConfig::default(),
            naming_contexts: vec![],
            schema: SchemaConfig::default(),
            metrics_listen: None,
            directory: DirectoryConfig::default(),
        }
    }
}
