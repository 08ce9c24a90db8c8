use crate::config::toml::TomlConfiguration;
use crate::executor::DEFAULT_MAX_BLOCKING_TASKS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

mod toml;

const DEFAULT_PROPAGATION_DELAY_SECS: u64 = 90;
const DEFAULT_DNS_API_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// ACME directory URL
    pub acme_url: Url,
    /// The single domain the certificate is issued for
    pub domain: String,
    /// Contact address registered with the account. Empty registers without contact.
    #[serde(default)]
    pub email: String,
    /// Directory holding keys, registration and certificate
    pub storage: PathBuf,
    #[serde(default = "default_max_blocking_tasks")]
    pub max_blocking_tasks: usize,
    pub remote_api: RemoteApiConfiguration,
    #[serde(default)]
    pub timing: TimingConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteApiConfiguration {
    pub base_url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfiguration {
    #[serde(default = "default_propagation_delay_secs")]
    pub propagation_delay_secs: u64,
    #[serde(default = "default_dns_api_timeout_secs")]
    pub dns_api_timeout_secs: u64,
}

impl TimingConfiguration {
    pub fn propagation_delay(&self) -> Duration {
        Duration::from_secs(self.propagation_delay_secs)
    }

    pub fn dns_api_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_api_timeout_secs)
    }
}

impl Default for TimingConfiguration {
    fn default() -> Self {
        Self {
            propagation_delay_secs: DEFAULT_PROPAGATION_DELAY_SECS,
            dns_api_timeout_secs: DEFAULT_DNS_API_TIMEOUT_SECS,
        }
    }
}

fn default_max_blocking_tasks() -> usize {
    DEFAULT_MAX_BLOCKING_TASKS
}

fn default_propagation_delay_secs() -> u64 {
    DEFAULT_PROPAGATION_DELAY_SECS
}

fn default_dns_api_timeout_secs() -> u64 {
    DEFAULT_DNS_API_TIMEOUT_SECS
}

impl Configuration {
    pub fn new(acme_url: Url, domain: String, email: String, storage: PathBuf, remote_api: RemoteApiConfiguration) -> Self {
        Self {
            acme_url,
            domain,
            email,
            storage,
            max_blocking_tasks: DEFAULT_MAX_BLOCKING_TASKS,
            remote_api,
            timing: TimingConfiguration::default(),
        }
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    TomlConfiguration::load(file)
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}
