use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use gwms_core::batch::extract::ExtractLimits;
use gwms_core::classad::AdValue;
use gwms_core::crypto::rsa::{DEFAULT_KEY_BITS, MIN_KEY_BITS};

use crate::common::config::{DEFAULT_LOOP_DELAY, duration, load_toml};
use crate::common::error::configuration_error;
use crate::common::supervisor::RestartPolicy;
use crate::factory::security::is_safe_name;

const DEFAULT_TRUST_DOMAIN: &str = "Grid";
const DEFAULT_AUTH_METHOD: &str = "grid_proxy";
pub const ALL: &str = "All";

/// How a frontend is known to this factory.
#[derive(Debug, Clone, Deserialize)]
pub struct FrontendDescript {
    /// Identity its ads must be authenticated with
    pub identity: String,
    /// Security class -> local submission user
    #[serde(default)]
    pub usernames: BTreeMap<String, String>,
}

/// Glideins an entry may keep in the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitLimits {
    /// Glideins submitted per request and iteration
    #[serde(default = "default_max_submits")]
    pub max_submits: u64,
    #[serde(default = "default_entry_max_glideins")]
    pub max_glideins: u64,
    #[serde(default = "default_entry_max_idle")]
    pub max_idle: u64,
    #[serde(default = "default_entry_max_held")]
    pub max_held: u64,
    #[serde(default = "default_frontend_max_glideins")]
    pub frontend_max_glideins: u64,
    #[serde(default = "default_frontend_max_idle")]
    pub frontend_max_idle: u64,
    #[serde(default = "default_frontend_max_held")]
    pub frontend_max_held: u64,
    /// Per `frontend:security_class` overrides, `"fe:sc;N,fe2:sc;M"`
    #[serde(default)]
    pub frontend_max_glideins_overrides: String,
    #[serde(default)]
    pub frontend_max_idle_overrides: String,
    #[serde(default)]
    pub frontend_max_held_overrides: String,
}

fn default_max_submits() -> u64 {
    100
}
fn default_entry_max_glideins() -> u64 {
    10000
}
fn default_entry_max_idle() -> u64 {
    2000
}
fn default_entry_max_held() -> u64 {
    1000
}
fn default_frontend_max_glideins() -> u64 {
    5000
}
fn default_frontend_max_idle() -> u64 {
    100
}
fn default_frontend_max_held() -> u64 {
    50
}

impl Default for SubmitLimits {
    fn default() -> Self {
        SubmitLimits {
            max_submits: default_max_submits(),
            max_glideins: default_entry_max_glideins(),
            max_idle: default_entry_max_idle(),
            max_held: default_entry_max_held(),
            frontend_max_glideins: default_frontend_max_glideins(),
            frontend_max_idle: default_frontend_max_idle(),
            frontend_max_held: default_frontend_max_held(),
            frontend_max_glideins_overrides: String::new(),
            frontend_max_idle_overrides: String::new(),
            frontend_max_held_overrides: String::new(),
        }
    }
}

/// Descriptor of one entry.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    pub name: String,
    pub gridtype: String,
    pub gatekeeper: String,
    #[serde(default)]
    pub rsl: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
    /// `+` joined methods, e.g. `grid_proxy+project_id`
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    /// Published on the entry ad as they are
    #[serde(default)]
    pub attrs: BTreeMap<String, AdValue>,
    /// Defaults of glidein parameters, overridable by the frontends
    #[serde(default)]
    pub params: BTreeMap<String, AdValue>,
    #[serde(default)]
    pub limits: SubmitLimits,
    /// Security names allowed to use the entry; everybody when empty
    #[serde(default)]
    pub allow_frontends: Vec<String>,
    /// Security classes allowed to use the entry; every class when empty or `All`
    #[serde(default)]
    pub allowed_security_classes: Vec<String>,
    #[serde(default = "default_max_releases")]
    pub max_releases: u32,
    #[serde(default = "default_min_release_time", with = "duration")]
    pub min_release_time: Duration,
    #[serde(default = "default_stale_idle_age", with = "duration")]
    pub stale_idle_age: Duration,
    #[serde(default = "default_stale_running_age", with = "duration")]
    pub stale_running_age: Duration,
    #[serde(default)]
    pub downtime_file: Option<PathBuf>,
    /// Job description handed to the batch system
    #[serde(default)]
    pub submit_file: Option<PathBuf>,
}

fn default_trust_domain() -> String {
    DEFAULT_TRUST_DOMAIN.to_string()
}
fn default_auth_method() -> String {
    DEFAULT_AUTH_METHOD.to_string()
}
fn default_max_releases() -> u32 {
    ExtractLimits::default().max_releases
}
fn default_min_release_time() -> Duration {
    ExtractLimits::default().min_release_time
}
fn default_stale_idle_age() -> Duration {
    ExtractLimits::default().stale_idle_age
}
fn default_stale_running_age() -> Duration {
    ExtractLimits::default().stale_running_age
}

impl EntryConfig {
    pub fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_releases: self.max_releases,
            min_release_time: self.min_release_time,
            stale_idle_age: self.stale_idle_age,
            stale_running_age: self.stale_running_age,
        }
    }

    pub fn is_cloud(&self) -> bool {
        matches!(self.gridtype.as_str(), "ec2" | "gce")
    }

    pub fn allows_frontend(&self, security_name: &str) -> bool {
        self.allow_frontends.is_empty() || self.allow_frontends.iter().any(|f| f == security_name)
    }

    pub fn allows_security_class(&self, security_class: &str) -> bool {
        self.allowed_security_classes.is_empty()
            || self
                .allowed_security_classes
                .iter()
                .any(|c| c == ALL || c == security_class)
    }

    fn validate(&self) -> crate::Result<()> {
        if !is_safe_name(&self.name) || self.name.contains('@') {
            return configuration_error(format!("Invalid entry name `{}`", self.name));
        }
        if self.gatekeeper.is_empty() {
            return configuration_error(format!("Entry {} has no gatekeeper", self.name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    pub factory_name: String,
    pub glidein_name: String,
    pub work_dir: PathBuf,
    /// Credentials received from the frontends, one subdirectory per user
    pub client_proxy_dir: PathBuf,
    /// Private key of the factory; `<work_dir>/rsa.key` when missing
    #[serde(default)]
    pub rsa_key: Option<PathBuf>,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
    #[serde(default = "default_sign_types")]
    pub supported_sign_types: Vec<String>,
    /// Factory wide downtimes; `<work_dir>/glideinWMS.downtimes` when missing
    #[serde(default)]
    pub downtime_file: Option<PathBuf>,
    /// Collector the factory publishes to; the local one when missing
    #[serde(default)]
    pub factory_collector: Option<String>,
    /// Schedd glideins are submitted to; the local one when missing
    #[serde(default)]
    pub schedd: Option<String>,
    #[serde(default = "default_loop_delay", with = "duration")]
    pub loop_delay: Duration,
    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,
    #[serde(default = "default_restart_interval", with = "duration")]
    pub restart_interval: Duration,
    pub entries: Vec<EntryConfig>,
    /// Security name -> frontend
    #[serde(default)]
    pub frontends: BTreeMap<String, FrontendDescript>,
}

fn default_key_bits() -> u32 {
    DEFAULT_KEY_BITS
}
fn default_sign_types() -> Vec<String> {
    vec!["sha1".to_string()]
}
fn default_loop_delay() -> Duration {
    DEFAULT_LOOP_DELAY
}
fn default_restart_attempts() -> u32 {
    3
}
fn default_restart_interval() -> Duration {
    Duration::from_secs(1800)
}

impl FactoryConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let config: FactoryConfig = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        for name in [&self.factory_name, &self.glidein_name] {
            if !is_safe_name(name) || name.contains('@') {
                return configuration_error(format!("Invalid factory name `{name}`"));
            }
        }
        if self.key_bits < MIN_KEY_BITS {
            return configuration_error(format!(
                "key_bits = {} cannot carry a session key, use at least {MIN_KEY_BITS}",
                self.key_bits
            ));
        }
        let mut names = std::collections::BTreeSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !names.insert(entry.name.as_str()) {
                return configuration_error(format!("Entry {} is defined twice", entry.name));
            }
        }
        Ok(())
    }

    pub fn entry(&self, name: &str) -> Option<&EntryConfig> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// `<glidein>@<factory>`, the name of the global ad.
    pub fn glidein_factory(&self) -> String {
        format!("{}@{}", self.glidein_name, self.factory_name)
    }

    /// `<entry>@<glidein>@<factory>`, the name of the entry ad.
    pub fn request_name(&self, entry: &str) -> String {
        format!("{entry}@{}", self.glidein_factory())
    }

    pub fn rsa_key_path(&self) -> PathBuf {
        self.rsa_key
            .clone()
            .unwrap_or_else(|| self.work_dir.join("rsa.key"))
    }

    pub fn downtime_path(&self) -> PathBuf {
        self.downtime_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("glideinWMS.downtimes"))
    }

    pub fn entry_work_dir(&self, entry: &EntryConfig) -> PathBuf {
        entry
            .work_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(format!("entry_{}", entry.name)))
    }

    /// Local user the glideins of a frontend security class are submitted as.
    pub fn username(&self, security_name: &str, security_class: &str) -> Option<&str> {
        self.frontends
            .get(security_name)?
            .usernames
            .get(security_class)
            .map(String::as_str)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            restart_attempts: self.restart_attempts,
            restart_interval: self.restart_interval,
        }
    }
}
