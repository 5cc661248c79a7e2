use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gwms_core::credentials::{CredentialKind, Parameter, ParameterName, ParameterType, Purpose};

use crate::common::config::{DEFAULT_LOOP_DELAY, duration, load_toml, optional_duration};
use crate::common::error::configuration_error;
use crate::common::supervisor::RestartPolicy;
use crate::frontend::policies::PolicyName;
use crate::frontend::removal::RemovalType;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaMode {
    #[default]
    Master,
    Slave,
}

impl HaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaMode::Master => "master",
            HaMode::Slave => "slave",
        }
    }
}

/// A factory collector the frontend talks to.
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryPoolConfig {
    pub pool: String,
    /// Identity the factory ads must be authenticated with; any identity when missing
    #[serde(default)]
    pub factory_identity: Option<String>,
    /// Identity this frontend is authenticated with at the pool
    pub my_identity: String,
}

/// Hard limits and soft curbs on a population of glideins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TotalLimits {
    #[serde(default = "default_total_max_glideins")]
    pub max_glideins: u64,
    #[serde(default = "default_total_curb_glideins")]
    pub curb_glideins: u64,
    #[serde(default = "default_total_max_idle")]
    pub max_vms_idle: u64,
    #[serde(default = "default_total_curb_idle")]
    pub curb_vms_idle: u64,
}

fn default_total_max_glideins() -> u64 {
    100000
}
fn default_total_curb_glideins() -> u64 {
    90000
}
fn default_total_max_idle() -> u64 {
    1000
}
fn default_total_curb_idle() -> u64 {
    200
}

impl Default for TotalLimits {
    fn default() -> Self {
        TotalLimits {
            max_glideins: default_total_max_glideins(),
            curb_glideins: default_total_curb_glideins(),
            max_vms_idle: default_total_max_idle(),
            curb_vms_idle: default_total_curb_idle(),
        }
    }
}

/// Limits applied to every entry a group requests glideins from.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct EntryLimits {
    #[serde(default = "default_max_running")]
    pub max_running: u64,
    /// Upper bound of a single idle request
    #[serde(default = "default_max_idle")]
    pub max_idle: u64,
    #[serde(default = "default_max_idle")]
    pub max_vms_idle: u64,
    #[serde(default = "default_curb_vms_idle")]
    pub curb_vms_idle: u64,
}

fn default_max_running() -> u64 {
    10000
}
fn default_max_idle() -> u64 {
    100
}
fn default_curb_vms_idle() -> u64 {
    5
}

impl Default for EntryLimits {
    fn default() -> Self {
        EntryLimits {
            max_running: default_max_running(),
            max_idle: default_max_idle(),
            max_vms_idle: default_max_idle(),
            curb_vms_idle: default_curb_vms_idle(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemovalConfig {
    #[serde(default)]
    pub removal_type: Option<RemovalType>,
    /// Idle-free iterations after which the configured removal is sent without tracking
    #[serde(default)]
    pub removal_wait: u32,
    #[serde(default)]
    pub removal_requests_tracking: bool,
    #[serde(default)]
    pub removal_margin: u32,
}

/// One credential of a group, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_purpose")]
    pub purpose: String,
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
    #[serde(default = "default_security_class")]
    pub security_class: String,
    #[serde(default)]
    pub creation_script: Option<String>,
    #[serde(default, with = "optional_duration")]
    pub minimum_lifetime: Option<Duration>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Private half of a pair credential
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub vm_id: Option<String>,
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub remote_username: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Credential handed to the glideins themselves (`GlideinProxy`)
    #[serde(default)]
    pub pilot_file: Option<PathBuf>,
}

fn default_purpose() -> String {
    "request".to_string()
}
fn default_trust_domain() -> String {
    "Grid".to_string()
}
fn default_security_class() -> String {
    "frontend".to_string()
}

impl CredentialConfig {
    pub fn kind(&self) -> crate::Result<CredentialKind> {
        self.kind.parse::<CredentialKind>().or_else(|_| {
            configuration_error(format!(
                "Unknown credential type `{}` for {}",
                self.kind,
                self.path.display()
            ))
        })
    }

    pub fn purpose(&self) -> Purpose {
        Purpose::parse(&self.purpose)
    }

    /// Identity parameters forwarded with every request made with this credential.
    pub fn parameters(&self) -> crate::Result<Vec<Parameter>> {
        let mut parameters = Vec::new();
        for (name, value) in [
            (ParameterName::VmId, &self.vm_id),
            (ParameterName::VmType, &self.vm_type),
            (ParameterName::RemoteUsername, &self.remote_username),
            (ParameterName::ProjectId, &self.project_id),
        ] {
            if let Some(value) = value {
                parameters.push(Parameter::new(name, ParameterType::String, value)?);
            }
        }
        Ok(parameters)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_match_expr")]
    pub match_expr: String,
    /// Additional named predicates ANDed with `match_expr`
    #[serde(default)]
    pub match_policies: BTreeMap<String, String>,
    /// Selects the jobs of this group
    #[serde(default)]
    pub job_query_expr: Option<String>,
    /// Selects the entries this group may use
    #[serde(default)]
    pub factory_query_expr: Option<String>,
    /// Schedulers queried by this group; all frontend schedulers when empty
    #[serde(default)]
    pub schedds: Vec<String>,
    #[serde(default)]
    pub entry_limits: EntryLimits,
    #[serde(default)]
    pub group_limits: TotalLimits,
    #[serde(default = "default_fraction_running")]
    pub fraction_running: f64,
    #[serde(default = "default_ramp_up_attenuation")]
    pub ramp_up_attenuation: u64,
    #[serde(default = "default_reserve_idle")]
    pub reserve_idle: u64,
    #[serde(default)]
    pub min_running: u64,
    #[serde(default = "default_idle_lifetime", with = "duration")]
    pub idle_lifetime: Duration,
    #[serde(default)]
    pub removal: RemovalConfig,
    #[serde(default)]
    pub credential_policy: PolicyName,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub ignore_down_entries: bool,
    #[serde(default)]
    pub require_voms: bool,
    /// Constant parameters published unencrypted to the factories
    #[serde(default)]
    pub glidein_params: BTreeMap<String, String>,
}

fn default_match_expr() -> String {
    "True".to_string()
}
fn default_fraction_running() -> f64 {
    1.15
}
fn default_ramp_up_attenuation() -> u64 {
    3
}
fn default_reserve_idle() -> u64 {
    5
}
fn default_idle_lifetime() -> Duration {
    Duration::ZERO
}

impl GroupConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return configuration_error(format!("Invalid group name `{}`", self.name));
        }
        if self.ramp_up_attenuation == 0 {
            return configuration_error(format!(
                "Group {}: ramp_up_attenuation must be positive",
                self.name
            ));
        }
        if self.fraction_running < 0.0 {
            return configuration_error(format!(
                "Group {}: fraction_running cannot be negative",
                self.name
            ));
        }
        for credential in &self.credentials {
            credential.kind()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GroupSource {
    /// Group kept in `group_<name>.toml` next to the frontend descriptor
    File { file: PathBuf },
    Inline(Box<GroupConfig>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Lifetime of issued idtokens, in hours
    #[serde(default = "default_idtoken_lifetime")]
    pub idtoken_lifetime: u64,
    /// Frontend host used in the token identity; the local hostname when missing
    #[serde(default)]
    pub frontend_host: Option<String>,
}

fn default_idtoken_lifetime() -> u64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    pub frontend_name: String,
    pub work_dir: PathBuf,
    /// Name the factories know this frontend by
    pub security_name: String,
    #[serde(default)]
    pub ha_mode: HaMode,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub monitoring_web_url: Option<String>,
    #[serde(default)]
    pub frontend_limits: TotalLimits,
    #[serde(default)]
    pub global_limits: TotalLimits,
    pub schedds: Vec<String>,
    /// Collector of the user pool; the local one when missing
    #[serde(default)]
    pub agent_pool: Option<String>,
    pub factory_pools: Vec<FactoryPoolConfig>,
    pub groups: Vec<GroupSource>,
    #[serde(default = "default_max_matchmakers")]
    pub max_matchmakers: usize,
    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,
    #[serde(default = "default_restart_interval", with = "duration")]
    pub restart_interval: Duration,
    #[serde(default = "default_loop_delay", with = "duration")]
    pub loop_delay: Duration,
    #[serde(default = "default_schedd_backpressure")]
    pub schedd_backpressure: f64,
    /// Free memory (MB) a partitionable slot needs to count as idle
    #[serde(default = "default_min_pslot_idle_memory")]
    pub min_pslot_idle_memory: i64,
    #[serde(default)]
    pub token_broker: Option<BrokerConfig>,
}

fn default_max_matchmakers() -> usize {
    3
}
fn default_restart_attempts() -> u32 {
    3
}
fn default_restart_interval() -> Duration {
    Duration::from_secs(1800)
}
fn default_loop_delay() -> Duration {
    DEFAULT_LOOP_DELAY
}
fn default_schedd_backpressure() -> f64 {
    0.95
}
fn default_min_pslot_idle_memory() -> i64 {
    2500
}

impl FrontendConfig {
    /// Reads the frontend descriptor together with the group files it references.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let mut config: FrontendConfig = load_toml(path)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut groups = Vec::with_capacity(config.groups.len());
        for source in config.groups {
            let group = match source {
                GroupSource::File { file } => {
                    let file = if file.is_absolute() { file } else { base.join(file) };
                    Box::new(load_toml::<GroupConfig>(&file)?)
                }
                GroupSource::Inline(group) => group,
            };
            groups.push(GroupSource::Inline(group));
        }
        config.groups = groups;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.frontend_name.is_empty() || self.frontend_name.contains(['.', '@']) {
            return configuration_error(format!("Invalid frontend name `{}`", self.frontend_name));
        }
        if !(self.schedd_backpressure > 0.0 && self.schedd_backpressure <= 1.0) {
            return configuration_error(format!(
                "schedd_backpressure must be in (0, 1], found {}",
                self.schedd_backpressure
            ));
        }
        if self.factory_pools.is_empty() {
            return configuration_error("No factory pool configured".to_string());
        }
        let mut names = std::collections::BTreeSet::new();
        for group in self.groups() {
            group.validate()?;
            if !names.insert(group.name.as_str()) {
                return configuration_error(format!("Group {} is defined twice", group.name));
            }
        }
        Ok(())
    }

    /// Groups defined inline; after [`FrontendConfig::load`] this is every group.
    pub fn groups(&self) -> impl Iterator<Item = &GroupConfig> {
        self.groups.iter().filter_map(|source| match source {
            GroupSource::Inline(group) => Some(group.as_ref()),
            GroupSource::File { .. } => None,
        })
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups().find(|group| group.name == name)
    }

    /// `<frontend>.<group>`, the name the factories see.
    pub fn client_name(&self, group: &str) -> String {
        format!("{}.{group}", self.frontend_name)
    }

    pub fn group_work_dir(&self, group: &str) -> PathBuf {
        self.work_dir.join(format!("group_{group}"))
    }

    /// Schedulers a group reads jobs from.
    pub fn group_schedds<'a>(&'a self, group: &'a GroupConfig) -> &'a [String] {
        if group.schedds.is_empty() {
            &self.schedds
        } else {
            &group.schedds
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            restart_attempts: self.restart_attempts,
            restart_interval: self.restart_interval,
        }
    }
}
