use std::collections::BTreeMap;
use std::time::Duration;

use gwms_core::adbus::Constraint;
use gwms_core::classad::{
    ATTR_NAME, AdType, AdValue, CONFIG_PREFIX, ClassAd, ENC_PARAM_PREFIX, MONITOR_PREFIX, PARAM_PREFIX,
    RESERVED_ATTRS,
};
use gwms_core::credentials::Credential;

use crate::frontend::config::HaMode;
use crate::frontend::keys::RequestEncryption;
use crate::frontend::removal::RemovalRequest;
use crate::frontend::sizing::LimitsTriggered;
use crate::matching::ATTR_IN_DOWNTIME;

pub const ATTR_CLIENT_NAME: &str = "ClientName";
pub const ATTR_FRONTEND_NAME: &str = "FrontendName";
pub const ATTR_HA_MODE: &str = "FrontendHAMode";
pub const ATTR_GROUP_NAME: &str = "GroupName";
pub const ATTR_REQ_NAME: &str = "ReqName";
pub const ATTR_REQ_GLIDEIN: &str = "ReqGlidein";
pub const ATTR_REQ_IDLE: &str = "ReqIdleGlideins";
pub const ATTR_REQ_MAX_RUN: &str = "ReqMaxGlideins";
pub const ATTR_REQ_REMOVE_EXCESS: &str = "ReqRemoveExcess";
pub const ATTR_REQ_REMOVE_MARGIN: &str = "ReqRemoveExcessMargin";
pub const ATTR_REQ_IDLE_LIFETIME: &str = "ReqIdleLifetime";

pub const ENC_SECURITY_NAME: &str = "SecurityName";
pub const ENC_SECURITY_CLASS: &str = "SecurityClass";
pub const ENC_NUMBER_OF_CREDENTIALS: &str = "NumberOfCredentials";

const WEB_SIGN_TYPE: &str = "sha1";

/// Entry attributes that are not forwarded into resource ads, besides the fabric ones.
const ENTRY_INFO_EXCLUDED: [&str; 13] = [
    ATTR_NAME,
    "CurrentTime",
    "PubKeyValue",
    "PubKeyType",
    "AuthenticatedIdentity",
    "GlideinName",
    "FactoryName",
    "EntryName",
    "GlideinWMSVersion",
    "LastHeardFrom",
    "PubKeyID",
    "SupportedSignTypes",
    ATTR_IN_DOWNTIME,
];

/// `<glidein>@<factory>` part of an entry request name.
pub fn glidein_factory_name(request_name: &str) -> &str {
    request_name
        .split_once('@')
        .map(|(_, rest)| rest)
        .unwrap_or(request_name)
}

/// Who publishes: one group of one frontend.
#[derive(Debug, Clone)]
pub struct GroupIdentity {
    pub frontend_name: String,
    pub group_name: String,
    pub client_name: String,
    pub ha_mode: HaMode,
    pub web_url: String,
    pub monitoring_web_url: Option<String>,
}

impl GroupIdentity {
    fn apply(&self, ad: &mut ClassAd) {
        ad.insert(ATTR_CLIENT_NAME, self.client_name.as_str());
        ad.insert(ATTR_FRONTEND_NAME, self.frontend_name.as_str());
        ad.insert(ATTR_HA_MODE, self.ha_mode.as_str());
        ad.insert(ATTR_GROUP_NAME, self.group_name.as_str());
    }

    fn apply_web(&self, ad: &mut ClassAd) {
        ad.insert("WebURL", self.web_url.as_str());
        ad.insert("WebSignType", WEB_SIGN_TYPE);
        ad.insert(
            "WebGroupURL",
            format!("{}/group_{}", self.web_url, self.group_name),
        );
    }

    /// Every ad this group ever published.
    pub fn constraint(&self) -> Constraint {
        Constraint::eq(ATTR_CLIENT_NAME, self.client_name.as_str())
    }
}

/// One request for glideins to one entry, made with one credential.
#[derive(Debug, Clone, Default)]
pub struct GlideinRequest {
    pub request_name: String,
    pub credential_id: String,
    pub idle: u64,
    pub max_run: u64,
    pub removal: RemovalRequest,
    pub idle_lifetime: Duration,
    pub params: BTreeMap<String, AdValue>,
    /// Sent encrypted as `GlideinEncParam*`
    pub secrets: BTreeMap<String, String>,
    pub monitors: BTreeMap<String, AdValue>,
    pub config: BTreeMap<String, AdValue>,
}

pub fn glideclient_ad(
    identity: &GroupIdentity,
    request: &GlideinRequest,
    encryption: &RequestEncryption,
    authenticated_identity: &str,
) -> crate::Result<ClassAd> {
    let name = format!(
        "{}_{}@{}",
        request.credential_id, request.request_name, identity.client_name
    );
    let mut ad = ClassAd::new(AdType::Client, &name);
    identity.apply(&mut ad);
    identity.apply_web(&mut ad);
    ad.insert(ATTR_REQ_NAME, request.request_name.as_str());
    ad.insert(ATTR_REQ_GLIDEIN, glidein_factory_name(&request.request_name));
    for (name, value) in encryption.key_attrs(authenticated_identity)? {
        ad.insert(name, value);
    }
    ad.insert(ATTR_REQ_IDLE, request.idle);
    ad.insert(ATTR_REQ_MAX_RUN, request.max_run);
    ad.insert(ATTR_REQ_REMOVE_EXCESS, request.removal.mode.as_str());
    ad.insert(ATTR_REQ_REMOVE_MARGIN, request.removal.margin);
    ad.insert(
        ATTR_REQ_IDLE_LIFETIME,
        request.idle_lifetime.as_secs().to_string(),
    );
    if let Some(url) = &identity.monitoring_web_url {
        ad.insert("WebMonitoringURL", url.as_str());
    }
    ad.set_typed(PARAM_PREFIX, &request.params);
    for (name, value) in &request.secrets {
        ad.insert(format!("{ENC_PARAM_PREFIX}{name}"), encryption.encrypt(value)?);
    }
    ad.set_typed(CONFIG_PREFIX, &request.config);
    ad.set_typed(MONITOR_PREFIX, &request.monitors);
    Ok(ad)
}

/// Credentials shared by all requests of a group to one factory.
pub fn glideclientglobal_ad(
    identity: &GroupIdentity,
    glidein_factory: &str,
    security_name: &str,
    credentials: &[(String, &Credential)],
    encryption: &RequestEncryption,
    authenticated_identity: &str,
) -> crate::Result<ClassAd> {
    let name = format!("{glidein_factory}@{}", identity.client_name);
    let mut ad = ClassAd::new(AdType::ClientGlobal, &name);
    identity.apply(&mut ad);
    ad.insert(ATTR_REQ_GLIDEIN, glidein_factory);
    for (name, value) in encryption.key_attrs(authenticated_identity)? {
        ad.insert(name, value);
    }
    let mut put = |name: &str, value: AdValue| ad.insert(format!("{ENC_PARAM_PREFIX}{name}"), value);
    put(
        ENC_NUMBER_OF_CREDENTIALS,
        encryption.encrypt(&credentials.len().to_string())?,
    );
    put(ENC_SECURITY_NAME, encryption.encrypt(security_name)?);
    for (id, credential) in credentials {
        let Some(data) = credential.data() else {
            log::warn!("Credential {id} has no data, not advertised");
            continue;
        };
        put(id.as_str(), encryption.encrypt_bytes(data)?);
        put(
            &format!("{ENC_SECURITY_CLASS}{id}"),
            encryption.encrypt(credential.security_class())?,
        );
    }
    Ok(ad)
}

/// Monitoring view of one entry as seen by one group.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ResourceMonitor {
    pub jobs_idle: u64,
    pub jobs_idle_matching: u64,
    pub jobs_idle_effective: u64,
    pub jobs_idle_old: u64,
    pub jobs_idle_unique: u64,
    pub jobs_running: u64,
    pub jobs_running_here: u64,
    pub jobs_running_max: u64,
    pub glideins_total: u64,
    pub glideins_idle: u64,
    pub glideins_running: u64,
    pub glideins_failed: u64,
    pub glideins_total_cores: u64,
    pub glideins_idle_cores: u64,
    pub glideins_running_cores: u64,
    pub glideins_request_idle: u64,
    pub glideins_request_max_run: u64,
}

impl ResourceMonitor {
    fn attrs(&self) -> [(&'static str, u64); 17] {
        [
            ("JobsIdle", self.jobs_idle),
            ("JobsIdleMatching", self.jobs_idle_matching),
            ("JobsIdleEffective", self.jobs_idle_effective),
            ("JobsIdleOld", self.jobs_idle_old),
            ("JobsIdleUnique", self.jobs_idle_unique),
            ("JobsRunning", self.jobs_running),
            ("JobsRunningHere", self.jobs_running_here),
            ("JobsRunningMax", self.jobs_running_max),
            ("GlideinsTotal", self.glideins_total),
            ("GlideinsIdle", self.glideins_idle),
            ("GlideinsRunning", self.glideins_running),
            ("GlideinsFailed", self.glideins_failed),
            ("GlideinsTotalCores", self.glideins_total_cores),
            ("GlideinsIdleCores", self.glideins_idle_cores),
            ("GlideinsRunningCores", self.glideins_running_cores),
            ("GlideinsRequestIdle", self.glideins_request_idle),
            ("GlideinsRequestMaxRun", self.glideins_request_max_run),
        ]
    }
}

/// Expressions the group matched the entry with.
#[derive(Debug, Clone, Default)]
pub struct MatchExprs {
    pub match_expr: String,
    pub job_query_expr: Option<String>,
    pub factory_query_expr: Option<String>,
}

pub struct ResourceInfo<'a> {
    pub request_name: &'a str,
    pub in_downtime: bool,
    pub monitor: ResourceMonitor,
    pub entry: &'a BTreeMap<String, AdValue>,
    /// `GlideinMonitor*` of the factory's client ad for this group
    pub factory_monitors: Option<BTreeMap<String, AdValue>>,
    pub match_exprs: &'a MatchExprs,
    pub limits: &'a LimitsTriggered,
}

/// Ad published to the user pool for monitoring.
pub fn glideresource_ad(identity: &GroupIdentity, info: &ResourceInfo) -> ClassAd {
    let name = format!("{}@{}", info.request_name, identity.client_name);
    let mut ad = ClassAd::new(AdType::Resource, &name);
    ad.insert("GlideFactoryName", info.request_name);
    ad.insert("GlideClientName", identity.client_name.as_str());
    ad.insert(
        ATTR_IN_DOWNTIME,
        if info.in_downtime { "True" } else { "False" },
    );
    ad.insert("GlideFrontendName", identity.frontend_name.as_str());
    ad.insert("GlideGroupName", identity.group_name.as_str());
    ad.insert("GlideFrontendHAMode", identity.ha_mode.as_str());

    for (name, value) in info.monitor.attrs() {
        ad.insert(format!("GlideClientMonitor{name}"), value);
    }
    ad.insert("GlideClientMatchingGlideinsTotal", info.monitor.jobs_idle_matching);

    for (name, value) in info.entry {
        if ENTRY_INFO_EXCLUDED.contains(&name.as_str()) || RESERVED_ATTRS.contains(&name.as_str()) {
            continue;
        }
        match name.strip_prefix(CONFIG_PREFIX) {
            Some(rest) => ad.insert(format!("GlideFactoryConfig{rest}"), value.clone()),
            None => ad.insert(name.as_str(), value.clone()),
        }
    }
    if let Some(monitors) = &info.factory_monitors {
        for (name, value) in monitors {
            if (name.starts_with("Total") || name.starts_with("Status") || name.starts_with("Requested"))
                && !name.starts_with("TotalClientMonitor")
            {
                ad.insert(format!("GlideFactoryMonitor{name}"), value.clone());
            }
        }
    }

    ad.insert(
        "GlideClientMatchingGlideinCondorExpr",
        info.match_exprs.match_expr.as_str(),
    );
    ad.insert(
        "GlideClientConstraintJobCondorExpr",
        info.match_exprs.job_query_expr.as_deref().unwrap_or("True"),
    );
    ad.insert(
        "GlideClientMatchingInternalPythonExpr",
        info.match_exprs.match_expr.as_str(),
    );
    ad.insert(
        "GlideClientConstraintFactoryCondorExpr",
        info.match_exprs.factory_query_expr.as_deref().unwrap_or("True"),
    );
    for (key, value) in info.limits {
        let name = if key.starts_with("Curb") {
            format!("GlideClientCurb{key}")
        } else {
            format!("GlideClientLimit{key}")
        };
        ad.insert(name, value.as_str());
    }
    ad
}
