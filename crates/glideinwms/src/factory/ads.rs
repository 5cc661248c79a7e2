use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gwms_core::classad::{AdType, AdValue, CONFIG_PREFIX, ClassAd, MONITOR_PREFIX, PARAM_PREFIX};
use gwms_core::crypto::RsaPublicKey;
use gwms_core::crypto::rsa::PUB_KEY_TYPE;

use crate::factory::config::{EntryConfig, FactoryConfig};
use crate::factory::totals::Counts;
use crate::matching::ATTR_IN_DOWNTIME;

pub const ATTR_FACTORY_NAME: &str = "FactoryName";
pub const ATTR_GLIDEIN_NAME: &str = "GlideinName";
pub const ATTR_ENTRY_NAME: &str = "EntryName";
pub const ATTR_SUPPORTED_SIGN_TYPES: &str = "SupportedSignTypes";
pub const ATTR_PUB_KEY_ID: &str = "PubKeyID";
pub const ATTR_PUB_KEY_TYPE: &str = "PubKeyType";
pub const ATTR_PUB_KEY_VALUE: &str = "PubKeyValue";

pub const ATTR_REQ_FACTORY_NAME: &str = "ReqFactoryName";
pub const ATTR_REQ_GLIDEIN_NAME: &str = "ReqGlideinName";
pub const ATTR_REQ_ENTRY_NAME: &str = "ReqEntryName";
pub const ATTR_REQ_CLIENT_NAME: &str = "ReqClientName";
pub const ATTR_REQ_CLIENT_REQ_NAME: &str = "ReqClientReqName";

pub const ATTR_TRUST_DOMAIN: &str = "GLIDEIN_TrustDomain";
pub const ATTR_AUTH_METHOD: &str = "GLIDEIN_SupportedAuthenticationMethod";

const LIMIT_MONITOR_PREFIX: &str = "Status_GlideFactoryLimit";

/// `PubKeyID`, `PubKeyType` and `PubKeyValue`, with the PEM newlines escaped.
fn apply_key(ad: &mut ClassAd, config: &FactoryConfig, key: &RsaPublicKey) {
    ad.insert(ATTR_FACTORY_NAME, config.factory_name.as_str());
    ad.insert(ATTR_GLIDEIN_NAME, config.glidein_name.as_str());
    ad.insert(ATTR_SUPPORTED_SIGN_TYPES, config.supported_sign_types.join(","));
    ad.insert(ATTR_PUB_KEY_ID, key.key_id());
    ad.insert(ATTR_PUB_KEY_TYPE, PUB_KEY_TYPE);
    ad.insert(ATTR_PUB_KEY_VALUE, key.pem().replace('\n', "\\n"));
}

pub fn glidefactoryglobal_ad(config: &FactoryConfig, key: &RsaPublicKey) -> ClassAd {
    let mut ad = ClassAd::new(AdType::FactoryGlobal, &config.glidein_factory());
    apply_key(&mut ad, config, key);
    ad
}

/// What the entry loop observed, published on the entry ad.
#[derive(Debug, Clone, Default)]
pub struct EntryState {
    pub in_downtime: bool,
    pub totals: Counts,
    pub requested_idle: i64,
    pub requested_max_run: i64,
    pub limits_triggered: BTreeMap<String, String>,
}

pub fn glidefactory_ad(
    config: &FactoryConfig,
    entry: &EntryConfig,
    key: &RsaPublicKey,
    state: &EntryState,
) -> ClassAd {
    let mut ad = ClassAd::new(AdType::Factory, &config.request_name(&entry.name));
    apply_key(&mut ad, config, key);
    ad.insert(ATTR_ENTRY_NAME, entry.name.as_str());
    ad.insert(ATTR_IN_DOWNTIME, if state.in_downtime { "True" } else { "False" });
    ad.insert(ATTR_TRUST_DOMAIN, entry.trust_domain.as_str());
    ad.insert(ATTR_AUTH_METHOD, entry.auth_method.as_str());
    ad.insert("GLIDEIN_GridType", entry.gridtype.as_str());
    ad.insert("GLIDEIN_Gatekeeper", entry.gatekeeper.as_str());
    if let Some(rsl) = &entry.rsl {
        ad.insert("GLIDEIN_GlobusRSL", rsl.as_str());
    }
    let grid_proxy = entry.auth_method.split('+').any(|m| m == "grid_proxy");
    ad.insert("GlideinAllowx509_Proxy", grid_proxy);
    ad.insert("GlideinRequirex509_Proxy", grid_proxy);
    ad.insert("GlideinRequireGlideinProxy", !grid_proxy);
    for (name, value) in &entry.attrs {
        ad.insert(name.as_str(), value.clone());
    }
    ad.set_typed(PARAM_PREFIX, &entry.params);

    let limits = &entry.limits;
    let config_limits: BTreeMap<String, AdValue> = [
        ("PerEntryMaxGlideins", limits.max_glideins),
        ("PerEntryMaxIdle", limits.max_idle),
        ("PerEntryMaxHeld", limits.max_held),
        ("DefaultPerFrontendMaxGlideins", limits.frontend_max_glideins),
        ("DefaultPerFrontendMaxIdle", limits.frontend_max_idle),
        ("DefaultPerFrontendMaxHeld", limits.frontend_max_held),
        ("MaxSubmits", limits.max_submits),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.into()))
    .collect();
    ad.set_typed(CONFIG_PREFIX, &config_limits);

    let mut monitors = status_monitors("Total", &state.totals);
    monitors.insert("TotalRequestedIdle".to_string(), state.requested_idle.into());
    monitors.insert("TotalRequestedMaxGlideins".to_string(), state.requested_max_run.into());
    for (name, value) in &state.limits_triggered {
        monitors.insert(format!("{LIMIT_MONITOR_PREFIX}{name}"), value.into());
    }
    ad.set_typed(MONITOR_PREFIX, &monitors);
    ad
}

fn status_monitors(prefix: &str, counts: &Counts) -> BTreeMap<String, AdValue> {
    [
        ("StatusIdle", counts.idle),
        ("StatusRunning", counts.running),
        ("StatusHeld", counts.held),
    ]
    .into_iter()
    .map(|(name, value)| (format!("{prefix}{name}"), value.into()))
    .collect()
}

/// What the entry did for one client during the last iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub client: String,
    /// `ReqName` of the client's requests
    pub request_name: String,
    pub status: Counts,
    pub requested_idle: i64,
    pub requested_max_run: i64,
    pub submitted: u64,
    pub in_downtime: bool,
    pub limits_triggered: BTreeMap<String, String>,
}

pub fn glidefactoryclient_ad(
    config: &FactoryConfig,
    entry: &EntryConfig,
    totals: &Counts,
    client: &ClientState,
) -> ClassAd {
    let request_name = config.request_name(&entry.name);
    let mut ad = ClassAd::new(AdType::FactoryClient, &format!("{request_name}@{}", client.client));
    ad.insert(crate::frontend::ads::ATTR_REQ_GLIDEIN, request_name.as_str());
    ad.insert(ATTR_REQ_FACTORY_NAME, config.factory_name.as_str());
    ad.insert(ATTR_REQ_GLIDEIN_NAME, config.glidein_name.as_str());
    ad.insert(ATTR_REQ_ENTRY_NAME, entry.name.as_str());
    ad.insert(ATTR_REQ_CLIENT_NAME, client.client.as_str());
    ad.insert(ATTR_REQ_CLIENT_REQ_NAME, client.request_name.as_str());
    ad.insert(ATTR_IN_DOWNTIME, if client.in_downtime { "True" } else { "False" });

    let mut monitors = status_monitors("", &client.status);
    monitors.extend(status_monitors("Total", totals));
    monitors.insert("RequestedIdle".to_string(), client.requested_idle.into());
    monitors.insert("RequestedMaxGlideins".to_string(), client.requested_max_run.into());
    monitors.insert("StatusSubmitted".to_string(), client.submitted.into());
    for (name, value) in &client.limits_triggered {
        monitors.insert(format!("{LIMIT_MONITOR_PREFIX}{name}"), value.into());
    }
    ad.set_typed(MONITOR_PREFIX, &monitors);
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::sources::factory_key;
    use gwms_core::classad::wire::{parse_ads, render_ad};
    use gwms_core::crypto::RsaKey;

    fn config() -> FactoryConfig {
        toml::from_str(
            r#"
factory_name = "gfactory"
glidein_name = "main"
work_dir = "/var/lib/gwms-factory"
client_proxy_dir = "/var/lib/gwms-factory/client-proxies"

[[entries]]
name = "CE_a"
gridtype = "condor"
gatekeeper = "ce.example.org"
auth_method = "scitoken"
attrs = { GLIDEIN_Site = "Example" }
params = { CONDOR_VERSION = "default" }
"#,
        )
        .unwrap()
    }

    #[test]
    fn global_ad_carries_usable_key() {
        let config = config();
        let key = RsaKey::generate(2048).unwrap();
        let ad = glidefactoryglobal_ad(&config, key.public_key());
        assert_eq!(ad.name(), Some("main@gfactory"));
        assert!(!ad.get_str(ATTR_PUB_KEY_VALUE).unwrap().contains('\n'));

        let parsed = parse_ads(&render_ad(&ad)).unwrap().remove(0);
        let read = factory_key(&parsed).unwrap();
        assert_eq!(read.key_id(), key.public_key().key_id());
    }

    #[test]
    fn entry_ad() {
        let config = config();
        let key = RsaKey::generate(2048).unwrap();
        let mut state = EntryState {
            in_downtime: true,
            totals: Counts { idle: 3, running: 2, held: 0 },
            ..Default::default()
        };
        state
            .limits_triggered
            .insert("IdleGlideinsPerEntry".to_string(), "count=3, limit=3".to_string());
        let ad = glidefactory_ad(&config, &config.entries[0], key.public_key(), &state);
        assert_eq!(ad.name(), Some("CE_a@main@gfactory"));
        assert_eq!(ad.get_str(ATTR_IN_DOWNTIME), Some("True"));
        assert_eq!(ad.get_str("GLIDEIN_Site"), Some("Example"));
        assert_eq!(ad.get_str("GlideinParamCONDOR_VERSION"), Some("default"));
        assert_eq!(ad.get_bool("GlideinRequireGlideinProxy"), Some(true));
        assert_eq!(ad.get_int("GlideinConfigPerEntryMaxIdle"), Some(2000));
        assert_eq!(ad.get_int("GlideinMonitorTotalStatusIdle"), Some(3));
        assert_eq!(
            ad.get_str("GlideinMonitorStatus_GlideFactoryLimitIdleGlideinsPerEntry"),
            Some("count=3, limit=3")
        );
    }

    #[test]
    fn client_ad() {
        let config = config();
        let client = ClientState {
            client: "fe.main".to_string(),
            request_name: "CE_a@main@gfactory".to_string(),
            status: Counts { idle: 1, running: 4, held: 1 },
            requested_idle: 2,
            requested_max_run: 10,
            submitted: 1,
            ..Default::default()
        };
        let totals = Counts { idle: 5, running: 9, held: 1 };
        let ad = glidefactoryclient_ad(&config, &config.entries[0], &totals, &client);
        assert_eq!(ad.name(), Some("CE_a@main@gfactory@fe.main"));
        assert_eq!(ad.get_str(ATTR_REQ_CLIENT_NAME), Some("fe.main"));
        assert_eq!(ad.get_str(ATTR_REQ_ENTRY_NAME), Some("CE_a"));
        let monitors: Vec<String> = ad
            .typed_attrs(MONITOR_PREFIX)
            .iter()
            .map(|(name, value)| format!("{name} = {value:?}"))
            .collect();
        insta::assert_snapshot!(monitors.join("\n"), @r###"
        RequestedIdle = Int(2)
        RequestedMaxGlideins = Int(10)
        StatusHeld = Int(1)
        StatusIdle = Int(1)
        StatusRunning = Int(4)
        StatusSubmitted = Int(1)
        TotalStatusHeld = Int(1)
        TotalStatusIdle = Int(5)
        TotalStatusRunning = Int(9)
        "###);
    }
}
