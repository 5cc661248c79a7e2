use std::path::{Path, PathBuf};

use chrono::Utc;
use derive_builder::Builder;

use gwms_core::batch::{ATTR_CLUSTER_ID, ATTR_ENTERED_STATUS, ATTR_JOB_STATUS, ATTR_PROC_ID, JobStatus};
use gwms_core::classad::{AdType, ClassAd};
use gwms_core::crypto::jwt::issue_hs256;
use gwms_core::crypto::{JwtClaims, RsaPublicKey};

use crate::factory::ads::{
    ATTR_AUTH_METHOD, ATTR_ENTRY_NAME, ATTR_PUB_KEY_ID, ATTR_PUB_KEY_TYPE, ATTR_PUB_KEY_VALUE,
    ATTR_TRUST_DOMAIN,
};
use crate::frontend::classify::{ATTR_CREDENTIAL_IDENTIFIER, ATTR_GLIDECLIENT_NAME};
use crate::matching::{ATTR_GLIDEIN_CPUS, ATTR_IN_DOWNTIME, ATTR_REQUEST_CPUS};

fn job(cluster: u64, owner: &str, status: JobStatus) -> ClassAd {
    let mut job = ClassAd::default();
    job.insert(ATTR_CLUSTER_ID, cluster);
    job.insert(ATTR_PROC_ID, 0);
    job.insert(ATTR_JOB_STATUS, status.code());
    job.insert(ATTR_ENTERED_STATUS, Utc::now().timestamp());
    job.insert("Owner", owner);
    job.insert("User", format!("{owner}@example.org"));
    job.insert(ATTR_REQUEST_CPUS, 1);
    job
}

pub fn idle_job(cluster: u64, owner: &str) -> ClassAd {
    job(cluster, owner, JobStatus::Idle)
}

pub fn running_job(cluster: u64, owner: &str) -> ClassAd {
    job(cluster, owner, JobStatus::Running)
}

/// Key ad of a factory, the way the factory publishes it.
pub fn factory_global_ad(name: &str, key: &RsaPublicKey) -> ClassAd {
    let mut ad = ClassAd::new(AdType::FactoryGlobal, name);
    ad.insert(ATTR_PUB_KEY_ID, key.key_id());
    ad.insert(ATTR_PUB_KEY_TYPE, "RSA");
    ad.insert(ATTR_PUB_KEY_VALUE, key.pem().replace('\n', "\\n"));
    ad
}

/// Writes a scitoken valid for an hour and returns its path.
pub fn scitoken_file(dir: &Path, sub: &str) -> PathBuf {
    let now = Utc::now().timestamp();
    let token = issue_hs256(
        &JwtClaims {
            sub: Some(sub.to_string()),
            iat: Some(now),
            nbf: Some(now - 10),
            exp: Some(now + 3600),
            ..Default::default()
        },
        b"secret",
    )
    .unwrap();
    let path = dir.join(format!("{sub}.scitoken"));
    std::fs::write(&path, token).unwrap();
    path
}

/// `glidefactory` ad of one entry.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", derive(Clone))]
pub struct EntryAd {
    #[builder(default = "\"CE_a\".to_string()", setter(into))]
    entry: String,
    #[builder(default = "\"main@gfactory\".to_string()", setter(into))]
    glidein_factory: String,
    #[builder(default = "\"scitoken\".to_string()", setter(into))]
    auth_method: String,
    #[builder(default = "\"Grid\".to_string()", setter(into))]
    trust_domain: String,
    #[builder(default)]
    in_downtime: bool,
    #[builder(default = "1")]
    cpus: u32,
    #[builder(default = "\"Example\".to_string()", setter(into))]
    site: String,
}

impl EntryAdBuilder {
    pub fn finish(self) -> ClassAd {
        let entry: EntryAd = self.build().unwrap();
        let mut ad = ClassAd::new(
            AdType::Factory,
            &format!("{}@{}", entry.entry, entry.glidein_factory),
        );
        ad.insert(ATTR_ENTRY_NAME, entry.entry.as_str());
        ad.insert(ATTR_AUTH_METHOD, entry.auth_method.as_str());
        ad.insert(ATTR_TRUST_DOMAIN, entry.trust_domain.as_str());
        ad.insert(ATTR_IN_DOWNTIME, if entry.in_downtime { "True" } else { "False" });
        ad.insert(ATTR_GLIDEIN_CPUS, entry.cpus);
        ad.insert("GLIDEIN_Site", entry.site.as_str());
        ad
    }
}

/// Startd ad of a glidein started for a client.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", derive(Clone))]
pub struct Slot {
    #[builder(setter(into))]
    name: String,
    #[builder(default = "\"vofe.main\".to_string()", setter(into))]
    client: String,
    #[builder(default = "\"CE_a\".to_string()", setter(into))]
    entry: String,
    #[builder(default = "\"main\".to_string()", setter(into))]
    glidein: String,
    #[builder(default = "\"gfactory\".to_string()", setter(into))]
    factory: String,
    #[builder(default, setter(into, strip_option))]
    credential: Option<String>,
    #[builder(default)]
    busy: bool,
    #[builder(default = "1")]
    cpus: u32,
}

impl SlotBuilder {
    pub fn finish(self) -> ClassAd {
        let slot: Slot = self.build().unwrap();
        let mut ad = ClassAd::new(AdType::Slot, &slot.name);
        ad.insert(ATTR_GLIDECLIENT_NAME, slot.client.as_str());
        ad.insert("GLIDEIN_Entry_Name", slot.entry.as_str());
        ad.insert("GLIDEIN_Name", slot.glidein.as_str());
        ad.insert("GLIDEIN_Factory", slot.factory.as_str());
        if let Some(credential) = &slot.credential {
            ad.insert(ATTR_CREDENTIAL_IDENTIFIER, credential.as_str());
        }
        if slot.busy {
            ad.insert("State", "Claimed");
            ad.insert("Activity", "Busy");
        } else {
            ad.insert("State", "Unclaimed");
            ad.insert("Activity", "Idle");
        }
        ad.insert("Cpus", slot.cpus);
        ad
    }
}
