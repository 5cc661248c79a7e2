use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;

use gwms_core::ExternalResult;
use gwms_core::adbus::{AdBus, Constraint};
use gwms_core::batch::BatchSystem;
use gwms_core::classad::{ATTR_AUTHENTICATED_IDENTITY, AdType, ClassAd};
use gwms_core::common::error::CoreError;
use gwms_core::crypto::RsaPublicKey;

use crate::factory::ads::{ATTR_PUB_KEY_TYPE, ATTR_PUB_KEY_VALUE, ATTR_REQ_CLIENT_NAME};
use crate::frontend::ads::ATTR_REQ_GLIDEIN;
use crate::frontend::config::FactoryPoolConfig;

/// A factory collector together with how the group talks to it.
pub struct FactoryPool {
    pub config: FactoryPoolConfig,
    pub bus: Rc<dyn AdBus>,
}

/// External systems a group iteration reads from and publishes to.
pub struct Services {
    pub factory_pools: Vec<FactoryPool>,
    /// Collector of the glideins (slots, schedd ads, resource ads)
    pub user_pool: Rc<dyn AdBus>,
    pub schedds: BTreeMap<String, Rc<dyn BatchSystem>>,
    pub timeout: Duration,
}

/// A factory that can receive requests.
#[derive(Debug, Clone)]
pub struct FactoryGlobal {
    /// `<glidein>@<factory>`
    pub name: String,
    pub key: RsaPublicKey,
    pub ad: ClassAd,
}

/// What one factory collector reported.
#[derive(Debug, Clone, Default)]
pub struct FactoryView {
    pub pool: String,
    pub globals: Vec<FactoryGlobal>,
    pub entries: Vec<ClassAd>,
    /// `glidefactoryclient` ads addressed to this group
    pub clients: Vec<ClassAd>,
}

impl FactoryView {
    /// Key of the factory serving the entry `request_name`.
    pub fn global_for(&self, request_name: &str) -> Option<&FactoryGlobal> {
        self.globals
            .iter()
            .find(|global| request_name.ends_with(&format!("@{}", global.name)))
    }

    pub fn client_for(&self, request_name: &str) -> Option<&ClassAd> {
        self.clients
            .iter()
            .find(|ad| ad.get_str(ATTR_REQ_GLIDEIN) == Some(request_name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub factories: Vec<FactoryView>,
    pub schedd_ads: Vec<ClassAd>,
    /// Jobs per scheduler; unreachable schedulers are absent
    pub jobs: BTreeMap<String, Vec<ClassAd>>,
    pub slots: Vec<ClassAd>,
}

pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, future: F) -> ExternalResult<T>
where
    F: Future<Output = ExternalResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{what} timed out after {}", humantime::format_duration(timeout)),
    }
}

/// Reads the public key of a factory, undoing the `\n` escaping of the collector.
pub fn factory_key(ad: &ClassAd) -> crate::Result<RsaPublicKey> {
    match ad.get_str(ATTR_PUB_KEY_TYPE) {
        Some("RSA") => {}
        other => {
            return Err(CoreError::invalid_input(format!(
                "Unsupported public key type {}",
                other.unwrap_or("<missing>")
            ))
            .into());
        }
    }
    let pem = ad
        .get_str(ATTR_PUB_KEY_VALUE)
        .ok_or_else(|| CoreError::invalid_input("Missing public key"))?
        .replace("\\n", "\n");
    Ok(RsaPublicKey::from_pem(&pem)?)
}

/// Drops ads not published by the expected identity and strips the fabric attributes.
fn ingest(ads: Vec<ClassAd>, expected_identity: Option<&str>) -> Vec<ClassAd> {
    ads.into_iter()
        .filter(|ad| match expected_identity {
            Some(identity) => {
                let published_by = ad.get_str(ATTR_AUTHENTICATED_IDENTITY);
                if published_by != Some(identity) {
                    log::warn!(
                        "Ignoring ad {} published by {}, expected {identity}",
                        ad.name().unwrap_or_default(),
                        published_by.unwrap_or("<unknown>")
                    );
                    return false;
                }
                true
            }
            None => true,
        })
        .map(|mut ad| {
            ad.strip_reserved();
            ad
        })
        .collect()
}

async fn poll_factory(
    pool: &FactoryPool,
    client_name: &str,
    timeout: Duration,
) -> ExternalResult<FactoryView> {
    let name = &pool.config.pool;
    let (globals, entries, clients) = futures::join!(
        bounded(
            timeout,
            name,
            pool.bus.query(AdType::FactoryGlobal, Constraint::All)
        ),
        bounded(timeout, name, pool.bus.query(AdType::Factory, Constraint::All)),
        bounded(
            timeout,
            name,
            pool.bus.query(
                AdType::FactoryClient,
                Constraint::eq(ATTR_REQ_CLIENT_NAME, client_name)
            )
        ),
    );
    let identity = pool.config.factory_identity.as_deref();
    let mut view = FactoryView {
        pool: name.clone(),
        entries: ingest(entries?, identity),
        clients: ingest(clients?, identity),
        ..Default::default()
    };
    for ad in ingest(globals?, identity) {
        let Some(global_name) = ad.name().map(|n| n.to_string()) else {
            continue;
        };
        match factory_key(&ad) {
            Ok(key) => view.globals.push(FactoryGlobal {
                name: global_name,
                key,
                ad,
            }),
            Err(error) => log::warn!("Dropping factory {global_name} at {name}: {error}"),
        }
    }
    Ok(view)
}

/// Reads the scheduler and slot ads of the user pool, then the jobs of every advertised scheduler.
///
/// Schedulers without a schedd ad are skipped.
async fn poll_user_pool(
    services: &Services,
    schedds: &[String],
) -> crate::Result<(Vec<ClassAd>, Vec<ClassAd>, BTreeMap<String, Vec<ClassAd>>)> {
    let timeout = services.timeout;
    let (schedd_ads, slots) = futures::join!(
        bounded(
            timeout,
            "user pool",
            services.user_pool.query(AdType::Schedd, Constraint::All),
        ),
        bounded(
            timeout,
            "user pool",
            services.user_pool.query(AdType::Slot, Constraint::All),
        ),
    );
    let schedd_ads = schedd_ads.map_err(|error| {
        CoreError::TransientExternal(format!("Cannot read scheduler ads: {error:?}"))
    })?;
    let mut slots = slots.map_err(|error| {
        CoreError::TransientExternal(format!("Cannot read glidein slots: {error:?}"))
    })?;
    slots.iter_mut().for_each(ClassAd::strip_reserved);

    let queried: Vec<(&String, Rc<dyn BatchSystem>)> = schedds
        .iter()
        .filter_map(|name| {
            let Some(batch) = services.schedds.get(name) else {
                log::warn!("Scheduler {name} is not configured");
                return None;
            };
            if !schedd_ads.iter().any(|ad| ad.name() == Some(name.as_str())) {
                log::warn!("Scheduler {name} has no schedd ad, skipping it");
                return None;
            }
            Some((name, batch.clone()))
        })
        .collect();
    let job_results = join_all(
        queried
            .iter()
            .map(|(name, batch)| bounded(timeout, name, batch.query(Constraint::All))),
    )
    .await;

    let mut jobs = BTreeMap::new();
    for ((name, _), result) in queried.iter().zip(job_results) {
        match result {
            Ok(mut ads) => {
                ads.iter_mut().for_each(ClassAd::strip_reserved);
                jobs.insert(name.to_string(), ads);
            }
            Err(error) => log::warn!("Scheduler {name} failed: {error:?}"),
        }
    }
    if !queried.is_empty() && jobs.is_empty() {
        return Err(CoreError::TransientExternal("No scheduler could be queried".into()).into());
    }
    Ok((schedd_ads, slots, jobs))
}

/// Queries every factory pool in parallel with the user pool and the schedulers.
///
/// Fails when every factory pool or every advertised scheduler is unreachable, or when the
/// user pool cannot be read.
pub async fn poll(
    services: &Services,
    client_name: &str,
    schedds: &[String],
) -> crate::Result<Snapshot> {
    let factory_results = join_all(
        services
            .factory_pools
            .iter()
            .map(|pool| poll_factory(pool, client_name, services.timeout)),
    );
    let (factory_results, user_pool) =
        futures::join!(factory_results, poll_user_pool(services, schedds));

    let mut snapshot = Snapshot::default();
    for (pool, result) in services.factory_pools.iter().zip(factory_results) {
        match result {
            Ok(view) => snapshot.factories.push(view),
            Err(error) => log::warn!("Factory pool {} failed: {error:?}", pool.config.pool),
        }
    }
    if !services.factory_pools.is_empty() && snapshot.factories.is_empty() {
        return Err(CoreError::TransientExternal("No factory pool could be queried".into()).into());
    }
    (snapshot.schedd_ads, snapshot.slots, snapshot.jobs) = user_pool?;

    log::debug!(
        "Polled {} factory pools, {} schedulers and {} slots",
        snapshot.factories.len(),
        snapshot.jobs.len(),
        snapshot.slots.len()
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{factory_global_ad, idle_job};
    use gwms_core::adbus::MemoryAdBus;
    use gwms_core::common::error::ErrorKind;
    use gwms_core::batch::MemoryBatchSystem;
    use gwms_core::crypto::RsaKey;

    fn pool(bus: &MemoryAdBus, identity: Option<&str>) -> FactoryPool {
        FactoryPool {
            config: FactoryPoolConfig {
                pool: "factory.example.org".to_string(),
                factory_identity: identity.map(|s| s.to_string()),
                my_identity: "vofe@factory.example.org".to_string(),
            },
            bus: Rc::new(bus.connect("vofe@factory.example.org")),
        }
    }

    #[test]
    fn escaped_keys_are_normalized() {
        let key = RsaKey::generate(2048).unwrap();
        let ad = factory_global_ad("gfactory@main", key.public_key());
        assert_eq!(factory_key(&ad).unwrap().pem(), key.public_key().pem());

        let mut ad = ad.clone();
        ad.insert(ATTR_PUB_KEY_TYPE, "DSA");
        assert!(factory_key(&ad).is_err());
    }

    async fn advertise_schedds(user_pool: &MemoryAdBus, names: &[&str]) {
        let ads = names
            .iter()
            .map(|name| ClassAd::new(AdType::Schedd, name))
            .collect();
        user_pool.connect("condor@schedd").publish(ads).await.unwrap();
    }

    fn services(
        factory_pools: Vec<FactoryPool>,
        user_pool: &MemoryAdBus,
        schedds: Vec<(&str, MemoryBatchSystem)>,
    ) -> Services {
        Services {
            factory_pools,
            user_pool: Rc::new(user_pool.clone()),
            schedds: schedds
                .into_iter()
                .map(|(name, batch)| (name.to_string(), Rc::new(batch) as Rc<dyn BatchSystem>))
                .collect(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn partial_failures_are_tolerated() {
        let factory_bus = MemoryAdBus::new("collector");
        let key = RsaKey::generate(2048).unwrap();
        factory_bus
            .connect("factory@factory.example.org")
            .publish(vec![factory_global_ad("gfactory@main", key.public_key())])
            .await
            .unwrap();
        let offline_pool = MemoryAdBus::new("collector");
        offline_pool.set_offline(true);
        let user_pool = MemoryAdBus::new("collector");
        advertise_schedds(&user_pool, &["schedd_a", "schedd_b"]).await;
        let good = MemoryBatchSystem::new();
        good.add_job(idle_job(1, "alice"));
        let bad = MemoryBatchSystem::new();
        bad.set_offline(true);

        let mut offline = pool(&offline_pool, None);
        offline.config.pool = "offline.example.org".to_string();
        let services = services(
            vec![
                pool(&factory_bus, Some("factory@factory.example.org")),
                offline,
            ],
            &user_pool,
            vec![("schedd_a", good), ("schedd_b", bad)],
        );
        let schedds = vec!["schedd_a".to_string(), "schedd_b".to_string()];
        let snapshot = poll(&services, "fe.main", &schedds).await.unwrap();
        assert_eq!(snapshot.factories.len(), 1);
        assert_eq!(snapshot.factories[0].globals.len(), 1);
        assert!(
            snapshot.factories[0]
                .global_for("entry@gfactory@main")
                .is_some()
        );
        assert_eq!(snapshot.schedd_ads.len(), 2);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs["schedd_a"].len(), 1);
        assert!(snapshot.slots.is_empty());
    }

    #[tokio::test]
    async fn unreadable_user_pool_fails_the_poll() {
        let user_pool = MemoryAdBus::new("collector");
        advertise_schedds(&user_pool, &["schedd_a"]).await;
        user_pool.set_offline(true);
        let good = MemoryBatchSystem::new();
        good.add_job(idle_job(1, "alice"));
        let services = services(vec![], &user_pool, vec![("schedd_a", good)]);

        let error = poll(&services, "fe.main", &["schedd_a".to_string()])
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TransientExternal);
    }

    #[tokio::test]
    async fn schedds_without_ads_are_not_queried() {
        let user_pool = MemoryAdBus::new("collector");
        advertise_schedds(&user_pool, &["schedd_a"]).await;
        let advertised = MemoryBatchSystem::new();
        advertised.add_job(idle_job(1, "alice"));
        let silent = MemoryBatchSystem::new();
        silent.add_job(idle_job(2, "bob"));
        let services = services(
            vec![],
            &user_pool,
            vec![("schedd_a", advertised), ("schedd_b", silent)],
        );

        let schedds = vec!["schedd_a".to_string(), "schedd_b".to_string()];
        let snapshot = poll(&services, "fe.main", &schedds).await.unwrap();
        assert_eq!(snapshot.jobs.keys().collect::<Vec<_>>(), vec!["schedd_a"]);

        // Only unadvertised schedulers: nothing to read, nothing failed
        let snapshot = poll(&services, "fe.main", &["schedd_b".to_string()])
            .await
            .unwrap();
        assert!(snapshot.jobs.is_empty());
    }

    #[tokio::test]
    async fn unexpected_publishers_are_ignored() {
        let factory_bus = MemoryAdBus::new("collector");
        let key = RsaKey::generate(2048).unwrap();
        factory_bus
            .connect("intruder@elsewhere")
            .publish(vec![factory_global_ad("gfactory@main", key.public_key())])
            .await
            .unwrap();
        let services = Services {
            factory_pools: vec![pool(&factory_bus, Some("factory@factory.example.org"))],
            user_pool: Rc::new(MemoryAdBus::new("collector")),
            schedds: BTreeMap::new(),
            timeout: Duration::from_secs(5),
        };
        let snapshot = poll(&services, "fe.main", &[]).await.unwrap();
        assert!(snapshot.factories[0].globals.is_empty());
    }

    #[tokio::test]
    async fn fails_without_any_scheduler() {
        let user_pool = MemoryAdBus::new("collector");
        advertise_schedds(&user_pool, &["schedd_a"]).await;
        let bad = MemoryBatchSystem::new();
        bad.set_offline(true);
        let services = services(vec![], &user_pool, vec![("schedd_a", bad)]);
        assert!(
            poll(&services, "fe.main", &["schedd_a".to_string()])
                .await
                .is_err()
        );
    }
}
