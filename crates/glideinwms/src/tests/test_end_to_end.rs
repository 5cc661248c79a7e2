use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;

use gwms_core::classad::{AdType, SequenceCounter};
use gwms_core::crypto::RsaKey;

use crate::aggregator::sink::tests::MemorySink;
use crate::common::process::WorkerAction;
use crate::factory::config::FactoryConfig;
use crate::factory::entry::{EntryServices, EntryWorker};
use crate::factory::global::{FactoryWork, advertise_global, decode_request, find_work, load_or_create_key};
use crate::frontend::ads::{ENC_SECURITY_CLASS, ENC_SECURITY_NAME};
use crate::tests::utils::{FACTORY_IDENTITY, FRONTEND_IDENTITY, FrontendEnv, idle_job};

/// A factory with one scitoken entry, talking to the collector of `env`.
struct Factory {
    config: FactoryConfig,
    key: RsaKey,
    bus: gwms_core::adbus::MemoryAdBus,
    batch: gwms_core::batch::MemoryBatchSystem,
    sequence: SequenceCounter,
}

impl Factory {
    fn new(env: &FrontendEnv) -> Self {
        Self::started_at(env, Utc::now().timestamp())
    }

    fn started_at(env: &FrontendEnv, start_time: i64) -> Self {
        let dir = env.dir.path().join("factory");
        let config: FactoryConfig = toml::from_str(&format!(
            r#"
factory_name = "gfactory"
glidein_name = "main"
work_dir = "{dir}/work"
client_proxy_dir = "{dir}/proxies"

[frontends.vofrontend]
identity = "{FRONTEND_IDENTITY}"
usernames = {{ frontend = "vofe_pilot" }}

[[entries]]
name = "CE_a"
gridtype = "condor"
gatekeeper = "ce-a.example.org"
auth_method = "scitoken"
"#,
            dir = dir.display()
        ))
        .unwrap();
        let key = load_or_create_key(&config.rsa_key_path(), 2048).unwrap();
        Factory {
            config,
            key,
            bus: env.factory_pool.connect(FACTORY_IDENTITY),
            batch: gwms_core::batch::MemoryBatchSystem::new(),
            sequence: SequenceCounter::new(start_time),
        }
    }

    fn worker(&self) -> EntryWorker<'_> {
        let services = EntryServices {
            bus: Rc::new(self.bus.clone()),
            batch: Rc::new(self.batch.clone()),
            timeout: Duration::from_secs(5),
        };
        EntryWorker::new(&self.config, "CE_a", &self.key, services)
            .unwrap()
            .with_sink(Box::new(MemorySink::default()))
    }

    async fn advertise(&mut self) {
        let timeout = Duration::from_secs(5);
        advertise_global(&self.bus, &self.config, &self.key, &mut self.sequence, timeout)
            .await
            .unwrap();
        self.worker().iterate(&FactoryWork::default(), Utc::now()).await;
    }

    async fn work(&self) -> FactoryWork {
        find_work(&self.bus, &self.config, &self.key, Duration::from_secs(5))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn frontend_request_reaches_the_factory() {
    let env = FrontendEnv::new();
    let mut factory = Factory::new(&env);
    factory.advertise().await;
    assert_eq!(env.factory_pool.ads(AdType::Factory).len(), 1);
    env.schedd.add_job(idle_job(1, "alice"));

    let report = env.worker().run(WorkerAction::Run).await.unwrap();
    assert_eq!(report.requests, 1);

    let work = factory.work().await;
    let global = &work.globals["vofe.main"];
    assert_eq!(global.identity, FRONTEND_IDENTITY);
    assert_eq!(global.security_name, "vofrontend");
    assert_eq!(work.for_entry("CE_a").len(), 1);

    let report = factory.worker().iterate(&work, Utc::now()).await;
    assert_eq!(report.rejected, 0);
    assert_eq!(report.submitted, 1);
    assert_eq!(factory.batch.submitted_count(), 1);

    let token = factory
        .config
        .client_proxy_dir
        .join("vofe_pilot")
        .join("credential_vofe.main_CE_a.scitoken");
    let sent = std::fs::read_to_string(env.dir.path().join("vofe.scitoken")).unwrap();
    assert_eq!(std::fs::read_to_string(token).unwrap(), sent);

    let client = env
        .factory_pool
        .ads(AdType::FactoryClient)
        .into_iter()
        .find(|ad| ad.get_str("ReqClientName") == Some("vofe.main"));
    assert!(client.is_some());
}

#[tokio::test]
async fn requests_are_only_readable_by_the_factory() {
    let env = FrontendEnv::new();
    let mut factory = Factory::new(&env);
    factory.advertise().await;
    env.schedd.add_job(idle_job(1, "alice"));
    env.worker().run(WorkerAction::Run).await.unwrap();

    let ad = env.requests().remove(0);
    let request = decode_request(&factory.key, &ad).unwrap();
    assert_eq!(request.secrets[ENC_SECURITY_NAME], "vofrontend");
    assert_eq!(request.secrets[ENC_SECURITY_CLASS], "frontend");
    assert_eq!(request.identity, FRONTEND_IDENTITY);

    let other = RsaKey::generate(2048).unwrap();
    assert!(decode_request(&other, &ad).is_err());
}

#[tokio::test]
async fn factory_key_rotation_is_picked_up() {
    let env = FrontendEnv::new();
    let mut factory = Factory::new(&env);
    factory.advertise().await;
    env.schedd.add_job(idle_job(1, "alice"));
    let mut frontend = env.worker();
    frontend.run(WorkerAction::Run).await.unwrap();

    std::fs::remove_file(factory.config.rsa_key_path()).unwrap();
    let mut rotated = Factory::started_at(&env, Utc::now().timestamp() + 60);
    rotated.advertise().await;
    assert!(rotated.work().await.for_entry("CE_a").is_empty());

    frontend.run(WorkerAction::Run).await.unwrap();
    assert_eq!(rotated.work().await.for_entry("CE_a").len(), 1);
}
