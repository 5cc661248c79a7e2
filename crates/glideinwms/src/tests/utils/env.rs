use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use gwms_core::adbus::{AdBus, MemoryAdBus};
use gwms_core::batch::{BatchSystem, MemoryBatchSystem};
use gwms_core::classad::{AdType, ClassAd};

use crate::frontend::config::{FactoryPoolConfig, FrontendConfig};
use crate::frontend::group::GroupWorker;
use crate::frontend::sources::{FactoryPool, Services};
use crate::tests::utils::ads::scitoken_file;

pub const FACTORY_IDENTITY: &str = "gfactory@factory.example.org";
pub const FRONTEND_IDENTITY: &str = "vofrontend@factory.example.org";
pub const FACTORY_POOL: &str = "factory.example.org";
pub const SCHEDD: &str = "schedd_a.example.org";

pub fn init_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// A frontend with a single group `main` using one scitoken, reading one advertised scheduler.
pub struct FrontendEnv {
    pub dir: TempDir,
    pub config: FrontendConfig,
    /// Collector shared with the factory
    pub factory_pool: MemoryAdBus,
    pub user_pool: MemoryAdBus,
    pub schedd: MemoryBatchSystem,
}

impl FrontendEnv {
    pub fn new() -> Self {
        Self::with_group("")
    }

    /// `group` is appended to the `[[groups]]` table of the group.
    pub fn with_group(group: &str) -> Self {
        init_logging();
        let dir = TempDir::with_prefix("gwms").unwrap();
        let token = scitoken_file(dir.path(), "vofe");
        let config: FrontendConfig = toml::from_str(&format!(
            r#"
frontend_name = "vofe"
work_dir = "{work_dir}"
security_name = "vofrontend"
schedds = ["{SCHEDD}"]

[[factory_pools]]
pool = "{FACTORY_POOL}"
factory_identity = "{FACTORY_IDENTITY}"
my_identity = "{FRONTEND_IDENTITY}"

[[groups]]
name = "main"
{group}

[[groups.credentials]]
path = "{token}"
type = "scitoken"
"#,
            work_dir = dir.path().join("frontend").display(),
            token = token.display(),
        ))
        .unwrap();
        config.validate().unwrap();
        let user_pool = MemoryAdBus::new("collector");
        futures::executor::block_on(
            user_pool
                .connect(SCHEDD)
                .publish(vec![ClassAd::new(AdType::Schedd, SCHEDD)]),
        )
        .unwrap();
        FrontendEnv {
            dir,
            config,
            factory_pool: MemoryAdBus::new("collector"),
            user_pool,
            schedd: MemoryBatchSystem::new(),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            factory_pools: vec![FactoryPool {
                config: FactoryPoolConfig {
                    pool: FACTORY_POOL.to_string(),
                    factory_identity: Some(FACTORY_IDENTITY.to_string()),
                    my_identity: FRONTEND_IDENTITY.to_string(),
                },
                bus: Rc::new(self.factory_pool.connect(FRONTEND_IDENTITY)) as Rc<dyn AdBus>,
            }],
            user_pool: Rc::new(self.user_pool.clone()),
            schedds: BTreeMap::from([(
                SCHEDD.to_string(),
                Rc::new(self.schedd.clone()) as Rc<dyn BatchSystem>,
            )]),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn worker(&self) -> GroupWorker<'_> {
        GroupWorker::new(&self.config, "main", self.services())
            .unwrap()
            .with_rng(StdRng::seed_from_u64(7))
    }

    /// Publishes ads as the factory would.
    pub async fn publish_as_factory(&self, ads: Vec<ClassAd>) {
        self.factory_pool
            .connect(FACTORY_IDENTITY)
            .publish(ads)
            .await
            .unwrap();
    }

    /// Requests of the group currently stored at the factory collector.
    pub fn requests(&self) -> Vec<ClassAd> {
        self.factory_pool.ads(AdType::Client)
    }
}
