use gwms_core::adbus::{AdBus, Constraint};
use gwms_core::classad::{ATTR_SEQUENCE, AdType, ClassAd};
use gwms_core::crypto::RsaKey;

use crate::common::process::WorkerAction;
use crate::frontend::ads::{
    ATTR_CLIENT_NAME, ATTR_REQ_GLIDEIN, ATTR_REQ_IDLE, ATTR_REQ_MAX_RUN, ATTR_REQ_NAME,
    ATTR_REQ_REMOVE_EXCESS,
};
use crate::tests::utils::{
    EntryAdBuilder, FACTORY_IDENTITY, FrontendEnv, SlotBuilder, factory_global_ad, idle_job,
    running_job,
};

async fn with_factory(env: &FrontendEnv, key: &RsaKey, entries: Vec<ClassAd>) {
    let mut ads = vec![factory_global_ad("main@gfactory", &key.public_key())];
    ads.extend(entries);
    env.publish_as_factory(ads).await;
}

fn request_for<'a>(requests: &'a [ClassAd], entry: &str) -> Option<&'a ClassAd> {
    let request_name = format!("{entry}@main@gfactory");
    requests
        .iter()
        .find(|ad| ad.get_str(ATTR_REQ_NAME) == Some(request_name.as_str()))
}

#[tokio::test]
async fn single_idle_job_requests_one_glidein() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));

    let report = env.worker().run(WorkerAction::Run).await.unwrap();
    assert_eq!(report.entries, 1);
    assert_eq!(report.requests, 1);
    assert_eq!(report.resources, 1);

    let requests = env.requests();
    let request = request_for(&requests, "CE_a").unwrap();
    assert_eq!(request.get_int(ATTR_REQ_IDLE), Some(1));
    assert!(request.get_int(ATTR_REQ_MAX_RUN).unwrap() >= 1);
    assert_eq!(request.get_str(ATTR_REQ_REMOVE_EXCESS), Some("NO"));
    assert_eq!(request.get_str(ATTR_CLIENT_NAME), Some("vofe.main"));
    assert_eq!(request.get_str(ATTR_REQ_GLIDEIN), Some("main@gfactory"));
    assert!(request.name().unwrap().ends_with("_CE_a@main@gfactory@vofe.main"));

    let globals = env.factory_pool.ads(AdType::ClientGlobal);
    assert_eq!(globals.len(), 1);
    assert_eq!(env.user_pool.ads(AdType::Resource).len(), 1);
    assert!(env.config.group_work_dir("main").join("history.json").exists());
}

#[tokio::test]
async fn downtime_entry_gets_nothing() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    let entry = EntryAdBuilder::default().in_downtime(true).finish();
    with_factory(&env, &key, vec![entry]).await;
    env.schedd.add_job(idle_job(1, "alice"));
    env.schedd.add_job(idle_job(2, "bob"));

    env.worker().run(WorkerAction::Run).await.unwrap();
    for request in env.requests() {
        assert_eq!(request.get_int(ATTR_REQ_IDLE), Some(0));
        assert_eq!(request.get_int(ATTR_REQ_MAX_RUN), Some(0));
    }
}

#[tokio::test]
async fn unused_entry_escalates_removal() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;

    let mut worker = env.worker();
    let mut modes = Vec::new();
    for _ in 0..11 {
        worker.run(WorkerAction::Run).await.unwrap();
        let requests = env.requests();
        modes.push(
            request_for(&requests, "CE_a")
                .and_then(|ad| ad.get_str(ATTR_REQ_REMOVE_EXCESS).map(str::to_string)),
        );
    }
    assert!(modes[..5].iter().all(Option::is_none));
    assert_eq!(modes[5].as_deref(), Some("WAIT"));
    assert_eq!(modes[10].as_deref(), Some("ALL"));

    env.schedd.add_job(idle_job(1, "alice"));
    worker.run(WorkerAction::Run).await.unwrap();
    let requests = env.requests();
    let request = request_for(&requests, "CE_a").unwrap();
    assert_eq!(request.get_str(ATTR_REQ_REMOVE_EXCESS), Some("NO"));
    assert_eq!(request.get_int(ATTR_REQ_IDLE), Some(1));
}

#[tokio::test]
async fn counters_survive_worker_restarts() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;

    for _ in 0..6 {
        env.worker().run(WorkerAction::Run).await.unwrap();
    }
    let requests = env.requests();
    let request = request_for(&requests, "CE_a").unwrap();
    assert_eq!(request.get_str(ATTR_REQ_REMOVE_EXCESS), Some("WAIT"));
}

#[tokio::test]
async fn unreadable_user_pool_keeps_removal_counters() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;

    let mut worker = env.worker();
    for _ in 0..5 {
        worker.run(WorkerAction::Run).await.unwrap();
    }
    let history = env.config.group_work_dir("main").join("history.json");
    let saved = std::fs::read_to_string(&history).unwrap();

    env.user_pool.set_offline(true);
    for _ in 0..3 {
        assert!(worker.run(WorkerAction::Run).await.is_err());
    }
    assert_eq!(std::fs::read_to_string(&history).unwrap(), saved);

    env.user_pool.set_offline(false);
    worker.run(WorkerAction::Run).await.unwrap();
    let requests = env.requests();
    let request = request_for(&requests, "CE_a").unwrap();
    assert_eq!(request.get_str(ATTR_REQ_REMOVE_EXCESS), Some("WAIT"));
}

#[tokio::test]
async fn sequence_numbers_grow() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));

    let mut worker = env.worker();
    let mut sequences = Vec::new();
    for _ in 0..3 {
        worker.run(WorkerAction::Run).await.unwrap();
        let globals = env.factory_pool.ads(AdType::ClientGlobal);
        sequences.push(globals[0].get_int(ATTR_SEQUENCE).unwrap());
    }
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn entries_of_unexpected_publishers_are_ignored() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, Vec::new()).await;
    env.factory_pool
        .connect("mallory@example.org")
        .publish(vec![EntryAdBuilder::default().entry("CE_evil").finish()])
        .await
        .unwrap();
    env.schedd.add_job(idle_job(1, "alice"));

    let report = env.worker().run(WorkerAction::Run).await.unwrap();
    assert_eq!(report.entries, 0);
    assert!(env.requests().is_empty());
}

#[tokio::test]
async fn resource_ads_count_group_glideins() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));
    env.schedd.add_job(running_job(2, "bob"));
    env.user_pool
        .publish(vec![
            SlotBuilder::default().name("slot1@wn1").busy(true).finish(),
            SlotBuilder::default().name("slot1@wn2").finish(),
            SlotBuilder::default().name("slot1@wn3").client("other.main").finish(),
        ])
        .await
        .unwrap();

    env.worker().run(WorkerAction::Run).await.unwrap();
    let resource = env
        .user_pool
        .get(AdType::Resource, "CE_a@main@gfactory@vofe.main")
        .unwrap();
    assert_eq!(resource.get_int("GlideClientMonitorGlideinsTotal"), Some(2));
    assert_eq!(resource.get_int("GlideClientMonitorGlideinsIdle"), Some(1));
    assert_eq!(resource.get_int("GlideClientMonitorGlideinsRunning"), Some(1));
    assert_eq!(resource.get_int("GlideClientMonitorJobsRunning"), Some(1));
    assert_eq!(resource.get_str("GlideFrontendName"), Some("vofe"));
}

#[tokio::test]
async fn resource_ads_report_limits_and_curbs() {
    let env = FrontendEnv::with_group(
        r#"
[groups.entry_limits]
max_running = 2
curb_vms_idle = 1
"#,
    );
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));
    env.user_pool
        .publish(vec![
            SlotBuilder::default().name("slot1@wn1").finish(),
            SlotBuilder::default().name("slot1@wn2").finish(),
        ])
        .await
        .unwrap();

    env.worker().run(WorkerAction::Run).await.unwrap();
    let requests = env.requests();
    let request = request_for(&requests, "CE_a").unwrap();
    assert_eq!(request.get_int(ATTR_REQ_IDLE), Some(0));

    let resource = env
        .user_pool
        .get(AdType::Resource, "CE_a@main@gfactory@vofe.main")
        .unwrap();
    assert_eq!(
        resource.get_str("GlideClientLimitTotalGlideinsPerEntry"),
        Some("count=2, limit=2")
    );
    assert_eq!(
        resource.get_str("GlideClientCurbCurbIdleGlideinsPerEntry"),
        Some("count=2, limit=1, curbbed")
    );
}

#[tokio::test]
async fn requests_are_withdrawn_when_entries_disappear() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));

    let mut worker = env.worker();
    worker.run(WorkerAction::Run).await.unwrap();
    assert_eq!(env.requests().len(), 1);

    env.factory_pool
        .connect(FACTORY_IDENTITY)
        .invalidate(AdType::Factory, Constraint::All)
        .await
        .unwrap();
    let report = worker.run(WorkerAction::Run).await.unwrap();
    assert_eq!(report.requests, 0);
    assert!(env.requests().is_empty());
}

#[tokio::test]
async fn deadvertise_withdraws_group_ads() {
    let env = FrontendEnv::new();
    let key = RsaKey::generate(2048).unwrap();
    with_factory(&env, &key, vec![EntryAdBuilder::default().finish()]).await;
    env.schedd.add_job(idle_job(1, "alice"));

    let mut worker = env.worker();
    worker.run(WorkerAction::Run).await.unwrap();
    assert!(!env.requests().is_empty());

    worker.run(WorkerAction::Deadvertise).await.unwrap();
    assert!(env.requests().is_empty());
    assert!(env.factory_pool.ads(AdType::ClientGlobal).is_empty());
    assert!(env.user_pool.ads(AdType::Resource).is_empty());
    assert_eq!(env.factory_pool.ads(AdType::Factory).len(), 1);
}
