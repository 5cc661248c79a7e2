use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use gwms_core::classad::ClassAd;
use gwms_core::common::fsutils::{read_json_or_default, write_json_atomic};
use gwms_core::credentials::{
    AuthenticationMethod, Credential, CredentialKind, CredentialPurpose, CredentialType,
    GeneratorRegistry, ParameterDict, Purpose, RequestCredential, SecurityBundle,
};
use gwms_core::crypto::sha256_hex;

use crate::frontend::config::CredentialConfig;

pub const ATTR_USER: &str = "User";
pub const ATTR_PROJECT_NAME: &str = "ProjectName";

const RR_STATE_FILE: &str = "proxy_user_rr.dat";
const USERMAP_STATE_FILE: &str = "proxy_usermap_wr.dat";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyName {
    #[default]
    ProxyFirst,
    ProxyAll,
    ProxyUserCardinality,
    ProxyUserRR,
    ProxyUserMapWRecycling,
    ProxyProjectName,
}

/// Trust domain of credentials usable at every entry.
pub const ANY_TRUST_DOMAIN: &str = "Any";

/// A configured credential of a group, with what it is forwarded with.
#[derive(Debug, Clone)]
pub struct GroupCredential {
    pub credential: Credential,
    pub parameters: ParameterDict,
    /// Credential handed to the glideins (`GlideinProxy`)
    pub pilot: Option<Credential>,
}

impl GroupCredential {
    /// Loads, renews and resolves a configured credential.
    pub async fn load(
        config: &CredentialConfig,
        registry: &GeneratorRegistry,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let kind = config.kind()?;
        let mut credential = Credential::new(
            kind,
            config.purpose(),
            &config.trust_domain,
            &config.security_class,
        )
        .with_path(config.path.clone())
        .with_creation_script(config.creation_script.clone())
        .with_minimum_lifetime(config.minimum_lifetime)
        .with_context(config.context.clone());
        if let (CredentialKind::Pair(_), Some(key_file)) = (kind, &config.key_file) {
            credential = credential.with_private_path(key_file.clone());
        }
        credential.load_if_present()?;
        credential.renew(timeout).await?;
        let credential = credential.resolve(registry).await?;

        let mut parameters = ParameterDict::default();
        for parameter in config.parameters()? {
            parameters.add(parameter);
        }
        let pilot = match &config.pilot_file {
            Some(path) => {
                let mut pilot = Credential::new(
                    CredentialKind::Single(CredentialType::X509Cert),
                    Purpose::new(CredentialPurpose::Payload),
                    &config.trust_domain,
                    &config.security_class,
                )
                .with_path(path.clone());
                pilot.load_from_file()?;
                Some(pilot)
            }
            None => None,
        };
        Ok(GroupCredential {
            credential,
            parameters,
            pilot,
        })
    }

    /// The bundle an entry auth method is checked against.
    pub fn bundle(&self) -> crate::Result<SecurityBundle> {
        let mut bundle = SecurityBundle::default();
        bundle.credentials.add(self.credential.clone(), None)?;
        if let Some(pilot) = &self.pilot {
            bundle.credentials.add(pilot.clone(), None)?;
        }
        for parameter in self.parameters.iter() {
            bundle.add_parameter(parameter.clone());
        }
        Ok(bundle)
    }

    pub fn satisfies(&self, trust_domain: &str, auth_method: &AuthenticationMethod) -> bool {
        let own = self.credential.trust_domain();
        if own != ANY_TRUST_DOMAIN && own != trust_domain {
            return false;
        }
        match self.bundle() {
            Ok(bundle) => auth_method.match_bundle(&bundle).is_some(),
            Err(error) => {
                log::debug!("Credential cannot be checked: {error}");
                false
            }
        }
    }
}

/// A credential picked for one entry together with its share of the request.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    /// Position in the group credential list
    pub source: usize,
    pub request: RequestCredential,
    pub project_id: Option<String>,
}

impl SelectedCredential {
    fn new(source: usize, credential: &GroupCredential) -> Self {
        SelectedCredential {
            source,
            request: RequestCredential::new(credential.credential.clone()),
            project_id: None,
        }
    }

    /// Identifier of the credential; project copies get their own.
    pub fn id(&self) -> crate::Result<String> {
        let id = self.request.credential.id()?;
        Ok(match &self.project_id {
            Some(project) => {
                let mut id = sha256_hex(format!("{id}{project}").as_bytes());
                id.truncate(16);
                id
            }
            None => id,
        })
    }
}

/// Glideins the group wants from one entry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub min_nr_glideins: u64,
    pub max_run_glideins: u64,
}

/// Share `i` (1-based) of `n` split into `p` parts.
pub fn fair_split(i: u64, n: u64, p: u64) -> u64 {
    if p == 0 {
        return 0;
    }
    n * i / p - n * (i - 1) / p
}

pub fn random_split(n: u64, p: u64, rng: &mut dyn RngCore) -> Vec<u64> {
    let mut shares: Vec<u64> = (1..=p).map(|i| fair_split(i, n, p)).collect();
    shares.shuffle(rng);
    shares
}

/// Splits a request among credentials; nobody gets more idle than running glideins.
pub fn fair_assign(selected: &mut [SelectedCredential], params: RequestParams, rng: &mut dyn RngCore) {
    let count = selected.len() as u64;
    let idle = random_split(params.min_nr_glideins, count, rng);
    for (index, (credential, idle)) in selected.iter_mut().zip(idle).enumerate() {
        let max_run = fair_split(index as u64 + 1, params.max_run_glideins, count);
        credential
            .request
            .add_usage_details(idle.min(max_run) as u32, max_run as u32);
    }
}

fn job_users(jobs: &[ClassAd]) -> BTreeMap<String, u64> {
    let mut users = BTreeMap::new();
    for job in jobs {
        if let Some(user) = job.get_str(ATTR_USER) {
            *users.entry(user.to_string()).or_insert(0) += 1;
        }
    }
    users
}

/// Chooses the credentials each entry request is made with.
pub trait CredentialPolicy {
    /// Learns the users of this iteration from the idle jobs of the group.
    fn update_usermap(&mut self, idle_jobs: &[ClassAd], credentials: &[GroupCredential])
    -> crate::Result<()>;

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential>;
}

pub fn create_policy(name: PolicyName, work_dir: &Path) -> crate::Result<Box<dyn CredentialPolicy>> {
    let policy: Box<dyn CredentialPolicy> = match name {
        PolicyName::ProxyFirst => Box::new(ProxyFirst),
        PolicyName::ProxyAll => Box::new(ProxyAll),
        PolicyName::ProxyUserCardinality => Box::<ProxyUserCardinality>::default(),
        PolicyName::ProxyUserRR => Box::new(ProxyUserRR::load(work_dir.join(RR_STATE_FILE))?),
        PolicyName::ProxyUserMapWRecycling => Box::new(ProxyUserMapWRecycling::load(
            work_dir.join(USERMAP_STATE_FILE),
        )?),
        PolicyName::ProxyProjectName => Box::<ProxyProjectName>::default(),
    };
    Ok(policy)
}

fn eligible<'a>(
    credentials: &'a [GroupCredential],
    trust_domain: &'a str,
    auth_method: &'a AuthenticationMethod,
) -> impl Iterator<Item = (usize, &'a GroupCredential)> + 'a {
    credentials
        .iter()
        .enumerate()
        .filter(move |(_, credential)| credential.satisfies(trust_domain, auth_method))
}

pub struct ProxyFirst;

impl CredentialPolicy for ProxyFirst {
    fn update_usermap(&mut self, _: &[ClassAd], _: &[GroupCredential]) -> crate::Result<()> {
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        _rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        eligible(credentials, trust_domain, auth_method)
            .next()
            .map(|(index, credential)| {
                let mut selected = SelectedCredential::new(index, credential);
                selected.request.add_usage_details(
                    params.min_nr_glideins as u32,
                    params.max_run_glideins as u32,
                );
                vec![selected]
            })
            .unwrap_or_default()
    }
}

pub struct ProxyAll;

impl CredentialPolicy for ProxyAll {
    fn update_usermap(&mut self, _: &[ClassAd], _: &[GroupCredential]) -> crate::Result<()> {
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        let mut selected: Vec<_> = eligible(credentials, trust_domain, auth_method)
            .map(|(index, credential)| SelectedCredential::new(index, credential))
            .collect();
        fair_assign(&mut selected, params, rng);
        selected
    }
}

/// As many credentials as there are users with idle jobs.
#[derive(Default)]
pub struct ProxyUserCardinality {
    users: usize,
}

impl CredentialPolicy for ProxyUserCardinality {
    fn update_usermap(&mut self, idle_jobs: &[ClassAd], _: &[GroupCredential]) -> crate::Result<()> {
        self.users = job_users(idle_jobs).len();
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        let mut selected: Vec<_> = eligible(credentials, trust_domain, auth_method)
            .take(self.users.max(1))
            .map(|(index, credential)| SelectedCredential::new(index, credential))
            .collect();
        fair_assign(&mut selected, params, rng);
        selected
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoundRobinState {
    /// Credential positions, next to be used first
    order: Vec<usize>,
    users: BTreeSet<String>,
}

/// Rotates the credential list whenever users leave.
pub struct ProxyUserRR {
    path: PathBuf,
    state: RoundRobinState,
}

impl ProxyUserRR {
    fn load(path: PathBuf) -> crate::Result<Self> {
        let state = read_json_or_default(&path)?;
        Ok(ProxyUserRR { path, state })
    }
}

impl CredentialPolicy for ProxyUserRR {
    fn update_usermap(
        &mut self,
        idle_jobs: &[ClassAd],
        credentials: &[GroupCredential],
    ) -> crate::Result<()> {
        let count = credentials.len();
        if self.state.order.len() != count || self.state.order.iter().any(|i| *i >= count) {
            self.state.order = (0..count).collect();
        }
        let users: BTreeSet<String> = job_users(idle_jobs).into_keys().collect();
        let removed = self.state.users.difference(&users).count();
        if removed > 0 && count > 0 {
            self.state.order.rotate_left(removed % count);
            log::debug!("{removed} users left, rotating credentials");
        }
        self.state.users = users;
        write_json_atomic(&self.path, &self.state)?;
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        let mut selected: Vec<_> = self
            .state
            .order
            .iter()
            .filter_map(|index| Some((*index, credentials.get(*index)?)))
            .filter(|(_, credential)| credential.satisfies(trust_domain, auth_method))
            .take(self.state.users.len().max(1))
            .map(|(index, credential)| SelectedCredential::new(index, credential))
            .collect();
        fair_assign(&mut selected, params, rng);
        selected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserMapping {
    credential: usize,
    last_seen: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserMapState {
    users: BTreeMap<String, UserMapping>,
    #[serde(skip)]
    idle: BTreeMap<String, u64>,
}

/// Gives every user its own credential, recycling the least recently seen.
pub struct ProxyUserMapWRecycling {
    path: PathBuf,
    state: UserMapState,
}

impl ProxyUserMapWRecycling {
    fn load(path: PathBuf) -> crate::Result<Self> {
        let state = read_json_or_default(&path)?;
        Ok(ProxyUserMapWRecycling { path, state })
    }

    fn assign(&mut self, user: &str, credentials: usize, now: i64) {
        if let Some(mapping) = self.state.users.get_mut(user) {
            mapping.last_seen = now;
            return;
        }
        let used: BTreeSet<usize> = self.state.users.values().map(|m| m.credential).collect();
        let credential = match (0..credentials).find(|index| !used.contains(index)) {
            Some(free) => free,
            None => {
                let Some((oldest, mapping)) = self
                    .state
                    .users
                    .iter()
                    .min_by_key(|(_, mapping)| mapping.last_seen)
                    .map(|(name, mapping)| (name.clone(), mapping.clone()))
                else {
                    return;
                };
                log::debug!("Recycling credential {} of user {oldest} for {user}", mapping.credential);
                self.state.users.remove(&oldest);
                mapping.credential
            }
        };
        self.state.users.insert(
            user.to_string(),
            UserMapping {
                credential,
                last_seen: now,
            },
        );
    }
}

impl CredentialPolicy for ProxyUserMapWRecycling {
    fn update_usermap(
        &mut self,
        idle_jobs: &[ClassAd],
        credentials: &[GroupCredential],
    ) -> crate::Result<()> {
        let count = credentials.len();
        self.state.users.retain(|_, mapping| mapping.credential < count);
        let now = chrono::Utc::now().timestamp();
        let users = job_users(idle_jobs);
        if count > 0 {
            for user in users.keys() {
                self.assign(user, count, now);
            }
        }
        self.state.idle = users;
        write_json_atomic(&self.path, &self.state)?;
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        _rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        let total_idle: u64 = self.state.idle.values().sum();
        let mut selected = Vec::new();
        for (user, idle) in &self.state.idle {
            let Some(index) = self.state.users.get(user).map(|m| m.credential) else {
                continue;
            };
            let Some(credential) = credentials.get(index) else {
                continue;
            };
            if !credential.satisfies(trust_domain, auth_method) {
                continue;
            }
            let share = |value: u64| (value * idle / total_idle.max(1)).max(1);
            let mut choice = SelectedCredential::new(index, credential);
            choice.request.add_usage_details(
                share(params.min_nr_glideins) as u32,
                share(params.max_run_glideins) as u32,
            );
            selected.push(choice);
        }
        selected
    }
}

/// One copy of the first usable credential per project of the idle jobs.
#[derive(Default)]
pub struct ProxyProjectName {
    projects: BTreeMap<String, u64>,
}

impl CredentialPolicy for ProxyProjectName {
    fn update_usermap(&mut self, idle_jobs: &[ClassAd], _: &[GroupCredential]) -> crate::Result<()> {
        self.projects.clear();
        for job in idle_jobs {
            if let Some(project) = job.get_str(ATTR_PROJECT_NAME) {
                *self.projects.entry(project.to_string()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    fn get_credentials(
        &mut self,
        credentials: &[GroupCredential],
        params: RequestParams,
        trust_domain: &str,
        auth_method: &AuthenticationMethod,
        _rng: &mut dyn RngCore,
    ) -> Vec<SelectedCredential> {
        let Some((index, base)) = eligible(credentials, trust_domain, auth_method).next() else {
            return Vec::new();
        };
        if self.projects.is_empty() {
            let mut selected = SelectedCredential::new(index, base);
            selected
                .request
                .add_usage_details(params.min_nr_glideins as u32, params.max_run_glideins as u32);
            return vec![selected];
        }
        let total: u64 = self.projects.values().sum();
        self.projects
            .iter()
            .map(|(project, jobs)| {
                let share = |value: u64| (jobs * value).div_ceil(total);
                let mut selected = SelectedCredential::new(index, base);
                selected.project_id = Some(project.clone());
                selected.request.add_usage_details(
                    share(params.min_nr_glideins) as u32,
                    share(params.max_run_glideins) as u32,
                );
                selected
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwms_core::crypto::JwtClaims;
    use gwms_core::crypto::jwt::issue_hs256;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn token(sub: &str, trust_domain: &str) -> GroupCredential {
        let now = chrono::Utc::now().timestamp();
        let data = issue_hs256(
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
        GroupCredential {
            credential: Credential::from_bytes(
                CredentialType::SciToken,
                data.as_bytes(),
                Purpose::new(CredentialPurpose::Request),
                trust_domain,
                "frontend",
            )
            .unwrap(),
            parameters: ParameterDict::default(),
            pilot: None,
        }
    }

    fn idle_job(user: &str, project: Option<&str>) -> ClassAd {
        let mut job = ClassAd::default();
        job.insert(ATTR_USER, user);
        if let Some(project) = project {
            job.insert(ATTR_PROJECT_NAME, project);
        }
        job
    }

    fn method() -> AuthenticationMethod {
        AuthenticationMethod::parse("scitoken").unwrap()
    }

    fn params(idle: u64, max_run: u64) -> RequestParams {
        RequestParams {
            min_nr_glideins: idle,
            max_run_glideins: max_run,
        }
    }

    fn shares(selected: &[SelectedCredential]) -> Vec<(usize, u32, u32)> {
        selected
            .iter()
            .map(|s| (s.source, s.request.req_idle, s.request.req_max_run))
            .collect()
    }

    #[test]
    fn fair_split_sums_up() {
        for n in 0..40 {
            for p in 1..7 {
                let total: u64 = (1..=p).map(|i| fair_split(i, n, p)).sum();
                assert_eq!(total, n);
                let mut rng = StdRng::seed_from_u64(n);
                assert_eq!(random_split(n, p, &mut rng).iter().sum::<u64>(), n);
            }
        }
        assert_eq!(fair_split(1, 10, 0), 0);
    }

    #[test]
    fn first_and_all() {
        let credentials = vec![token("a", "OSG"), token("b", "Grid"), token("c", "Grid")];
        let mut rng = StdRng::seed_from_u64(1);
        let selected =
            ProxyFirst.get_credentials(&credentials, params(7, 20), "Grid", &method(), &mut rng);
        assert_eq!(shares(&selected), vec![(1, 7, 20)]);

        let selected =
            ProxyAll.get_credentials(&credentials, params(7, 2), "Grid", &method(), &mut rng);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|s| s.request.req_idle <= s.request.req_max_run));
        assert_eq!(selected.iter().map(|s| s.request.req_max_run).sum::<u32>(), 2);

        let grid_proxy = AuthenticationMethod::parse("grid_proxy").unwrap();
        assert!(
            ProxyFirst
                .get_credentials(&credentials, params(7, 20), "Grid", &grid_proxy, &mut rng)
                .is_empty()
        );
    }

    #[test]
    fn any_trust_domain_matches_every_entry() {
        let credentials = vec![token("a", ANY_TRUST_DOMAIN)];
        let mut rng = StdRng::seed_from_u64(1);
        for entry_domain in ["Grid", "OSG"] {
            let selected = ProxyFirst.get_credentials(
                &credentials,
                params(3, 5),
                entry_domain,
                &method(),
                &mut rng,
            );
            assert_eq!(shares(&selected), vec![(0, 3, 5)]);
        }
        assert!(!token("b", "OSG").satisfies("Grid", &method()));
    }

    #[test]
    fn cardinality_follows_users() {
        let credentials = vec![token("a", "Grid"), token("b", "Grid"), token("c", "Grid")];
        let mut rng = StdRng::seed_from_u64(1);
        let mut policy = ProxyUserCardinality::default();
        policy
            .update_usermap(&[idle_job("u1", None), idle_job("u2", None), idle_job("u1", None)], &credentials)
            .unwrap();
        let selected = policy.get_credentials(&credentials, params(10, 10), "Grid", &method(), &mut rng);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected.iter().map(|s| s.request.req_idle).sum::<u32>(), 10);
    }

    #[test]
    fn round_robin_rotates_and_persists() {
        let dir = tempfile::TempDir::with_prefix("gwms").unwrap();
        let credentials = vec![token("a", "Grid"), token("b", "Grid"), token("c", "Grid")];
        let mut rng = StdRng::seed_from_u64(1);
        let mut policy = create_policy(PolicyName::ProxyUserRR, dir.path()).unwrap();
        policy
            .update_usermap(&[idle_job("u1", None), idle_job("u2", None)], &credentials)
            .unwrap();
        let first: Vec<usize> = policy
            .get_credentials(&credentials, params(4, 4), "Grid", &method(), &mut rng)
            .iter()
            .map(|s| s.source)
            .collect();
        assert_eq!(first, vec![0, 1]);

        let mut policy = create_policy(PolicyName::ProxyUserRR, dir.path()).unwrap();
        policy
            .update_usermap(&[idle_job("u2", None)], &credentials)
            .unwrap();
        let second: Vec<usize> = policy
            .get_credentials(&credentials, params(4, 4), "Grid", &method(), &mut rng)
            .iter()
            .map(|s| s.source)
            .collect();
        assert_eq!(second, vec![1]);
        assert!(dir.path().join(RR_STATE_FILE).is_file());
    }

    #[test]
    fn usermap_recycles_oldest_user() {
        let dir = tempfile::TempDir::with_prefix("gwms").unwrap();
        let credentials = vec![token("a", "Grid"), token("b", "Grid")];
        let mut rng = StdRng::seed_from_u64(1);
        let mut policy = ProxyUserMapWRecycling::load(dir.path().join(USERMAP_STATE_FILE)).unwrap();
        policy.state.users.insert(
            "old".to_string(),
            UserMapping {
                credential: 0,
                last_seen: 10,
            },
        );
        policy.state.users.insert(
            "recent".to_string(),
            UserMapping {
                credential: 1,
                last_seen: i64::MAX,
            },
        );
        let jobs = vec![idle_job("new", None), idle_job("new", None), idle_job("new", None), idle_job("recent", None)];
        policy.update_usermap(&jobs, &credentials).unwrap();
        assert_eq!(policy.state.users["new"].credential, 0);
        assert!(!policy.state.users.contains_key("old"));

        let selected = policy.get_credentials(&credentials, params(8, 12), "Grid", &method(), &mut rng);
        assert_eq!(shares(&selected), vec![(0, 6, 9), (1, 2, 3)]);

        let reloaded = ProxyUserMapWRecycling::load(dir.path().join(USERMAP_STATE_FILE)).unwrap();
        assert_eq!(reloaded.state.users.len(), 2);
    }

    #[test]
    fn project_copies() {
        let credentials = vec![token("a", "Grid")];
        let mut rng = StdRng::seed_from_u64(1);
        let mut policy = ProxyProjectName::default();
        let jobs = vec![
            idle_job("u", Some("p1")),
            idle_job("u", Some("p1")),
            idle_job("u", Some("p2")),
        ];
        policy.update_usermap(&jobs, &credentials).unwrap();
        let selected = policy.get_credentials(&credentials, params(10, 10), "Grid", &method(), &mut rng);
        assert_eq!(shares(&selected), vec![(0, 7, 7), (0, 4, 4)]);
        let ids: BTreeSet<String> = selected.iter().map(|s| s.id().unwrap()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&credentials[0].credential.id().unwrap()));
    }
}
