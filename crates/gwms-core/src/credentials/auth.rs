use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use crate::common::error::CoreError;
use crate::credentials::{
    CredentialDict, CredentialKind, CredentialPairType, CredentialType, Parameter, ParameterDict,
    ParameterName,
};

/// One item an entry may require from a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthRequirement {
    Credential(CredentialType),
    Pair(CredentialPairType),
    Parameter(ParameterName),
}

impl FromStr for AuthRequirement {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(kind) = s.parse::<CredentialType>() {
            return Ok(AuthRequirement::Credential(kind));
        }
        if let Ok(kind) = s.parse::<CredentialPairType>() {
            return Ok(AuthRequirement::Pair(kind));
        }
        if let Ok(name) = s.parse::<ParameterName>() {
            return Ok(AuthRequirement::Parameter(name));
        }
        Err(CoreError::configuration(format!(
            "Unknown authentication requirement: {s}"
        )))
    }
}

impl Display for AuthRequirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthRequirement::Credential(kind) => write!(f, "{kind}"),
            AuthRequirement::Pair(kind) => f.write_str(kind.as_str()),
            AuthRequirement::Parameter(name) => write!(f, "{name}"),
        }
    }
}

/// Parsed auth-method expression: every group must be satisfied by one of its alternatives.
///
/// Groups are separated by `;` (the `+` of entry descriptors is accepted as well) and the
/// alternatives inside a group by `,`. A group written as `Any` is empty and always satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationMethod {
    groups: Vec<Vec<AuthRequirement>>,
}

impl AuthenticationMethod {
    pub fn parse(expression: &str) -> crate::Result<Self> {
        let mut groups = Vec::new();
        for group in expression.split([';', '+']) {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            if group.eq_ignore_ascii_case("any") {
                groups.push(Vec::new());
                continue;
            }
            let alternatives = group
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| item.parse::<AuthRequirement>())
                .collect::<crate::Result<Vec<_>>>()?;
            groups.push(alternatives);
        }
        Ok(AuthenticationMethod { groups })
    }

    pub fn groups(&self) -> &[Vec<AuthRequirement>] {
        &self.groups
    }

    /// Picks the first satisfied alternative of every group; `None` when a group fails.
    pub fn match_bundle(&self, bundle: &SecurityBundle) -> Option<AuthenticationSet> {
        let mut items = BTreeSet::new();
        for group in &self.groups {
            if group.is_empty() {
                continue;
            }
            let picked = group.iter().find(|item| bundle.satisfies(**item))?;
            items.insert(*picked);
        }
        Some(AuthenticationSet { items })
    }

    /// True if `requirement` appears in any group.
    pub fn mentions(&self, requirement: AuthRequirement) -> bool {
        self.groups.iter().flatten().any(|item| *item == requirement)
    }
}

impl FromStr for AuthenticationMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuthenticationMethod::parse(s)
    }
}

impl Display for AuthenticationMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let groups = self
            .groups
            .iter()
            .map(|group| {
                if group.is_empty() {
                    "Any".to_string()
                } else {
                    group
                        .iter()
                        .map(|item| item.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                }
            })
            .collect::<Vec<_>>();
        f.write_str(&groups.join(";"))
    }
}

/// The requirements picked when an auth method matched a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationSet {
    items: BTreeSet<AuthRequirement>,
}

impl AuthenticationSet {
    pub fn contains(&self, requirement: AuthRequirement) -> bool {
        self.items.contains(&requirement)
    }

    /// True if a credential of `kind` is one of the picked items.
    pub fn supports(&self, kind: CredentialKind) -> bool {
        match kind {
            CredentialKind::Single(kind) => self.contains(AuthRequirement::Credential(kind)),
            CredentialKind::Pair(kind) => self.contains(AuthRequirement::Pair(kind)),
        }
    }

    pub fn satisfied_by(&self, bundle: &SecurityBundle) -> bool {
        self.items.iter().all(|item| bundle.satisfies(*item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthRequirement> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Credentials and parameters available to satisfy an auth method.
#[derive(Debug, Clone, Default)]
pub struct SecurityBundle {
    pub credentials: CredentialDict,
    pub parameters: ParameterDict,
}

impl SecurityBundle {
    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.add(parameter);
    }

    /// Only valid credentials count.
    pub fn satisfies(&self, requirement: AuthRequirement) -> bool {
        match requirement {
            AuthRequirement::Credential(kind) => self
                .credentials
                .find(Some(CredentialKind::Single(kind)), None)
                .iter()
                .any(|(_, credential)| credential.is_valid()),
            AuthRequirement::Pair(kind) => self
                .credentials
                .find(Some(CredentialKind::Pair(kind)), None)
                .iter()
                .any(|(_, credential)| credential.is_valid()),
            AuthRequirement::Parameter(name) => self.parameters.contains(name),
        }
    }
}

/// Everything the factory hands the batch system for one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitBundle {
    pub username: String,
    pub security_class: String,
    /// Credential identifier the glideins are tagged with
    pub id: String,
    pub cred_dir: PathBuf,
    pub auth_set: AuthenticationSet,
    /// Payload slot name -> materialized credential file
    pub security_credentials: BTreeMap<String, PathBuf>,
    /// Identity values (`VMId`, `ScitokenId`, ...) forwarded to the glideins
    pub identity_credentials: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

impl SubmitBundle {
    pub fn new(username: &str, security_class: &str, id: &str, cred_dir: PathBuf) -> Self {
        SubmitBundle {
            username: username.to_string(),
            security_class: security_class.to_string(),
            id: id.to_string(),
            cred_dir,
            ..Default::default()
        }
    }

    pub fn add_security_credential(&mut self, slot: &str, path: PathBuf) {
        self.security_credentials.insert(slot.to_string(), path);
    }

    pub fn add_identity_credential(&mut self, name: &str, value: &str) {
        self.identity_credentials
            .insert(name.to_string(), value.to_string());
    }

    pub fn credential_files(&self) -> Vec<PathBuf> {
        self.security_credentials.values().cloned().collect()
    }

    /// Environment passed to the submission: credential paths and identity values.
    pub fn environment(&self) -> Vec<(String, String)> {
        let credentials = self
            .security_credentials
            .iter()
            .map(|(slot, path)| (format!("GLIDEIN_{slot}"), path.display().to_string()));
        let identities = self
            .identity_credentials
            .iter()
            .map(|(name, value)| (format!("GLIDEIN_{name}"), value.clone()));
        credentials.chain(identities).collect()
    }
}
