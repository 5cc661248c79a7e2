pub mod auth;
pub mod generators;
pub mod parameters;
pub mod store;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::command::run_command;
use crate::common::error::CoreError;
use crate::crypto::{
    Certificate, JwtClaims, RsaKey, RsaPublicKey, SymmetricKey, jwt, sha256_hex,
};

pub use auth::{AuthRequirement, AuthenticationMethod, AuthenticationSet, SecurityBundle, SubmitBundle};
pub use generators::{CredentialGenerator, GeneratorRegistry};
pub use parameters::{Parameter, ParameterDict, ParameterName, ParameterType};
pub use store::{SaveOptions, compress_credential};

/// Length of a credential identifier (hex characters).
const CREDENTIAL_ID_LEN: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialType {
    Token,
    SciToken,
    IdToken,
    X509Cert,
    RsaPublicKey,
    RsaPrivateKey,
    SymmetricKey,
    Dynamic,
    Text,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Token => "token",
            CredentialType::SciToken => "scitoken",
            CredentialType::IdToken => "idtoken",
            CredentialType::X509Cert => "x509_cert",
            CredentialType::RsaPublicKey => "rsa_public_key",
            CredentialType::RsaPrivateKey => "rsa_private_key",
            CredentialType::SymmetricKey => "symmetric_key",
            CredentialType::Dynamic => "dynamic",
            CredentialType::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CredentialType::Token => "jwt",
            CredentialType::SciToken => "scitoken",
            CredentialType::IdToken => "idtoken",
            CredentialType::X509Cert => "pem",
            CredentialType::RsaPublicKey | CredentialType::RsaPrivateKey => "rsa",
            CredentialType::SymmetricKey => "key",
            CredentialType::Dynamic | CredentialType::Text => "txt",
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(
            self,
            CredentialType::Token | CredentialType::SciToken | CredentialType::IdToken
        )
    }
}

impl FromStr for CredentialType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "token" => CredentialType::Token,
            "scitoken" => CredentialType::SciToken,
            "idtoken" => CredentialType::IdToken,
            "x509_cert" | "grid_proxy" => CredentialType::X509Cert,
            "rsa_public_key" | "rsa_key" => CredentialType::RsaPublicKey,
            "rsa_private_key" => CredentialType::RsaPrivateKey,
            "symmetric_key" => CredentialType::SymmetricKey,
            "dynamic" | "generator" => CredentialType::Dynamic,
            "text" | "auth_file" => CredentialType::Text,
            _ => return Err(CoreError::credential(format!("Unknown credential type: {s}"))),
        })
    }
}

impl Display for CredentialType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialPairType {
    X509Pair,
    KeyPair,
    UsernamePassword,
}

impl CredentialPairType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialPairType::X509Pair => "x509_pair",
            CredentialPairType::KeyPair => "key_pair",
            CredentialPairType::UsernamePassword => "username_password",
        }
    }

    pub fn public_type(&self) -> CredentialType {
        match self {
            CredentialPairType::X509Pair => CredentialType::X509Cert,
            CredentialPairType::KeyPair => CredentialType::RsaPublicKey,
            CredentialPairType::UsernamePassword => CredentialType::Text,
        }
    }

    pub fn private_type(&self) -> CredentialType {
        match self {
            CredentialPairType::X509Pair => CredentialType::Text,
            CredentialPairType::KeyPair => CredentialType::RsaPrivateKey,
            CredentialPairType::UsernamePassword => CredentialType::Text,
        }
    }
}

impl FromStr for CredentialPairType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "x509_pair" | "cert_pair" => CredentialPairType::X509Pair,
            "key_pair" => CredentialPairType::KeyPair,
            "username_password" => CredentialPairType::UsernamePassword,
            _ => return Err(CoreError::credential(format!("Unknown credential type: {s}"))),
        })
    }
}

/// Either a single credential type or a pair type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialKind {
    Single(CredentialType),
    Pair(CredentialPairType),
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Single(t) => t.as_str(),
            CredentialKind::Pair(t) => t.as_str(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CredentialKind::Single(t) => t.extension(),
            CredentialKind::Pair(t) => t.public_type().extension(),
        }
    }

    /// Type of the (public) data held by the credential itself.
    pub fn data_type(&self) -> CredentialType {
        match self {
            CredentialKind::Single(t) => *t,
            CredentialKind::Pair(t) => t.public_type(),
        }
    }
}

impl FromStr for CredentialKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<CredentialType>()
            .map(CredentialKind::Single)
            .or_else(|_| s.parse::<CredentialPairType>().map(CredentialKind::Pair))
    }
}

impl Display for CredentialKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialPurpose {
    Request,
    Callback,
    Payload,
}

impl CredentialPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialPurpose::Request => "request",
            CredentialPurpose::Callback => "callback",
            CredentialPurpose::Payload => "payload",
        }
    }
}

/// Purpose together with the name it was configured under; unknown names become payload
/// credentials that keep their name for file naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Purpose {
    pub purpose: CredentialPurpose,
    alias: Option<String>,
}

impl Purpose {
    pub fn new(purpose: CredentialPurpose) -> Self {
        Purpose {
            purpose,
            alias: None,
        }
    }

    pub fn parse(value: &str) -> Self {
        let purpose = match value.to_ascii_lowercase().as_str() {
            "request" => CredentialPurpose::Request,
            "callback" => CredentialPurpose::Callback,
            "payload" => CredentialPurpose::Payload,
            _ => {
                return Purpose {
                    purpose: CredentialPurpose::Payload,
                    alias: Some(value.to_string()),
                };
            }
        };
        Purpose::new(purpose)
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.purpose.as_str())
    }
}

/// Typed secret. Pairs carry their second half in `private`.
#[derive(Debug, Clone)]
pub struct Credential {
    kind: CredentialKind,
    data: Option<Vec<u8>>,
    path: Option<PathBuf>,
    purpose: Purpose,
    trust_domain: String,
    security_class: String,
    creation_script: Option<String>,
    minimum_lifetime: Option<Duration>,
    context: BTreeMap<String, String>,
    private: Option<Box<Credential>>,
}

impl Credential {
    pub fn new(kind: CredentialKind, purpose: Purpose, trust_domain: &str, security_class: &str) -> Self {
        let private = match kind {
            CredentialKind::Pair(pair) => Some(Box::new(Credential::new(
                CredentialKind::Single(pair.private_type()),
                purpose.clone(),
                trust_domain,
                security_class,
            ))),
            CredentialKind::Single(_) => None,
        };
        Credential {
            kind,
            data: None,
            path: None,
            purpose,
            trust_domain: trust_domain.to_string(),
            security_class: security_class.to_string(),
            creation_script: None,
            minimum_lifetime: None,
            context: Default::default(),
            private,
        }
    }

    /// Credential of a single type loaded from `data`.
    pub fn from_bytes(
        kind: CredentialType,
        data: &[u8],
        purpose: Purpose,
        trust_domain: &str,
        security_class: &str,
    ) -> crate::Result<Self> {
        let mut credential = Credential::new(
            CredentialKind::Single(kind),
            purpose,
            trust_domain,
            security_class,
        );
        credential.load_from_bytes(data)?;
        Ok(credential)
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_private_path(mut self, path: PathBuf) -> Self {
        if let Some(private) = self.private.as_mut() {
            private.path = Some(path);
        }
        self
    }

    pub fn with_private_data(mut self, data: &[u8]) -> crate::Result<Self> {
        match self.private.as_mut() {
            Some(private) => private.load_from_bytes(data)?,
            None => return Err(CoreError::credential("Credential is not a pair")),
        }
        Ok(self)
    }

    pub fn with_creation_script(mut self, script: Option<String>) -> Self {
        if let Some(private) = self.private.as_mut() {
            private.creation_script = script.clone();
        }
        self.creation_script = script;
        self
    }

    pub fn with_minimum_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.minimum_lifetime = lifetime;
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn data_type(&self) -> CredentialType {
        self.kind.data_type()
    }

    pub fn extension(&self) -> &'static str {
        self.kind.extension()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn text(&self) -> crate::Result<String> {
        let data = self.require_data()?;
        String::from_utf8(data.to_vec())
            .map_err(|_| CoreError::credential("Credential data is not UTF-8"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn purpose(&self) -> &Purpose {
        &self.purpose
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn security_class(&self) -> &str {
        &self.security_class
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn private(&self) -> Option<&Credential> {
        self.private.as_deref()
    }

    pub fn creation_script(&self) -> Option<&str> {
        self.creation_script.as_deref()
    }

    fn require_data(&self) -> crate::Result<&[u8]> {
        self.data
            .as_deref()
            .ok_or_else(|| CoreError::credential("Credential not initialized"))
    }

    /// Checks that `data` decodes as this credential's type and stores it.
    pub fn load_from_bytes(&mut self, data: &[u8]) -> crate::Result<()> {
        decode_check(self.data_type(), data)?;
        self.data = Some(data.to_vec());
        Ok(())
    }

    pub fn load_from_file(&mut self) -> crate::Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| CoreError::credential("Credential path not set"))?;
        let data = std::fs::read(&path).map_err(|e| {
            CoreError::credential(format!("Credential file {} cannot be read: {e}", path.display()))
        })?;
        self.load_from_bytes(&data)
    }

    /// Loads both halves from their paths when the files exist.
    pub fn load_if_present(&mut self) -> crate::Result<()> {
        if self.data_type() == CredentialType::Dynamic {
            // The descriptor is the generator name kept in the path
            if self.data.is_none() {
                if let Some(name) = self.path.as_ref().map(|p| p.display().to_string()) {
                    self.data = Some(name.into_bytes());
                }
            }
            return Ok(());
        }
        if self.path.as_ref().is_some_and(|p| p.is_file()) {
            self.load_from_file()?;
        }
        if let Some(private) = self.private.as_mut() {
            private.load_if_present()?;
        }
        Ok(())
    }

    pub fn token_claims(&self) -> crate::Result<JwtClaims> {
        if !self.data_type().is_token() {
            return Err(CoreError::credential("Credential is not a token"));
        }
        jwt::decode_unverified(&self.text()?)
    }

    pub fn certificate(&self) -> crate::Result<Certificate> {
        Certificate::from_pem(self.require_data()?)
    }

    pub fn rsa_public_key(&self) -> crate::Result<RsaPublicKey> {
        RsaPublicKey::from_pem(&self.text()?)
    }

    pub fn rsa_key(&self) -> crate::Result<RsaKey> {
        RsaKey::from_pem(self.require_data()?)
    }

    pub fn symmetric_key(&self) -> crate::Result<SymmetricKey> {
        SymmetricKey::parse(&self.text()?)
    }

    /// Attribute that identifies the credential independently of where it is stored.
    pub fn id_attribute(&self) -> crate::Result<String> {
        Ok(match self.data_type() {
            CredentialType::Token | CredentialType::SciToken | CredentialType::IdToken => {
                self.token_claims()?.sub.unwrap_or_default()
            }
            CredentialType::X509Cert => self.certificate()?.subject,
            CredentialType::Dynamic => {
                let context = self
                    .context
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{}{context}", self.text()?)
            }
            CredentialType::RsaPublicKey
            | CredentialType::RsaPrivateKey
            | CredentialType::SymmetricKey
            | CredentialType::Text => String::from_utf8_lossy(self.require_data()?).into_owned(),
        })
    }

    /// Stable identifier derived from the identifying attribute, purpose, trust domain,
    /// security class and kind.
    pub fn id(&self) -> crate::Result<String> {
        let mut id = sha256_hex(
            format!(
                "{}{}{}{}{}",
                self.id_attribute()?,
                self.purpose.purpose.as_str(),
                self.trust_domain,
                self.security_class,
                self.kind
            )
            .as_bytes(),
        );
        id.truncate(CREDENTIAL_ID_LEN);
        Ok(id)
    }

    pub fn invalid_reason(&self) -> Option<String> {
        self.invalid_reason_at(Utc::now())
    }

    pub fn invalid_reason_at(&self, now: DateTime<Utc>) -> Option<String> {
        let reason = single_invalid_reason(self, now);
        if reason.is_some() {
            return reason;
        }
        self.private.as_ref().and_then(|p| p.invalid_reason_at(now))
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_reason().is_none()
    }

    /// Runs the creation script when the credential is not valid and reloads it.
    pub async fn renew(&mut self, timeout: Duration) -> crate::Result<()> {
        self.renew_single(timeout).await?;
        if let Some(private) = self.private.as_mut() {
            private.renew_single(timeout).await?;
        }
        Ok(())
    }

    async fn renew_single(&mut self, timeout: Duration) -> crate::Result<()> {
        let Some(script) = self.creation_script.clone() else {
            return Ok(());
        };
        if single_invalid_reason(self, Utc::now()).is_none() {
            return Ok(());
        }
        log::debug!("Renewing credential with `{script}`");
        run_command(&["/bin/sh", "-c", &script], None, timeout)
            .await
            .map_err(|e| {
                CoreError::credential(format!("Error renewing or creating credential: {e:?}"))
            })?;
        self.load_from_file()
    }

    /// Replaces a dynamic credential by the credential its generator produces.
    pub async fn resolve(&self, registry: &GeneratorRegistry) -> crate::Result<Credential> {
        if self.data_type() != CredentialType::Dynamic {
            return Ok(self.clone());
        }
        let name = self.text()?;
        let generator = registry.get(&name)?;
        let generated = generator
            .generate(self.context.clone())
            .await
            .map_err(|e| CoreError::credential(format!("Generator {name} failed: {e:?}")))?;
        let mut credential = Credential::from_bytes(
            generated.kind,
            &generated.data,
            self.purpose.clone(),
            &self.trust_domain,
            &self.security_class,
        )?;
        credential.path = self.path.clone();
        credential.minimum_lifetime = self.minimum_lifetime;
        Ok(credential)
    }
}

fn decode_check(kind: CredentialType, data: &[u8]) -> crate::Result<()> {
    let text = || {
        std::str::from_utf8(data).map_err(|_| CoreError::credential("Credential data is not UTF-8"))
    };
    match kind {
        CredentialType::Token | CredentialType::SciToken | CredentialType::IdToken => {
            jwt::decode_unverified(text()?)?;
        }
        CredentialType::X509Cert => {
            Certificate::from_pem(data)?;
        }
        CredentialType::RsaPublicKey => {
            RsaPublicKey::from_pem(text()?)?;
        }
        CredentialType::RsaPrivateKey => {
            RsaKey::from_pem(data)?;
        }
        CredentialType::SymmetricKey => {
            SymmetricKey::parse(text()?)?;
        }
        CredentialType::Dynamic | CredentialType::Text => {}
    }
    Ok(())
}

fn lifetime_too_short(credential: &Credential, expires: i64, now: i64) -> bool {
    credential
        .minimum_lifetime
        .is_some_and(|min| expires - now < min.as_secs() as i64)
}

fn single_invalid_reason(credential: &Credential, now: DateTime<Utc>) -> Option<String> {
    let now_ts = now.timestamp();
    let reason = match credential.data_type() {
        CredentialType::Token | CredentialType::SciToken | CredentialType::IdToken => {
            let Ok(claims) = credential.token_claims() else {
                return Some("Token not initialized.".to_string());
            };
            if claims.nbf.is_some_and(|nbf| now_ts < nbf) {
                "Token not yet valid."
            } else if claims.exp.is_some_and(|exp| now_ts > exp) {
                "Token expired."
            } else if claims
                .exp
                .is_some_and(|exp| lifetime_too_short(credential, exp, now_ts))
            {
                "Token lifetime too short."
            } else {
                return None;
            }
        }
        CredentialType::X509Cert => {
            let Ok(cert) = credential.certificate() else {
                return Some("Certificate not initialized.".to_string());
            };
            if now < cert.not_before {
                "Certificate not yet valid."
            } else if now > cert.not_after {
                "Certificate expired."
            } else if lifetime_too_short(credential, cert.not_after.timestamp(), now_ts) {
                "Certificate lifetime too short."
            } else {
                return None;
            }
        }
        CredentialType::RsaPublicKey => match credential.rsa_public_key() {
            Ok(_) => return None,
            Err(_) => "RSA key not initialized.",
        },
        CredentialType::RsaPrivateKey => match credential.rsa_key() {
            Ok(_) => return None,
            Err(_) => "RSA key not initialized.",
        },
        CredentialType::SymmetricKey => match credential.symmetric_key() {
            Ok(_) => return None,
            Err(_) => "Symmetric key not initialized.",
        },
        CredentialType::Dynamic => match credential.data {
            Some(_) => return None,
            None => "Generator not initialized.",
        },
        CredentialType::Text => match credential.data {
            Some(_) => return None,
            None => "Text credential not initialized.",
        },
    };
    Some(reason.to_string())
}

/// Credentials indexed by their identifier.
#[derive(Debug, Clone, Default)]
pub struct CredentialDict {
    credentials: BTreeMap<String, Credential>,
}

impl CredentialDict {
    /// Adds a credential under `id` or under its own identifier; returns the key used.
    pub fn add(&mut self, credential: Credential, id: Option<String>) -> crate::Result<String> {
        let id = match id {
            Some(id) => id,
            None => credential.id()?,
        };
        self.credentials.insert(id.clone(), credential);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.credentials.get(id)
    }

    pub fn find(
        &self,
        kind: Option<CredentialKind>,
        purpose: Option<CredentialPurpose>,
    ) -> Vec<(&String, &Credential)> {
        self.credentials
            .iter()
            .filter(|(_, c)| kind.is_none_or(|k| c.kind == k))
            .filter(|(_, c)| purpose.is_none_or(|p| c.purpose.purpose == p))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Credential)> {
        self.credentials.iter()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// A credential selected for one request together with the request share it carries.
#[derive(Debug, Clone)]
pub struct RequestCredential {
    pub credential: Credential,
    pub advertise: bool,
    pub req_idle: u32,
    pub req_max_run: u32,
}

impl RequestCredential {
    pub fn new(credential: Credential) -> Self {
        RequestCredential {
            credential,
            advertise: true,
            req_idle: 0,
            req_max_run: 0,
        }
    }

    pub fn add_usage_details(&mut self, req_idle: u32, req_max_run: u32) {
        self.req_idle = req_idle;
        self.req_max_run = req_max_run;
    }

    pub fn usage_details(&self) -> (u32, u32) {
        (self.req_idle, self.req_max_run)
    }
}

/// Names of the request attributes carrying a credential (and its private half).
pub fn payload_slots(credential: &Credential) -> (&'static str, Option<&'static str>) {
    match credential.kind() {
        CredentialKind::Pair(CredentialPairType::X509Pair) => ("PublicCert", Some("PrivateCert")),
        CredentialKind::Pair(CredentialPairType::KeyPair) => ("PublicKey", Some("PrivateKey")),
        CredentialKind::Pair(CredentialPairType::UsernamePassword) => {
            ("Username", Some("Password"))
        }
        CredentialKind::Single(CredentialType::X509Cert) => {
            if credential.purpose().purpose == CredentialPurpose::Request {
                ("SubmitProxy", None)
            } else {
                ("GlideinProxy", None)
            }
        }
        CredentialKind::Single(CredentialType::SciToken) => ("frontend_scitoken", None),
        CredentialKind::Single(CredentialType::IdToken) => ("frontend_condortoken", None),
        CredentialKind::Single(CredentialType::Text) => ("AuthFile", None),
        CredentialKind::Single(CredentialType::RsaPublicKey) => ("PublicKey", None),
        CredentialKind::Single(_) => ("AuthFile", None),
    }
}
