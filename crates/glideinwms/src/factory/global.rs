use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use gwms_core::adbus::{AdBus, Constraint};
use gwms_core::classad::{ATTR_AUTHENTICATED_IDENTITY, AdType, ClassAd, ENC_PARAM_PREFIX};
use gwms_core::common::error::CoreError;
use gwms_core::common::fsutils::{PRIVATE_FILE_MODE, atomic_write};
use gwms_core::crypto::{RsaKey, SymmetricKey};

use crate::factory::ads::glidefactoryglobal_ad;
use crate::factory::config::FactoryConfig;
use crate::frontend::ads::{
    ATTR_CLIENT_NAME, ATTR_REQ_GLIDEIN, ATTR_REQ_NAME, ENC_NUMBER_OF_CREDENTIALS,
    ENC_SECURITY_CLASS, ENC_SECURITY_NAME,
};
use crate::frontend::keys::{ATTR_ENC_IDENTITY, ATTR_ENC_KEY_CODE, ATTR_PUB_KEY_ID};
use crate::frontend::sources::bounded;

/// Reads the factory private key, generating and saving a new one when it does not exist yet.
pub fn load_or_create_key(path: &Path, bits: u32) -> crate::Result<RsaKey> {
    match std::fs::read(path) {
        Ok(pem) => Ok(RsaKey::from_pem(&pem)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            log::info!("Generating a {bits} bit factory key in {}", path.display());
            let key = RsaKey::generate(bits)?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            atomic_write(path, &key.private_pem()?, PRIVATE_FILE_MODE, false)?;
            Ok(key)
        }
        Err(error) => Err(error.into()),
    }
}

/// Publishes the key ad of the factory.
pub async fn advertise_global(
    bus: &dyn AdBus,
    config: &FactoryConfig,
    key: &RsaKey,
    sequence: &mut gwms_core::classad::SequenceCounter,
    timeout: Duration,
) -> crate::Result<()> {
    let mut ad = glidefactoryglobal_ad(config, key.public_key());
    sequence.stamp(&mut ad);
    bounded(timeout, "Factory global advertisement", bus.publish(vec![ad])).await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCredential {
    pub data: Vec<u8>,
    pub security_class: String,
}

/// Credentials one client shares with every entry of the factory.
#[derive(Debug, Clone)]
pub struct ClientGlobal {
    pub client: String,
    pub identity: String,
    pub security_name: String,
    pub credentials: BTreeMap<String, ReceivedCredential>,
}

/// One decrypted `glideclient` request.
#[derive(Debug, Clone)]
pub struct ClientRequestAd {
    pub client: String,
    /// `<entry>@<glidein>@<factory>`
    pub request_name: String,
    pub identity: String,
    /// Fabric attributes stripped
    pub ad: ClassAd,
    /// Decrypted `GlideinEncParam*` values
    pub secrets: BTreeMap<String, String>,
}

impl ClientRequestAd {
    pub fn entry_name(&self) -> &str {
        self.request_name
            .split_once('@')
            .map(|(entry, _)| entry)
            .unwrap_or(&self.request_name)
    }
}

/// Decrypted requests addressed to this factory.
#[derive(Debug, Clone, Default)]
pub struct FactoryWork {
    pub globals: BTreeMap<String, ClientGlobal>,
    /// Entry name -> its requests
    pub requests: BTreeMap<String, Vec<ClientRequestAd>>,
}

impl FactoryWork {
    pub fn for_entry(&self, entry: &str) -> &[ClientRequestAd] {
        self.requests.get(entry).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Unwraps the session key of an ad and checks that it was encrypted for the publisher.
fn session_key(key: &RsaKey, ad: &ClassAd) -> Result<(SymmetricKey, String), CoreError> {
    let key_id = key.public_key().key_id();
    match ad.get_str(ATTR_PUB_KEY_ID) {
        Some(id) if id == key_id => {}
        Some(id) => {
            return Err(CoreError::credential(format!(
                "Encrypted for key {id}, current key is {key_id}"
            )));
        }
        None => return Err(CoreError::credential("Missing public key id")),
    }
    let code = ad
        .get_str(ATTR_ENC_KEY_CODE)
        .ok_or_else(|| CoreError::credential("Missing session key"))?;
    let code = key.decrypt_hex(code)?;
    let code = String::from_utf8(code)
        .map_err(|_| CoreError::credential("Session key is not text"))?;
    let session = SymmetricKey::parse(&code)?;

    let identity = ad
        .get_str(ATTR_AUTHENTICATED_IDENTITY)
        .ok_or_else(|| CoreError::credential("Ad was not authenticated"))?;
    let claimed = ad
        .get_str(ATTR_ENC_IDENTITY)
        .ok_or_else(|| CoreError::credential("Missing encrypted identity"))?;
    let claimed = session.decrypt_hex_str(claimed)?;
    if claimed != identity {
        return Err(CoreError::credential(format!(
            "Encrypted identity {claimed} does not match authenticated identity {identity}"
        )));
    }
    Ok((session, identity.to_string()))
}

fn client_name(ad: &ClassAd) -> Result<String, CoreError> {
    ad.get_str(ATTR_CLIENT_NAME)
        .map(str::to_string)
        .ok_or_else(|| CoreError::invalid_input("Missing ClientName"))
}

pub fn decode_global(key: &RsaKey, ad: &ClassAd) -> Result<ClientGlobal, CoreError> {
    let client = client_name(ad)?;
    let (session, identity) = session_key(key, ad)?;
    let encrypted = ad.typed_attrs(ENC_PARAM_PREFIX);
    let text = |name: &str| -> Result<Option<String>, CoreError> {
        encrypted
            .get(name)
            .and_then(|value| value.as_str())
            .map(|value| session.decrypt_hex_str(value))
            .transpose()
    };

    let security_name = text(ENC_SECURITY_NAME)?
        .ok_or_else(|| CoreError::invalid_input("Missing SecurityName"))?;
    let mut credentials = BTreeMap::new();
    for (name, value) in &encrypted {
        if name == ENC_SECURITY_NAME
            || name == ENC_NUMBER_OF_CREDENTIALS
            || name.starts_with(ENC_SECURITY_CLASS)
        {
            continue;
        }
        let Some(value) = value.as_str() else {
            continue;
        };
        let security_class = text(&format!("{ENC_SECURITY_CLASS}{name}"))?.unwrap_or_default();
        credentials.insert(
            name.clone(),
            ReceivedCredential {
                data: session.decrypt_hex(value)?,
                security_class,
            },
        );
    }
    if let Some(declared) = text(ENC_NUMBER_OF_CREDENTIALS)? {
        if declared.parse::<usize>().ok() != Some(credentials.len()) {
            log::warn!(
                "{client} declared {declared} credentials, received {}",
                credentials.len()
            );
        }
    }
    Ok(ClientGlobal {
        client,
        identity,
        security_name,
        credentials,
    })
}

pub fn decode_request(key: &RsaKey, ad: &ClassAd) -> Result<ClientRequestAd, CoreError> {
    let client = client_name(ad)?;
    let request_name = ad
        .get_str(ATTR_REQ_NAME)
        .ok_or_else(|| CoreError::invalid_input("Missing ReqName"))?
        .to_string();
    let (session, identity) = session_key(key, ad)?;
    let mut secrets = BTreeMap::new();
    for (name, value) in ad.typed_attrs(ENC_PARAM_PREFIX) {
        let Some(value) = value.as_str() else {
            return Err(CoreError::invalid_input(format!("{ENC_PARAM_PREFIX}{name} is not text")));
        };
        secrets.insert(name, session.decrypt_hex_str(value)?);
    }
    let mut ad = ad.clone();
    ad.strip_reserved();
    Ok(ClientRequestAd {
        client,
        request_name,
        identity,
        ad,
        secrets,
    })
}

/// Collects and decrypts every request for this factory; undecodable ads are dropped.
pub async fn find_work(
    bus: &dyn AdBus,
    config: &FactoryConfig,
    key: &RsaKey,
    timeout: Duration,
) -> crate::Result<FactoryWork> {
    let glidein_factory = config.glidein_factory();
    let addressed = || Constraint::eq(ATTR_REQ_GLIDEIN, glidein_factory.as_str());
    let globals = bounded(
        timeout,
        "Client global query",
        bus.query(AdType::ClientGlobal, addressed()),
    )
    .await?;
    let requests = bounded(timeout, "Client query", bus.query(AdType::Client, addressed())).await?;

    let mut work = FactoryWork::default();
    for ad in &globals {
        match decode_global(key, ad) {
            Ok(global) => {
                work.globals.insert(global.client.clone(), global);
            }
            Err(error) => log::warn!(
                "Dropping client global {}: {error}",
                ad.name().unwrap_or_default()
            ),
        }
    }
    let suffix = format!("@{glidein_factory}");
    for ad in &requests {
        let request = match decode_request(key, ad) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("Dropping request {}: {error}", ad.name().unwrap_or_default());
                continue;
            }
        };
        if !request.request_name.ends_with(&suffix) {
            log::warn!(
                "Request {} of {} is not for this factory",
                request.request_name,
                request.client
            );
            continue;
        }
        let entry = request.entry_name().to_string();
        if config.entry(&entry).is_none() {
            log::warn!("Request of {} for unknown entry {entry}", request.client);
            continue;
        }
        work.requests.entry(entry).or_default().push(request);
    }
    log::debug!(
        "{} client globals, {} entries with requests",
        work.globals.len(),
        work.requests.len()
    );
    Ok(work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::keys::RequestEncryption;
    use gwms_core::adbus::MemoryAdBus;
    use gwms_core::classad::{ATTR_NAME, AdValue};
    use tempfile::TempDir;

    const IDENTITY: &str = "vofrontend@frontend.example.org";

    fn encrypted_ad(
        ad_type: AdType,
        name: &str,
        key: &RsaKey,
        secrets: &[(&str, &[u8])],
        identity: &str,
    ) -> ClassAd {
        let session = SymmetricKey::generate().unwrap();
        let encryption = RequestEncryption::new(key.public_key(), &session);
        let mut ad = ClassAd::new(ad_type, name);
        ad.insert(ATTR_CLIENT_NAME, "vofrontend.main");
        ad.insert(ATTR_REQ_GLIDEIN, "main@gfactory");
        for (attr, value) in encryption.key_attrs(identity).unwrap() {
            ad.insert(attr, value);
        }
        for (secret, value) in secrets {
            ad.insert(
                format!("{ENC_PARAM_PREFIX}{secret}"),
                encryption.encrypt_bytes(value).unwrap(),
            );
        }
        ad
    }

    #[test]
    fn key_is_created_once() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let path = dir.path().join("keys").join("rsa.key");
        let key = load_or_create_key(&path, 2048).unwrap();
        let again = load_or_create_key(&path, 2048).unwrap();
        assert_eq!(key.public_key().key_id(), again.public_key().key_id());
    }

    #[test]
    fn decode_global_credentials() {
        let key = RsaKey::generate(2048).unwrap();
        let mut ad = encrypted_ad(
            AdType::ClientGlobal,
            "main@gfactory@vofrontend.main",
            &key,
            &[
                (ENC_SECURITY_NAME, b"vofrontend"),
                (ENC_NUMBER_OF_CREDENTIALS, b"1"),
                ("abc123", b"-----BEGIN CERT-----\nxyz\n"),
                ("SecurityClassabc123", b"frontend"),
            ],
            IDENTITY,
        );
        ad.insert(ATTR_AUTHENTICATED_IDENTITY, IDENTITY);
        let global = decode_global(&key, &ad).unwrap();
        assert_eq!(global.security_name, "vofrontend");
        assert_eq!(global.credentials.len(), 1);
        assert_eq!(global.credentials["abc123"].security_class, "frontend");
        assert_eq!(global.credentials["abc123"].data, b"-----BEGIN CERT-----\nxyz\n");
    }

    #[test]
    fn identity_must_match() {
        let key = RsaKey::generate(2048).unwrap();
        let mut ad = encrypted_ad(
            AdType::Client,
            "id_CE_a@main@gfactory@vofrontend.main",
            &key,
            &[],
            "someone@else",
        );
        ad.insert(ATTR_REQ_NAME, "CE_a@main@gfactory");
        ad.insert(ATTR_AUTHENTICATED_IDENTITY, IDENTITY);
        assert!(decode_request(&key, &ad).is_err());

        let other = RsaKey::generate(2048).unwrap();
        assert!(decode_request(&other, &ad).is_err());
    }

    #[tokio::test]
    async fn find_work_routes_requests_per_entry() {
        let config: FactoryConfig = toml::from_str(
            r#"
factory_name = "gfactory"
glidein_name = "main"
work_dir = "/tmp/gwms-factory"
client_proxy_dir = "/tmp/gwms-factory/proxies"

[[entries]]
name = "CE_a"
gridtype = "condor"
gatekeeper = "ce.example.org"
"#,
        )
        .unwrap();
        let key = RsaKey::generate(2048).unwrap();
        let frontend = MemoryAdBus::new(IDENTITY);

        let mut request = encrypted_ad(
            AdType::Client,
            "id_CE_a@main@gfactory@vofrontend.main",
            &key,
            &[(ENC_SECURITY_NAME, b"vofrontend")],
            IDENTITY,
        );
        request.insert(ATTR_REQ_NAME, "CE_a@main@gfactory");
        request.insert("ReqIdleGlideins", 3);
        let mut unknown = request.clone();
        unknown.insert(ATTR_NAME, "id_CE_x@main@gfactory@vofrontend.main");
        unknown.insert(ATTR_REQ_NAME, "CE_x@main@gfactory");
        let mut forged = encrypted_ad(
            AdType::Client,
            "id2_CE_a@main@gfactory@vofrontend.main",
            &key,
            &[],
            "intruder@example.org",
        );
        forged.insert(ATTR_REQ_NAME, "CE_a@main@gfactory");
        frontend.publish(vec![request, unknown, forged]).await.unwrap();

        let work = find_work(&frontend, &config, &key, Duration::from_secs(5))
            .await
            .unwrap();
        let requests = work.for_entry("CE_a");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].identity, IDENTITY);
        assert_eq!(requests[0].secrets[ENC_SECURITY_NAME], "vofrontend");
        assert_eq!(requests[0].ad.get("ReqIdleGlideins"), Some(&AdValue::Int(3)));
        assert!(!requests[0].ad.contains(ATTR_AUTHENTICATED_IDENTITY));
        assert!(work.for_entry("CE_x").is_empty());
    }
}
