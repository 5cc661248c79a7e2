use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use gwms_core::common::fsutils::{PRIVATE_FILE_MODE, atomic_write, file_age};
use gwms_core::crypto::jwt::{decode_unverified, issue_hs256};
use gwms_core::crypto::{JwtClaims, random_bytes};

use crate::common::config::get_idtoken_refresh;
use crate::frontend::config::BrokerConfig;

pub const TOKEN_SCOPE: &str = "condor:/READ condor:/ADVERTISE_STARTD condor:/ADVERTISE_MASTER";

const PASSWORDS_DIR: &str = "passwords.d";
const TOKENS_DIR: &str = "tokens.d";

/// Issues the idtokens glideins use to join the user pool.
pub struct TokenBroker {
    work_dir: PathBuf,
    lifetime: Duration,
    refresh: Duration,
    frontend_host: String,
}

impl TokenBroker {
    pub fn new(work_dir: &Path, config: &BrokerConfig) -> Self {
        let frontend_host = config.frontend_host.clone().unwrap_or_else(|| {
            gethostname::gethostname().to_string_lossy().into_owned()
        });
        TokenBroker {
            work_dir: work_dir.to_path_buf(),
            lifetime: Duration::from_secs(config.idtoken_lifetime * 3600),
            refresh: get_idtoken_refresh(),
            frontend_host,
        }
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    fn password_path(&self, site: &str) -> PathBuf {
        self.work_dir.join(PASSWORDS_DIR).join(site)
    }

    pub fn token_path(&self, entry: &str) -> PathBuf {
        self.work_dir.join(TOKENS_DIR).join(format!("{entry}.idtoken"))
    }

    fn current_token(&self, path: &Path, now: DateTime<Utc>) -> Option<String> {
        if file_age(path)? >= self.refresh {
            return None;
        }
        let token = std::fs::read_to_string(path).ok()?;
        match decode_unverified(&token) {
            Ok(claims) if claims.exp.is_some_and(|exp| exp > now.timestamp()) => Some(token),
            Ok(_) => None,
            Err(error) => {
                log::warn!("Replacing unreadable token {}: {error}", path.display());
                None
            }
        }
    }

    /// Token of an entry, reissued when missing, expired or older than the refresh interval.
    ///
    /// `None` when no password is provisioned for the site.
    pub fn entry_token(
        &self,
        entry: &str,
        site: &str,
        trust_domain: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<String>> {
        let password = match std::fs::read(self.password_path(site)) {
            Ok(password) => password,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let path = self.token_path(entry);
        if let Some(token) = self.current_token(&path, now) {
            return Ok(Some(token));
        }

        let iat = now.timestamp();
        let claims = JwtClaims {
            sub: Some(format!("{site}@{}", self.frontend_host)),
            iss: Some(trust_domain.to_string()),
            scope: Some(TOKEN_SCOPE.to_string()),
            iat: Some(iat),
            exp: Some(iat + self.lifetime.as_secs() as i64),
            jti: Some(hex::encode(random_bytes(16)?)),
            ..Default::default()
        };
        let token = issue_hs256(&claims, password.trim_ascii_end())?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        atomic_write(&path, token.as_bytes(), PRIVATE_FILE_MODE, false)?;
        log::info!("Issued idtoken for entry {entry} at site {site}");
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn broker(dir: &Path) -> TokenBroker {
        let config = BrokerConfig {
            idtoken_lifetime: 24,
            frontend_host: Some("fe.example.org".to_string()),
        };
        TokenBroker::new(dir, &config).with_refresh(Duration::from_secs(3600))
    }

    fn provision(dir: &Path, site: &str) {
        std::fs::create_dir_all(dir.join(PASSWORDS_DIR)).unwrap();
        std::fs::write(dir.join(PASSWORDS_DIR).join(site), "pool password\n").unwrap();
    }

    #[test]
    fn no_password_no_token() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let broker = broker(dir.path());
        assert!(
            broker
                .entry_token("entry", "Example", "Grid", Utc::now())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn issues_and_reuses_token() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        provision(dir.path(), "Example");
        let broker = broker(dir.path());
        let now = Utc::now();
        let token = broker
            .entry_token("entry", "Example", "Grid", now)
            .unwrap()
            .unwrap();
        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("Example@fe.example.org"));
        assert_eq!(claims.scope.as_deref(), Some(TOKEN_SCOPE));
        assert_eq!(claims.exp, Some(now.timestamp() + 24 * 3600));
        let mode = std::fs::metadata(broker.token_path("entry"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let again = broker
            .entry_token("entry", "Example", "Grid", now)
            .unwrap()
            .unwrap();
        assert_eq!(again, token);
    }

    #[test]
    fn expired_token_is_replaced() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        provision(dir.path(), "Example");
        let broker = broker(dir.path());
        let now = Utc::now();
        let first = broker
            .entry_token("entry", "Example", "Grid", now)
            .unwrap()
            .unwrap();
        let later = now + chrono::Duration::hours(25);
        let second = broker
            .entry_token("entry", "Example", "Grid", later)
            .unwrap()
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(
            decode_unverified(&second).unwrap().iat,
            Some(later.timestamp())
        );
    }
}
