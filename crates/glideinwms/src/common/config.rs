use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use gwms_core::common::error::CoreError;

pub const DEFAULT_LOOP_DELAY: Duration = Duration::from_secs(60);

pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Delay between two iterations of a service loop.
pub fn get_loop_delay(configured: Duration) -> Duration {
    get_duration_from_env("GWMS_LOOP_DELAY_MS").unwrap_or(configured)
}

/// Upper bound of every call to an external system (collector, schedd, scripts).
pub fn get_query_timeout() -> Duration {
    get_duration_from_env("GWMS_QUERY_TIMEOUT_MS").unwrap_or_else(|| Duration::from_secs(120))
}

/// Wall-clock limit of one worker run.
pub fn get_worker_timeout(loop_delay: Duration) -> Duration {
    get_duration_from_env("GWMS_WORKER_TIMEOUT_MS").unwrap_or(loop_delay * 3)
}

/// Age after which the token broker reissues an entry idtoken.
pub fn get_idtoken_refresh() -> Duration {
    get_duration_from_env("GWMS_IDTOKEN_REFRESH_MS").unwrap_or_else(|| Duration::from_secs(3600))
}

/// Reads a TOML service descriptor. Every failure is a configuration error.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::configuration(format!("Cannot read {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        CoreError::configuration(format!("Cannot parse {}: {e}", path.display())).into()
    })
}

/// Serde adapter for durations written as humantime strings (`"5m"`, `"1h 30m"`).
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

pub mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::duration::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwms_core::common::error::ErrorKind;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Timing {
        #[serde(with = "duration")]
        delay: Duration,
        #[serde(default, with = "optional_duration")]
        lifetime: Option<Duration>,
    }

    #[test]
    fn humantime_durations() {
        let timing: Timing = toml::from_str("delay = \"1m 30s\"").unwrap();
        assert_eq!(timing.delay, Duration::from_secs(90));
        assert_eq!(timing.lifetime, None);

        let timing: Timing = toml::from_str("delay = \"5m\"\nlifetime = \"2h\"").unwrap();
        assert_eq!(timing.lifetime, Some(Duration::from_secs(7200)));
        assert!(toml::from_str::<Timing>("delay = \"soon\"").is_err());
    }

    #[test]
    fn worker_timeout_defaults_to_three_loops() {
        assert_eq!(
            get_worker_timeout(Duration::from_secs(60)),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn load_toml_reports_configuration_errors() {
        let dir = tempfile::TempDir::with_prefix("gwms").unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "delay = ").unwrap();
        let error = load_toml::<toml::Table>(&path).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
        let error = load_toml::<toml::Table>(&dir.path().join("missing.toml")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }
}
