use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use gwms_core::common::error::CoreError;
use gwms_core::common::fsutils::{read_json_or_default, write_json_atomic};

/// Samples kept per series.
const MAX_SAMPLES: usize = 1440;

/// Time series store of the monitoring values.
pub trait MonitorSink {
    /// Checks that every known series stores `expected_attrs`; with `extend` missing ones are added.
    fn verify(&mut self, expected_attrs: &[&str], extend: bool) -> crate::Result<()>;

    fn update(&mut self, series: &str, time: i64, values: &BTreeMap<String, f64>) -> crate::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Series {
    attrs: Vec<String>,
    samples: Vec<(i64, BTreeMap<String, f64>)>,
}

/// One JSON file per series in a directory.
pub struct JsonSink {
    dir: PathBuf,
}

impl JsonSink {
    pub fn new(dir: &Path) -> Self {
        JsonSink {
            dir: dir.to_path_buf(),
        }
    }

    fn series_path(&self, series: &str) -> PathBuf {
        self.dir.join(format!("{series}.json"))
    }

    fn known_series(&self) -> crate::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl MonitorSink for JsonSink {
    fn verify(&mut self, expected_attrs: &[&str], extend: bool) -> crate::Result<()> {
        for path in self.known_series()? {
            let mut series: Series = read_json_or_default(&path)?;
            let missing: Vec<&str> = expected_attrs
                .iter()
                .copied()
                .filter(|attr| !series.attrs.iter().any(|known| known == attr))
                .collect();
            if missing.is_empty() {
                continue;
            }
            if !extend {
                return Err(CoreError::configuration(format!(
                    "{} lacks {}",
                    path.display(),
                    missing.join(", ")
                ))
                .into());
            }
            log::info!("Extending {} with {}", path.display(), missing.join(", "));
            std::fs::copy(&path, path.with_extension("json.bak"))?;
            series.attrs.extend(missing.into_iter().map(str::to_string));
            write_json_atomic(&path, &series)?;
        }
        Ok(())
    }

    fn update(&mut self, series: &str, time: i64, values: &BTreeMap<String, f64>) -> crate::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.series_path(series);
        let mut stored: Series = read_json_or_default(&path)?;
        for name in values.keys() {
            if !stored.attrs.contains(name) {
                stored.attrs.push(name.clone());
            }
        }
        stored.samples.push((time, values.clone()));
        if stored.samples.len() > MAX_SAMPLES {
            let excess = stored.samples.len() - MAX_SAMPLES;
            stored.samples.drain(..excess);
        }
        write_json_atomic(&path, &stored)?;
        Ok(())
    }
}

/// Feeds a sink, logging instead of failing.
pub fn update_logged(sink: &mut dyn MonitorSink, series: &str, time: i64, values: &BTreeMap<String, f64>) {
    if let Err(error) = sink.update(series, time, values) {
        log::warn!("Cannot update monitoring series {series}: {error}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Keeps every update in memory.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub updates: Vec<(String, i64, BTreeMap<String, f64>)>,
        pub fail: bool,
    }

    impl MonitorSink for MemorySink {
        fn verify(&mut self, _expected_attrs: &[&str], _extend: bool) -> crate::Result<()> {
            Ok(())
        }

        fn update(&mut self, series: &str, time: i64, values: &BTreeMap<String, f64>) -> crate::Result<()> {
            if self.fail {
                return crate::common::error::error("Sink is broken".to_string());
            }
            self.updates.push((series.to_string(), time, values.clone()));
            Ok(())
        }
    }

    fn values(names: &[&str]) -> BTreeMap<String, f64> {
        names.iter().map(|name| (name.to_string(), 1.0)).collect()
    }

    #[test]
    fn verify_and_extend() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let mut sink = JsonSink::new(dir.path());
        sink.verify(&["StatusIdle"], false).unwrap();
        sink.update("total", 10, &values(&["StatusIdle"])).unwrap();
        sink.update("total", 20, &values(&["StatusIdle"])).unwrap();

        assert!(sink.verify(&["StatusIdle", "StatusHeld"], false).is_err());
        sink.verify(&["StatusIdle", "StatusHeld"], true).unwrap();
        sink.verify(&["StatusIdle", "StatusHeld"], false).unwrap();
        assert!(dir.path().join("total.json.bak").exists());

        let stored: Series = read_json_or_default(&dir.path().join("total.json")).unwrap();
        assert_eq!(stored.samples.len(), 2);
        assert_eq!(stored.attrs, vec!["StatusIdle".to_string(), "StatusHeld".to_string()]);
    }

    #[test]
    fn failures_are_only_logged() {
        let mut sink = MemorySink {
            fail: true,
            ..Default::default()
        };
        update_logged(&mut sink, "total", 1, &values(&["StatusIdle"]));
        assert!(sink.updates.is_empty());
    }
}
