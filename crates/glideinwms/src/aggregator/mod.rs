pub mod ranges;
pub mod rollup;
pub mod sink;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gwms_core::common::fsutils::{read_json_or_default, write_json_atomic};

use crate::aggregator::rollup::{
    CompletedGlidein, CompletedStats, CompletedSummary, EntryStatus, FactoryStatus, STATUS_ATTRS,
    StatusAttrs, aggregate_status,
};
use crate::aggregator::sink::{MonitorSink, update_logged};
use crate::factory::config::FactoryConfig;

pub const MONITOR_DIR: &str = "monitor";
/// Written by every entry worker
pub const STATUS_FILE: &str = "status.json";
/// Glideins that completed during the last entry iteration
pub const COMPLETED_FILE: &str = "completed_glideins.json";
pub const COMPLETED_STATS_FILE: &str = "completed_stats.json";

pub fn monitor_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(MONITOR_DIR)
}

/// Attributes the status series of the sink must store.
pub fn expected_attrs() -> Vec<&'static str> {
    STATUS_ATTRS.to_vec()
}

fn as_values(attrs: &StatusAttrs) -> BTreeMap<String, f64> {
    attrs
        .iter()
        .map(|(name, value)| (name.clone(), *value as f64))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateReport {
    pub status: FactoryStatus,
    pub completed: CompletedSummary,
    /// Entries without a readable status
    pub missing: Vec<String>,
}

fn read_entry<T: serde::de::DeserializeOwned + Default>(path: &Path, entry: &str) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match read_json_or_default(path) {
        Ok(value) => Some(value),
        Err(error) => {
            log::warn!("entry {entry}: unreadable {}: {error}", path.display());
            None
        }
    }
}

/// Merges the entry snapshots of the factory and writes the factory wide views.
pub fn aggregate(config: &FactoryConfig, sink: &mut dyn MonitorSink, now: i64) -> crate::Result<AggregateReport> {
    let mut statuses = Vec::with_capacity(config.entries.len());
    let mut completed = BTreeMap::new();
    let mut missing = Vec::new();
    for entry in &config.entries {
        let dir = monitor_dir(&config.entry_work_dir(entry));
        match read_entry::<EntryStatus>(&dir.join(STATUS_FILE), &entry.name) {
            Some(status) => statuses.push(status),
            None => missing.push(entry.name.clone()),
        }
        let glideins: Vec<CompletedGlidein> =
            read_entry(&dir.join(COMPLETED_FILE), &entry.name).unwrap_or_default();
        completed.insert(entry.name.clone(), CompletedStats::summarize(&glideins));
    }

    let status = aggregate_status(&statuses, now);
    let completed = CompletedSummary::new(completed, now);

    let dir = monitor_dir(&config.work_dir);
    std::fs::create_dir_all(&dir)?;
    write_json_atomic(&dir.join(STATUS_FILE), &status)?;
    write_json_atomic(&dir.join(COMPLETED_STATS_FILE), &completed)?;

    update_logged(sink, "total", now, &as_values(&status.totals));
    for (client, attrs) in &status.frontends {
        update_logged(sink, &format!("frontend_{client}"), now, &as_values(attrs));
    }
    for (entry, stats) in &completed.entries {
        update_logged(sink, &format!("completed_{entry}"), now, &stats.flatten());
    }
    update_logged(sink, "completed_total", now, &completed.total.flatten());

    if !missing.is_empty() {
        log::debug!("No status yet for entries {missing:?}");
    }
    log::info!(
        "Aggregated {} entries, {} frontends",
        status.entries.len(),
        status.frontends.len()
    );
    Ok(AggregateReport {
        status,
        completed,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::sink::tests::MemorySink;
    use tempfile::TempDir;

    #[test]
    fn aggregate_entry_snapshots() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let config: FactoryConfig = toml::from_str(&format!(
            r#"
factory_name = "gfactory"
glidein_name = "main"
work_dir = "{}"
client_proxy_dir = "{}/proxies"

[[entries]]
name = "CE_a"
gridtype = "condor"
gatekeeper = "ce-a.example.org"

[[entries]]
name = "CE_b"
gridtype = "condor"
gatekeeper = "ce-b.example.org"
"#,
            dir.path().display(),
            dir.path().display()
        ))
        .unwrap();

        let entry_dir = monitor_dir(&config.entry_work_dir(&config.entries[0]));
        std::fs::create_dir_all(&entry_dir).unwrap();
        let status = EntryStatus {
            entry: "CE_a".to_string(),
            updated: 990,
            totals: [("StatusIdle".to_string(), 4)].into(),
            clients: [("fe.main".to_string(), [("StatusIdle".to_string(), 4)].into())].into(),
            ..Default::default()
        };
        write_json_atomic(&entry_dir.join(STATUS_FILE), &status).unwrap();
        let glideins = vec![CompletedGlidein {
            client: "fe.main".to_string(),
            duration: 600,
            ..Default::default()
        }];
        write_json_atomic(&entry_dir.join(COMPLETED_FILE), &glideins).unwrap();

        let mut sink = MemorySink::default();
        let report = aggregate(&config, &mut sink, 1000).unwrap();
        assert_eq!(report.missing, vec!["CE_b".to_string()]);
        assert_eq!(report.status.totals["StatusIdle"], 4);
        assert_eq!(report.status.totals["InfoAge"], 10);
        assert_eq!(report.completed.total.sum.glideins, 1);
        assert_eq!(report.completed.entries["CE_b"].sum.glideins, 0);

        let written: FactoryStatus =
            read_json_or_default(&monitor_dir(dir.path()).join(STATUS_FILE)).unwrap();
        assert_eq!(written, report.status);
        let series: Vec<&str> = sink.updates.iter().map(|(name, _, _)| name.as_str()).collect();
        assert_eq!(
            series,
            ["total", "frontend_fe.main", "completed_CE_a", "completed_CE_b", "completed_total"]
        );
    }
}
