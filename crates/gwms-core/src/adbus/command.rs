use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tempfile::NamedTempFile;

use crate::adbus::{AdBus, AdBusFuture, Constraint};
use crate::classad::{AdType, ClassAd, parse_ads, render_ads};
use crate::common::command::run_command;

/// Advertisement fabric driven through the collector command line tools.
pub struct CommandAdBus {
    /// Collector address, `None` for the locally configured one.
    pool: Option<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandAdBus {
    pub fn new(pool: Option<String>, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            pool,
            work_dir,
            timeout,
        }
    }

    fn pool_args(&self) -> Vec<String> {
        match &self.pool {
            Some(pool) => vec!["-pool".to_string(), pool.clone()],
            None => vec![],
        }
    }

    fn advertise(&self, command: &'static str, ads: Vec<ClassAd>) -> AdBusFuture<()> {
        let mut arguments = vec!["condor_advertise".to_string()];
        arguments.extend(self.pool_args());
        if ads.len() > 1 {
            arguments.push("-multiple".to_string());
        }
        arguments.push(command.to_string());
        let work_dir = self.work_dir.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            if ads.is_empty() {
                return Ok(());
            }
            let file = NamedTempFile::with_prefix_in("gwms_ads_", &work_dir)
                .context("Cannot create ad file")?;
            std::fs::write(file.path(), render_ads(&ads)).context("Cannot write ad file")?;
            arguments.push(file.path().display().to_string());

            let args: Vec<&str> = arguments.iter().map(|s| s.as_str()).collect();
            run_command(&args, Some(&work_dir), timeout).await?;
            Ok(())
        })
    }
}

impl AdBus for CommandAdBus {
    fn publish(&self, ads: Vec<ClassAd>) -> AdBusFuture<()> {
        self.advertise("UPDATE_AD_GENERIC", ads)
    }

    fn invalidate(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<()> {
        let mut query = ClassAd::default();
        query.insert("MyType", "Query");
        query.insert("TargetType", ad_type.my_type());
        query.insert("Name", ad_type.my_type());
        query.insert("Requirements", type_constraint(ad_type, &constraint));
        // `-multiple` is only added for batches, an invalidation is a single query ad
        self.advertise("INVALIDATE_ADS_GENERIC", vec![query])
    }

    fn query(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<Vec<ClassAd>> {
        let mut arguments = vec!["condor_status".to_string()];
        arguments.extend(self.pool_args());
        arguments.extend([
            "-any".to_string(),
            "-long".to_string(),
            "-constraint".to_string(),
            type_constraint(ad_type, &constraint),
        ]);
        let work_dir = self.work_dir.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let args: Vec<&str> = arguments.iter().map(|s| s.as_str()).collect();
            let output = run_command(&args, Some(&work_dir), timeout).await?;
            let ads = parse_ads(&output)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("Cannot parse condor_status output")?;
            log::trace!("Collector returned {} {ad_type} ads", ads.len());
            Ok(ads)
        })
    }
}

fn type_constraint(ad_type: AdType, constraint: &Constraint) -> String {
    Constraint::eq(ad_type.type_attribute(), ad_type.my_type())
        .and(constraint.clone())
        .to_expression()
}
