use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use gwms_core::common::fsutils::atomic_write;

pub const FACTORY_SCOPE: &str = "factory";
pub const ALL: &str = "All";

const FILE_MODE: u32 = 0o644;
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Debug, Clone, PartialEq)]
pub struct DowntimePeriod {
    pub start: DateTime<Utc>,
    /// Open ended when missing
    pub end: Option<DateTime<Utc>>,
    pub entry: String,
    pub frontend: String,
    pub security_class: String,
    pub comment: String,
}

impl DowntimePeriod {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        DowntimePeriod {
            start,
            end,
            entry: ALL.to_string(),
            frontend: ALL.to_string(),
            security_class: ALL.to_string(),
            comment: String::new(),
        }
    }

    fn applies(&self, entry: &str, frontend: &str, security_class: &str, now: DateTime<Utc>) -> bool {
        if self.entry == ALL {
            if entry == FACTORY_SCOPE {
                return false;
            }
        } else if self.entry != entry {
            return false;
        }
        (self.frontend == ALL || self.frontend == frontend)
            && (self.security_class == ALL || self.security_class == security_class)
            && self.start <= now
            && self.end.is_none_or(|end| now <= end)
    }

    pub fn render(&self) -> String {
        let end = self
            .end
            .map(format_time)
            .unwrap_or_else(|| "None".to_string());
        let mut line = format!(
            "{:<30} {:<30} {:<20} {:<30} {:<20}",
            format_time(self.start),
            end,
            self.entry,
            self.frontend,
            self.security_class
        );
        if !self.comment.is_empty() {
            line.push_str(" # ");
            line.push_str(&self.comment);
        }
        line
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

/// ISO-8601 with or without offset (local time when missing), or seconds since the epoch.
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = value.parse::<i64>() {
        return DateTime::from_timestamp(epoch, 0);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Some(time.with_timezone(&Utc));
    }
    if let Ok(time) = DateTime::parse_from_str(value, TIME_FORMAT) {
        return Some(time.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|time| time.with_timezone(&Utc))
}

fn parse_line(line: &str) -> Option<DowntimePeriod> {
    let (fields, comment) = match line.split_once('#') {
        Some((fields, comment)) => (fields, comment.trim()),
        None => (line, ""),
    };
    let mut fields = fields.split_whitespace();
    let start = parse_time(fields.next()?)?;
    let end = match fields.next()? {
        "None" => None,
        end => Some(parse_time(end)?),
    };
    let mut period = DowntimePeriod::new(start, end);
    period.entry = fields.next().unwrap_or(FACTORY_SCOPE).to_string();
    if let Some(frontend) = fields.next() {
        period.frontend = frontend.to_string();
    }
    if let Some(security_class) = fields.next() {
        period.security_class = security_class.to_string();
    }
    let rest: Vec<&str> = fields.collect();
    period.comment = if rest.is_empty() {
        comment.to_string()
    } else {
        rest.join(" ")
    };
    Some(period)
}

/// Downtime file of the factory or of one entry.
#[derive(Debug, Clone)]
pub struct DowntimeFile {
    path: PathBuf,
}

impl DowntimeFile {
    pub fn new(path: &Path) -> Self {
        DowntimeFile {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Periods of the file; a missing file has none.
    pub fn read(&self) -> Vec<DowntimePeriod> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Cannot read downtime file {}: {error}", self.path.display());
                }
                return Vec::new();
            }
        };
        content
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let period = parse_line(line);
                if period.is_none() {
                    log::warn!(
                        "{}:{}: ignoring malformed downtime `{line}`",
                        self.path.display(),
                        index + 1
                    );
                }
                period
            })
            .collect()
    }

    /// First active period covering the scope at `now`.
    pub fn check(
        &self,
        entry: &str,
        frontend: &str,
        security_class: &str,
        now: DateTime<Utc>,
    ) -> Option<DowntimePeriod> {
        self.read()
            .into_iter()
            .find(|period| period.applies(entry, frontend, security_class, now))
    }

    pub fn add_period(&self, period: DowntimePeriod) -> crate::Result<()> {
        let mut periods = self.read();
        periods.push(period);
        self.write(&periods)
    }

    /// Closes every open or future-ending period of the scope at `end`; returns how many.
    pub fn end_downtime(&self, end: DateTime<Utc>, entry: &str, frontend: &str, security_class: &str) -> crate::Result<usize> {
        let mut periods = self.read();
        let mut closed = 0;
        for period in periods.iter_mut() {
            let scope_matches = (entry == ALL || period.entry == entry)
                && (frontend == ALL || period.frontend == frontend)
                && (security_class == ALL || period.security_class == security_class);
            if !scope_matches || period.end.is_some_and(|current| current <= end) {
                continue;
            }
            period.end = Some(end.max(period.start));
            closed += 1;
        }
        if closed > 0 {
            self.write(&periods)?;
        }
        Ok(closed)
    }

    fn write(&self, periods: &[DowntimePeriod]) -> crate::Result<()> {
        let mut content = format!(
            "#{:<29} {:<30} {:<20} {:<30} {:<20} # Comment\n",
            "Start", "End", "Entry", "Frontend", "Sec_Class"
        );
        for period in periods {
            content.push_str(&period.render());
            content.push('\n');
        }
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        atomic_write(&self.path, content.as_bytes(), FILE_MODE, false)?;
        Ok(())
    }
}

/// Factory wide and per-entry downtime files seen together.
#[derive(Debug, Clone)]
pub struct Downtimes {
    files: Vec<DowntimeFile>,
}

impl Downtimes {
    pub fn new(factory: &Path, entry: Option<&Path>) -> Self {
        let mut files = vec![DowntimeFile::new(factory)];
        if let Some(entry) = entry.filter(|entry| *entry != factory) {
            files.push(DowntimeFile::new(entry));
        }
        Downtimes { files }
    }

    pub fn check(&self, entry: &str, frontend: &str, security_class: &str, now: DateTime<Utc>) -> Option<DowntimePeriod> {
        self.files
            .iter()
            .find_map(|file| file.check(FACTORY_SCOPE, frontend, security_class, now))
            .or_else(|| {
                self.files
                    .iter()
                    .find_map(|file| file.check(entry, frontend, security_class, now))
            })
    }

    /// Whole entry down, regardless of who asks.
    pub fn entry_down(&self, entry: &str, now: DateTime<Utc>) -> bool {
        self.check(entry, ALL, ALL, now).is_some()
    }
}
