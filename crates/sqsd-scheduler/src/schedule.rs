//! `cron.yaml` parsing.
//!
//! ```yaml
//! version: 1
//! cron:
//!   - name: "backup"
//!     url: "/backup"
//!     schedule: "0 */12 * * *"
//! ```
//!
//! Schedules use the classic five cron fields (minute precision). A sixth
//! leading seconds field is also accepted. Every entry is validated up front
//! so a bad file fails at startup rather than at the first firing.

use chrono::{DateTime, Utc};
use cron::Schedule;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{Result, ScheduleError};

const SUPPORTED_VERSION: u64 = 1;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Deserialize)]
struct RawFile {
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    cron: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
    url: String,
    schedule: String,
}

/// A named task posted to `path` whenever its schedule fires.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub path: String,
    /// The expression as written in the file.
    pub expression: String,
    schedule: Schedule,
}

impl ScheduledJob {
    pub fn new(name: &str, url: &str, expression: &str) -> Result<Self> {
        let path = normalize_path(url).ok_or_else(|| ScheduleError::InvalidPath {
            name: name.to_string(),
            url: url.to_string(),
        })?;
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            name: name.to_string(),
            expression: expression.to_string(),
            reason,
        };

        let normalized = normalize_expression(expression).map_err(invalid)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(invalid("never fires".to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            path,
            expression: expression.to_string(),
            schedule,
        })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Every task from a schedule file, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct JobSchedule {
    jobs: IndexMap<String, ScheduledJob>,
}

impl JobSchedule {
    /// Load a schedule file. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            info!(path = %path.display(), "No schedule file found, scheduler disabled");
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ScheduleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let schedule = Self::parse(&contents)?;
        info!(
            path = %path.display(),
            tasks = schedule.len(),
            "Loaded scheduled tasks"
        );
        Ok(Some(schedule))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Err(ScheduleError::Empty);
        }
        let raw: Option<RawFile> = serde_yaml::from_str(contents)?;
        let raw = raw.ok_or(ScheduleError::Empty)?;

        let version = match raw.version {
            None | Some(serde_yaml::Value::Null) => return Err(ScheduleError::MissingVersion),
            Some(v) => v,
        };
        let supported = match &version {
            serde_yaml::Value::Number(n) => n.as_u64() == Some(SUPPORTED_VERSION),
            serde_yaml::Value::String(s) => s.trim().parse::<u64>().ok() == Some(SUPPORTED_VERSION),
            _ => false,
        };
        if !supported {
            let shown = match version {
                serde_yaml::Value::String(s) => s,
                other => serde_yaml::to_string(&other)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default(),
            };
            return Err(ScheduleError::UnsupportedVersion(shown));
        }

        let mut jobs = IndexMap::with_capacity(raw.cron.len());
        for task in raw.cron {
            let job = ScheduledJob::new(&task.name, &task.url, &task.schedule)?;
            if let Some(previous) = jobs.insert(task.name.clone(), job) {
                warn!(
                    task = %task.name,
                    replaced_url = %previous.path,
                    "Duplicate task name in schedule file, keeping the last entry"
                );
            }
        }
        Ok(Self { jobs })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ScheduledJob> {
        self.jobs.get(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.values()
    }

    /// The earliest firing strictly after `after`, with every job due then.
    pub fn next_due(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<&ScheduledJob>)> {
        let mut earliest: Option<(DateTime<Utc>, Vec<&ScheduledJob>)> = None;
        for job in self.jobs.values() {
            let Some(at) = job.next_after(after) else {
                continue;
            };
            match earliest.as_mut() {
                Some((current, due)) if at == *current => {
                    due.push(job);
                    continue;
                }
                Some((current, _)) if at > *current => continue,
                _ => {}
            }
            earliest = Some((at, vec![job]));
        }
        earliest
    }
}

/// Paths are relative to the application root. A missing leading slash is
/// added; absolute URLs and whitespace are rejected.
fn normalize_path(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() || url.contains("://") || url.chars().any(char::is_whitespace) {
        return None;
    }
    if url.starts_with('/') {
        Some(url.to_string())
    } else {
        Some(format!("/{}", url))
    }
}

/// Rewrite a cron expression into the seconds-first form `cron` parses.
fn normalize_expression(expression: &str) -> std::result::Result<String, String> {
    let expression = expression.trim();
    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    let weekday = match fields.len() {
        5 => {
            fields.insert(0, "0".to_string());
            5
        }
        6 | 7 => 5,
        n => return Err(format!("expected 5 fields, found {}", n)),
    };
    fields[weekday] = weekday_names(&fields[weekday])?;
    Ok(fields.join(" "))
}

/// Numeric weekdays count from Sunday = 0 (7 is also Sunday). Step values are
/// left alone.
fn weekday_names(field: &str) -> std::result::Result<String, String> {
    let parts: std::result::Result<Vec<String>, String> = field
        .split(',')
        .map(|part| -> std::result::Result<String, String> {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|token| match token.parse::<usize>() {
                    Ok(day) => WEEKDAYS
                        .get(day)
                        .map(|name| name.to_string())
                        .ok_or_else(|| format!("day of week {} out of range", day)),
                    Err(_) => Ok(token.to_string()),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
                .join("-");
            Ok(match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            })
        })
        .collect();
    Ok(parts?.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    const FILE: &str = r#"
version: 1
cron:
  - name: "backup"
    url: "/backup"
    schedule: "0 */12 * * *"
  - name: "report"
    url: "reports/daily"
    schedule: "30 6 * * 1-5"
"#;

    #[test]
    fn test_parse_file() {
        let schedule = JobSchedule::parse(FILE).unwrap();
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.get("backup").unwrap().path, "/backup");
        assert_eq!(schedule.get("report").unwrap().path, "/reports/daily");
        assert_eq!(schedule.get("report").unwrap().expression, "30 6 * * 1-5");
    }

    #[test]
    fn test_version_as_string() {
        let schedule = JobSchedule::parse("version: \"1\"\ncron: []\n").unwrap();
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_empty_file() {
        assert!(matches!(JobSchedule::parse("  \n"), Err(ScheduleError::Empty)));
    }

    #[test]
    fn test_missing_version() {
        let result = JobSchedule::parse("cron: []\n");
        assert!(matches!(result, Err(ScheduleError::MissingVersion)));
    }

    #[test]
    fn test_unsupported_version() {
        match JobSchedule::parse("version: 2\ncron: []\n") {
            Err(ScheduleError::UnsupportedVersion(v)) => assert_eq!(v, "2"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_schedule_names_the_task() {
        let file = "version: 1\ncron:\n  - name: broken\n    url: /x\n    schedule: \"not a schedule\"\n";
        match JobSchedule::parse(file) {
            Err(ScheduleError::InvalidSchedule { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_path() {
        assert!(matches!(
            ScheduledJob::new("t", "http://elsewhere/x", "* * * * *"),
            Err(ScheduleError::InvalidPath { .. })
        ));
        assert!(matches!(
            ScheduledJob::new("t", "/has space", "* * * * *"),
            Err(ScheduleError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let file = "version: 1\ncron:\n  - name: nourl\n    schedule: \"* * * * *\"\n";
        assert!(matches!(JobSchedule::parse(file), Err(ScheduleError::Yaml(_))));
    }

    #[test]
    fn test_weekday_numbers_count_from_sunday() {
        assert_eq!(weekday_names("0").unwrap(), "SUN");
        assert_eq!(weekday_names("7").unwrap(), "SUN");
        assert_eq!(weekday_names("1-5").unwrap(), "MON-FRI");
        assert_eq!(weekday_names("*/2").unwrap(), "*/2");
        assert_eq!(weekday_names("0,6").unwrap(), "SUN,SAT");
        assert_eq!(weekday_names("MON").unwrap(), "MON");
        assert!(weekday_names("8").is_err());
    }

    #[test]
    fn test_five_fields_gain_seconds() {
        assert_eq!(normalize_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_expression("@daily").unwrap(), "@daily");
        assert!(normalize_expression("* *").is_err());
    }

    #[test]
    fn test_weekday_schedule_skips_weekend() {
        let job = ScheduledJob::new("report", "/r", "30 6 * * 1-5").unwrap();
        // 2024-06-01 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = job.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute(), next.second()), (6, 30, 0));
    }

    #[test]
    fn test_next_due_groups_simultaneous_jobs() {
        let file = r#"
version: 1
cron:
  - name: a
    url: /a
    schedule: "0 * * * *"
  - name: b
    url: /b
    schedule: "0 */2 * * *"
  - name: c
    url: /c
    schedule: "15 * * * *"
"#;
        let schedule = JobSchedule::parse(file).unwrap();

        let at = Utc.with_ymd_and_hms(2024, 6, 1, 1, 30, 0).unwrap();
        let (due_at, jobs) = schedule.next_due(at).unwrap();
        assert_eq!(due_at, Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap());
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let (due_at, jobs) = schedule.next_due(due_at).unwrap();
        assert_eq!(due_at, Utc.with_ymd_and_hms(2024, 6, 1, 2, 15, 0).unwrap());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "c");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JobSchedule::load(&dir.path().join("cron.yaml")).unwrap().is_none());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.yaml");
        std::fs::write(&path, FILE).unwrap();
        let schedule = JobSchedule::load(&path).unwrap().unwrap();
        assert_eq!(schedule.len(), 2);
    }
}
