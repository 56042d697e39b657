use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;

use crate::reminder::ReminderConfig;

const DEFAULT_DATA_DIR: &str = "./data";
const WAL_FILE: &str = "chairbook.wal";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: &'static str, value: String },
    #[error("{var}: {value} is out of range ({expected})")]
    OutOfRange {
        var: &'static str,
        value: i64,
        expected: &'static str,
    },
}

/// Daemon settings, read from `CHAIRBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Offset of the local calendar used for weekdays and slot times.
    pub utc_offset: FixedOffset,
    pub reminder_hour: u32,
    pub reminder_tick: Duration,
    pub reminder_concurrency: usize,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("CHAIRBOOK_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into());

        let offset_minutes: i64 = parse(&lookup, "CHAIRBOOK_UTC_OFFSET_MINUTES")?.unwrap_or(0);
        let utc_offset = i32::try_from(offset_minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::OutOfRange {
                var: "CHAIRBOOK_UTC_OFFSET_MINUTES",
                value: offset_minutes,
                expected: "-1439..=1439",
            })?;

        let reminder_hour: u32 = parse(&lookup, "CHAIRBOOK_REMINDER_HOUR")?.unwrap_or(18);
        if reminder_hour > 23 {
            return Err(ConfigError::OutOfRange {
                var: "CHAIRBOOK_REMINDER_HOUR",
                value: reminder_hour.into(),
                expected: "0..=23",
            });
        }

        let tick_secs: u64 = parse(&lookup, "CHAIRBOOK_REMINDER_TICK_SECS")?.unwrap_or(3600);
        if tick_secs == 0 {
            return Err(ConfigError::OutOfRange {
                var: "CHAIRBOOK_REMINDER_TICK_SECS",
                value: 0,
                expected: ">= 1",
            });
        }

        let reminder_concurrency: usize = parse(&lookup, "CHAIRBOOK_REMINDER_CONCURRENCY")?.unwrap_or(8);
        if reminder_concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                var: "CHAIRBOOK_REMINDER_CONCURRENCY",
                value: 0,
                expected: ">= 1",
            });
        }

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            utc_offset,
            reminder_hour,
            reminder_tick: Duration::from_secs(tick_secs),
            reminder_concurrency,
            metrics_port: parse(&lookup, "CHAIRBOOK_METRICS_PORT")?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    pub fn reminder(&self) -> ReminderConfig {
        ReminderConfig {
            hour: self.reminder_hour,
            tick: self.reminder_tick,
            concurrency: self.reminder_concurrency,
            tz: self.utc_offset,
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value }),
    }
}
