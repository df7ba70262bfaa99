use std::{collections::BTreeMap, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

const DEFAULT_PULL_INTERVAL: f64 = 10.0;
const DEFAULT_ACK_DEADLINE: f64 = 60.0;
const DEFAULT_SCHEME: &str = "gs";
const SUSTAIN_INTERVAL_FACTOR: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandConfig {
    // the command line to run, after `%{...}` expansion
    #[serde(default)]
    pub template: String,
    // optional registry: rendered template -> registered command template
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    // log the built command line instead of running it
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    // directory the queue backend watches for message files
    #[serde(default)]
    pub spool_dir: String,
    // seconds to sleep when the queue comes up empty
    pub pull_interval: Option<f64>,
    // seconds of lease granted per claim
    pub ack_deadline: Option<f64>,
    #[serde(default)]
    pub sustainer: SustainerConfig,
}

impl JobConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pull_interval.unwrap_or(DEFAULT_PULL_INTERVAL))
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.ack_deadline.unwrap_or(DEFAULT_ACK_DEADLINE))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SustainerConfig {
    #[serde(default)]
    pub disabled: bool,
    // seconds each renewal extends the lease by; defaults to the
    // queue's own ack deadline
    pub delay: Option<f64>,
    // seconds between renewals; defaults to 0.9 * delay
    pub interval: Option<f64>,
}

impl SustainerConfig {
    pub fn delay_or(&self, queue_deadline: Duration) -> Duration {
        self.delay
            .map(Duration::from_secs_f64)
            .unwrap_or(queue_deadline)
    }

    pub fn interval_or(&self, delay: Duration) -> Duration {
        self.interval
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| delay.mul_f64(SUSTAIN_INTERVAL_FACTOR))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    // root directory of the filesystem object store
    #[serde(default)]
    pub root: String,
    // accepted remote-reference scheme
    pub scheme: Option<String>,
}

impl StorageConfig {
    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    // upload whatever the command left under uploads/
    Scan,
    // upload exactly what the message's upload_files document maps
    Mapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadConfig {
    pub mode: Option<UploadMode>,
    // scan mode: bucket to use instead of the last downloaded-from one
    #[serde(default)]
    pub bucket: String,
}

impl UploadConfig {
    pub fn mode(&self) -> UploadMode {
        self.mode.unwrap_or(UploadMode::Scan)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressConfig {
    // spool directory progress events are published into; empty disables
    #[serde(default)]
    pub topic: String,
    // minimum severity an event needs to be published
    pub level: Option<String>,
    pub hostname: Option<String>,
    // extra attributes stamped on every published event
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ProgressConfig {
    pub fn enabled(&self) -> bool {
        !self.topic.is_empty()
    }

    pub fn level(&self) -> Level {
        self.level
            .as_deref()
            .and_then(|s| Level::from_str(s).ok())
            .unwrap_or(Level::INFO)
    }

    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
}

impl LogConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }
}

pub fn load(path: &str) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source: source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source: source,
    })
}

fn check_duration(field: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(ConfigError::Invalid {
            field: field,
            reason: format!("`{v}` is not a positive number of seconds"),
        }),
        _ => Ok(()),
    }
}

impl Config {
    // Fill defaults and reject values the rest of the process would
    // trip over later. Trailing command-line arguments take the place
    // of `[command] template`.
    pub fn finalize(&mut self, template_args: &[String]) -> Result<(), ConfigError> {
        if !template_args.is_empty() {
            self.command.template = template_args.join(" ");
        }
        if self.command.template.is_empty() {
            return Err(ConfigError::Invalid {
                field: "command.template",
                reason: "a command template is required".to_string(),
            });
        }
        if self.job.spool_dir.is_empty() {
            return Err(ConfigError::Invalid {
                field: "job.spool_dir",
                reason: "a spool directory is required".to_string(),
            });
        }
        check_duration("job.pull_interval", self.job.pull_interval)?;
        check_duration("job.ack_deadline", self.job.ack_deadline)?;
        check_duration("job.sustainer.delay", self.job.sustainer.delay)?;
        check_duration("job.sustainer.interval", self.job.sustainer.interval)?;
        if self.storage.root.is_empty() {
            return Err(ConfigError::Invalid {
                field: "storage.root",
                reason: "a storage root directory is required".to_string(),
            });
        }
        let scheme = self.storage.scheme();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                field: "storage.scheme",
                reason: format!("`{scheme}` is not a lowercase url scheme"),
            });
        }
        if let Some(level) = self.progress.level.as_deref() {
            if Level::from_str(level).is_err() {
                return Err(ConfigError::Invalid {
                    field: "progress.level",
                    reason: format!("unknown log level `{level}`"),
                });
            }
        }
        if self.progress.hostname.is_none() {
            self.progress.hostname =
                Some(std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()));
        }
        Ok(())
    }
}
