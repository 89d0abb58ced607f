use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{
    alerts::{DispatcherConfig, JiraConfig},
    anomaly::{AnomalyEngine, RuleConfig},
    detector::{DetectorConfig, GithubConfig},
    kubernetes::WatcherConfig,
    logs::StreamerConfig,
    store::{DatabaseConfig, DatabaseType},
    template::AlertTemplates,
    Error, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub kube: KubeConfig,
    pub ci: CiConfig,
    pub detector: DetectorConfig,
    pub streamer: StreamerConfig,
    pub watcher: WatcherConfig,
    pub rules: RuleConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// When false, pod events and pod logs are not followed.
    pub enabled: bool,
    pub namespace: String,
    /// `k=v,k2=v2` selector for the workload pods of a run.
    pub label_selector: String,
}

impl KubeConfig {
    pub fn labels(&self) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        for pair in self.label_selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("Invalid label selector term '{}': expected key=value", pair)))?;
            labels.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(labels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunSourceKind {
    Github,
    Process,
}

impl FromStr for RunSourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "github" => Ok(RunSourceKind::Github),
            "process" | "local" => Ok(RunSourceKind::Process),
            other => Err(Error::Config(format!("Unknown run source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    pub source: RunSourceKind,
    pub github: GithubConfig,
    /// Command-line substring identifying a local test run.
    pub process_pattern: String,
    pub proc_root: PathBuf,
    /// Log files tailed for every run, in addition to pod logs.
    pub log_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Stdout,
    Slack,
    Ticket,
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(ChannelKind::Stdout),
            "slack" => Ok(ChannelKind::Slack),
            "ticket" | "jira" => Ok(ChannelKind::Ticket),
            other => Err(Error::Config(format!("Unknown alert channel '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub channels: Vec<ChannelKind>,
    pub stdout_format: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_channel: Option<String>,
    pub jira: Option<JiraConfig>,
    pub dispatcher: DispatcherConfig,
    /// Tera template replacing the default alert body.
    pub body_template: Option<String>,
    /// `prefix=subsystem,...` rules for the structure analyzer.
    pub subsystem_rules: Option<String>,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: '{}'", key, raw))),
        None => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let db_type = match env("DATABASE_TYPE").unwrap_or_else(|| "sqlite".to_string()).to_lowercase().as_str() {
            "sqlite" => DatabaseType::Sqlite,
            "memory" => DatabaseType::Memory,
            other => return Err(Error::Config(format!("Unknown DATABASE_TYPE '{}'", other))),
        };

        let channels = match env("ALERT_CHANNELS") {
            Some(raw) => raw
                .split(',')
                .filter(|c| !c.trim().is_empty())
                .map(ChannelKind::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.alerts.channels.clone(),
        };

        let jira = match env("JIRA_BASE_URL") {
            Some(base_url) => Some(JiraConfig {
                base_url,
                project: env("JIRA_PROJECT").unwrap_or_default(),
                issue_type: env("JIRA_ISSUE_TYPE").unwrap_or_else(|| "Bug".to_string()),
                user: env("JIRA_USER").unwrap_or_default(),
                token: env("JIRA_TOKEN").unwrap_or_default(),
                link_to: env("JIRA_LINK_TO"),
            }),
            None => None,
        };

        let config = Config {
            server: ServerConfig {
                addr: env("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            database: DatabaseConfig {
                db_type,
                sqlite_path: env("SQLITE_PATH").map(PathBuf::from).or(defaults.database.sqlite_path),
            },
            kube: KubeConfig {
                enabled: env_parse("KUBE_ENABLED", defaults.kube.enabled)?,
                namespace: env("KUBE_NAMESPACE").unwrap_or(defaults.kube.namespace),
                label_selector: env("KUBE_LABEL_SELECTOR").unwrap_or(defaults.kube.label_selector),
            },
            ci: CiConfig {
                source: env_parse("RUN_SOURCE", defaults.ci.source)?,
                github: GithubConfig {
                    api_url: env("GITHUB_API_URL").unwrap_or(defaults.ci.github.api_url),
                    repository: env("GITHUB_REPOSITORY").unwrap_or_default(),
                    token: env("GITHUB_TOKEN"),
                    workflow: env("GITHUB_WORKFLOW"),
                },
                process_pattern: env("PROCESS_PATTERN").unwrap_or(defaults.ci.process_pattern),
                proc_root: env("PROC_ROOT").map(PathBuf::from).unwrap_or(defaults.ci.proc_root),
                log_files: env("LOG_FILES")
                    .map(|raw| raw.split(',').map(|p| PathBuf::from(p.trim())).collect())
                    .unwrap_or_default(),
            },
            detector: DetectorConfig {
                poll_interval_secs: env_parse("DETECTOR_POLL_INTERVAL_SECS", defaults.detector.poll_interval_secs)?,
                max_run_duration_secs: env_parse("MAX_RUN_DURATION_SECS", defaults.detector.max_run_duration_secs)?,
                retry_attempts: env_parse("DETECTOR_RETRY_ATTEMPTS", defaults.detector.retry_attempts)?,
                retry_base_ms: env_parse("DETECTOR_RETRY_BASE_MS", defaults.detector.retry_base_ms)?,
                retry_max_ms: env_parse("DETECTOR_RETRY_MAX_MS", defaults.detector.retry_max_ms)?,
            },
            streamer: StreamerConfig {
                buffer_capacity: env_parse("LOG_BUFFER_CAPACITY", defaults.streamer.buffer_capacity)?,
                reconnect_attempts: env_parse("LOG_RECONNECT_ATTEMPTS", defaults.streamer.reconnect_attempts)?,
                reconnect_base_ms: env_parse("LOG_RECONNECT_BASE_MS", defaults.streamer.reconnect_base_ms)?,
                reconnect_max_ms: env_parse("LOG_RECONNECT_MAX_MS", defaults.streamer.reconnect_max_ms)?,
            },
            watcher: WatcherConfig {
                crash_loop_threshold: env_parse("CRASH_LOOP_THRESHOLD", defaults.watcher.crash_loop_threshold)?,
                crash_loop_window_secs: env_parse("CRASH_LOOP_WINDOW_SECS", defaults.watcher.crash_loop_window_secs)?,
                reconnect_attempts: env_parse("WATCH_RECONNECT_ATTEMPTS", defaults.watcher.reconnect_attempts)?,
                reconnect_base_ms: env_parse("WATCH_RECONNECT_BASE_MS", defaults.watcher.reconnect_base_ms)?,
                reconnect_max_ms: env_parse("WATCH_RECONNECT_MAX_MS", defaults.watcher.reconnect_max_ms)?,
            },
            rules: RuleConfig {
                error_burst_threshold: env_parse("ERROR_BURST_THRESHOLD", defaults.rules.error_burst_threshold)?,
                error_burst_window_secs: env_parse("ERROR_BURST_WINDOW_SECS", defaults.rules.error_burst_window_secs)?,
                crash_threshold: env_parse("CRASH_THRESHOLD", defaults.rules.crash_threshold)?,
                crash_window_secs: env_parse("CRASH_WINDOW_SECS", defaults.rules.crash_window_secs)?,
                max_run_duration_secs: env_parse("MAX_RUN_DURATION_SECS", defaults.rules.max_run_duration_secs)?,
                resource_pattern: env("RESOURCE_EXHAUSTION_PATTERN").unwrap_or(defaults.rules.resource_pattern),
            },
            alerts: AlertsConfig {
                channels,
                stdout_format: env("ALERT_STDOUT_FORMAT"),
                slack_webhook_url: env("SLACK_WEBHOOK_URL"),
                slack_channel: env("SLACK_CHANNEL"),
                jira,
                dispatcher: DispatcherConfig {
                    retry_attempts: env_parse("ALERT_RETRY_ATTEMPTS", defaults.alerts.dispatcher.retry_attempts)?,
                    retry_base_ms: env_parse("ALERT_RETRY_BASE_MS", defaults.alerts.dispatcher.retry_base_ms)?,
                    retry_max_ms: env_parse("ALERT_RETRY_MAX_MS", defaults.alerts.dispatcher.retry_max_ms)?,
                },
                body_template: env("ALERT_BODY_TEMPLATE"),
                subsystem_rules: env("SUBSYSTEM_RULES"),
            },
        };

        Ok(config)
    }

    /// Reject configurations that cannot monitor anything. Runs before any
    /// connection or subscription is attempted.
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.kube.labels()?;

        if self.ci.source == RunSourceKind::Github && self.ci.github.repository.trim().is_empty() {
            return Err(Error::Config(
                "GITHUB_REPOSITORY must be set when RUN_SOURCE=github".to_string(),
            ));
        }
        if self.detector.poll_interval_secs == 0 {
            return Err(Error::Config("DETECTOR_POLL_INTERVAL_SECS must be positive".to_string()));
        }
        if self.streamer.buffer_capacity == 0 {
            return Err(Error::Config("LOG_BUFFER_CAPACITY must be positive".to_string()));
        }
        if self.rules.error_burst_threshold == 0 || self.rules.crash_threshold == 0 {
            return Err(Error::Config("Anomaly thresholds must be positive".to_string()));
        }
        AnomalyEngine::new(self.rules.clone())?;
        AlertTemplates::new(self.alerts.body_template.as_deref())?;

        if self.alerts.channels.is_empty() {
            return Err(Error::Config("At least one alert channel must be configured".to_string()));
        }
        for channel in &self.alerts.channels {
            match channel {
                ChannelKind::Stdout => {}
                ChannelKind::Slack => {
                    let url = self.alerts.slack_webhook_url.as_deref().ok_or_else(|| {
                        Error::Config("SLACK_WEBHOOK_URL must be set for the slack channel".to_string())
                    })?;
                    url::Url::parse(url).map_err(|e| Error::Config(format!("Invalid SLACK_WEBHOOK_URL: {}", e)))?;
                }
                ChannelKind::Ticket => {
                    let jira = self.alerts.jira.as_ref().ok_or_else(|| {
                        Error::Config("JIRA_BASE_URL must be set for the ticket channel".to_string())
                    })?;
                    for (name, value) in [
                        ("JIRA_PROJECT", &jira.project),
                        ("JIRA_USER", &jira.user),
                        ("JIRA_TOKEN", &jira.token),
                    ] {
                        if value.is_empty() {
                            return Err(Error::Config(format!("{} must be set for the ticket channel", name)));
                        }
                    }
                    url::Url::parse(&jira.base_url)
                        .map_err(|e| Error::Config(format!("Invalid JIRA_BASE_URL: {}", e)))?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            kube: KubeConfig {
                enabled: true,
                namespace: "default".to_string(),
                label_selector: String::new(),
            },
            ci: CiConfig {
                source: RunSourceKind::Github,
                github: GithubConfig::default(),
                process_pattern: "pytest".to_string(),
                proc_root: PathBuf::from("/proc"),
                log_files: Vec::new(),
            },
            detector: DetectorConfig::default(),
            streamer: StreamerConfig::default(),
            watcher: WatcherConfig::default(),
            rules: RuleConfig::default(),
            alerts: AlertsConfig {
                channels: vec![ChannelKind::Stdout],
                stdout_format: None,
                slack_webhook_url: None,
                slack_channel: None,
                jira: None,
                dispatcher: DispatcherConfig::default(),
                body_template: None,
                subsystem_rules: None,
            },
        }
    }
}
