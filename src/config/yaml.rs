//! YAML pipeline definitions.
//!
//! Parses pipeline files into [`PipelineConfig`] and validates everything
//! that can be checked without building the graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::error::ConfigError;
use crate::core::schedule::Schedule;

/// A pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    /// Cron expression or shortcut, optionally with a timezone.
    pub schedule: Option<ScheduleConfig>,
    /// No schedule tick before this instant produces a run.
    pub start_date: Option<DateTime<Utc>>,
    /// Run every missed tick instead of only the latest one.
    #[serde(default)]
    pub catchup: bool,
    pub max_active_tasks: Option<usize>,
    pub max_active_runs: Option<usize>,
    /// Retry settings applied to every task without its own.
    #[serde(default)]
    pub default_args: DefaultArgs,
    /// Named external systems referenced by tasks.
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub tasks: Vec<TaskConfig>,
    /// Each chain adds an edge between consecutive task ids.
    #[serde(default)]
    pub chains: Vec<Vec<String>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    Simple(String),
    Detailed {
        cron: String,
        timezone: Option<String>,
    },
}

impl ScheduleConfig {
    pub fn cron(&self) -> &str {
        match self {
            ScheduleConfig::Simple(s) => s,
            ScheduleConfig::Detailed { cron, .. } => cron,
        }
    }

    pub fn timezone(&self) -> Option<&str> {
        match self {
            ScheduleConfig::Simple(_) => None,
            ScheduleConfig::Detailed { timezone, .. } => timezone.as_deref(),
        }
    }

    pub fn to_schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(Schedule::with_timezone(
            self.cron(),
            self.timezone().unwrap_or("UTC"),
        )?)
    }
}

/// Pipeline-wide task defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultArgs {
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay_secs: 300,
        }
    }
}

/// An external system tasks talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// A SQL command-line client that accepts `-e <statement>`.
    Hive {
        #[serde(default = "default_hive_program")]
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Spark {
        master: String,
        #[serde(default = "default_spark_program")]
        program: String,
        #[serde(default)]
        verbose: bool,
    },
    Slack {
        /// Environment variable holding the bot token.
        #[serde(default = "default_slack_token_env")]
        token_env: String,
        base_url: Option<String>,
    },
    /// A sendmail-compatible program reading a message on stdin.
    Sendmail {
        #[serde(default = "default_sendmail_program")]
        program: String,
        #[serde(default = "default_sendmail_args")]
        args: Vec<String>,
    },
}

impl ConnectionConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::Hive { .. } => "hive",
            ConnectionConfig::Spark { .. } => "spark",
            ConnectionConfig::Slack { .. } => "slack",
            ConnectionConfig::Sendmail { .. } => "sendmail",
        }
    }
}

fn default_hive_program() -> String {
    "beeline".to_string()
}

fn default_spark_program() -> String {
    "spark-submit".to_string()
}

fn default_slack_token_env() -> String {
    "SLACK_API_TOKEN".to_string()
}

fn default_sendmail_program() -> String {
    "sendmail".to_string()
}

fn default_sendmail_args() -> Vec<String> {
    vec!["-t".to_string()]
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier (unique within the pipeline).
    pub id: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub action: ActionConfig,
    /// Upstream task ids, in addition to any chains.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides `default_args.retries`.
    pub retries: Option<u32>,
    /// Overrides `default_args.retry_delay_secs`.
    pub retry_delay_secs: Option<u64>,
}

/// What a task does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// A program with arguments.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        environment: BTreeMap<String, String>,
        working_dir: Option<String>,
        timeout_secs: Option<u64>,
    },
    /// A script run with `sh -c`.
    Shell {
        script: String,
        #[serde(default)]
        environment: BTreeMap<String, String>,
        working_dir: Option<String>,
        timeout_secs: Option<u64>,
    },
    FileSensor {
        path: String,
        #[serde(default = "default_poke_interval_secs")]
        poke_interval_secs: u64,
        #[serde(default = "default_sensor_timeout_secs")]
        timeout_secs: u64,
    },
    Ddl {
        connection: String,
        statement: String,
    },
    SparkSubmit {
        connection: String,
        application: String,
        /// Spark application name; defaults to the task id.
        name: Option<String>,
        #[serde(default)]
        application_args: Vec<String>,
        #[serde(default)]
        conf: BTreeMap<String, String>,
    },
    Email {
        to: Vec<String>,
        subject: String,
        html_content: String,
        from: Option<String>,
        /// A `sendmail` connection; `sendmail -t` when absent.
        connection: Option<String>,
    },
    Slack {
        connection: String,
        channel: String,
        text: String,
        username: Option<String>,
    },
}

fn default_poke_interval_secs() -> u64 {
    60
}

fn default_sensor_timeout_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl ActionConfig {
    /// The connection this action needs, with the connection type it expects.
    pub fn connection(&self) -> Option<(&str, &'static str)> {
        match self {
            ActionConfig::Ddl { connection, .. } => Some((connection, "hive")),
            ActionConfig::SparkSubmit { connection, .. } => Some((connection, "spark")),
            ActionConfig::Slack { connection, .. } => Some((connection, "slack")),
            ActionConfig::Email {
                connection: Some(connection),
                ..
            } => Some((connection, "sendmail")),
            _ => None,
        }
    }

    pub fn is_sensor(&self) -> bool {
        matches!(self, ActionConfig::FileSensor { .. })
    }
}

/// YAML pipeline loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a pipeline configuration from a file.
    pub fn load_pipeline_config(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_pipeline_config(&config)?;
        Ok(config)
    }

    /// Parse a pipeline configuration from a YAML string.
    pub fn parse_pipeline_config(yaml: &str) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Self::validate_pipeline_config(&config)?;
        Ok(config)
    }

    /// Checks that need no graph. Graph errors (cycles, unknown or duplicate
    /// tasks) are reported when the pipeline is built.
    fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }
        if config.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }
        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "pipeline must have at least one task".into(),
            ));
        }
        if config.max_active_tasks == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_active_tasks cannot be zero".into(),
            ));
        }
        if config.max_active_runs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_active_runs cannot be zero".into(),
            ));
        }
        if let Some(schedule) = &config.schedule {
            schedule.to_schedule()?;
        }

        for task in &config.tasks {
            if task.id.trim().is_empty() {
                return Err(ConfigError::MissingField("tasks[].id".into()));
            }

            if let Some((name, expected)) = task.action.connection() {
                let connection = config.connections.get(name).ok_or_else(|| {
                    ConfigError::InvalidConfig(format!(
                        "task '{}' references unknown connection '{name}'",
                        task.id
                    ))
                })?;
                if connection.kind() != expected {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' needs a {expected} connection, but '{name}' is {}",
                        task.id,
                        connection.kind()
                    )));
                }
            }

            if let ActionConfig::FileSensor {
                poke_interval_secs,
                timeout_secs,
                ..
            } = &task.action
                && (*poke_interval_secs == 0 || *timeout_secs == 0)
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "sensor '{}' needs a non-zero poke interval and timeout",
                    task.id
                )));
            }
        }

        for chain in &config.chains {
            if chain.is_empty() {
                return Err(ConfigError::InvalidConfig("empty chain".into()));
            }
        }

        Ok(())
    }
}
