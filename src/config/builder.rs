//! Pipeline builder from YAML configuration.
//!
//! Converts a [`PipelineConfig`] into a runnable [`Pipeline`]: one action per
//! task, edges from `chains` and `depends_on`, retry policies from
//! `default_args` with per-task overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::core::dag::GraphBuilder;
use crate::core::pipeline::Pipeline;
use crate::core::retry::RetryPolicy;
use crate::core::task::{Action, Task};
use crate::execution::actions::{
    CommandAction, DdlAction, EmailAction, SensorAction, SlackAction, SparkSubmitAction,
};

use super::error::ConfigError;
use super::yaml::{ActionConfig, ConnectionConfig, PipelineConfig, TaskConfig, YamlLoader};

/// Builder for creating Pipelines from YAML configuration.
pub struct PipelineConfigBuilder;

impl PipelineConfigBuilder {
    pub fn build(config: PipelineConfig) -> Result<Pipeline, ConfigError> {
        let default_retry = RetryPolicy::fixed(
            config.default_args.retries,
            Duration::from_secs(config.default_args.retry_delay_secs),
        );

        let mut builder = GraphBuilder::new(config.id.as_str(), config.name.as_str());

        for task_config in &config.tasks {
            let action = Self::build_action(task_config, &config.connections)?;
            let mut task = Task::new(task_config.id.as_str(), action)
                .with_retry(Self::retry_policy(task_config, &default_retry));
            if let Some(description) = &task_config.description {
                task = task.with_description(description);
            }
            builder = builder.task(task);
        }

        for chain in &config.chains {
            builder = builder.chain(chain);
        }
        for task_config in &config.tasks {
            if !task_config.depends_on.is_empty() {
                builder = builder.depends_on(&task_config.id, &task_config.depends_on);
            }
        }

        let graph = builder.build()?;
        debug!(pipeline = %config.id, tasks = graph.len(), "built pipeline graph");

        let mut pipeline = Pipeline::new(graph)
            .with_catchup(config.catchup)
            .with_enabled(config.enabled);
        if let Some(schedule) = &config.schedule {
            pipeline = pipeline.with_schedule(schedule.to_schedule()?);
        }
        if let Some(start_date) = config.start_date {
            pipeline = pipeline.with_start_date(start_date);
        }
        if let Some(owner) = config.owner {
            pipeline = pipeline.with_owner(owner);
        }
        if let Some(description) = config.description {
            pipeline = pipeline.with_description(description);
        }
        if let Some(max) = config.max_active_tasks {
            pipeline = pipeline.with_max_active_tasks(max);
        }
        if let Some(max) = config.max_active_runs {
            pipeline = pipeline.with_max_active_runs(max);
        }

        Ok(pipeline)
    }

    /// Per-task values win over the defaults. Sensors do not inherit the
    /// default retries.
    fn retry_policy(task: &TaskConfig, default: &RetryPolicy) -> RetryPolicy {
        let inherited = if task.action.is_sensor() {
            RetryPolicy::none()
        } else {
            default.clone()
        };
        RetryPolicy::fixed(
            task.retries.unwrap_or(inherited.retries),
            task.retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(default.delay),
        )
    }

    fn build_action(
        task: &TaskConfig,
        connections: &BTreeMap<String, ConnectionConfig>,
    ) -> Result<Arc<dyn Action>, ConfigError> {
        let connection = |name: &str| {
            connections.get(name).ok_or_else(|| {
                ConfigError::InvalidConfig(format!(
                    "task '{}' references unknown connection '{name}'",
                    task.id
                ))
            })
        };
        let mismatch = |name: &str, expected: &str| {
            ConfigError::InvalidConfig(format!(
                "task '{}' needs a {expected} connection, but '{name}' is not one",
                task.id
            ))
        };

        let action: Arc<dyn Action> = match &task.action {
            ActionConfig::Command {
                command,
                args,
                environment,
                working_dir,
                timeout_secs,
            } => {
                let mut builder = CommandAction::builder(command)
                    .args(args.iter().cloned())
                    .envs(environment.clone());
                if let Some(dir) = working_dir {
                    builder = builder.working_dir(dir);
                }
                if let Some(secs) = timeout_secs {
                    builder = builder.timeout(Duration::from_secs(*secs));
                }
                Arc::new(builder.build())
            }
            ActionConfig::Shell {
                script,
                environment,
                working_dir,
                timeout_secs,
            } => {
                let mut builder = CommandAction::shell(script).envs(environment.clone());
                if let Some(dir) = working_dir {
                    builder = builder.working_dir(dir);
                }
                if let Some(secs) = timeout_secs {
                    builder = builder.timeout(Duration::from_secs(*secs));
                }
                Arc::new(builder.build())
            }
            ActionConfig::FileSensor {
                path,
                poke_interval_secs,
                timeout_secs,
            } => Arc::new(SensorAction::file(
                path,
                Duration::from_secs(*poke_interval_secs),
                Duration::from_secs(*timeout_secs),
            )),
            ActionConfig::Ddl {
                connection: name,
                statement,
            } => match connection(name)? {
                ConnectionConfig::Hive { program, args } => {
                    Arc::new(DdlAction::new(program, args.iter().cloned(), statement))
                }
                _ => return Err(mismatch(name, "hive")),
            },
            ActionConfig::SparkSubmit {
                connection: name,
                application,
                name: app_name,
                application_args,
                conf,
            } => match connection(name)? {
                ConnectionConfig::Spark {
                    master,
                    program,
                    verbose,
                } => {
                    let mut builder = SparkSubmitAction::builder(application)
                        .program(program)
                        .master(master)
                        .name(app_name.clone().unwrap_or_else(|| task.id.clone()))
                        .verbose(*verbose)
                        .application_args(application_args.iter().cloned());
                    for (key, value) in conf {
                        builder = builder.conf(key, value);
                    }
                    Arc::new(builder.build())
                }
                _ => return Err(mismatch(name, "spark")),
            },
            ActionConfig::Email {
                to,
                subject,
                html_content,
                from,
                connection: name,
            } => {
                let mut email = EmailAction::new(to.iter().cloned(), subject, html_content);
                if let Some(from) = from {
                    email = email.with_from(from);
                }
                if let Some(name) = name {
                    match connection(name)? {
                        ConnectionConfig::Sendmail { program, args } => {
                            email = email.with_program(program, args.iter().cloned());
                        }
                        _ => return Err(mismatch(name, "sendmail")),
                    }
                }
                Arc::new(email)
            }
            ActionConfig::Slack {
                connection: name,
                channel,
                text,
                username,
            } => match connection(name)? {
                ConnectionConfig::Slack {
                    token_env,
                    base_url,
                } => {
                    let mut slack = SlackAction::new(channel, text, token_env);
                    if let Some(username) = username {
                        slack = slack.with_username(username);
                    }
                    if let Some(base_url) = base_url {
                        slack = slack.with_base_url(base_url);
                    }
                    Arc::new(slack)
                }
                _ => return Err(mismatch(name, "slack")),
            },
        };
        Ok(action)
    }
}

/// Load and build one pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline, ConfigError> {
    let config = YamlLoader::load_pipeline_config(path)?;
    PipelineConfigBuilder::build(config)
}

/// Load every `*.yaml` / `*.yml` pipeline in a directory, ordered by file name.
pub fn load_pipelines_from_directory(dir: impl AsRef<Path>) -> Result<Vec<Pipeline>, ConfigError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let read_dir_err = |source| ConfigError::DirRead {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir_err)? {
        let path = entry.map_err(read_dir_err)?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pipelines = Vec::with_capacity(paths.len());
    for path in paths {
        pipelines.push(load_pipeline(&path)?);
    }
    Ok(pipelines)
}
