//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::dag::DagError;
use crate::core::schedule::ScheduleError;

/// Errors that can occur when loading a pipeline definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read directory '{path}': {source}")]
    DirRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("YAML parse error in '{path}': {source}")]
    YamlFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    /// The tasks and edges do not form a valid graph.
    #[error("invalid graph: {0}")]
    Graph(#[from] DagError),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}
