//! Configuration loading and parsing.
//!
//! Pipelines are defined in YAML files; see [`PipelineConfig`] for the format.

mod builder;
mod error;
mod yaml;

pub use builder::{PipelineConfigBuilder, load_pipeline, load_pipelines_from_directory};
pub use error::ConfigError;
pub use yaml::{
    ActionConfig, ConnectionConfig, DefaultArgs, PipelineConfig, ScheduleConfig, TaskConfig,
    YamlLoader,
};
