//! Spark job submission.

use async_trait::async_trait;

use super::command::CommandAction;
use crate::core::task::{Action, ActionContext, ActionError};

/// Submits an application with `spark-submit`.
#[derive(Debug, Clone)]
pub struct SparkSubmitAction {
    application: String,
    command: CommandAction,
}

impl SparkSubmitAction {
    pub fn builder(application: impl Into<String>) -> SparkSubmitBuilder {
        SparkSubmitBuilder::new(application)
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn command(&self) -> &CommandAction {
        &self.command
    }
}

#[async_trait]
impl Action for SparkSubmitAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.command.execute(ctx).await
    }

    fn kind(&self) -> &'static str {
        "spark_submit"
    }
}

#[derive(Debug, Clone)]
pub struct SparkSubmitBuilder {
    program: String,
    application: String,
    master: Option<String>,
    name: Option<String>,
    verbose: bool,
    conf: Vec<(String, String)>,
    application_args: Vec<String>,
}

impl SparkSubmitBuilder {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            program: "spark-submit".to_string(),
            application: application.into(),
            master: None,
            name: None,
            verbose: false,
            conf: Vec::new(),
            application_args: Vec::new(),
        }
    }

    /// Path of the submit script, `spark-submit` by default.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn conf(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conf.push((key.into(), value.into()));
        self
    }

    pub fn application_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.application_args
            .extend(args.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> SparkSubmitAction {
        let mut command = CommandAction::builder(self.program).kind("spark_submit");
        if let Some(master) = self.master {
            command = command.args(["--master".to_string(), master]);
        }
        if let Some(name) = self.name {
            command = command.args(["--name".to_string(), name]);
        }
        for (key, value) in self.conf {
            command = command.args(["--conf".to_string(), format!("{key}={value}")]);
        }
        if self.verbose {
            command = command.arg("--verbose");
        }
        let command = command
            .arg(self.application.clone())
            .args(self.application_args)
            .build();

        SparkSubmitAction {
            application: self.application,
            command,
        }
    }
}
