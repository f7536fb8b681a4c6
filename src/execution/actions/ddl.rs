//! SQL DDL through a command-line client.

use async_trait::async_trait;

use super::command::CommandAction;
use crate::core::task::{Action, ActionContext, ActionError};

/// Runs one statement with `<program> <args...> -e <statement>`.
///
/// The client and its connection arguments come from a configured
/// connection, e.g. `beeline -u jdbc:hive2://hive-server:10000`.
#[derive(Debug, Clone)]
pub struct DdlAction {
    statement: String,
    command: CommandAction,
}

impl DdlAction {
    pub fn new<I, S>(program: impl Into<String>, args: I, statement: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statement = statement.into();
        let command = CommandAction::builder(program)
            .args(args)
            .arg("-e")
            .arg(statement.clone())
            .kind("ddl")
            .build();
        Self { statement, command }
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn command(&self) -> &CommandAction {
        &self.command
    }
}

#[async_trait]
impl Action for DdlAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.command.execute(ctx).await
    }

    fn kind(&self) -> &'static str {
        "ddl"
    }
}
