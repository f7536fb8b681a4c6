//! External command action.
//!
//! [`CommandAction`] runs a program (or a `sh -c` script) as a task's action.
//! The child process is killed if the attempt is cancelled or times out.
//!
//! Every child sees the run's identity in its environment:
//!
//! | Variable | Value |
//! |---|---|
//! | `DAGRUN_DAG_ID` | pipeline id |
//! | `DAGRUN_RUN_ID` | run id |
//! | `DAGRUN_TASK_ID` | task id |
//! | `DAGRUN_LOGICAL_DATE` | logical date, RFC 3339 |
//! | `DAGRUN_ATTEMPT` | 1-based attempt number |
//!
//! Arguments may use `{{ ds }}` (logical date as `YYYY-MM-DD`) and
//! `{{ run_id }}`; both are substituted before launch.
//!
//! ```rust
//! use dagrun::CommandAction;
//! use std::time::Duration;
//!
//! let download = CommandAction::shell(
//!     "curl -o /tmp/Customer.csv https://example.com/DIM_Customer.csv",
//! )
//! .timeout(Duration::from_secs(300))
//! .build();
//! assert_eq!(download.program(), "sh");
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::task::{Action, ActionContext, ActionError};

/// Bytes of stderr kept in a [`ActionError::CommandFailed`].
const STDERR_TAIL_BYTES: usize = 2048;

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// An action that executes an external command.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    stdin: Option<String>,
    kind: &'static str,
}

impl CommandAction {
    pub fn builder(program: impl Into<String>) -> CommandActionBuilder {
        CommandActionBuilder::new(program)
    }

    /// A builder for `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> CommandActionBuilder {
        CommandActionBuilder::new("sh").arg("-c").arg(script)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the command and return its output whatever the exit code.
    ///
    /// Fails only if the process cannot be started, the timeout elapses, or
    /// the attempt is cancelled.
    pub async fn run(&self, ctx: &ActionContext) -> Result<CommandOutput, ActionError> {
        let args: Vec<String> = self.args.iter().map(|a| render(a, ctx)).collect();
        debug!(program = %self.program, ?args, "spawning command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .envs(&self.env)
            .env("DAGRUN_DAG_ID", ctx.dag_id.as_str())
            .env("DAGRUN_RUN_ID", ctx.run_id.to_string())
            .env("DAGRUN_TASK_ID", ctx.task_id.as_str())
            .env("DAGRUN_LOGICAL_DATE", ctx.logical_date.to_rfc3339())
            .env("DAGRUN_ATTEMPT", ctx.attempt.to_string())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ActionError::Failed(format!("failed to start '{}': {e}", self.program))
        })?;

        // Stdin is fed while the output is collected, both under the
        // timeout and cancellation.
        let pipe = child.stdin.take();
        let feed = async move {
            match (pipe, &self.stdin) {
                (Some(mut pipe), Some(input)) => match pipe.write_all(input.as_bytes()).await {
                    // The child may exit without reading all of its input.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                },
                _ => Ok(()),
            }
        };
        let work = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(|e| ActionError::Failed(format!("failed to write stdin: {e}")))?;
            output.map_err(|e| ActionError::Failed(e.to_string()))
        };

        let output = tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(ActionError::Cancelled),
            result = with_timeout(self.timeout, work) => result??,
        };

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let output = self.run(ctx).await?;
        debug!(code = output.code, stdout = %output.stdout.trim_end(), "command finished");
        if output.code == 0 {
            Ok(())
        } else {
            Err(ActionError::CommandFailed {
                code: output.code,
                stderr: tail(output.stderr.trim_end(), STDERR_TAIL_BYTES).to_string(),
            })
        }
    }

    fn kind(&self) -> &'static str {
        self.kind
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, ActionError>
where
    F: std::future::Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ActionError::Failed(format!("command timed out after {limit:?}"))),
        None => Ok(fut.await),
    }
}

/// Substitute `{{ ds }}` and `{{ run_id }}`.
fn render(arg: &str, ctx: &ActionContext) -> String {
    if !arg.contains("{{") {
        return arg.to_string();
    }
    arg.replace("{{ ds }}", &ctx.logical_date.format("%Y-%m-%d").to_string())
        .replace("{{ run_id }}", &ctx.run_id.to_string())
}

/// The last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Builder for [`CommandAction`].
#[derive(Debug, Clone)]
pub struct CommandActionBuilder {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    stdin: Option<String>,
    kind: &'static str,
}

impl CommandActionBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
            stdin: None,
            kind: "command",
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Text written to the child's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Operator name reported by [`Action::kind`].
    pub(crate) fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    pub fn build(self) -> CommandAction {
        CommandAction {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            timeout: self.timeout,
            stdin: self.stdin,
            kind: self.kind,
        }
    }
}
