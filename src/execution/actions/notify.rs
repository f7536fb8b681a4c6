//! Completion notifications: email and Slack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::command::CommandAction;
use crate::core::task::{Action, ActionContext, ActionError};

/// Sends an HTML email by piping an RFC 822 message to a sendmail-compatible
/// program (`sendmail -t` by default).
#[derive(Debug, Clone)]
pub struct EmailAction {
    to: Vec<String>,
    subject: String,
    html_content: String,
    from: Option<String>,
    program: String,
    args: Vec<String>,
}

impl EmailAction {
    pub fn new(
        to: impl IntoIterator<Item = impl Into<String>>,
        subject: impl Into<String>,
        html_content: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            html_content: html_content.into(),
            from: None,
            program: "sendmail".to_string(),
            args: vec!["-t".to_string()],
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Use another mail transfer program; it receives the message on stdin.
    pub fn with_program<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The full message handed to the mail program.
    pub fn message(&self) -> String {
        let mut message = String::new();
        if let Some(from) = &self.from {
            message.push_str(&format!("From: {from}\r\n"));
        }
        message.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        message.push_str(&format!("Subject: {}\r\n", self.subject));
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/html; charset=utf-8\r\n");
        message.push_str("\r\n");
        message.push_str(&self.html_content);
        message.push_str("\r\n");
        message
    }
}

#[async_trait]
impl Action for EmailAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        if self.to.is_empty() {
            return Err(ActionError::Misconfigured("email has no recipients".into()));
        }
        let command = CommandAction::builder(&self.program)
            .args(self.args.iter().cloned())
            .stdin(self.message())
            .kind("email")
            .build();
        command.execute(ctx).await?;
        info!(to = %self.to.join(", "), subject = %self.subject, "email sent");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "email"
    }
}

/// Default Slack Web API base URL.
pub const SLACK_API_URL: &str = "https://slack.com/api";

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts a message with Slack's `chat.postMessage`.
///
/// The bearer token is read from the environment variable `token_env` at
/// execution time, so it never appears in pipeline files. An explicit token
/// set with [`SlackAction::with_token`] takes precedence.
#[derive(Clone)]
pub struct SlackAction {
    channel: String,
    text: String,
    username: Option<String>,
    token_env: String,
    token: Option<String>,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl SlackAction {
    pub fn new(
        channel: impl Into<String>,
        text: impl Into<String>,
        token_env: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            username: None,
            token_env: token_env.into(),
            token: None,
            base_url: SLACK_API_URL.to_string(),
            timeout: Duration::from_secs(30),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Use this token instead of reading `token_env`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_env(&self) -> &str {
        &self.token_env
    }

    fn resolve_token(&self) -> Result<String, ActionError> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        std::env::var(&self.token_env).map_err(|_| {
            ActionError::Misconfigured(format!(
                "environment variable {} is not set",
                self.token_env
            ))
        })
    }
}

impl std::fmt::Debug for SlackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackAction")
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("token_env", &self.token_env)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for SlackAction {
    async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
        let token = self.resolve_token()?;

        let url = format!("{}/chat.postMessage", self.base_url);
        debug!(%url, channel = %self.channel, "posting slack message");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(&SlackMessage {
                channel: &self.channel,
                text: &self.text,
                username: self.username.as_deref(),
            })
            .send()
            .await
            .map_err(|e| ActionError::Failed(format!("slack request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ActionError::Failed(format!("slack returned HTTP {status}")));
        }

        let body: SlackResponse = response
            .json()
            .await
            .map_err(|e| ActionError::Failed(format!("invalid slack response: {e}")))?;
        if !body.ok {
            return Err(ActionError::Failed(format!(
                "slack rejected message: {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        info!(channel = %self.channel, "slack message posted");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "slack"
    }
}
