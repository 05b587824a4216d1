use crate::config::HandlerConfig;
use anyhow::{bail, Context};
use async_trait::async_trait;
use hg_push_core::{PushEvent, RepositoryId};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Receiver of decoded push batches.
///
/// Any error is treated as a failed attempt by the consumer; what counts as
/// success is entirely up to the implementation.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle_pushes(
        &self,
        repository_id: &RepositoryId,
        pushes: &[PushEvent],
        close_connection: bool,
    ) -> anyhow::Result<()>;
}

/// Document handed to out-of-process handlers
#[derive(Debug, Serialize)]
pub struct PushBatch<'a> {
    pub repository_id: &'a RepositoryId,
    pub pushes: Vec<&'a Map<String, Value>>,
    pub close_connection: bool,
}

impl<'a> PushBatch<'a> {
    pub fn new(repository_id: &'a RepositoryId, pushes: &'a [PushEvent], close_connection: bool) -> Self {
        PushBatch {
            repository_id,
            pushes: pushes.iter().map(|p| &p.payload).collect(),
            close_connection,
        }
    }
}

/// Posts each batch as JSON to an HTTP endpoint
pub struct HttpPushHandler {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpPushHandler {
    pub fn new(url: impl Into<String>, bearer_token: Option<String>) -> Self {
        HttpPushHandler {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer_token,
        }
    }
}

#[async_trait]
impl PushHandler for HttpPushHandler {
    async fn handle_pushes(
        &self,
        repository_id: &RepositoryId,
        pushes: &[PushEvent],
        close_connection: bool,
    ) -> anyhow::Result<()> {
        let batch = PushBatch::new(repository_id, pushes, close_connection);

        let mut request = self.client.post(&self.url).json(&batch);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("push handler at {} rejected the batch", self.url))?;

        Ok(())
    }
}

/// Runs a program per batch, feeding the JSON document on stdin
pub struct CommandPushHandler {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandPushHandler {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        CommandPushHandler {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PushHandler for CommandPushHandler {
    async fn handle_pushes(
        &self,
        repository_id: &RepositoryId,
        pushes: &[PushEvent],
        close_connection: bool,
    ) -> anyhow::Result<()> {
        let document = serde_json::to_vec(&PushBatch::new(repository_id, pushes, close_connection))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&document).await {
                Ok(()) => {}
                // the program may exit without reading everything; its status decides
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e).context("failed to write push batch to stdin"),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.trim().lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                tail
            );
        }

        Ok(())
    }
}

pub fn handler_from_config(config: &HandlerConfig) -> Arc<dyn PushHandler> {
    match config {
        HandlerConfig::Http { url, bearer_token } => {
            Arc::new(HttpPushHandler::new(url.clone(), bearer_token.clone()))
        }
        HandlerConfig::Command { program, args } => {
            Arc::new(CommandPushHandler::new(program.clone(), args.clone()))
        }
    }
}
