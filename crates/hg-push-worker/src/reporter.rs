use crate::config::ErrorReportingConfig;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a push handler failure happened
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub retries: u32,
    pub max_retries: u32,
    pub repository_id: Option<String>,
    pub delivery_tag: u64,
    pub escalated: bool,
}

/// Sink for handler failures.
///
/// Reporting is best-effort: implementations swallow their own errors and
/// only say whether the report went out.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn capture(&self, error: &anyhow::Error, context: &FailureContext) -> bool;
}

/// Used when no reporting credentials are configured
pub struct NoopReporter;

#[async_trait]
impl ErrorReporter for NoopReporter {
    async fn capture(&self, _error: &anyhow::Error, _context: &FailureContext) -> bool {
        true
    }
}

/// Sends events to a Sentry-compatible store endpoint
pub struct SentryReporter {
    client: reqwest::Client,
    store_url: Url,
    auth_header: String,
    environment: Option<String>,
}

impl SentryReporter {
    /// Build from a DSN of the form `https://<key>[:<secret>]@<host>[/<prefix>]/<project>`
    pub fn from_dsn(dsn: &str, environment: Option<String>) -> Result<Self> {
        let dsn_url = Url::parse(dsn)
            .map_err(|e| WorkerError::Config(format!("invalid error reporting DSN: {}", e)))?;

        let key = dsn_url.username();
        if key.is_empty() {
            return Err(WorkerError::Config("error reporting DSN has no public key".to_string()));
        }

        let path = dsn_url.path().trim_end_matches('/');
        let (prefix, project) = match path.rsplit_once('/') {
            Some((prefix, project)) if !project.is_empty() => (prefix, project),
            _ => {
                return Err(WorkerError::Config(
                    "error reporting DSN has no project id".to_string(),
                ))
            }
        };

        let mut store_url = dsn_url.clone();
        store_url.set_path(&format!("{}/api/{}/store/", prefix, project));
        // credentials travel in the auth header, not the URL
        let _ = store_url.set_username("");
        let _ = store_url.set_password(None);

        let mut auth_header = format!(
            "Sentry sentry_version=7, sentry_client=hg-push-worker/{}, sentry_key={}",
            env!("CARGO_PKG_VERSION"),
            key
        );
        if let Some(secret) = dsn_url.password() {
            auth_header.push_str(&format!(", sentry_secret={}", secret));
        }

        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .map_err(|e| WorkerError::Config(format!("failed to build reporting client: {}", e)))?;

        Ok(SentryReporter {
            client,
            store_url,
            auth_header,
            environment,
        })
    }

    pub fn store_url(&self) -> &Url {
        &self.store_url
    }

    pub fn build_event(&self, error: &anyhow::Error, context: &FailureContext) -> Value {
        let exceptions: Vec<Value> = error
            .chain()
            .map(|cause| json!({"type": "Error", "value": cause.to_string()}))
            .rev()
            .collect();

        json!({
            "event_id": Uuid::new_v4().simple().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "level": if context.escalated { "fatal" } else { "error" },
            "logger": "hg_push_worker",
            "platform": "other",
            "environment": self.environment,
            "message": format!("handlePushes failed: {}", context.retries),
            "exception": {"values": exceptions},
            "tags": {
                "escalated": context.escalated.to_string(),
            },
            "extra": {
                "retries": context.retries,
                "max_retries": context.max_retries,
                "repository_id": context.repository_id,
                "delivery_tag": context.delivery_tag,
            },
        })
    }
}

#[async_trait]
impl ErrorReporter for SentryReporter {
    async fn capture(&self, error: &anyhow::Error, context: &FailureContext) -> bool {
        let event = self.build_event(error, context);

        let response = self
            .client
            .post(self.store_url.clone())
            .header("X-Sentry-Auth", &self.auth_header)
            .json(&event)
            .send()
            .await;

        match response.and_then(|r| r.error_for_status()) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to report handler failure: {}", e);
                false
            }
        }
    }
}

/// Pick the reporter once at startup
pub fn reporter_from_config(config: Option<&ErrorReportingConfig>) -> Result<Arc<dyn ErrorReporter>> {
    match config {
        Some(reporting) => Ok(Arc::new(SentryReporter::from_dsn(
            &reporting.dsn,
            reporting.environment.clone(),
        )?)),
        None => Ok(Arc::new(NoopReporter)),
    }
}
