use crate::config::UnroutablePolicy;
use crate::error::{Result, WorkerError};
use crate::handler::PushHandler;
use crate::metrics::WorkerMetrics;
use crate::reporter::{ErrorReporter, FailureContext};
use crate::transport::InboundMessage;
use anyhow::{anyhow, Context};
use hg_push_core::{MessageKind, PushMessage, RetryDecision, RetryPolicy, RetryState};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    Rejected,
    /// Left unsettled; the broker decides its fate
    Ignored,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Requeued => "requeued",
            Disposition::Rejected => "rejected",
            Disposition::Ignored => "ignored",
        }
    }
}

/// Routes deliveries to the push and repo-registration callbacks and
/// settles them.
///
/// The retry counter lives here and is shared by every push this consumer
/// sees, so a run of failures across different messages escalates just
/// like repeated failures of one message.
pub struct PushConsumer {
    handler: Arc<dyn PushHandler>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<WorkerMetrics>,
    policy: RetryPolicy,
    state: RetryState,
    handler_timeout: Option<Duration>,
    unroutable: UnroutablePolicy,
}

impl PushConsumer {
    pub fn new(
        handler: Arc<dyn PushHandler>,
        reporter: Arc<dyn ErrorReporter>,
        metrics: Arc<WorkerMetrics>,
        policy: RetryPolicy,
    ) -> Self {
        PushConsumer {
            handler,
            reporter,
            metrics,
            policy,
            state: RetryState::new(),
            handler_timeout: None,
            unroutable: UnroutablePolicy::default(),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_unroutable(mut self, policy: UnroutablePolicy) -> Self {
        self.unroutable = policy;
        self
    }

    pub fn retry_state(&self) -> RetryState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run both callbacks on a delivery, each filtering by its own type.
    ///
    /// Returns `WorkerError::Escalated` once push failures pass the retry
    /// ceiling; the delivery is then dropped unsettled.
    pub async fn dispatch(&mut self, message: InboundMessage) -> Result<Disposition> {
        let body: Value = match serde_json::from_slice(&message.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "Undecodable message (delivery {}): {}",
                    message.delivery_tag, e
                );
                return self.on_unroutable("undecodable", &message).await;
            }
        };

        let mut disposition = self.on_push(&body, &message).await?;
        if disposition.is_none() {
            disposition = self.on_repo_registration(&body, &message).await?;
        }

        match disposition {
            Some(disposition) => Ok(disposition),
            None => {
                let kind = MessageKind::of(&body);
                warn!("No route for message type '{}': {}", kind, body);
                self.on_unroutable(kind.as_str(), &message).await
            }
        }
    }

    /// Handle an `hg-push` body; `None` for any other type
    pub async fn on_push(
        &mut self,
        body: &Value,
        message: &InboundMessage,
    ) -> Result<Option<Disposition>> {
        if MessageKind::of(body) != MessageKind::HgPush {
            return Ok(None);
        }
        info!("got hg-push message {}", body);

        match self.process_pushes(body).await {
            Ok(()) => {
                self.state = self.policy.on_success(self.state);
                self.metrics.set_retries(self.state.retries);
                message.ack().await?;
                self.metrics
                    .inc_messages(MessageKind::HgPush.as_str(), Disposition::Acked.as_str());
                Ok(Some(Disposition::Acked))
            }
            Err(error) => self.on_push_failure(error, body, message).await.map(Some),
        }
    }

    /// Handle a `new-hg-repo` body; `None` for any other type
    pub async fn on_repo_registration(
        &mut self,
        body: &Value,
        message: &InboundMessage,
    ) -> Result<Option<Disposition>> {
        if MessageKind::of(body) != MessageKind::NewHgRepo {
            return Ok(None);
        }
        info!("got message {}", body);

        message.ack().await?;
        self.metrics
            .inc_messages(MessageKind::NewHgRepo.as_str(), Disposition::Acked.as_str());
        Ok(Some(Disposition::Acked))
    }

    async fn process_pushes(&self, body: &Value) -> anyhow::Result<()> {
        let push = PushMessage::from_body(body)?;
        let call = self
            .handler
            .handle_pushes(&push.repository_id, &push.pushes, true);

        let started = Instant::now();
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("push handler timed out after {:?}", limit)),
            },
            None => call.await,
        };
        self.metrics
            .handler_duration
            .observe(started.elapsed().as_secs_f64());

        result.with_context(|| format!("handlePushes failed for repository {}", push.repository_id))
    }

    async fn on_push_failure(
        &mut self,
        error: anyhow::Error,
        body: &Value,
        message: &InboundMessage,
    ) -> Result<Disposition> {
        let (state, decision) = self.policy.on_failure(self.state);
        self.state = state;
        self.metrics.set_retries(state.retries);

        error!("handlePushes failed: {}: {:#}", state.retries, error);

        let context = FailureContext {
            retries: state.retries,
            max_retries: self.policy.max_retries,
            repository_id: body.get("repository_id").map(|id| match id.as_str() {
                Some(id) => id.to_string(),
                None => id.to_string(),
            }),
            delivery_tag: message.delivery_tag,
            escalated: decision == RetryDecision::Escalate,
        };
        if !self.reporter.capture(&error, &context).await {
            self.metrics.report_failures_total.inc();
        }

        match decision {
            RetryDecision::Escalate => {
                self.metrics.escalations_total.inc();
                self.metrics
                    .inc_messages(MessageKind::HgPush.as_str(), "escalated");
                error!(
                    "Giving up after {} consecutive failures (max {}), stopping worker",
                    state.retries, self.policy.max_retries
                );
                Err(WorkerError::Escalated {
                    retries: state.retries,
                    max_retries: self.policy.max_retries,
                    source: error,
                })
            }
            RetryDecision::Requeue { backoff } => {
                info!(
                    "Requeueing delivery {} after {:?}",
                    message.delivery_tag, backoff
                );
                tokio::time::sleep(backoff).await;
                message.requeue().await?;
                self.metrics
                    .inc_messages(MessageKind::HgPush.as_str(), Disposition::Requeued.as_str());
                Ok(Disposition::Requeued)
            }
        }
    }

    async fn on_unroutable(&self, kind: &str, message: &InboundMessage) -> Result<Disposition> {
        let disposition = match self.unroutable {
            UnroutablePolicy::Leave => Disposition::Ignored,
            UnroutablePolicy::Ack => {
                message.ack().await?;
                Disposition::Acked
            }
            UnroutablePolicy::Reject => {
                message.reject().await?;
                Disposition::Rejected
            }
        };

        self.metrics.inc_messages(kind, disposition.as_str());
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NoopReporter;
    use crate::transport::Acknowledger;
    use async_trait::async_trait;
    use hg_push_core::{PushEvent, RepositoryId};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Settlements(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Acknowledger for Settlements {
        async fn ack(&self) -> Result<()> {
            self.0.lock().push("ack");
            Ok(())
        }

        async fn requeue(&self) -> Result<()> {
            self.0.lock().push("requeue");
            Ok(())
        }

        async fn reject(&self) -> Result<()> {
            self.0.lock().push("reject");
            Ok(())
        }
    }

    struct StuckHandler;

    #[async_trait]
    impl PushHandler for StuckHandler {
        async fn handle_pushes(
            &self,
            _repository_id: &RepositoryId,
            _pushes: &[PushEvent],
            _close_connection: bool,
        ) -> anyhow::Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn consumer(handler: Arc<dyn PushHandler>) -> PushConsumer {
        PushConsumer::new(
            handler,
            Arc::new(NoopReporter),
            Arc::new(WorkerMetrics::new(None).unwrap()),
            RetryPolicy::new(5, Duration::from_millis(10)),
        )
    }

    fn message(body: &[u8], settlements: &Settlements) -> InboundMessage {
        InboundMessage::new(1, false, body.to_vec(), settlements.clone())
    }

    #[tokio::test]
    async fn test_unroutable_policies() {
        let cases = [
            (UnroutablePolicy::Leave, Disposition::Ignored, vec![]),
            (UnroutablePolicy::Ack, Disposition::Acked, vec!["ack"]),
            (UnroutablePolicy::Reject, Disposition::Rejected, vec!["reject"]),
        ];

        for (policy, expected, settled) in cases {
            let mut consumer = consumer(Arc::new(StuckHandler)).with_unroutable(policy);
            let settlements = Settlements::default();

            let disposition = consumer
                .dispatch(message(br#"{"type": "unknown"}"#, &settlements))
                .await
                .unwrap();

            assert_eq!(disposition, expected);
            assert_eq!(*settlements.0.lock(), settled);
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_unroutable() {
        let mut consumer = consumer(Arc::new(StuckHandler));
        let settlements = Settlements::default();

        let disposition = consumer
            .dispatch(message(b"\x80not json", &settlements))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ignored);
        assert!(settlements.0.lock().is_empty());
        assert_eq!(consumer.retry_state().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_counts_as_failure() {
        let mut consumer =
            consumer(Arc::new(StuckHandler)).with_handler_timeout(Some(Duration::from_secs(30)));
        let settlements = Settlements::default();

        let disposition = consumer
            .dispatch(message(
                br#"{"type": "hg-push", "repository_id": 1, "pushes": [{"id": 10}]}"#,
                &settlements,
            ))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(*settlements.0.lock(), vec!["requeue"]);
        assert_eq!(consumer.retry_state().retries, 1);
    }

    #[tokio::test]
    async fn test_malformed_push_goes_through_retry_path() {
        let mut consumer = consumer(Arc::new(StuckHandler));
        let settlements = Settlements::default();

        let disposition = consumer
            .dispatch(message(br#"{"type": "hg-push", "pushes": []}"#, &settlements))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(consumer.retry_state().retries, 1);
    }
}
