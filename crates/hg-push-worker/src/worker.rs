use crate::config::WorkerConfig;
use crate::consumer::PushConsumer;
use crate::error::{Result, WorkerError};
use crate::transport::{AmqpTransport, DeliveryStream};
use futures::StreamExt;
use std::future::Future;
use tracing::{debug, info};

/// Consumer worker: one broker subscription, one delivery at a time
pub struct Worker {
    config: WorkerConfig,
    consumer: PushConsumer,
}

impl Worker {
    pub fn new(config: WorkerConfig, consumer: PushConsumer) -> Self {
        Worker { config, consumer }
    }

    pub fn consumer(&self) -> &PushConsumer {
        &self.consumer
    }

    /// Connect, subscribe and consume until `shutdown` resolves or a push
    /// failure escalates.
    ///
    /// The broker connection is closed on every exit path.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let consumer_tag = self.config.generate_consumer_tag();
        info!(
            "Starting worker {} (max retries: {})",
            consumer_tag, self.config.max_retries
        );

        let transport = AmqpTransport::connect(&self.config.transport).await?;
        let result = match transport
            .subscribe(&self.config.queues, self.config.prefetch_count, &consumer_tag)
            .await
        {
            Ok(deliveries) => self.consume(deliveries, shutdown).await,
            Err(e) => Err(e),
        };

        transport.close().await;
        result
    }

    /// Drive the receive, dispatch and settle loop over an already
    /// subscribed stream.
    ///
    /// Shutdown cancels the delivery in flight, including a pending backoff;
    /// that delivery stays unsettled.
    pub async fn consume<S>(&mut self, mut deliveries: DeliveryStream, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let consumer = &mut self.consumer;
            let next = async {
                match deliveries.next().await {
                    Some(Ok(message)) => {
                        let tag = message.delivery_tag;
                        consumer.dispatch(message).await.map(|disposition| {
                            debug!("Delivery {} {}", tag, disposition.as_str());
                        })
                    }
                    Some(Err(e)) => Err(e),
                    None => Err(WorkerError::StreamClosed),
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, bye bye");
                    return Ok(());
                }
                result = next => result?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PushHandler;
    use crate::metrics::WorkerMetrics;
    use crate::reporter::NoopReporter;
    use crate::transport::{Acknowledger, InboundMessage};
    use async_trait::async_trait;
    use futures::stream;
    use hg_push_core::{PushEvent, RepositoryId, RetryPolicy};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

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

    struct FailingHandler;

    #[async_trait]
    impl PushHandler for FailingHandler {
        async fn handle_pushes(
            &self,
            _repository_id: &RepositoryId,
            _pushes: &[PushEvent],
            _close_connection: bool,
        ) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    fn worker(backoff_unit: Duration) -> Worker {
        let consumer = PushConsumer::new(
            Arc::new(FailingHandler),
            Arc::new(NoopReporter),
            Arc::new(WorkerMetrics::new(None).unwrap()),
            RetryPolicy::new(1, backoff_unit),
        );
        Worker::new(WorkerConfig::default(), consumer)
    }

    fn push(settlements: &Settlements) -> Result<InboundMessage> {
        Ok(InboundMessage::new(
            1,
            false,
            br#"{"type": "hg-push", "repository_id": 1, "pushes": [{"id": 10}]}"#.to_vec(),
            settlements.clone(),
        ))
    }

    #[tokio::test]
    async fn test_shutdown_returns_cleanly() {
        let mut worker = worker(Duration::from_millis(1));
        let deliveries = stream::pending().boxed();

        worker.consume(deliveries, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_is_an_error() {
        let mut worker = worker(Duration::from_millis(1));
        let deliveries = stream::empty().boxed();

        let result = worker.consume(deliveries, futures::future::pending()).await;
        assert!(matches!(result, Err(WorkerError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_escalation_stops_the_loop() {
        let mut worker = worker(Duration::from_millis(1));
        let settlements = Settlements::default();
        let deliveries = stream::iter(vec![
            push(&settlements),
            push(&settlements),
            push(&settlements),
        ])
        .chain(stream::pending())
        .boxed();

        let result = worker.consume(deliveries, futures::future::pending()).await;

        match result {
            Err(WorkerError::Escalated { retries, max_retries, .. }) => {
                assert_eq!(retries, 2);
                assert_eq!(max_retries, 1);
            }
            other => panic!("expected escalation, got {:?}", other),
        }
        assert_eq!(*settlements.0.lock(), vec!["requeue"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_leaves_message_unsettled() {
        let mut worker = worker(Duration::from_secs(3600));
        let settlements = Settlements::default();
        let deliveries = stream::iter(vec![push(&settlements)])
            .chain(stream::pending())
            .boxed();

        worker
            .consume(deliveries, tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(settlements.0.lock().is_empty());
        assert_eq!(worker.consumer().retry_state().retries, 1);
    }
}
