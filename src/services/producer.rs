use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, queue::DurableQueue},
    error::{BreakerError, ProcessingError, ProducerError},
    models::{
        event::WebhookEvent, queue::QueueEntry, report::ProcessingReport,
        validation::SignatureValidator,
    },
    services::{processor::EventProcessor, stats::StatsRegistry},
};

#[derive(Debug)]
pub enum DispatchOutcome {
    Enqueued {
        entry_id: String,
    },
    /// The queue was bypassed and the event processed inline.
    Fallback {
        entry_id: String,
        report: Result<ProcessingReport, ProcessingError>,
    },
}

/// Accepts a webhook: validate, then publish through the breaker, or process
/// inline when publishing is not possible.
pub struct Producer {
    validator: SignatureValidator,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<dyn DurableQueue>,
    processor: Arc<EventProcessor>,
    stats: Arc<StatsRegistry>,
    processing_timeout: Duration,
}

impl Producer {
    pub fn new(
        validator: SignatureValidator,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<dyn DurableQueue>,
        processor: Arc<EventProcessor>,
        stats: Arc<StatsRegistry>,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            validator,
            breaker,
            queue,
            processor,
            stats,
            processing_timeout,
        }
    }

    pub async fn handle(
        &self,
        body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<DispatchOutcome, ProducerError> {
        let signature = self
            .validator
            .validate(body, signature_header)
            .inspect_err(|_| self.stats.record_signature_rejected())?;

        let event = WebhookEvent::from_raw(body, signature).map_err(|e| {
            warn!(error = %e, "Webhook body is not a push envelope");
            e
        })?;
        let entry = QueueEntry::new(event);

        match self.breaker.attempt_publish(self.queue.as_ref(), &entry).await {
            Ok(()) => {
                self.stats.record_enqueued();
                info!(
                    entry_id = %entry.id,
                    event_code = entry.event.event_code,
                    "Webhook enqueued"
                );
                Ok(DispatchOutcome::Enqueued { entry_id: entry.id })
            }
            Err(e) => Ok(self.fallback(entry, e).await),
        }
    }

    async fn fallback(&self, entry: QueueEntry, cause: BreakerError) -> DispatchOutcome {
        warn!(
            entry_id = %entry.id,
            event_code = entry.event.event_code,
            cause = %cause,
            "Queue unavailable, processing webhook synchronously"
        );

        let report = self
            .processor
            .process_with_timeout(&entry.event, self.processing_timeout)
            .await;

        match &report {
            Ok(_) => {
                self.stats.record_fallback(true);
                info!(entry_id = %entry.id, "Fallback processing succeeded");
            }
            Err(e) => {
                self.stats.record_fallback(false);
                error!(
                    entry_id = %entry.id,
                    error = %e,
                    "Fallback processing failed, event not delivered"
                );
            }
        }

        DispatchOutcome::Fallback {
            entry_id: entry.id,
            report,
        }
    }
}
