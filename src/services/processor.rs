use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::{ProcessingError, SinkError},
    models::{
        event::{ORDER_STATUS_UPDATE, ORDER_TRACKING_UPDATE, WebhookEvent},
        order::Order,
        report::{ProcessingReport, SinkKind, SinkOutcome},
    },
    services::sinks::{Notifier, OrderFetcher, OrderStore, SheetSync},
};

/// Order statuses that are not mirrored to the spreadsheet.
pub const IGNORE_STATUSES: &[&str] = &["UNPAID"];

const RECONCILIATION_CATEGORY: &str = "reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Order,
}

/// How an event code is handled. Resolved once per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Configured(Handler),
    Default,
}

impl EventCategory {
    pub fn resolve(event_code: i64) -> Self {
        match event_code {
            ORDER_STATUS_UPDATE | ORDER_TRACKING_UPDATE => EventCategory::Configured(Handler::Order),
            _ => EventCategory::Default,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventCategory::Configured(Handler::Order) => "order",
            EventCategory::Default => "basic",
        }
    }
}

fn outcome(result: Result<(), SinkError>) -> SinkOutcome {
    match result {
        Ok(()) => SinkOutcome::Applied,
        Err(e) => SinkOutcome::Failed(e.to_string()),
    }
}

/// Runs one event end to end against the sinks. Shared by the worker pool and
/// the producer's fallback path.
pub struct EventProcessor {
    fetcher: Arc<dyn OrderFetcher>,
    store: Arc<dyn OrderStore>,
    notifier: Option<Arc<dyn Notifier>>,
    sheets: Option<Arc<dyn SheetSync>>,
}

impl EventProcessor {
    pub fn new(fetcher: Arc<dyn OrderFetcher>, store: Arc<dyn OrderStore>) -> Self {
        Self {
            fetcher,
            store,
            notifier: None,
            sheets: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_sheet_sync(mut self, sheets: Arc<dyn SheetSync>) -> Self {
        self.sheets = Some(sheets);
        self
    }

    pub async fn process_with_timeout(
        &self,
        event: &WebhookEvent,
        limit: Duration,
    ) -> Result<ProcessingReport, ProcessingError> {
        tokio::time::timeout(limit, self.process(event))
            .await
            .map_err(|_| ProcessingError::Timeout(limit.as_secs()))?
    }

    pub async fn process(&self, event: &WebhookEvent) -> Result<ProcessingReport, ProcessingError> {
        let envelope = event
            .envelope()
            .map_err(|e| ProcessingError::Malformed(e.to_string()))?;
        let category = EventCategory::resolve(event.event_code);
        let order_sn = envelope.order_sn().map(str::to_string);

        debug!(
            event_code = event.event_code,
            category = category.name(),
            order_sn = order_sn.as_deref().unwrap_or("-"),
            "Processing event"
        );

        let report = ProcessingReport::new(event.event_code, category.name(), order_sn.clone());

        match category {
            EventCategory::Configured(Handler::Order) => {
                let order_sn = order_sn.ok_or(ProcessingError::MissingOrderId)?;
                self.deliver_order(&order_sn, Some(event), report).await
            }
            EventCategory::Default => Ok(self.handle_basic(event, report).await),
        }
    }

    /// Re-applies an order found by reconciliation: storage and spreadsheet
    /// only, nobody is notified about orders they may already have seen.
    pub async fn reconcile_order(&self, order_sn: &str) -> Result<ProcessingReport, ProcessingError> {
        let report = ProcessingReport::new(
            ORDER_STATUS_UPDATE,
            RECONCILIATION_CATEGORY,
            Some(order_sn.to_string()),
        );
        self.deliver_order(order_sn, None, report).await
    }

    async fn notify(&self, event: &WebhookEvent, order: Option<&Order>) -> SinkOutcome {
        match &self.notifier {
            Some(notifier) => outcome(notifier.notify(event, order).await),
            None => SinkOutcome::Skipped("not configured".to_string()),
        }
    }

    async fn handle_basic(&self, event: &WebhookEvent, mut report: ProcessingReport) -> ProcessingReport {
        let notified = self.notify(event, None).await;
        if let SinkOutcome::Failed(reason) = &notified {
            warn!(event_code = event.event_code, reason = %reason, "Notification failed");
        }
        report.record(SinkKind::Notifier, notified);
        report
    }

    async fn deliver_order(
        &self,
        order_sn: &str,
        event: Option<&WebhookEvent>,
        mut report: ProcessingReport,
    ) -> Result<ProcessingReport, ProcessingError> {
        let order = self.fetcher.fetch_order(order_sn).await.map_err(|e| {
            warn!(order_sn, error = %e, "Order fetch failed");
            ProcessingError::Fetch(e)
        })?;

        let sheet_step = async {
            if IGNORE_STATUSES.contains(&order.order_status.as_str()) {
                return SinkOutcome::Skipped(format!("status {}", order.order_status));
            }
            match &self.sheets {
                Some(sheets) => outcome(sheets.upsert_rows(&order.rows()).await),
                None => SinkOutcome::Skipped("not configured".to_string()),
            }
        };

        let notify_step = async {
            match event {
                Some(event) => self.notify(event, Some(&order)).await,
                None => SinkOutcome::Skipped("reconciliation".to_string()),
            }
        };

        let (stored, notified, synced) = tokio::join!(
            async { outcome(self.store.upsert_order(&order).await) },
            notify_step,
            sheet_step,
        );

        report.record(SinkKind::Storage, stored);
        report.record(SinkKind::Notifier, notified);
        report.record(SinkKind::Spreadsheet, synced);

        for (sink, result) in &report.sinks {
            if let SinkOutcome::Failed(reason) = result {
                warn!(order_sn, sink = %sink, reason = %reason, "Sink failed");
            }
        }

        let failed = report.failed_required_sinks();
        if !failed.is_empty() {
            return Err(ProcessingError::Sinks(failed.join("; ")));
        }

        info!(
            order_sn,
            order_status = %order.order_status,
            "Order event delivered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_codes_resolve_to_order_handler() {
        assert_eq!(
            EventCategory::resolve(ORDER_STATUS_UPDATE),
            EventCategory::Configured(Handler::Order)
        );
        assert_eq!(
            EventCategory::resolve(ORDER_TRACKING_UPDATE),
            EventCategory::Configured(Handler::Order)
        );
        assert_eq!(EventCategory::resolve(8), EventCategory::Default);
        assert_eq!(EventCategory::resolve(0).name(), "basic");
    }
}
