use std::fmt::{Display, Formatter, Result};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Storage,
    Notifier,
    Spreadsheet,
}

impl SinkKind {
    /// Record sinks hold the durable state of an order. Their failure fails the event.
    pub fn is_required(&self) -> bool {
        matches!(self, SinkKind::Storage | SinkKind::Spreadsheet)
    }
}

impl Display for SinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            SinkKind::Storage => write!(f, "storage"),
            SinkKind::Notifier => write!(f, "notifier"),
            SinkKind::Spreadsheet => write!(f, "spreadsheet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum SinkOutcome {
    Applied,
    Skipped(String),
    Failed(String),
}

/// What happened to one event, sink by sink.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub event_code: i64,
    pub category: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_sn: Option<String>,

    pub sinks: Vec<(SinkKind, SinkOutcome)>,
}

impl ProcessingReport {
    pub fn new(event_code: i64, category: &'static str, order_sn: Option<String>) -> Self {
        Self {
            event_code,
            category,
            order_sn,
            sinks: Vec::new(),
        }
    }

    pub fn record(&mut self, sink: SinkKind, outcome: SinkOutcome) {
        self.sinks.push((sink, outcome));
    }

    pub fn outcome(&self, sink: SinkKind) -> Option<&SinkOutcome> {
        self.sinks
            .iter()
            .find(|(kind, _)| *kind == sink)
            .map(|(_, outcome)| outcome)
    }

    pub fn failed_required_sinks(&self) -> Vec<String> {
        self.sinks
            .iter()
            .filter(|(kind, outcome)| kind.is_required() && matches!(outcome, SinkOutcome::Failed(_)))
            .map(|(kind, outcome)| match outcome {
                SinkOutcome::Failed(reason) => format!("{kind}: {reason}"),
                _ => kind.to_string(),
            })
            .collect()
    }
}
