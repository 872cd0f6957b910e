//! Run-outcome notification contract. Log-only by
//! default; a webhook sink is provided for environments that wire one up.
//!
//! Version dependencies:
//! - async-trait = "0.1"
//! - reqwest = "0.11"
//! - serde = "1.0"
//! - tracing = "0.1"

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::pipeline::PipelineReport;

#[derive(Debug, Clone, Serialize)]
pub struct RunNotification {
    pub pipeline: String,
    pub success: bool,
    pub failed_stages: Vec<String>,
    pub total_rows_written: i64,
}

impl RunNotification {
    pub fn from_report(report: &PipelineReport) -> Self {
        let total_rows_written = report
        .results
        .iter()
        .filter_map(|r| r.outcome.as_ref().ok())
        .map(|o| o.rows_written as i64)
        .sum();
        let failed_stages = report
        .results
        .iter()
        .filter(|r| r.outcome.is_err())
        .map(|r| r.api_name.clone())
        .collect();
        Self {
            pipeline: report.name.clone(),
            success: report.is_success(),
            failed_stages,
            total_rows_written,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &RunNotification);
}

/// Writes the notification as a structured log event. The default sink:
/// every deployment already has log aggregation, not every deployment has
/// a webhook configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &RunNotification) {
        if notification.success {
            info!(
                pipeline = notification.pipeline,
                rows = notification.total_rows_written,
                "pipeline run succeeded"
            );
        } else {
            error!(
                pipeline = notification.pipeline,
                failed = ?notification.failed_stages,
                "pipeline run failed"
            );
        }
    }
}

/// Posts the notification as JSON to a configured URL. Delivery failures
/// are logged and swallowed; a notification that can't be delivered must
/// never fail the run it's reporting on.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &RunNotification) {
        if let Err(e) = self.client.post(&self.url).json(notification).send().await {
            warn!(url = self.url, error = %e, "failed to deliver run notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageResult;
    use crate::stage::StageOutcome;
    use crate::types::Criticality;

    #[test]
    fn notification_sums_rows_across_succeeded_stages() {
        let report = PipelineReport {
            name: "nightly".into(),
            results: vec![
                StageResult {
                    api_name: "a".into(),
                    criticality: Criticality::Core,
                    outcome: Ok(StageOutcome { api_name: "a".into(), rows_written: 10, no_op: false }),
                },
                StageResult {
                    api_name: "b".into(),
                    criticality: Criticality::Feature,
                    outcome: Err("down".into()),
                },
            ],
        };
        let note = RunNotification::from_report(&report);
        assert_eq!(note.total_rows_written, 10);
        assert_eq!(note.failed_stages, vec!["b".to_string()]);
    }
}
