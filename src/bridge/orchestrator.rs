//! Pipeline between the Telegram listener and the delivery engine.
//!
//! Normalizes every inbound event, runs the filters and hands the resulting
//! task to the engine. Rejected tasks are still submitted, already
//! `Dropped`, so the engine records them in the activity log.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::common::messages::InboundEvent;
use crate::common::types::{ForwardTask, TaskStatus};
use crate::config::types::Config;

use super::filter::{FilterDecision, MessageFilter};
use super::normalizer::Normalizer;

pub struct Pipeline {
    normalizer: Normalizer,
    filter: MessageFilter,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, filter: MessageFilter) -> Self {
        Self { normalizer, filter }
    }

    pub fn from_config(config: &Config) -> Self {
        let filter = MessageFilter::new(&config.filters);
        if filter.has_rules() {
            info!("Message filters enabled");
        }
        Self::new(
            Normalizer::new(config.whatsapp.recipient.clone(), config.whatsapp.include_sender),
            filter,
        )
    }

    /// Turn one event into a task ready for the engine.
    pub fn process(&self, event: &InboundEvent) -> ForwardTask {
        let mut task = self.normalizer.normalize(event);
        if task.status == TaskStatus::Dropped {
            info!(
                task = %task.id,
                "SKIPPED Telegram -> WhatsApp: {}",
                task.last_error.as_deref().unwrap_or("")
            );
            return task;
        }

        if let FilterDecision::Reject(reason) = self.filter.evaluate(&task, event) {
            info!(task = %task.id, "FILTERED Telegram -> WhatsApp: {}", reason);
            task.drop_with(reason.to_string());
        }
        task
    }

    /// Forward events until either side closes.
    pub async fn run(
        self,
        mut events_rx: mpsc::Receiver<InboundEvent>,
        intake_tx: mpsc::Sender<ForwardTask>,
    ) {
        while let Some(event) = events_rx.recv().await {
            let task = self.process(&event);
            debug!(task = %task.id, status = %task.status, "Submitting to delivery engine");
            if intake_tx.send(task).await.is_err() {
                info!("Delivery engine closed, stopping pipeline");
                break;
            }
        }
        info!("Telegram -> WhatsApp pipeline ended");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::common::types::{ContentType, Payload, TaskId};
    use crate::config::types::FiltersConfig;

    fn pipeline(filters: FiltersConfig) -> Pipeline {
        Pipeline::new(
            Normalizer::new("34600000000", false),
            MessageFilter::new(&filters),
        )
    }

    #[test]
    fn test_excluded_keyword_drops_task() {
        let pipeline = pipeline(FiltersConfig {
            exclude: vec!["spam".to_string()],
            ..FiltersConfig::default()
        });
        let task = pipeline.process(&InboundEvent::text(-100, 1, "buy spam now", Utc::now()));

        assert_eq!(task.status, TaskStatus::Dropped);
        assert!(task.last_error.unwrap().contains("spam"));
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_accepted_task_is_pending() {
        let pipeline = pipeline(FiltersConfig {
            include: vec!["release".to_string()],
            ..FiltersConfig::default()
        });
        let task = pipeline.process(&InboundEvent::text(-100, 2, "New release out", Utc::now()));

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.id, TaskId::new(-100, 2));
        assert_eq!(task.payload, Payload::Text("New release out".to_string()));
    }

    #[test]
    fn test_unsupported_content_skips_filters() {
        let pipeline = pipeline(FiltersConfig::default());
        let mut event = InboundEvent::text(-100, 3, "", Utc::now());
        event.content_type = ContentType::Other("poll".to_string());

        let task = pipeline.process(&event);
        assert_eq!(task.status, TaskStatus::Dropped);
        assert_eq!(task.last_error.as_deref(), Some("unsupported content type: poll"));
    }

    #[tokio::test]
    async fn test_run_forwards_every_event() {
        let (events_tx, events_rx) = mpsc::channel(4);
        let (intake_tx, mut intake_rx) = mpsc::channel(4);
        let handle = tokio::spawn(pipeline(FiltersConfig::default()).run(events_rx, intake_tx));

        events_tx
            .send(InboundEvent::text(-100, 1, "one", Utc::now()))
            .await
            .unwrap();
        events_tx
            .send(InboundEvent::text(-100, 2, "   ", Utc::now()))
            .await
            .unwrap();
        drop(events_tx);
        handle.await.unwrap();

        let first = intake_rx.recv().await.unwrap();
        let second = intake_rx.recv().await.unwrap();
        assert_eq!(first.status, TaskStatus::Pending);
        assert_eq!(second.status, TaskStatus::Dropped);
        assert!(intake_rx.recv().await.is_none());
    }
}
