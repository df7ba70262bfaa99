use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

use crate::queue::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Completed,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Starting => "STARTING",
            Phase::Completed => "COMPLETED",
            Phase::Error => "ERROR",
        }
    }
}

// One stage transition of one job. Constructed per transition and
// broadcast as is; sinks never mutate it.
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub job_message_id: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub label: &'static str,
    pub phase: Phase,
    pub severity: Level,
    // true exactly when the job has been acknowledged
    pub completed: bool,
    pub detail: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &StageEvent);
}

// Fans one event out to every attached sink. A sink failure is the
// sink's own problem and never blocks the others.
pub struct CompositeNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        CompositeNotifier { sinks: sinks }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, event: &StageEvent) {
        for sink in &self.sinks {
            sink.notify(event).await;
        }
    }
}

// Console sink: every event goes to the log at the severity the stage
// table assigned to it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &StageEvent) {
        let line = format!(
            "Job `{}` step {}/{} {} {}: {}",
            event.job_message_id,
            event.step_number,
            event.total_steps,
            event.label,
            event.phase.as_str(),
            event.detail
        );
        match event.severity {
            Level::ERROR => error!("{line}"),
            Level::WARN => warn!("{line}"),
            Level::INFO => info!("{line}"),
            _ => debug!("{line}"),
        }
    }
}

// Publish boundary of the progress topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        data: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), QueueError>;
}

// Writes each published message as a spool file under `<topic>/`, the
// same format `DirQueue` consumes, so a downstream worker can follow
// job progress.
pub struct DirPublisher;

#[async_trait]
impl Publisher for DirPublisher {
    async fn publish(
        &self,
        topic: &str,
        data: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), QueueError> {
        let dir = PathBuf::from(topic);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::json!({
            "attributes": attributes,
            "data": data,
        });
        let path = dir.join(format!("{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, body.to_string()).await?;
        Ok(())
    }
}

// Topic sink: republishes stage events severe enough to pass the
// configured level, stamped with the event protocol attributes.
pub struct TopicNotifier {
    publisher: Arc<dyn Publisher>,
    topic: String,
    level: Level,
    host: String,
    extra_attributes: BTreeMap<String, String>,
}

impl TopicNotifier {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic: String,
        level: Level,
        host: String,
        extra_attributes: BTreeMap<String, String>,
    ) -> Self {
        TopicNotifier {
            publisher: publisher,
            topic: topic,
            level: level,
            host: host,
            extra_attributes: extra_attributes,
        }
    }
}

#[async_trait]
impl Notifier for TopicNotifier {
    async fn notify(&self, event: &StageEvent) {
        // tracing orders levels by verbosity, so "at least as severe" is <=
        if event.severity > self.level {
            return;
        }
        let mut attributes = self.extra_attributes.clone();
        attributes.insert("job_message_id".to_string(), event.job_message_id.clone());
        attributes.insert("step".to_string(), event.label.to_string());
        attributes.insert("step_status".to_string(), event.phase.as_str().to_string());
        attributes.insert("step_number".to_string(), event.step_number.to_string());
        attributes.insert("total_steps".to_string(), event.total_steps.to_string());
        attributes.insert("level".to_string(), event.severity.to_string().to_lowercase());
        attributes.insert("completed".to_string(), event.completed.to_string());
        attributes.insert("host".to_string(), self.host.clone());

        if let Err(e) = self
            .publisher
            .publish(&self.topic, &event.detail, &attributes)
            .await
        {
            warn!(
                "Failed to publish a progress event to `{}`: {e}.",
                self.topic
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            RecordingPublisher {
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            data: &str,
            attributes: &BTreeMap<String, String>,
        ) -> Result<(), QueueError> {
            self.published.lock().unwrap().push((
                topic.to_string(),
                data.to_string(),
                attributes.clone(),
            ));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _data: &str,
            _attributes: &BTreeMap<String, String>,
        ) -> Result<(), QueueError> {
            Err(QueueError::UnknownAckId("gone".to_string()))
        }
    }

    struct RecordingNotifier {
        events: Mutex<Vec<StageEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &StageEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn topic_notifier(publisher: Arc<dyn Publisher>) -> TopicNotifier {
        TopicNotifier::new(
            publisher,
            "progress".to_string(),
            Level::INFO,
            "host1".to_string(),
            BTreeMap::from([("env".to_string(), "test".to_string())]),
        )
    }

    #[tokio::test]
    async fn publishes_only_events_that_pass_the_level() {
        let publisher = Arc::new(RecordingPublisher::new());
        let notifier = topic_notifier(publisher.clone());

        let stages = [
            Stage::Processing,
            Stage::Downloading,
            Stage::Executing,
            Stage::Uploading,
            Stage::Acknowledging,
            Stage::Cleanup,
        ];
        for stage in stages {
            notifier
                .notify(&stage.event("job1", Phase::Starting, "starting"))
                .await;
            notifier
                .notify(&stage.event("job1", Phase::Completed, "done"))
                .await;
        }

        let published = publisher.published.lock().unwrap();
        // only the INFO completions of Processing and Acknowledging pass
        assert_eq!(published.len(), 2);
        let (_, _, first) = &published[0];
        assert_eq!(first["step"], "PROCESSING");
        assert_eq!(first["step_status"], "COMPLETED");
        assert_eq!(first["step_number"], "1");
        assert_eq!(first["total_steps"], "6");
        assert_eq!(first["level"], "info");
        assert_eq!(first["completed"], "false");
        assert_eq!(first["host"], "host1");
        assert_eq!(first["env"], "test");
        assert_eq!(first["job_message_id"], "job1");

        let (_, _, last) = &published[1];
        assert_eq!(last["step"], "ACKNOWLEDGING");
        assert_eq!(last["completed"], "true");
    }

    #[tokio::test]
    async fn failures_pass_the_level_as_errors() {
        let publisher = Arc::new(RecordingPublisher::new());
        let notifier = topic_notifier(publisher.clone());

        notifier
            .notify(&Stage::Executing.event("job1", Phase::Starting, "starting"))
            .await;
        notifier
            .notify(&Stage::Executing.event("job1", Phase::Error, "command failed"))
            .await;

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, data, attrs) = &published[0];
        assert_eq!(topic, "progress");
        assert_eq!(data, "command failed");
        assert_eq!(attrs["step"], "EXECUTING");
        assert_eq!(attrs["step_status"], "ERROR");
        assert_eq!(attrs["level"], "error");
        assert_eq!(attrs["completed"], "false");
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_block_the_rest() {
        let recording = Arc::new(RecordingNotifier {
            events: Mutex::new(Vec::new()),
        });
        let composite = CompositeNotifier::new(vec![
            Arc::new(topic_notifier(Arc::new(FailingPublisher))),
            recording.clone(),
        ]);

        composite
            .notify(&Stage::Acknowledging.event("job1", Phase::Completed, "done"))
            .await;
        assert_eq!(recording.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dir_publisher_writes_spool_messages() {
        let dir = tempfile::tempdir().unwrap();
        let topic = dir.path().join("progress");
        DirPublisher
            .publish(
                &topic.display().to_string(),
                "detail text",
                &BTreeMap::from([("step".to_string(), "CLEANUP".to_string())]),
            )
            .await
            .unwrap();

        let q = crate::queue::DirQueue::new(&topic, std::time::Duration::from_secs(5));
        let msg = crate::queue::Queue::pull(&q).await.unwrap().unwrap();
        assert_eq!(msg.data, "detail text");
        assert_eq!(msg.attribute("step"), Some("CLEANUP"));
    }
}
