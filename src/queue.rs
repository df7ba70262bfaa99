use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;
use uuid::Uuid;

use crate::message::JobMessage;

#[derive(Debug, Error)]
pub enum QueueError {
    // i/o failures are treated as transient: the queue may come back.
    #[error("queue i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no active claim for ack id `{0}`")]
    UnknownAckId(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Io(_))
    }
}

// Receive/lease/acknowledge boundary of the job queue. One claim per
// delivery: `pull` hands out an ack id, `renew_lease` keeps the claim
// alive, `acknowledge` retires the message for good.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn pull(&self) -> Result<Option<JobMessage>, QueueError>;

    async fn renew_lease(&self, ack_id: &str, lease: Duration) -> Result<(), QueueError>;

    async fn acknowledge(&self, ack_id: &str) -> Result<(), QueueError>;

    // The lease granted per claim, as configured on the queue side.
    fn ack_deadline(&self) -> Duration;
}

// On-disk message file: `{"attributes": {...}, "data": "..."}`.
#[derive(Debug, Deserialize)]
struct SpoolMessage {
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    data: String,
}

struct Claim {
    path: PathBuf,
    deadline: Instant,
}

// Spool-directory queue: every `*.json` file in the directory is one
// pending message. Pulling claims a file for `ack_deadline`; claims are
// tracked in process, so an expired or crashed claim simply makes the
// file deliverable again. Acknowledging deletes the file.
pub struct DirQueue {
    dir: PathBuf,
    ack_deadline: Duration,
    claims: Mutex<HashMap<String, Claim>>,
}

impl DirQueue {
    pub fn new(dir: impl Into<PathBuf>, ack_deadline: Duration) -> Self {
        DirQueue {
            dir: dir.into(),
            ack_deadline: ack_deadline,
            claims: Mutex::new(HashMap::new()),
        }
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>, QueueError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false)
                && entry.file_type().await?.is_file()
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Queue for DirQueue {
    async fn pull(&self) -> Result<Option<JobMessage>, QueueError> {
        let files = self.pending_files().await?;
        let mut claims = self.claims.lock().await;
        let now = Instant::now();
        claims.retain(|_, claim| claim.deadline > now);
        let claimed: HashSet<PathBuf> = claims.values().map(|c| c.path.clone()).collect();

        for path in files {
            if claimed.contains(&path) {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            let spooled: SpoolMessage = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    // sideline the file so it cannot wedge the queue
                    let sidelined = path.with_extension("invalid");
                    warn!(
                        "Malformed message file `{}`, moving to `{}`: {e}.",
                        path.display(),
                        sidelined.display()
                    );
                    tokio::fs::rename(&path, &sidelined).await?;
                    continue;
                }
            };

            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ack_id = Uuid::new_v4().to_string();
            claims.insert(
                ack_id.clone(),
                Claim {
                    path: path,
                    deadline: now + self.ack_deadline,
                },
            );
            return Ok(Some(JobMessage {
                id: id,
                ack_id: ack_id,
                attributes: spooled.attributes,
                data: spooled.data,
            }));
        }
        Ok(None)
    }

    async fn renew_lease(&self, ack_id: &str, lease: Duration) -> Result<(), QueueError> {
        let mut claims = self.claims.lock().await;
        let claim = claims
            .get_mut(ack_id)
            .ok_or_else(|| QueueError::UnknownAckId(ack_id.to_string()))?;
        claim.deadline = Instant::now() + lease;
        Ok(())
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<(), QueueError> {
        let claim = {
            let mut claims = self.claims.lock().await;
            claims
                .remove(ack_id)
                .ok_or_else(|| QueueError::UnknownAckId(ack_id.to_string()))?
        };
        tokio::fs::remove_file(&claim.path).await?;
        Ok(())
    }

    fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spool(dir: &std::path::Path, name: &str, body: &str) {
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }

    fn queue(dir: &std::path::Path) -> DirQueue {
        DirQueue::new(dir, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn empty_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(queue(dir.path()).pull().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pull_claims_until_the_lease_expires() {
        let dir = tempfile::tempdir().unwrap();
        spool(
            dir.path(),
            "job1.json",
            r#"{"attributes": {"k": "v"}, "data": "d"}"#,
        )
        .await;
        let q = queue(dir.path());

        let msg = q.pull().await.unwrap().unwrap();
        assert_eq!(msg.id, "job1");
        assert_eq!(msg.attribute("k"), Some("v"));
        assert_eq!(msg.data, "d");

        // claimed, not redelivered
        assert!(q.pull().await.unwrap().is_none());

        // lease lapses, file is deliverable again under a fresh ack id
        tokio::time::advance(Duration::from_secs(61)).await;
        let again = q.pull().await.unwrap().unwrap();
        assert_eq!(again.id, "job1");
        assert_ne!(again.ack_id, msg.ack_id);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_the_claim() {
        let dir = tempfile::tempdir().unwrap();
        spool(dir.path(), "job1.json", r#"{"data": "d"}"#).await;
        let q = queue(dir.path());

        let msg = q.pull().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        q.renew_lease(&msg.ack_id, Duration::from_secs(60))
            .await
            .unwrap();

        // past the original deadline but inside the renewed one
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(q.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acknowledge_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        spool(dir.path(), "job1.json", r#"{"data": "d"}"#).await;
        let q = queue(dir.path());

        let msg = q.pull().await.unwrap().unwrap();
        q.acknowledge(&msg.ack_id).await.unwrap();
        assert!(!dir.path().join("job1.json").exists());
        assert!(q.pull().await.unwrap().is_none());

        let err = q.acknowledge(&msg.ack_id).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownAckId(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malformed_files_are_sidelined() {
        let dir = tempfile::tempdir().unwrap();
        spool(dir.path(), "bad.json", "{not json").await;
        spool(dir.path(), "good.json", r#"{"data": "ok"}"#).await;
        let q = queue(dir.path());

        let msg = q.pull().await.unwrap().unwrap();
        assert_eq!(msg.id, "good");
        assert!(dir.path().join("bad.invalid").exists());
        assert!(!dir.path().join("bad.json").exists());
    }
}
