use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn, Level};
use uuid::Uuid;

use crate::{
    command,
    config::UploadMode,
    context::{PathMapper, PathMapping, Workspace},
    message::{JobMessage, DOWNLOAD_FILES_KEY, EXEC_UUID_KEY, UPLOAD_FILES_KEY},
    notifier::{Phase, StageEvent},
    sustainer::LeaseSustainer,
    worker::ProcessContext,
};

pub const TOTAL_STEPS: u32 = 6;

// The fixed per-message state machine. Every stage reports starting,
// completed, or error under its own step number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Processing,
    Downloading,
    Executing,
    Uploading,
    Acknowledging,
    Cleanup,
}

impl Stage {
    pub fn number(self) -> u32 {
        match self {
            Stage::Processing => 1,
            Stage::Downloading => 2,
            Stage::Executing => 3,
            Stage::Uploading => 4,
            Stage::Acknowledging => 5,
            Stage::Cleanup => 6,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Processing => "PROCESSING",
            Stage::Downloading => "DOWNLOADING",
            Stage::Executing => "EXECUTING",
            Stage::Uploading => "UPLOADING",
            Stage::Acknowledging => "ACKNOWLEDGING",
            Stage::Cleanup => "CLEANUP",
        }
    }

    pub fn severity(self, phase: Phase) -> Level {
        match phase {
            Phase::Starting => Level::DEBUG,
            Phase::Completed => match self {
                Stage::Processing | Stage::Acknowledging => Level::INFO,
                _ => Level::DEBUG,
            },
            Phase::Error => match self {
                Stage::Cleanup => Level::WARN,
                _ => Level::ERROR,
            },
        }
    }

    pub fn event(self, job_id: &str, phase: Phase, detail: impl Into<String>) -> StageEvent {
        StageEvent {
            job_message_id: job_id.to_string(),
            step_number: self.number(),
            total_steps: TOTAL_STEPS,
            label: self.label(),
            phase: phase,
            severity: self.severity(phase),
            completed: self == Stage::Acknowledging && phase == Phase::Completed,
            detail: detail.into(),
        }
    }
}

// A stage body failed; carries the stage for the worker loop's log line.
#[derive(Debug, Error)]
#[error("{stage} failed: {cause:#}")]
pub struct StageError {
    pub stage: &'static str,
    pub cause: anyhow::Error,
}

enum Outcome {
    Completed,
    // the external command failed; routine, not the worker's concern
    CommandFailed,
    Aborted(StageError),
}

// Everything that happens to one claimed message: stage the inputs, run
// the command, stage the results, acknowledge, clean up, all while the
// lease sustainer keeps the claim alive.
pub struct Job {
    ctx: Arc<ProcessContext>,
    message: JobMessage,
    mapper: PathMapper,
    workspace: Option<Workspace>,
    download_mapping: PathMapping,
    upload_mapping: PathMapping,
    namespace: Value,
    command_line: String,
    sustainer: Option<LeaseSustainer>,
}

impl Job {
    pub fn new(ctx: Arc<ProcessContext>, message: JobMessage) -> Self {
        let mapper = PathMapper::new(
            ctx.storage.clone(),
            ctx.config.storage.scheme().to_string(),
        );
        Job {
            ctx: ctx,
            message: message,
            mapper: mapper,
            workspace: None,
            download_mapping: PathMapping::default(),
            upload_mapping: PathMapping::default(),
            namespace: Value::Null,
            command_line: String::new(),
            sustainer: None,
        }
    }

    // Fatal failures come back as the error; a failing command does not.
    // Cleanup runs exactly once either way.
    pub async fn run(mut self) -> Result<(), StageError> {
        let outcome = self.process().await;
        self.cleanup().await;
        self.stop_sustainer().await;
        match outcome {
            Outcome::Completed => {
                info!("Job `{}` done.", self.message.id);
                Ok(())
            }
            Outcome::CommandFailed => Ok(()),
            Outcome::Aborted(e) => Err(e),
        }
    }

    async fn process(&mut self) -> Outcome {
        let abort = |stage: Stage, cause: anyhow::Error| {
            Outcome::Aborted(StageError {
                stage: stage.label(),
                cause: cause,
            })
        };

        self.emit(Stage::Processing, Phase::Starting, "Setting up the job.")
            .await;
        match self.setup().await {
            Ok(()) => {
                self.emit(Stage::Processing, Phase::Completed, "Job setup done.")
                    .await
            }
            Err(e) => {
                self.emit(
                    Stage::Processing,
                    Phase::Error,
                    format!("Job setup failed: {e:#}"),
                )
                .await;
                return abort(Stage::Processing, e);
            }
        }

        self.start_sustainer();

        self.emit(Stage::Downloading, Phase::Starting, "Downloading input files.")
            .await;
        match self.mapper.download(&self.download_mapping).await {
            Ok(()) => {
                self.emit(
                    Stage::Downloading,
                    Phase::Completed,
                    "Downloaded input files.",
                )
                .await
            }
            Err(e) => {
                self.emit(
                    Stage::Downloading,
                    Phase::Error,
                    format!("Download failed: {e:#}"),
                )
                .await;
                return abort(Stage::Downloading, e);
            }
        }

        self.emit(Stage::Executing, Phase::Starting, "Executing the command.")
            .await;
        match self.execute().await {
            Ok(()) => {
                self.emit(Stage::Executing, Phase::Completed, "Command finished.")
                    .await
            }
            Err(e) => {
                self.emit(
                    Stage::Executing,
                    Phase::Error,
                    format!("Command failed: {e:#}"),
                )
                .await;
                return Outcome::CommandFailed;
            }
        }

        self.emit(Stage::Uploading, Phase::Starting, "Uploading result files.")
            .await;
        match self.upload().await {
            Ok(()) => {
                self.emit(Stage::Uploading, Phase::Completed, "Uploaded result files.")
                    .await
            }
            Err(e) => {
                self.emit(
                    Stage::Uploading,
                    Phase::Error,
                    format!("Upload failed: {e:#}"),
                )
                .await;
                return abort(Stage::Uploading, e);
            }
        }

        self.emit(
            Stage::Acknowledging,
            Phase::Starting,
            "Acknowledging the message.",
        )
        .await;
        match self.ctx.queue.acknowledge(&self.message.ack_id).await {
            Ok(()) => {
                self.emit(Stage::Acknowledging, Phase::Completed, "Job completed.")
                    .await
            }
            Err(e) => {
                self.emit(
                    Stage::Acknowledging,
                    Phase::Error,
                    format!("Acknowledgement failed: {e:#}"),
                )
                .await;
                return abort(Stage::Acknowledging, e.into());
            }
        }

        Outcome::Completed
    }

    // Per-message setup: execution id, workspace, path mappings, lookup
    // namespace, and the fully built command line.
    async fn setup(&mut self) -> anyhow::Result<()> {
        let exec_uuid = Uuid::new_v4().to_string();
        self.message
            .insert_attribute(EXEC_UUID_KEY, exec_uuid.clone());
        info!("Job `{}` attempt `{}`.", self.message.id, exec_uuid);

        let workspace = Workspace::create()?;

        let remote_download = self.decode_files_attribute(DOWNLOAD_FILES_KEY)?;
        self.download_mapping = self
            .mapper
            .build_mapping(&workspace.downloads_dir, &remote_download)?;
        let local_download = self
            .mapper
            .build_local_view(&remote_download, &self.download_mapping);

        let mut namespace = serde_json::Map::new();
        namespace.insert(
            "workspace".to_string(),
            Value::String(workspace.path().display().to_string()),
        );
        namespace.insert(
            "downloads_dir".to_string(),
            Value::String(workspace.downloads_dir.display().to_string()),
        );
        namespace.insert(
            "uploads_dir".to_string(),
            Value::String(workspace.uploads_dir.display().to_string()),
        );
        namespace.insert("download_files".to_string(), local_download.clone());
        namespace.insert("local_download_files".to_string(), local_download);
        namespace.insert("remote_download_files".to_string(), remote_download);

        if self.ctx.config.upload.mode() == UploadMode::Mapping {
            let remote_upload = self.decode_files_attribute(UPLOAD_FILES_KEY)?;
            self.upload_mapping = self
                .mapper
                .build_mapping(&workspace.uploads_dir, &remote_upload)?;
            let local_upload = self
                .mapper
                .build_local_view(&remote_upload, &self.upload_mapping);
            // so the command can write straight into the mapped paths
            for file in self.upload_mapping.files() {
                if let Some(parent) = file.local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("failed to prepare `{}`", parent.display()))?;
                }
            }
            namespace.insert("upload_files".to_string(), local_upload.clone());
            namespace.insert("local_upload_files".to_string(), local_upload);
            namespace.insert("remote_upload_files".to_string(), remote_upload);
        }

        let attrs = Value::Object(
            self.message
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        namespace.insert("attrs".to_string(), attrs.clone());
        namespace.insert("attributes".to_string(), attrs);
        namespace.insert("data".to_string(), Value::String(self.message.data.clone()));
        self.namespace = Value::Object(namespace);

        self.command_line = command::build(&self.ctx.config.command, &self.namespace)?;
        self.workspace = Some(workspace);
        Ok(())
    }

    fn decode_files_attribute(&self, key: &str) -> anyhow::Result<Value> {
        match self.message.attribute(key) {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("malformed `{key}` attribute")),
            None => Ok(Value::Null),
        }
    }

    async fn execute(&self) -> anyhow::Result<()> {
        if self.ctx.config.command.dryrun {
            info!("Dryrun: `{}` was not executed.", self.command_line);
            return Ok(());
        }
        command::run(&self.command_line).await
    }

    async fn upload(&self) -> anyhow::Result<()> {
        match self.ctx.config.upload.mode() {
            UploadMode::Scan => {
                let workspace = self
                    .workspace
                    .as_ref()
                    .context("no workspace to scan for uploads")?;
                self.mapper
                    .upload_scan(&workspace.uploads_dir, &self.ctx.config.upload.bucket)
                    .await
            }
            UploadMode::Mapping => self.mapper.upload(&self.upload_mapping).await,
        }
    }

    async fn cleanup(&mut self) {
        self.emit(Stage::Cleanup, Phase::Starting, "Cleaning up the workspace.")
            .await;
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = workspace.remove() {
                warn!("Failed to remove the workspace: {e}.");
            }
        }
        self.emit(Stage::Cleanup, Phase::Completed, "Job cleanup done.")
            .await;
    }

    fn start_sustainer(&mut self) {
        let sustainer_config = &self.ctx.config.job.sustainer;
        if sustainer_config.disabled {
            return;
        }
        let delay = sustainer_config.delay_or(self.ctx.queue.ack_deadline());
        let interval = sustainer_config.interval_or(delay);
        self.sustainer = Some(LeaseSustainer::start(
            self.ctx.queue.clone(),
            self.message.id.clone(),
            self.message.ack_id.clone(),
            delay,
            interval,
        ));
    }

    async fn stop_sustainer(&mut self) {
        if let Some(sustainer) = self.sustainer.take() {
            sustainer.stop().await;
        }
    }

    async fn emit(&self, stage: Stage, phase: Phase, detail: impl Into<String>) {
        let event = stage.event(&self.message.id, phase, detail);
        self.ctx.notifier.notify(&event).await;
    }
}
