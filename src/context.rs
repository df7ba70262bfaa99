use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use serde_json::Value;
use tempfile::TempDir;
use tracing::info;

use crate::{
    remote::{RemoteUrl, UnsupportedSchemeError},
    storage::Storage,
};

// Scratch directory for one job: inputs are staged under `downloads/`,
// the command leaves its results under `uploads/`. Removed exactly once
// when the job is done, however it went.
pub struct Workspace {
    root: TempDir,
    pub downloads_dir: PathBuf,
    pub uploads_dir: PathBuf,
}

impl Workspace {
    pub fn create() -> anyhow::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("stagehand-")
            .tempdir()
            .context("failed to create a workspace directory")?;
        let downloads_dir = root.path().join("downloads");
        let uploads_dir = root.path().join("uploads");
        std::fs::create_dir_all(&downloads_dir)?;
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Workspace {
            root: root,
            downloads_dir: downloads_dir,
            uploads_dir: uploads_dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn remove(self) -> std::io::Result<()> {
        self.root.close()
    }
}

// One remote reference resolved to its place on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    pub url: String,
    pub bucket: String,
    pub object: String,
    pub local: PathBuf,
}

// Every distinct remote reference of one file description, keyed by url.
// Iteration order is the sorted url order, so transfers are deterministic.
#[derive(Debug, Default)]
pub struct PathMapping {
    entries: BTreeMap<String, MappedFile>,
}

impl PathMapping {
    pub fn get(&self, url: &str) -> Option<&MappedFile> {
        self.entries.get(url)
    }

    pub fn files(&self) -> impl Iterator<Item = &MappedFile> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Translates the remote references of a job description into workspace
// paths and moves the bytes either way through the storage client.
pub struct PathMapper {
    storage: Arc<dyn Storage>,
    scheme: String,
    last_bucket: Option<String>,
}

impl PathMapper {
    pub fn new(storage: Arc<dyn Storage>, scheme: String) -> Self {
        PathMapper {
            storage: storage,
            scheme: scheme,
            last_bucket: None,
        }
    }

    // Walk the description and give every remote reference a local path
    // `<base_dir>/<bucket>/<object>`. Duplicate references collapse into
    // one entry. A url with a foreign scheme fails the whole build.
    pub fn build_mapping(
        &self,
        base_dir: &Path,
        description: &Value,
    ) -> Result<PathMapping, UnsupportedSchemeError> {
        let mut mapping = PathMapping::default();
        self.collect_refs(base_dir, description, &mut mapping)?;
        Ok(mapping)
    }

    fn collect_refs(
        &self,
        base_dir: &Path,
        value: &Value,
        mapping: &mut PathMapping,
    ) -> Result<(), UnsupportedSchemeError> {
        match value {
            Value::Object(map) => {
                for child in map.values() {
                    self.collect_refs(base_dir, child, mapping)?;
                }
            }
            Value::Array(items) => {
                for child in items {
                    self.collect_refs(base_dir, child, mapping)?;
                }
            }
            Value::String(s) => {
                if let Some(url) = RemoteUrl::parse(s, &self.scheme)? {
                    mapping.entries.insert(
                        s.clone(),
                        MappedFile {
                            url: s.clone(),
                            local: base_dir.join(&url.bucket).join(&url.object),
                            bucket: url.bucket,
                            object: url.object,
                        },
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    // Shape-preserving copy of the description with every mapped url
    // replaced by its local path. Only strings the mapping knows are
    // touched; everything else passes through as is.
    pub fn build_local_view(&self, description: &Value, mapping: &PathMapping) -> Value {
        match description {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.build_local_view(v, mapping)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.build_local_view(v, mapping))
                    .collect(),
            ),
            Value::String(s) => match mapping.get(s) {
                Some(file) => Value::String(file.local.display().to_string()),
                None => description.clone(),
            },
            other => other.clone(),
        }
    }

    // Fetch every mapped object into the workspace. The first failure
    // aborts the remaining transfers; retrying is the caller's business.
    pub async fn download(&mut self, mapping: &PathMapping) -> anyhow::Result<()> {
        for file in mapping.files() {
            if let Some(parent) = file.local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to prepare `{}`", parent.display()))?;
            }
            info!("Downloading `{}` to `{}`.", file.url, file.local.display());
            self.storage
                .download(&file.bucket, &file.object, &file.local)
                .await?;
            info!("Downloaded `{}`.", file.url);
            self.last_bucket = Some(file.bucket.clone());
        }
        Ok(())
    }

    // Mapping-directed upload, the mirror image of `download`.
    pub async fn upload(&self, mapping: &PathMapping) -> anyhow::Result<()> {
        for file in mapping.files() {
            info!("Uploading `{}` from `{}`.", file.url, file.local.display());
            self.storage
                .upload(&file.bucket, &file.object, &file.local)
                .await?;
            info!("Uploaded `{}`.", file.url);
        }
        Ok(())
    }

    // Scan-directed upload: everything the command left under `uploads/`
    // goes to the override bucket when configured, otherwise to the last
    // bucket seen while downloading.
    pub async fn upload_scan(
        &self,
        uploads_dir: &Path,
        bucket_override: &str,
    ) -> anyhow::Result<()> {
        let files = collect_files(uploads_dir).await?;
        if files.is_empty() {
            return Ok(());
        }
        let bucket = if !bucket_override.is_empty() {
            bucket_override
        } else {
            self.last_bucket.as_deref().ok_or_else(|| {
                anyhow!("no upload bucket known: nothing was downloaded and no bucket is configured")
            })?
        };
        for path in files {
            let object = path
                .strip_prefix(uploads_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            info!(
                "Uploading `{}` to `{}://{}/{}`.",
                path.display(),
                self.scheme,
                bucket,
                object
            );
            self.storage.upload(bucket, &object, &path).await?;
            info!("Uploaded `{}://{}/{}`.", self.scheme, bucket, object);
        }
        Ok(())
    }

    pub fn last_bucket(&self) -> Option<&str> {
        self.last_bucket.as_deref()
    }
}

// All regular files under `root`, recursively, in sorted order.
async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
