use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::source::{check_path_segment, SourceDescriptor};
use crate::{Error, Result};

pub const ARTIFACT_ROOT: &str = "artifacts";

/// What is actually written to disk for each artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
    pub source: SourceDescriptor,
}

/// Path-addressed cache of stage outputs.
///
/// Layout: `<root>/<state_abbrv>/<city>/<doctype>/<year>/<date>-<id>-artifacts/<processor>.json`.
/// An artifact that exists is a cache hit; nothing is hashed or compared.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, source: &SourceDescriptor) -> PathBuf {
        self.root
            .join(&source.state_abbrv)
            .join(&source.city)
            .join(&source.doctype)
            .join(&source.year)
            .join(format!("{}-{}-artifacts", source.date, source.id))
    }

    /// Path of the artifact, creating its directory if needed.
    pub async fn locate(&self, source: &SourceDescriptor, processor: &str) -> Result<PathBuf> {
        source.validate()?;
        check_path_segment("processor", processor).map_err(Error::InvalidProcessorName)?;
        let dir = self.artifact_dir(source);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!("{processor}.json")))
    }

    /// Handle bound to one (source, processor) pair.
    pub async fn artifact(&self, source: &SourceDescriptor, processor: &str) -> Result<Artifact> {
        let path = self.locate(source, processor).await?;
        Ok(Artifact {
            path,
            processor: processor.to_string(),
            source: source.clone(),
        })
    }

    pub async fn exists(&self, source: &SourceDescriptor, processor: &str) -> Result<bool> {
        self.artifact(source, processor).await?.exists().await
    }

    pub async fn write<T: Serialize + Sync>(
        &self,
        source: &SourceDescriptor,
        processor: &str,
        data: &T,
        overwrite: bool,
    ) -> Result<PathBuf> {
        self.artifact(source, processor)
            .await?
            .write(data, overwrite)
            .await
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        source: &SourceDescriptor,
        processor: &str,
    ) -> Result<T> {
        self.artifact(source, processor).await?.read().await
    }

    pub async fn read_envelope<T: DeserializeOwned>(
        &self,
        source: &SourceDescriptor,
        processor: &str,
    ) -> Result<Envelope<T>> {
        self.artifact(source, processor).await?.read_envelope().await
    }

    pub async fn delete(&self, source: &SourceDescriptor, processor: &str) -> Result<()> {
        self.artifact(source, processor).await?.delete().await
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new(ARTIFACT_ROOT)
    }
}

/// One stage's artifact for one source document.
#[derive(Debug, Clone)]
pub struct Artifact {
    path: PathBuf,
    processor: String,
    source: SourceDescriptor,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    /// Writes `data` unless an artifact exists and `overwrite` is false, in
    /// which case the existing path is returned untouched.
    pub async fn write<T: Serialize + Sync>(&self, data: &T, overwrite: bool) -> Result<PathBuf> {
        if !overwrite && self.exists().await? {
            return Ok(self.path.clone());
        }

        let envelope = Envelope {
            data,
            timestamp: Utc::now(),
            source: self.source.clone(),
        };
        let body = serde_json::to_vec(&envelope)?;

        // Rename into place so a crash never leaves a truncated artifact.
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        debug!(path = %self.path.display(), overwrite, "wrote artifact");
        Ok(self.path.clone())
    }

    pub async fn read<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.read_envelope::<T>().await?.data)
    }

    pub async fn read_envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ArtifactNotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw).map_err(|source| Error::ArtifactRead {
            path: self.path.clone(),
            source,
        })
    }

    /// Removes the artifact. Deleting an absent artifact is a no-op.
    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "deleted artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
