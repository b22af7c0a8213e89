use std::path::PathBuf;

use thiserror::Error;

use crate::processor::StageError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("Artifact at {} could not be decoded: {source}", path.display())]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Stage {0} has no result to save")]
    NoResult(String),

    #[error("Entity {entity} is missing from {output}")]
    MissingEntity { entity: String, output: String },

    #[error("Named output not found: {0}")]
    MissingOutput(String),

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Processor {0} appears in more than one stage")]
    DuplicateProcessor(String),

    #[error("Output name {0} is published more than once")]
    DuplicateOutput(String),

    #[error("Output name {0} is reserved")]
    ReservedOutput(String),

    #[error("Stage {stage} references {name} before it is published")]
    ForwardReference { stage: String, name: String },

    #[error("Invalid source descriptor: {0}")]
    InvalidSource(String),

    #[error("Invalid processor name: {0}")]
    InvalidProcessorName(String),

    #[error("Stored id is not a UUID: {0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn stage(stage: impl Into<String>, source: StageError) -> Self {
        Self::Stage {
            stage: stage.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
