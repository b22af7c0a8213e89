pub mod artifact;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod reshape;
pub mod source;
pub mod storage;

pub use artifact::{Artifact, ArtifactStore, Envelope, ARTIFACT_ROOT};
pub use error::{Error, Result};
pub use pipeline::{
    NamedOutputSet, Pipeline, PipelineConfig, PipelineRun, StageReport, StageSpec, SOURCE_OUTPUT,
};
pub use processor::{
    AddressDetection, Bound, Coord, DecisionStatus, ErrorLog, ErrorTag, Processor,
    ProcessorFactory, ProcessorRegistry, Stage, StageArgs, StageError, StageFactory, StageResult,
    Summary, TextPage,
};
pub use reshape::{join_entities, reshape, reshape_with, OutputNames, ParsedEntityRecord, PipelineResult};
pub use source::{Jurisdiction, SourceDescriptor, SourceDirectory, SourceMetadata};
pub use storage::{PersistedIds, Storage};
