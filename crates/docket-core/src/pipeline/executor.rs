use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{PipelineConfig, StageSpec};
use super::outputs::NamedOutputSet;
use crate::artifact::ArtifactStore;
use crate::processor::{ErrorTag, ProcessorRegistry};
use crate::source::SourceDescriptor;
use crate::{Error, Result};

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub output: String,
    pub processor: String,
    pub cache_hit: bool,
    pub errors: Vec<ErrorTag>,
}

/// Outputs and per-stage reports from one run over one source.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub outputs: NamedOutputSet,
    pub stages: Vec<StageReport>,
}

impl PipelineRun {
    pub fn soft_errors(&self) -> impl Iterator<Item = (&str, ErrorTag)> {
        self.stages
            .iter()
            .flat_map(|s| s.errors.iter().map(move |tag| (s.output.as_str(), *tag)))
    }
}

/// Runs an ordered stage list against source documents, one at a time.
///
/// Each stage is memoized in the artifact store. A stage whose artifact
/// already exists is loaded instead of computed, so re-running a source after
/// a failure only repeats the stages that never completed.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    registry: ProcessorRegistry,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: ProcessorRegistry,
        store: ArtifactStore,
    ) -> Result<Self> {
        config.validate(&registry)?;
        Ok(Self {
            config,
            registry,
            store,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run(&self, source: &SourceDescriptor) -> Result<PipelineRun> {
        source.validate()?;
        info!(source = %source.label(), "running pipeline");

        let mut outputs = NamedOutputSet::new(source)?;
        let mut stages = Vec::with_capacity(self.config.stages.len());

        for spec in &self.config.stages {
            let report = self.run_stage(spec, source, &mut outputs).await?;
            stages.push(report);
        }

        Ok(PipelineRun { outputs, stages })
    }

    async fn run_stage(
        &self,
        spec: &StageSpec,
        source: &SourceDescriptor,
        outputs: &mut NamedOutputSet,
    ) -> Result<StageReport> {
        let factory = self
            .registry
            .get(&spec.processor)
            .ok_or_else(|| Error::UnknownProcessor(spec.processor.clone()))?;

        let args = outputs.resolve_all(&spec.args);
        let artifact = self.store.artifact(source, factory.name()).await?;
        let mut processor = factory.build(&args, artifact)?;

        let cache_hit = spec.load_from_cache && processor.artifact_exists().await?;
        let value = if cache_hit {
            info!(stage = %spec.output, processor = processor.name(), "loaded from cache");
            processor.load().await?
        } else {
            info!(stage = %spec.output, processor = processor.name(), "computing");
            let extract_args = outputs.resolve_all(&spec.extract_args);
            let value = processor.extract(&extract_args).await?;
            let path = processor.save(true).await?;
            debug!(path = %path.display(), "saved artifact");
            value
        };

        let errors = processor.errors().to_vec();
        if !errors.is_empty() {
            warn!(
                stage = %spec.output,
                count = errors.len(),
                "stage completed with soft failures"
            );
        }

        outputs.publish(&spec.output, value);

        Ok(StageReport {
            output: spec.output.clone(),
            processor: spec.processor.clone(),
            cache_hit,
            errors,
        })
    }
}
