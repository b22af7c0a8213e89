use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::outputs::SOURCE_OUTPUT;
use crate::processor::ProcessorRegistry;
use crate::{Error, Result};

const fn default_true() -> bool {
    true
}

fn default_args() -> Vec<String> {
    vec![SOURCE_OUTPUT.to_string()]
}

/// One step of a pipeline.
///
/// Every name in `args` and `extract_args` is looked up among the outputs
/// published so far; a name that was never published is passed as a literal
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub processor: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub extract_args: Vec<String>,
    pub output: String,
    #[serde(default = "default_true")]
    pub load_from_cache: bool,
}

impl StageSpec {
    pub fn new(processor: &str, output: &str) -> Self {
        Self {
            processor: processor.to_string(),
            args: default_args(),
            extract_args: Vec::new(),
            output: output.to_string(),
            load_from_cache: true,
        }
    }

    #[must_use]
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| (*a).to_string()).collect();
        self
    }

    #[must_use]
    pub fn extract_args(mut self, args: &[&str]) -> Self {
        self.extract_args = args.iter().map(|a| (*a).to_string()).collect();
        self
    }

    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.load_from_cache = false;
        self
    }

    fn references(&self) -> impl Iterator<Item = &String> {
        self.args.iter().chain(self.extract_args.iter())
    }
}

/// Ordered stage list run against each source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                StageSpec::new("pdf2text", "pages"),
                StageSpec::new("address", "addresses").extract_args(&["pages"]),
                StageSpec::new("summarize", "summaries")
                    .args(&[SOURCE_OUTPUT, "pages"])
                    .extract_args(&["addresses"]),
                StageSpec::new("geocode", "coords").extract_args(&["summaries"]),
            ],
        }
    }
}

impl PipelineConfig {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    /// Rejects unknown processors, clashing outputs and references to outputs
    /// that are only published later.
    pub fn validate(&self, registry: &ProcessorRegistry) -> Result<()> {
        let mut outputs = HashSet::new();
        let mut processors = HashSet::new();

        for spec in &self.stages {
            if !registry.contains(&spec.processor) {
                return Err(Error::UnknownProcessor(spec.processor.clone()));
            }
            if !processors.insert(spec.processor.as_str()) {
                return Err(Error::DuplicateProcessor(spec.processor.clone()));
            }
            if spec.output == SOURCE_OUTPUT {
                return Err(Error::ReservedOutput(spec.output.clone()));
            }
            if !outputs.insert(spec.output.as_str()) {
                return Err(Error::DuplicateOutput(spec.output.clone()));
            }
        }

        for (index, spec) in self.stages.iter().enumerate() {
            let later: HashSet<&str> = self.stages[index..]
                .iter()
                .map(|s| s.output.as_str())
                .collect();

            if let Some(name) = spec.references().find(|n| later.contains(n.as_str())) {
                return Err(Error::ForwardReference {
                    stage: spec.output.clone(),
                    name: name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::processor::{Processor, ProcessorFactory, StageArgs};

    fn registry(names: &[&'static str]) -> ProcessorRegistry {
        struct Fake(&'static str);

        impl ProcessorFactory for Fake {
            fn name(&self) -> &str {
                self.0
            }

            fn build(&self, _args: &StageArgs, _artifact: Artifact) -> Result<Box<dyn Processor>> {
                Err(Error::UnknownProcessor(self.0.to_string()))
            }
        }

        let mut registry = ProcessorRegistry::new();
        for name in names {
            registry.register(Fake(*name));
        }
        registry
    }

    #[test]
    fn default_pipeline_is_valid() {
        let registry = registry(&["pdf2text", "address", "summarize", "geocode"]);
        PipelineConfig::default().validate(&registry).unwrap();
    }

    #[test]
    fn forward_reference_is_rejected() {
        let registry = registry(&["a", "b"]);
        let config = PipelineConfig::new(vec![
            StageSpec::new("a", "first").extract_args(&["second"]),
            StageSpec::new("b", "second"),
        ]);
        assert!(matches!(
            config.validate(&registry),
            Err(Error::ForwardReference { ref name, .. }) if name == "second"
        ));
    }

    #[test]
    fn self_reference_is_rejected() {
        let registry = registry(&["a"]);
        let config = PipelineConfig::new(vec![StageSpec::new("a", "first").args(&["first"])]);
        assert!(matches!(
            config.validate(&registry),
            Err(Error::ForwardReference { .. })
        ));
    }

    #[test]
    fn clashing_names_are_rejected() {
        let registry = registry(&["a", "b"]);

        let unknown = PipelineConfig::new(vec![StageSpec::new("zzz", "x")]);
        assert!(matches!(
            unknown.validate(&registry),
            Err(Error::UnknownProcessor(_))
        ));

        let reserved = PipelineConfig::new(vec![StageSpec::new("a", SOURCE_OUTPUT)]);
        assert!(matches!(
            reserved.validate(&registry),
            Err(Error::ReservedOutput(_))
        ));

        let duplicate = PipelineConfig::new(vec![StageSpec::new("a", "x"), StageSpec::new("b", "x")]);
        assert!(matches!(
            duplicate.validate(&registry),
            Err(Error::DuplicateOutput(_))
        ));

        let reused = PipelineConfig::new(vec![StageSpec::new("a", "x"), StageSpec::new("a", "y")]);
        assert!(matches!(
            reused.validate(&registry),
            Err(Error::DuplicateProcessor(_))
        ));
    }

    #[test]
    fn json_defaults_args_and_caching() {
        let config = PipelineConfig::from_json(
            r#"{"stages": [{"processor": "pdf2text", "output": "pages"}]}"#,
        )
        .unwrap();
        let stage = &config.stages[0];
        assert_eq!(stage.args, vec![SOURCE_OUTPUT]);
        assert!(stage.extract_args.is_empty());
        assert!(stage.load_from_cache);
    }

    #[test]
    fn stage_builder_sets_fields() {
        let spec = StageSpec::new("summarize", "summaries")
            .args(&["source", "pages"])
            .extract_args(&["addresses"])
            .no_cache();
        assert_eq!(spec.args, vec!["source", "pages"]);
        assert_eq!(spec.extract_args, vec!["addresses"]);
        assert!(!spec.load_from_cache);
    }
}
