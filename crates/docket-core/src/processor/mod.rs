mod address;
mod geocode;
mod pdf2text;
mod summarize;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::artifact::Artifact;
use crate::source::SourceDescriptor;
use crate::{Error, Result};

pub use address::{AddressDetection, AddressFactory, AddressStage, StreetDetector};
pub use geocode::{Coord, GeocodeConfig, GeocodeFactory, GeocodeStage, Geocoder, NominatimGeocoder};
pub use pdf2text::{
    parse_tesseract_tsv, DeferredTesseract, Pdf2TextFactory, Pdf2TextStage, RecognizedPage, TesseractRecognizer,
    TextPage, TextRecognizer,
};
pub use summarize::{
    parse_summary_response, ChatCompletionModel, DecisionStatus, DeferredChatModel, SummarizeConfig,
    SummarizeFactory, SummarizeStage, Summary, SummaryFields, SummaryModel, DEFAULT_TAGS,
    ENV_OPENAI_KEY,
};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage failed: {0}")]
    Failed(String),
    #[error("Invalid argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Required tool not found: {0}")]
    ToolMissing(String),
    #[error("Tool {tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StageResult<T> = std::result::Result<T, StageError>;

/// Soft failures a stage records without aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTag {
    GeocodeFailed,
    InvalidJson,
    InvalidKeyValue,
    InvalidTagList,
    PageOutOfRange,
}

impl ErrorTag {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeocodeFailed => "GEOCODE_FAILED",
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidKeyValue => "INVALID_KEY_VALUE",
            Self::InvalidTagList => "INVALID_TAG_LIST",
            Self::PageOutOfRange => "PAGE_OUT_OF_RANGE",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates soft failures during one `extract` call.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    tags: Vec<ErrorTag>,
}

impl ErrorLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tag: ErrorTag, entity: &str) {
        warn!(%tag, entity, "soft stage failure");
        self.tags.push(tag);
    }

    pub fn tags(&self) -> &[ErrorTag] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

/// Resolved stage arguments, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct StageArgs(Vec<Value>);

impl StageArgs {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn raw(&self, index: usize) -> StageResult<&Value> {
        self.0.get(index).ok_or_else(|| StageError::InvalidArgument {
            index,
            reason: format!("only {} arguments given", self.0.len()),
        })
    }

    /// Decodes argument `index` into the stage's native type.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> StageResult<T> {
        let value = self.raw(index)?.clone();
        serde_json::from_value(value).map_err(|e| StageError::InvalidArgument {
            index,
            reason: e.to_string(),
        })
    }
}

impl From<Vec<Value>> for StageArgs {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// The capability every pipeline stage exposes to the executor.
///
/// A processor is built for one source document and bound to that document's
/// artifact. `extract` always computes; the executor decides whether to call
/// `load` instead.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Soft failures from the most recent `extract`.
    fn errors(&self) -> &[ErrorTag];

    /// Last computed or loaded output.
    fn result(&self) -> Option<Value>;

    async fn artifact_exists(&self) -> Result<bool>;

    async fn extract(&mut self, args: &StageArgs) -> Result<Value>;

    async fn save(&self, overwrite: bool) -> Result<PathBuf>;

    async fn load(&mut self) -> Result<Value>;
}

/// A typed computation that can be lifted into a [`Processor`] with [`Bound`].
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send + Sync;

    const NAME: &'static str;

    async fn extract(&self, args: &StageArgs, errors: &mut ErrorLog) -> StageResult<Self::Output>;
}

/// Binds a [`Stage`] to its artifact and keeps its native result.
pub struct Bound<S: Stage> {
    stage: S,
    artifact: Artifact,
    result: Option<S::Output>,
    errors: ErrorLog,
}

impl<S: Stage> Bound<S> {
    pub fn new(stage: S, artifact: Artifact) -> Self {
        Self {
            stage,
            artifact,
            result: None,
            errors: ErrorLog::new(),
        }
    }

    pub fn typed_result(&self) -> Option<&S::Output> {
        self.result.as_ref()
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }
}

#[async_trait::async_trait]
impl<S: Stage> Processor for Bound<S> {
    fn name(&self) -> &str {
        S::NAME
    }

    fn errors(&self) -> &[ErrorTag] {
        self.errors.tags()
    }

    fn result(&self) -> Option<Value> {
        self.result
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok())
    }

    async fn artifact_exists(&self) -> Result<bool> {
        self.artifact.exists().await
    }

    async fn extract(&mut self, args: &StageArgs) -> Result<Value> {
        self.errors.clear();
        let output = self
            .stage
            .extract(args, &mut self.errors)
            .await
            .map_err(|e| Error::stage(S::NAME, e))?;
        let value = serde_json::to_value(&output)?;
        self.result = Some(output);
        Ok(value)
    }

    async fn save(&self, overwrite: bool) -> Result<PathBuf> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| Error::NoResult(S::NAME.to_string()))?;
        self.artifact.write(result, overwrite).await
    }

    async fn load(&mut self) -> Result<Value> {
        // Decoding into the native type catches artifacts of the wrong shape.
        let output: S::Output = self.artifact.read().await?;
        let value = serde_json::to_value(&output)?;
        self.result = Some(output);
        Ok(value)
    }
}

/// Builds a processor for one source document from its resolved arguments.
pub trait ProcessorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, args: &StageArgs, artifact: Artifact) -> Result<Box<dyn Processor>>;
}

/// Typed constructor for a [`Stage`]; every implementor is a [`ProcessorFactory`].
pub trait StageFactory: Send + Sync {
    type Stage: Stage + 'static;

    fn construct(&self, args: &StageArgs) -> StageResult<Self::Stage>;
}

impl<F: StageFactory> ProcessorFactory for F {
    fn name(&self) -> &str {
        F::Stage::NAME
    }

    fn build(&self, args: &StageArgs, artifact: Artifact) -> Result<Box<dyn Processor>> {
        let stage = self
            .construct(args)
            .map_err(|e| Error::stage(F::Stage::NAME, e))?;
        Ok(Box::new(Bound::new(stage, artifact)))
    }
}

/// Processor factories addressable by name from a pipeline configuration.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    factories: HashMap<String, Arc<dyn ProcessorFactory>>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, factory: impl ProcessorFactory + 'static) -> Self {
        self.register(factory);
        self
    }

    pub fn register(&mut self, factory: impl ProcessorFactory + 'static) {
        self.factories
            .insert(factory.name().to_string(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ProcessorFactory>> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

/// The source descriptor every stage takes as its first constructor argument.
pub(crate) fn source_arg(args: &StageArgs) -> StageResult<SourceDescriptor> {
    args.get(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::source::test_source;
    use serde_json::json;
    use tempfile::TempDir;

    struct Doubler;

    #[async_trait::async_trait]
    impl Stage for Doubler {
        type Output = Vec<i64>;
        const NAME: &'static str = "doubler";

        async fn extract(
            &self,
            args: &StageArgs,
            errors: &mut ErrorLog,
        ) -> StageResult<Self::Output> {
            let input: Vec<i64> = args.get(0)?;
            if input.is_empty() {
                errors.record(ErrorTag::InvalidJson, "empty");
            }
            Ok(input.into_iter().map(|n| n * 2).collect())
        }
    }

    struct DoublerFactory;

    impl StageFactory for DoublerFactory {
        type Stage = Doubler;

        fn construct(&self, _args: &StageArgs) -> StageResult<Doubler> {
            Ok(Doubler)
        }
    }

    async fn bound(tmp: &TempDir) -> Box<dyn Processor> {
        let store = ArtifactStore::new(tmp.path());
        let artifact = store
            .artifact(&test_source(tmp.path()), "doubler")
            .await
            .unwrap();
        DoublerFactory.build(&StageArgs::default(), artifact).unwrap()
    }

    #[test]
    fn error_tags_serialize_screaming() {
        let json = serde_json::to_string(&ErrorTag::GeocodeFailed).unwrap();
        assert_eq!(json, "\"GEOCODE_FAILED\"");
        assert_eq!(ErrorTag::InvalidTagList.to_string(), "INVALID_TAG_LIST");
    }

    #[test]
    fn stage_args_report_bad_index_and_shape() {
        let args = StageArgs::new(vec![json!("pages")]);
        assert!(matches!(
            args.get::<String>(1),
            Err(StageError::InvalidArgument { index: 1, .. })
        ));
        assert!(matches!(
            args.get::<Vec<i64>>(0),
            Err(StageError::InvalidArgument { index: 0, .. })
        ));
        assert_eq!(args.get::<String>(0).unwrap(), "pages");
    }

    #[tokio::test]
    async fn bound_stage_extracts_saves_and_loads() {
        let tmp = TempDir::new().unwrap();
        let mut processor = bound(&tmp).await;

        assert!(!processor.artifact_exists().await.unwrap());
        let value = processor
            .extract(&StageArgs::new(vec![json!([1, 2, 3])]))
            .await
            .unwrap();
        assert_eq!(value, json!([2, 4, 6]));
        assert!(processor.errors().is_empty());

        processor.save(false).await.unwrap();
        assert!(processor.artifact_exists().await.unwrap());

        let mut fresh = bound(&tmp).await;
        assert!(fresh.result().is_none());
        assert_eq!(fresh.load().await.unwrap(), json!([2, 4, 6]));
        assert_eq!(fresh.result(), Some(json!([2, 4, 6])));
    }

    #[tokio::test]
    async fn soft_errors_reset_between_extracts() {
        let tmp = TempDir::new().unwrap();
        let mut processor = bound(&tmp).await;

        processor
            .extract(&StageArgs::new(vec![json!([])]))
            .await
            .unwrap();
        assert_eq!(processor.errors(), &[ErrorTag::InvalidJson]);

        processor
            .extract(&StageArgs::new(vec![json!([5])]))
            .await
            .unwrap();
        assert!(processor.errors().is_empty());
    }

    #[tokio::test]
    async fn save_before_extract_fails() {
        let tmp = TempDir::new().unwrap();
        let processor = bound(&tmp).await;
        assert!(matches!(
            processor.save(true).await,
            Err(Error::NoResult(_))
        ));
    }

    #[tokio::test]
    async fn load_rejects_wrong_shape() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        store
            .write(&test_source(tmp.path()), "doubler", &json!({"not": "a list"}), false)
            .await
            .unwrap();

        let mut processor = bound(&tmp).await;
        assert!(matches!(
            processor.load().await,
            Err(Error::ArtifactRead { .. })
        ));
    }

    #[test]
    fn registry_lists_names_sorted() {
        let registry = ProcessorRegistry::new().with(DoublerFactory);
        assert!(registry.contains("doubler"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["doubler"]);
    }
}
