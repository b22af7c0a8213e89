use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::address::AddressDetection;
use super::pdf2text::TextPage;
use super::{
    source_arg, ErrorLog, ErrorTag, Stage, StageArgs, StageError, StageFactory, StageResult,
};

const PROCESSOR_NAME: &str = "summarize";

pub const ENV_OPENAI_KEY: &str = "OPENAI_KEY";

pub const DEFAULT_TAGS: &[&str] = &[
    "INSTALLATION",
    "NEW_CONSTRUCTION",
    "AUXILIARY_UNIT",
    "EXTENSION",
    "ADJUSTMENT",
];

const SYSTEM_PROMPT: &str =
    "You are a document parsing tool. You only ever respond with a single JSON object.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Approved,
    Denied,
    NoStatus,
}

impl DecisionStatus {
    /// Lenient parse of a model's status field; anything unrecognized is `NoStatus`.
    pub fn parse(s: &str) -> Self {
        match s.trim().trim_matches('"').to_ascii_uppercase().as_str() {
            "APPROVED" => Self::Approved,
            "DENIED" => Self::Denied,
            _ => Self::NoStatus,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::NoStatus => "NO_STATUS",
        }
    }
}

/// The board's decision on one street, drawn from one window of pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub street: String,
    pub page: usize,
    pub status: DecisionStatus,
    pub summary: String,
    pub tags: Vec<String>,
}

/// Fields the model is asked to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFields {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait::async_trait]
pub trait SummaryModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> StageResult<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tags: Vec<String>,
    pub pages_per_window: usize,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-3.5-turbo".into(),
            temperature: 0.0,
            max_tokens: 1500,
            tags: DEFAULT_TAGS.iter().map(|t| (*t).to_string()).collect(),
            pages_per_window: 2,
        }
    }
}

impl SummarizeConfig {
    pub fn prompt(&self, street: &str, text: &str) -> String {
        format!(
            r#"For the property address below, identify the issue, the resolution and the decision.
Respond with a JSON object shaped like:

    {{
        "status": "<APPROVED, DENIED or NO_STATUS>",
        "summary": "<three sentence summary of the resolution for this property, or empty>",
        "tags": ["<every tag that applies from: {tags}>"]
    }}

Rules:
1. Work through each field step by step.
2. The response must be valid JSON.

property address: {street}

document: {text}
"#,
            tags = self.tags.join(", "),
        )
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

const SUMMARY_KEYS: [&str; 3] = ["status", "summary", "tags"];

/// `None` unless at least one recognized key was read.
fn parse_key_value(raw: &str, errors: &mut ErrorLog, street: &str) -> Option<SummaryFields> {
    let mut fields = SummaryFields::default();
    let mut recognized = false;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            errors.record(ErrorTag::InvalidKeyValue, street);
            return None;
        };
        let key = key.trim().trim_matches('"').to_ascii_lowercase();
        let value = value.trim().trim_end_matches(',');

        match key.as_str() {
            "status" => fields.status = value.trim_matches('"').to_string(),
            "summary" => fields.summary = value.trim_matches('"').to_string(),
            "tags" => {
                fields.tags = if value.contains('[') {
                    serde_json::from_str(value).unwrap_or_else(|_| {
                        errors.record(ErrorTag::InvalidTagList, street);
                        split_tags(value)
                    })
                } else {
                    split_tags(value)
                };
            }
            _ => continue,
        }
        recognized = true;
    }

    if !recognized {
        errors.record(ErrorTag::InvalidKeyValue, street);
        return None;
    }
    Some(fields)
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().trim_matches(['[', ']', '"', ' ']).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reads a JSON object whose fields have the wrong types, such as `tags`
/// given as a single string. `None` when no recognized key is present.
fn salvage_object(
    object: &Map<String, Value>,
    errors: &mut ErrorLog,
    street: &str,
) -> Option<SummaryFields> {
    if !SUMMARY_KEYS.iter().any(|k| object.contains_key(*k)) {
        return None;
    }

    let tags = match object.get("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => {
            items.iter().map(value_text).collect()
        }
        Some(Value::Array(items)) => {
            errors.record(ErrorTag::InvalidTagList, street);
            items.iter().map(value_text).filter(|t| !t.is_empty()).collect()
        }
        Some(Value::String(s)) => {
            errors.record(ErrorTag::InvalidTagList, street);
            split_tags(s)
        }
        Some(other) => {
            errors.record(ErrorTag::InvalidTagList, street);
            vec![other.to_string()]
        }
    };

    Some(SummaryFields {
        status: object.get("status").map(value_text).unwrap_or_default(),
        summary: object.get("summary").map(value_text).unwrap_or_default(),
        tags,
    })
}

/// Parses a model response, preferring JSON and falling back to `key: value` lines.
///
/// `None` means nothing usable came back; no empty summary is fabricated.
pub fn parse_summary_response(
    raw: &str,
    errors: &mut ErrorLog,
    street: &str,
) -> Option<SummaryFields> {
    let body = strip_code_fence(raw);
    if let Ok(fields) = serde_json::from_str::<SummaryFields>(body) {
        return Some(fields);
    }

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        if let Some(fields) = salvage_object(&object, errors, street) {
            return Some(fields);
        }
    }

    errors.record(ErrorTag::InvalidJson, street);
    parse_key_value(body, errors, street)
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct ChatCompletionModel {
    client: reqwest::Client,
    api_key: String,
    config: SummarizeConfig,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatCompletionModel {
    pub fn new(api_key: String, config: SummarizeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            config,
        }
    }

    /// Reads the API key from `OPENAI_KEY`.
    pub fn from_env(config: SummarizeConfig) -> StageResult<Self> {
        match std::env::var(ENV_OPENAI_KEY) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key, config)),
            _ => Err(StageError::ModelUnavailable(format!(
                "{ENV_OPENAI_KEY} env var not set"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SummaryModel for ChatCompletionModel {
    async fn complete(&self, system: &str, prompt: &str) -> StageResult<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StageError::RateLimited);
        }

        let parsed: ChatResponse = response.error_for_status()?.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| StageError::Failed("completion returned no choices".into()))
    }
}

/// Chat model that reads `OPENAI_KEY` on first use, so a run served
/// entirely from cache never needs the key.
pub struct DeferredChatModel {
    config: SummarizeConfig,
    model: OnceCell<ChatCompletionModel>,
}

impl DeferredChatModel {
    pub fn new(config: SummarizeConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
        }
    }
}

#[async_trait::async_trait]
impl SummaryModel for DeferredChatModel {
    async fn complete(&self, system: &str, prompt: &str) -> StageResult<String> {
        let model = self
            .model
            .get_or_try_init(|| async { ChatCompletionModel::from_env(self.config.clone()) })
            .await?;
        model.complete(system, prompt).await
    }
}

/// Summarizes the decision on every detected street.
///
/// Constructor arguments: `[source, pages]`. Extract arguments: `[addresses]`.
pub struct SummarizeStage {
    pages: Vec<TextPage>,
    model: Arc<dyn SummaryModel>,
    config: SummarizeConfig,
}

impl SummarizeStage {
    fn window_text(&self, start: usize) -> Option<(String, Vec<usize>)> {
        let first = self.pages.get(start)?;
        let mut text = first.text.clone();
        let mut covered = vec![start];

        for offset in 1..self.config.pages_per_window.max(1) {
            let Some(page) = self.pages.get(start + offset) else {
                break;
            };
            text.push('\n');
            text.push_str(&page.text);
            covered.push(start + offset);
        }

        Some((text, covered))
    }

    async fn summarize_street(
        &self,
        street: &str,
        detection: &AddressDetection,
        errors: &mut ErrorLog,
    ) -> StageResult<Vec<Summary>> {
        let mut summaries = Vec::new();
        let mut processed = BTreeSet::new();

        let mut pages = detection.pages.clone();
        pages.sort_unstable();

        for page in pages {
            if processed.contains(&page) {
                continue;
            }

            let Some((text, covered)) = self.window_text(page) else {
                errors.record(ErrorTag::PageOutOfRange, street);
                continue;
            };
            processed.extend(covered);

            let raw = self
                .model
                .complete(SYSTEM_PROMPT, &self.config.prompt(street, &text))
                .await?;
            debug!(street, page, "model responded");

            if let Some(fields) = parse_summary_response(&raw, errors, street) {
                summaries.push(Summary {
                    street: street.to_string(),
                    page,
                    status: DecisionStatus::parse(&fields.status),
                    summary: fields.summary,
                    tags: fields.tags,
                });
            }
        }

        Ok(summaries)
    }
}

#[async_trait::async_trait]
impl Stage for SummarizeStage {
    type Output = BTreeMap<String, Vec<Summary>>;

    const NAME: &'static str = PROCESSOR_NAME;

    async fn extract(&self, args: &StageArgs, errors: &mut ErrorLog) -> StageResult<Self::Output> {
        let addresses: BTreeMap<String, AddressDetection> = args.get(0)?;
        info!(streets = addresses.len(), "summarizing by address");

        let mut out = BTreeMap::new();
        for (street, detection) in &addresses {
            let summaries = self.summarize_street(street, detection, errors).await?;
            out.insert(street.clone(), summaries);
        }

        Ok(out)
    }
}

pub struct SummarizeFactory {
    model: Arc<dyn SummaryModel>,
    config: SummarizeConfig,
}

impl SummarizeFactory {
    pub fn new(model: Arc<dyn SummaryModel>, config: SummarizeConfig) -> Self {
        Self { model, config }
    }
}

impl StageFactory for SummarizeFactory {
    type Stage = SummarizeStage;

    fn construct(&self, args: &StageArgs) -> StageResult<SummarizeStage> {
        source_arg(args)?;
        Ok(SummarizeStage {
            pages: args.get(1)?,
            model: Arc::clone(&self.model),
            config: self.config.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|r| (*r).to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SummaryModel for ScriptedModel {
        async fn complete(&self, _system: &str, prompt: &str) -> StageResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| StageError::Failed("no scripted response".into()))
        }
    }

    fn pages(texts: &[&str]) -> Vec<TextPage> {
        texts
            .iter()
            .enumerate()
            .map(|(page, t)| TextPage {
                page,
                text: (*t).to_string(),
                headers: Vec::new(),
                table: Vec::new(),
            })
            .collect()
    }

    fn detection(street: &str, pages: &[usize]) -> AddressDetection {
        AddressDetection {
            street: street.to_string(),
            aliases: vec![format!("1 {street}")],
            pages: pages.to_vec(),
        }
    }

    fn stage(model: Arc<ScriptedModel>, texts: &[&str]) -> SummarizeStage {
        SummarizeStage {
            pages: pages(texts),
            model,
            config: SummarizeConfig::default(),
        }
    }

    #[test]
    fn json_response_parses_cleanly() {
        let mut errors = ErrorLog::new();
        let fields = parse_summary_response(
            r#"{"status": "APPROVED", "summary": "Deck allowed.", "tags": ["EXTENSION"]}"#,
            &mut errors,
            "Main St",
        )
        .unwrap();
        assert_eq!(fields.status, "APPROVED");
        assert_eq!(fields.tags, vec!["EXTENSION"]);
        assert!(errors.is_empty());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let mut errors = ErrorLog::new();
        let fields = parse_summary_response(
            "```json\n{\"status\": \"DENIED\", \"summary\": \"No.\", \"tags\": []}\n```",
            &mut errors,
            "Main St",
        )
        .unwrap();
        assert_eq!(fields.status, "DENIED");
        assert!(errors.is_empty());
    }

    #[test]
    fn key_value_fallback_records_invalid_json() {
        let mut errors = ErrorLog::new();
        let fields = parse_summary_response(
            "status: DENIED\nsummary: Fence too tall\ntags: [\"ADJUSTMENT\"]",
            &mut errors,
            "Oak Ave",
        )
        .unwrap();
        assert_eq!(fields.status, "DENIED");
        assert_eq!(fields.summary, "Fence too tall");
        assert_eq!(fields.tags, vec!["ADJUSTMENT"]);
        assert_eq!(errors.tags(), &[ErrorTag::InvalidJson]);
    }

    #[test]
    fn bad_tag_list_falls_back_to_split() {
        let mut errors = ErrorLog::new();
        let fields = parse_summary_response(
            "status: APPROVED\ntags: [INSTALLATION, EXTENSION",
            &mut errors,
            "Oak Ave",
        )
        .unwrap();
        assert_eq!(fields.tags, vec!["INSTALLATION", "EXTENSION"]);
        assert_eq!(
            errors.tags(),
            &[ErrorTag::InvalidJson, ErrorTag::InvalidTagList]
        );
    }

    #[test]
    fn unparsable_response_is_dropped() {
        let mut errors = ErrorLog::new();
        assert!(parse_summary_response("I cannot help with that", &mut errors, "Elm Ct").is_none());
        assert_eq!(
            errors.tags(),
            &[ErrorTag::InvalidJson, ErrorTag::InvalidKeyValue]
        );
    }

    #[test]
    fn json_with_string_tags_is_salvaged() {
        let mut errors = ErrorLog::new();
        let fields = parse_summary_response(
            r#"{"status": "APPROVED", "summary": "Deck ok", "tags": "EXTENSION, ADJUSTMENT"}"#,
            &mut errors,
            "Main St",
        )
        .unwrap();
        assert_eq!(fields.status, "APPROVED");
        assert_eq!(fields.summary, "Deck ok");
        assert_eq!(fields.tags, vec!["EXTENSION", "ADJUSTMENT"]);
        assert_eq!(errors.tags(), &[ErrorTag::InvalidTagList]);
    }

    #[test]
    fn response_without_known_keys_is_dropped() {
        let mut errors = ErrorLog::new();
        assert!(parse_summary_response(r#"{"answer": "yes"}"#, &mut errors, "Elm Ct").is_none());
        assert_eq!(
            errors.tags(),
            &[ErrorTag::InvalidJson, ErrorTag::InvalidKeyValue]
        );

        let mut errors = ErrorLog::new();
        assert!(parse_summary_response("note: nothing decided", &mut errors, "Elm Ct").is_none());
        assert_eq!(
            errors.tags(),
            &[ErrorTag::InvalidJson, ErrorTag::InvalidKeyValue]
        );
    }

    #[tokio::test]
    async fn mistyped_response_keeps_decision() {
        let model = Arc::new(ScriptedModel::new(&[
            r#"{"status": "APPROVED", "summary": "Deck ok", "tags": "EXTENSION"}"#,
            "Sorry, no decision found",
        ]));
        let stage = stage(model, &["p0", "p1", "p2"]);

        let mut addresses = BTreeMap::new();
        addresses.insert("Main St".to_string(), detection("Main St", &[0]));
        addresses.insert("Oak Ave".to_string(), detection("Oak Ave", &[2]));
        let args = StageArgs::new(vec![serde_json::to_value(&addresses).unwrap()]);

        let mut errors = ErrorLog::new();
        let out = stage.extract(&args, &mut errors).await.unwrap();

        let main = &out["Main St"];
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].status, DecisionStatus::Approved);
        assert_eq!(main[0].summary, "Deck ok");
        assert_eq!(main[0].tags, vec!["EXTENSION"]);
        assert!(out["Oak Ave"].is_empty());
        assert_eq!(
            errors.tags(),
            &[
                ErrorTag::InvalidTagList,
                ErrorTag::InvalidJson,
                ErrorTag::InvalidKeyValue
            ]
        );
    }

    #[test]
    fn unknown_status_is_no_status() {
        assert_eq!(DecisionStatus::parse("approved"), DecisionStatus::Approved);
        assert_eq!(DecisionStatus::parse("TABLED"), DecisionStatus::NoStatus);
        assert_eq!(
            serde_json::to_string(&DecisionStatus::NoStatus).unwrap(),
            "\"NO_STATUS\""
        );
    }

    #[tokio::test]
    async fn windows_skip_pages_already_covered() {
        let ok = r#"{"status": "APPROVED", "summary": "ok", "tags": []}"#;
        let model = Arc::new(ScriptedModel::new(&[ok, ok]));
        let stage = stage(Arc::clone(&model), &["p0", "p1", "p2", "p3"]);

        let mut addresses = BTreeMap::new();
        addresses.insert("Main St".to_string(), detection("Main St", &[3, 0, 1]));
        let args = StageArgs::new(vec![serde_json::to_value(&addresses).unwrap()]);

        let out = stage.extract(&args, &mut ErrorLog::new()).await.unwrap();

        let main = &out["Main St"];
        assert_eq!(main.iter().map(|s| s.page).collect::<Vec<_>>(), vec![0, 3]);
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("p0\np1"));
        assert!(prompts[1].contains("document: p3"));
    }

    #[tokio::test]
    async fn out_of_range_page_is_soft() {
        let model = Arc::new(ScriptedModel::new(&[]));
        let stage = stage(model, &["only page"]);

        let mut addresses = BTreeMap::new();
        addresses.insert("Oak Ave".to_string(), detection("Oak Ave", &[7]));
        let args = StageArgs::new(vec![serde_json::to_value(&addresses).unwrap()]);

        let mut errors = ErrorLog::new();
        let out = stage.extract(&args, &mut errors).await.unwrap();

        assert!(out["Oak Ave"].is_empty());
        assert_eq!(errors.tags(), &[ErrorTag::PageOutOfRange]);
    }

    #[tokio::test]
    async fn model_failure_is_fatal() {
        let model = Arc::new(ScriptedModel::new(&[]));
        let stage = stage(model, &["p0"]);

        let mut addresses = BTreeMap::new();
        addresses.insert("Oak Ave".to_string(), detection("Oak Ave", &[0]));
        let args = StageArgs::new(vec![serde_json::to_value(&addresses).unwrap()]);

        assert!(stage.extract(&args, &mut ErrorLog::new()).await.is_err());
    }

    #[tokio::test]
    async fn deferred_model_needs_key_only_when_called() {
        let model = DeferredChatModel::new(SummarizeConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".into(),
            ..SummarizeConfig::default()
        });
        if std::env::var(ENV_OPENAI_KEY).is_err() {
            assert!(matches!(
                model.complete("system", "prompt").await,
                Err(StageError::ModelUnavailable(_))
            ));
        }
    }

    #[test]
    fn prompt_lists_tag_vocabulary() {
        let prompt = SummarizeConfig::default().prompt("Main St", "minutes text");
        assert!(prompt.contains("INSTALLATION, NEW_CONSTRUCTION"));
        assert!(prompt.contains("property address: Main St"));
        assert!(prompt.contains("document: minutes text"));
    }
}
