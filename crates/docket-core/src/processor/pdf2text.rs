use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{source_arg, ErrorLog, Stage, StageArgs, StageError, StageFactory, StageResult};
use crate::source::SourceDescriptor;

const PROCESSOR_NAME: &str = "pdf2text";
const DEFAULT_DPI: u32 = 200;

/// OCR output for one page of a scanned document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPage {
    pub page: usize,
    pub text: String,
    pub headers: Vec<String>,
    pub table: Vec<Vec<String>>,
}

/// Raw recognizer output for one page: plain text plus word-level TSV.
#[derive(Debug, Clone)]
pub struct RecognizedPage {
    pub text: String,
    pub tsv: String,
}

#[async_trait::async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, pdf: &Path) -> StageResult<Vec<RecognizedPage>>;
}

/// Splits tesseract TSV into its header row and the rows that carry a word.
pub fn parse_tesseract_tsv(data: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let mut rows = data.split('\n');
    let headers = rows
        .next()
        .map(|h| h.split('\t').map(String::from).collect())
        .unwrap_or_default();

    let table = rows
        .map(|row| row.split('\t').map(String::from).collect::<Vec<_>>())
        .filter(|values| values.last().is_some_and(|v| !v.is_empty()))
        .collect();

    (headers, table)
}

/// Rasterizes with `pdftoppm` and recognizes each page with `tesseract`.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    pdftoppm: PathBuf,
    tesseract: PathBuf,
    dpi: u32,
}

impl TesseractRecognizer {
    pub fn new(pdftoppm: PathBuf, tesseract: PathBuf) -> Self {
        Self {
            pdftoppm,
            tesseract,
            dpi: DEFAULT_DPI,
        }
    }

    /// Finds both binaries on `PATH`.
    pub fn locate() -> StageResult<Self> {
        let pdftoppm =
            which::which("pdftoppm").map_err(|_| StageError::ToolMissing("pdftoppm".into()))?;
        let tesseract =
            which::which("tesseract").map_err(|_| StageError::ToolMissing("tesseract".into()))?;
        Ok(Self::new(pdftoppm, tesseract))
    }

    #[must_use]
    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    async fn run<I, A>(program: &Path, args: I) -> StageResult<String>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(StageError::ToolFailed {
                tool: program.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn rasterize(&self, pdf: &Path, scratch: &Path) -> StageResult<Vec<PathBuf>> {
        let prefix = scratch.join("page");
        Self::run(
            &self.pdftoppm,
            [
                OsStr::new("-r"),
                OsStr::new(&self.dpi.to_string()),
                OsStr::new("-png"),
                pdf.as_os_str(),
                prefix.as_os_str(),
            ],
        )
        .await?;

        let mut images = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "png") {
                images.push(path);
            }
        }

        // pdftoppm zero-pads page numbers, so lexical order is page order.
        images.sort();
        Ok(images)
    }

    async fn recognize_in(&self, pdf: &Path, scratch: &Path) -> StageResult<Vec<RecognizedPage>> {
        let images = self.rasterize(pdf, scratch).await?;
        info!(pdf = %pdf.display(), pages = images.len(), "running OCR");

        let mut pages = Vec::with_capacity(images.len());
        for image in &images {
            let text = Self::run(&self.tesseract, [image.as_os_str(), OsStr::new("stdout")]).await?;
            let tsv = Self::run(
                &self.tesseract,
                [image.as_os_str(), OsStr::new("stdout"), OsStr::new("tsv")],
            )
            .await?;
            debug!(image = %image.display(), chars = text.len(), "recognized page");
            pages.push(RecognizedPage { text, tsv });
        }

        Ok(pages)
    }
}

#[async_trait::async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, pdf: &Path) -> StageResult<Vec<RecognizedPage>> {
        let scratch = std::env::temp_dir().join(format!("docket-ocr-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.recognize_in(pdf, &scratch).await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        result
    }
}

/// Finds `pdftoppm` and `tesseract` on the first recognition instead of at
/// startup, so cached runs work on hosts without either tool.
pub struct DeferredTesseract {
    dpi: u32,
    located: OnceCell<TesseractRecognizer>,
}

impl DeferredTesseract {
    pub fn new() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            located: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }
}

impl Default for DeferredTesseract {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TextRecognizer for DeferredTesseract {
    async fn recognize(&self, pdf: &Path) -> StageResult<Vec<RecognizedPage>> {
        let recognizer = self
            .located
            .get_or_try_init(|| async { TesseractRecognizer::locate().map(|r| r.with_dpi(self.dpi)) })
            .await?;
        recognizer.recognize(pdf).await
    }
}

/// Converts the source PDF into per-page text.
///
/// Constructor arguments: `[source]`. Extract arguments: none.
pub struct Pdf2TextStage {
    source: SourceDescriptor,
    recognizer: Arc<dyn TextRecognizer>,
}

#[async_trait::async_trait]
impl Stage for Pdf2TextStage {
    type Output = Vec<TextPage>;

    const NAME: &'static str = PROCESSOR_NAME;

    async fn extract(&self, _args: &StageArgs, _errors: &mut ErrorLog) -> StageResult<Vec<TextPage>> {
        let recognized = self.recognizer.recognize(&self.source.filepath).await?;

        Ok(recognized
            .into_iter()
            .enumerate()
            .map(|(page, r)| {
                let (headers, table) = parse_tesseract_tsv(&r.tsv);
                TextPage {
                    page,
                    text: r.text,
                    headers,
                    table,
                }
            })
            .collect())
    }
}

pub struct Pdf2TextFactory {
    recognizer: Arc<dyn TextRecognizer>,
}

impl Pdf2TextFactory {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }
}

impl StageFactory for Pdf2TextFactory {
    type Stage = Pdf2TextStage;

    fn construct(&self, args: &StageArgs) -> StageResult<Pdf2TextStage> {
        Ok(Pdf2TextStage {
            source: source_arg(args)?,
            recognizer: Arc::clone(&self.recognizer),
        })
    }
}
