use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Identifying fields for one municipality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub state_abbrv: String,
    pub state: String,
    pub city: String,
    pub municipal: String,
}

impl Jurisdiction {
    #[must_use]
    pub fn new(state_abbrv: &str, state: &str, city: &str, municipal: &str) -> Self {
        Self {
            state_abbrv: state_abbrv.to_string(),
            state: state.to_string(),
            city: city.to_string(),
            municipal: municipal.to_string(),
        }
    }
}

/// One downloaded meeting document.
///
/// The descriptor is both a parameter to every stage and the key under which
/// stage artifacts are stored, so the path fields must stay stable for the
/// life of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub state_abbrv: String,
    pub state: String,
    pub city: String,
    pub municipal: String,
    pub doctype: String,
    pub year: String,
    pub date: String,
    pub id: String,
    pub filepath: PathBuf,
    pub url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SourceDescriptor {
    #[must_use]
    pub fn new(
        jurisdiction: &Jurisdiction,
        doctype: &str,
        metadata: SourceMetadata,
        filepath: PathBuf,
    ) -> Self {
        let mut extra = serde_json::Map::new();
        if let Some(label) = metadata.label {
            extra.insert("label".into(), serde_json::Value::String(label));
        }

        Self {
            state_abbrv: jurisdiction.state_abbrv.clone(),
            state: jurisdiction.state.clone(),
            city: jurisdiction.city.clone(),
            municipal: jurisdiction.municipal.clone(),
            doctype: doctype.to_string(),
            year: metadata.year,
            date: metadata.date,
            id: metadata.id,
            filepath,
            url: metadata.url,
            extra,
        }
    }

    /// Checks the fields that make up an artifact path.
    pub fn validate(&self) -> Result<()> {
        let keyed = [
            ("state_abbrv", &self.state_abbrv),
            ("city", &self.city),
            ("doctype", &self.doctype),
            ("year", &self.year),
            ("date", &self.date),
            ("id", &self.id),
        ];

        for (field, value) in keyed {
            check_path_segment(field, value).map_err(Error::InvalidSource)?;
        }

        Ok(())
    }

    /// Human readable label, falling back to the file path.
    pub fn label(&self) -> String {
        self.extra
            .get("label")
            .and_then(|v| v.as_str())
            .map_or_else(|| self.filepath.display().to_string(), String::from)
    }
}

/// A value used as one directory or file name component of an artifact path.
pub(crate) fn check_path_segment(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} is empty"));
    }
    if value.contains(['/', '\\']) || value == ".." || value == "." {
        return Err(format!("{field} is not a path segment: {value}"));
    }
    Ok(())
}

/// Fields recorded by the crawler for each document it downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub id: String,
    pub year: String,
    pub date: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataSidecar {
    metadata: SourceMetadata,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    source_path: Option<String>,
}

/// Downloaded documents for one jurisdiction, doctype and year.
///
/// Layout: `<root>/<state_abbrv>/<city>/<doctype>/<year>/<date>-minutes.pdf`
/// with a `<date>-minutes_metadata.json` sidecar next to each PDF.
#[derive(Debug, Clone)]
pub struct SourceDirectory {
    jurisdiction: Jurisdiction,
    doctype: String,
    dir: PathBuf,
}

impl SourceDirectory {
    pub fn new(root: &Path, jurisdiction: Jurisdiction, doctype: &str, year: &str) -> Self {
        let dir = root
            .join(&jurisdiction.state_abbrv)
            .join(&jurisdiction.city)
            .join(doctype)
            .join(year);

        Self {
            jurisdiction,
            doctype: doctype.to_string(),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// PDF file names in this directory, sorted. A missing directory is empty.
    pub async fn source_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with("pdf") && entry.path().is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    pub async fn read_metadata(&self, source_name: &str) -> Result<SourceMetadata> {
        let date = source_name.get(..10).ok_or_else(|| {
            Error::InvalidSource(format!("{source_name} does not start with a date"))
        })?;
        let path = self.dir.join(format!("{date}-minutes_metadata.json"));

        let raw = tokio::fs::read_to_string(&path).await?;
        let sidecar: MetadataSidecar = serde_json::from_str(&raw)?;
        Ok(sidecar.metadata)
    }

    pub async fn descriptor(&self, source_name: &str) -> Result<SourceDescriptor> {
        let metadata = self.read_metadata(source_name).await?;
        let descriptor = SourceDescriptor::new(
            &self.jurisdiction,
            &self.doctype,
            metadata,
            self.dir.join(source_name),
        );
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Descriptors for every PDF with a readable sidecar. A PDF whose sidecar
    /// is missing or malformed is logged and skipped.
    pub async fn descriptors(&self) -> Result<Vec<SourceDescriptor>> {
        let mut sources = Vec::new();

        for name in self.source_files().await? {
            match self.descriptor(&name).await {
                Ok(descriptor) => sources.push(descriptor),
                Err(e) => {
                    warn!(path = %self.dir.join(&name).display(), error = %e, "skipping source");
                }
            }
        }

        Ok(sources)
    }
}

#[cfg(test)]
pub(crate) fn test_source(root: &Path) -> SourceDescriptor {
    SourceDescriptor::new(
        &Jurisdiction::new("NJ", "New Jersey", "Millburn", "Millburn Township"),
        "ZONING",
        SourceMetadata {
            id: "4821".into(),
            year: "2022".into(),
            date: "2022-03-14".into(),
            url: "https://example.org/AgendaCenter/ViewFile/Minutes/_03142022-4821".into(),
            label: Some("Zoning Board Minutes".into()),
        },
        root.join("2022-03-14-minutes.pdf"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sidecar(dir: &Path, date: &str, id: &str) {
        std::fs::write(dir.join(format!("{date}-minutes.pdf")), b"%PDF-1.4").unwrap();
        let sidecar = serde_json::json!({
            "metadata": {
                "id": id,
                "year": &date[..4],
                "date": date,
                "url": format!("https://example.org/{id}"),
                "label": "Zoning Board",
            },
            "timestamp": "2023-01-01 00:00:00",
            "source_path": "ignored",
        });
        std::fs::write(
            dir.join(format!("{date}-minutes_metadata.json")),
            sidecar.to_string(),
        )
        .unwrap();
    }

    #[test]
    fn validate_rejects_path_separators() {
        let tmp = TempDir::new().unwrap();
        let mut source = test_source(tmp.path());
        assert!(source.validate().is_ok());

        source.id = "../escape".into();
        assert!(matches!(source.validate(), Err(Error::InvalidSource(_))));

        source.id = String::new();
        assert!(matches!(source.validate(), Err(Error::InvalidSource(_))));
    }

    #[test]
    fn descriptor_serializes_label_inline() {
        let tmp = TempDir::new().unwrap();
        let source = test_source(tmp.path());
        let value = serde_json::to_value(&source).unwrap();
        assert_eq!(value["label"], "Zoning Board Minutes");
        assert_eq!(value["city"], "Millburn");

        let back: SourceDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, source);
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let dir = SourceDirectory::new(
            tmp.path(),
            Jurisdiction::new("NJ", "New Jersey", "Millburn", "Millburn Township"),
            "PLANNING",
            "2019",
        );
        assert!(dir.source_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn descriptors_merge_sidecar_and_jurisdiction() {
        let tmp = TempDir::new().unwrap();
        let jurisdiction = Jurisdiction::new("NJ", "New Jersey", "Millburn", "Millburn Township");
        let dir = SourceDirectory::new(tmp.path(), jurisdiction, "ZONING", "2021");
        std::fs::create_dir_all(dir.dir()).unwrap();
        write_sidecar(dir.dir(), "2021-05-03", "3920");
        write_sidecar(dir.dir(), "2021-02-01", "3711");

        let sources = dir.descriptors().await.unwrap();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].date, "2021-02-01");
        assert_eq!(sources[0].id, "3711");
        assert_eq!(sources[0].doctype, "ZONING");
        assert_eq!(sources[0].state_abbrv, "NJ");
        assert_eq!(sources[1].filepath, dir.dir().join("2021-05-03-minutes.pdf"));
        assert_eq!(sources[1].label(), "Zoning Board");
    }

    #[tokio::test]
    async fn bad_sidecar_skips_only_that_source() {
        let tmp = TempDir::new().unwrap();
        let jurisdiction = Jurisdiction::new("NJ", "New Jersey", "Millburn", "Millburn Township");
        let dir = SourceDirectory::new(tmp.path(), jurisdiction, "ZONING", "2021");
        std::fs::create_dir_all(dir.dir()).unwrap();
        write_sidecar(dir.dir(), "2021-02-01", "3711");
        std::fs::write(dir.dir().join("2021-03-01-minutes.pdf"), b"%PDF-1.4").unwrap();
        write_sidecar(dir.dir(), "2021-04-05", "3802");
        std::fs::write(dir.dir().join("2021-04-05-minutes_metadata.json"), "not json").unwrap();

        let sources = dir.descriptors().await.unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, "3711");
        assert!(dir.descriptor("2021-03-01-minutes.pdf").await.is_err());
    }
}
