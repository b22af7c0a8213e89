use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::pdf2text::TextPage;
use super::{source_arg, ErrorLog, Stage, StageArgs, StageFactory, StageResult};

const PROCESSOR_NAME: &str = "address";

const STREET_PATTERN: &str = r"\b(\d{1,5}[A-Za-z]?)\s+((?:[A-Z][A-Za-z'\-]+\s+){1,3})(?i:(street|st|avenue|ave|road|rd|lane|ln|drive|dr|place|pl|court|ct|terrace|ter|boulevard|blvd|parkway|pkwy|circle|cir|highway|hwy|way))\b\.?";

/// Every mention of one street across the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDetection {
    pub street: String,
    pub aliases: Vec<String>,
    pub pages: Vec<usize>,
}

/// Finds numbered street addresses in OCR text.
#[derive(Debug, Clone)]
pub struct StreetDetector {
    pattern: Regex,
}

impl StreetDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(STREET_PATTERN)?,
        })
    }

    /// `(street key, matched text)` for every address in `text`.
    pub fn find(&self, text: &str) -> Vec<(String, String)> {
        self.pattern
            .captures_iter(text)
            .map(|caps| {
                let name = caps[2]
                    .split_whitespace()
                    .map(title_case)
                    .collect::<Vec<_>>()
                    .join(" ");
                let street = format!("{name} {}", canonical_suffix(&caps[3]));
                let alias = caps[0].split_whitespace().collect::<Vec<_>>().join(" ");
                (street, alias)
            })
            .collect()
    }

    pub fn detect(&self, pages: &[TextPage]) -> BTreeMap<String, AddressDetection> {
        let mut found: BTreeMap<String, (BTreeSet<String>, BTreeSet<usize>)> = BTreeMap::new();

        for page in pages {
            for (street, alias) in self.find(&page.text) {
                let entry = found.entry(street).or_default();
                entry.0.insert(alias);
                entry.1.insert(page.page);
            }
        }

        found
            .into_iter()
            .map(|(street, (aliases, pages))| {
                let detection = AddressDetection {
                    street: street.clone(),
                    aliases: aliases.into_iter().collect(),
                    pages: pages.into_iter().collect(),
                };
                (street, detection)
            })
            .collect()
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

fn canonical_suffix(suffix: &str) -> &'static str {
    match suffix.to_ascii_lowercase().as_str() {
        "street" | "st" => "St",
        "avenue" | "ave" => "Ave",
        "road" | "rd" => "Rd",
        "lane" | "ln" => "Ln",
        "drive" | "dr" => "Dr",
        "place" | "pl" => "Pl",
        "court" | "ct" => "Ct",
        "terrace" | "ter" => "Ter",
        "boulevard" | "blvd" => "Blvd",
        "parkway" | "pkwy" => "Pkwy",
        "circle" | "cir" => "Cir",
        "highway" | "hwy" => "Hwy",
        _ => "Way",
    }
}

/// Groups street mentions by street.
///
/// Constructor arguments: `[source]`. Extract arguments: `[pages]`.
pub struct AddressStage {
    detector: StreetDetector,
}

#[async_trait::async_trait]
impl Stage for AddressStage {
    type Output = BTreeMap<String, AddressDetection>;

    const NAME: &'static str = PROCESSOR_NAME;

    async fn extract(&self, args: &StageArgs, _errors: &mut ErrorLog) -> StageResult<Self::Output> {
        let pages: Vec<TextPage> = args.get(0)?;
        Ok(self.detector.detect(&pages))
    }
}

#[derive(Debug, Clone)]
pub struct AddressFactory {
    detector: StreetDetector,
}

impl AddressFactory {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            detector: StreetDetector::new()?,
        })
    }
}

impl StageFactory for AddressFactory {
    type Stage = AddressStage;

    fn construct(&self, args: &StageArgs) -> StageResult<AddressStage> {
        source_arg(args)?;
        Ok(AddressStage {
            detector: self.detector.clone(),
        })
    }
}
