use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pipeline::NamedOutputSet;
use crate::processor::{AddressDetection, Coord, Summary};
use crate::source::SourceDescriptor;
use crate::{Error, Result};

/// Everything the pipeline learned about one street.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEntityRecord {
    pub street: String,
    pub addresses: AddressDetection,
    pub summaries: Vec<Summary>,
    pub coords: Option<Coord>,
}

/// A source together with its per-street records, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub source: SourceDescriptor,
    pub parsed: Vec<ParsedEntityRecord>,
}

/// Output names the reshaper reads from a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputNames {
    pub addresses: String,
    pub summaries: String,
    pub coords: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        Self {
            addresses: "addresses".into(),
            summaries: "summaries".into(),
            coords: "coords".into(),
        }
    }
}

/// Joins per-stage outputs on the street key.
///
/// Summaries decide which streets appear. A summarized street must have been
/// detected; a missing coordinate is allowed.
pub fn join_entities(
    mut addresses: BTreeMap<String, AddressDetection>,
    summaries: BTreeMap<String, Vec<Summary>>,
    coords: &BTreeMap<String, Coord>,
    addresses_output: &str,
) -> Result<Vec<ParsedEntityRecord>> {
    summaries
        .into_iter()
        .map(|(street, summaries)| {
            let detection = addresses
                .remove(&street)
                .ok_or_else(|| Error::MissingEntity {
                    entity: street.clone(),
                    output: addresses_output.to_string(),
                })?;
            Ok(ParsedEntityRecord {
                coords: coords.get(&street).copied(),
                street,
                addresses: detection,
                summaries,
            })
        })
        .collect()
}

pub fn reshape(outputs: &NamedOutputSet) -> Result<PipelineResult> {
    reshape_with(outputs, &OutputNames::default())
}

pub fn reshape_with(outputs: &NamedOutputSet, names: &OutputNames) -> Result<PipelineResult> {
    let addresses = outputs.get_as(&names.addresses)?;
    let summaries = outputs.get_as(&names.summaries)?;
    let coords = if outputs.contains(&names.coords) {
        outputs.get_as(&names.coords)?
    } else {
        BTreeMap::new()
    };

    Ok(PipelineResult {
        source: outputs.source()?,
        parsed: join_entities(addresses, summaries, &coords, &names.addresses)?,
    })
}
