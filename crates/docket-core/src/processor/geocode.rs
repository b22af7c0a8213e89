use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{
    source_arg, ErrorLog, ErrorTag, Stage, StageArgs, StageError, StageFactory, StageResult,
};
use crate::source::SourceDescriptor;

const PROCESSOR_NAME: &str = "geocode";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the lookup succeeded but found nothing.
    async fn geocode(&self, query: &str) -> StageResult<Option<Coord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search".into(),
            user_agent: concat!("docket/", env!("CARGO_PKG_VERSION")).into(),
            timeout_secs: 10,
        }
    }
}

/// OpenStreetMap Nominatim search.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodeConfig) -> StageResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| StageError::Failed(format!("invalid geocode endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait::async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> StageResult<Option<Coord>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("limit", "1");

        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StageError::RateLimited);
        }

        let places: Vec<Place> = response.error_for_status()?.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let lat = place.lat.parse::<f64>();
        let lon = place.lon.parse::<f64>();
        match (lat, lon) {
            (Ok(lat), Ok(lon)) => Ok(Some(Coord { lat, lon })),
            _ => Err(StageError::Failed(format!(
                "unparsable coordinates {}, {}",
                place.lat, place.lon
            ))),
        }
    }
}

/// Looks up a coordinate for every summarized street.
///
/// Constructor arguments: `[source]`. Extract arguments: `[summaries]`; only
/// the street keys are read.
pub struct GeocodeStage {
    source: SourceDescriptor,
    geocoder: Arc<dyn Geocoder>,
}

impl GeocodeStage {
    fn query(&self, street: &str) -> String {
        format!("{street} {} {}", self.source.city, self.source.state)
    }
}

#[async_trait::async_trait]
impl Stage for GeocodeStage {
    type Output = BTreeMap<String, Coord>;

    const NAME: &'static str = PROCESSOR_NAME;

    async fn extract(&self, args: &StageArgs, errors: &mut ErrorLog) -> StageResult<Self::Output> {
        let streets: BTreeMap<String, serde_json::Value> = args.get(0)?;

        let mut coords = BTreeMap::new();
        for street in streets.keys() {
            match self.geocoder.geocode(&self.query(street)).await? {
                Some(coord) => {
                    debug!(street, lat = coord.lat, lon = coord.lon, "geocoded");
                    coords.insert(street.clone(), coord);
                }
                None => errors.record(ErrorTag::GeocodeFailed, street),
            }
        }

        Ok(coords)
    }
}

pub struct GeocodeFactory {
    geocoder: Arc<dyn Geocoder>,
}

impl GeocodeFactory {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }
}

impl StageFactory for GeocodeFactory {
    type Stage = GeocodeStage;

    fn construct(&self, args: &StageArgs) -> StageResult<GeocodeStage> {
        Ok(GeocodeStage {
            source: source_arg(args)?,
            geocoder: Arc::clone(&self.geocoder),
        })
    }
}
