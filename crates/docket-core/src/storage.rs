use chrono::Utc;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::debug;
use uuid::Uuid;

use crate::{
    processor::{AddressDetection, Coord, Summary},
    reshape::{ParsedEntityRecord, PipelineResult},
    source::SourceDescriptor,
    Error, Result,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS source (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    local_path TEXT NOT NULL,
    state_abbrv TEXT NOT NULL,
    city TEXT NOT NULL,
    doctype TEXT NOT NULL,
    year TEXT NOT NULL,
    date TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    descriptor TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (url, local_path)
);

CREATE TABLE IF NOT EXISTS address (
    id TEXT PRIMARY KEY,
    street TEXT NOT NULL,
    city TEXT NOT NULL,
    state TEXT NOT NULL,
    lat REAL,
    lon REAL,
    created_at TEXT NOT NULL,
    UNIQUE (street, city)
);

CREATE TABLE IF NOT EXISTS source_address_assoc (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    address_id TEXT NOT NULL REFERENCES address(id) ON DELETE CASCADE,
    aliases TEXT NOT NULL,
    pages TEXT NOT NULL,
    UNIQUE (source_id, address_id)
);

CREATE TABLE IF NOT EXISTS summary (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES source(id) ON DELETE CASCADE,
    address_id TEXT NOT NULL REFERENCES address(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    page INTEGER NOT NULL,
    summary TEXT NOT NULL,
    tags TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (source_id, address_id, status, page, summary)
);

CREATE INDEX IF NOT EXISTS idx_summary_address ON summary(address_id);
CREATE INDEX IF NOT EXISTS idx_assoc_address ON source_address_assoc(address_id);
"#;

/// Stable ids for one persisted street record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedIds {
    pub source_id: Uuid,
    pub address_id: Uuid,
    pub association_id: Uuid,
    pub summary_ids: Vec<Uuid>,
}

/// SQLite store for reshaped pipeline results.
///
/// Every row has a natural key, so persisting the same result twice returns
/// the same ids and adds nothing.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn persist(&self, result: &PipelineResult) -> Result<Vec<PersistedIds>> {
        let source_id = self.get_or_create_source(&result.source).await?;

        let mut persisted = Vec::with_capacity(result.parsed.len());
        for record in &result.parsed {
            persisted.push(self.persist_record(source_id, &result.source, record).await?);
        }

        debug!(
            source = %result.source.label(),
            records = persisted.len(),
            "persisted pipeline result"
        );
        Ok(persisted)
    }

    async fn persist_record(
        &self,
        source_id: Uuid,
        source: &SourceDescriptor,
        record: &ParsedEntityRecord,
    ) -> Result<PersistedIds> {
        let address_id = self
            .get_or_create_address(&record.street, source, record.coords)
            .await?;
        let association_id = self
            .get_or_create_association(source_id, address_id, &record.addresses)
            .await?;

        let mut summary_ids = Vec::with_capacity(record.summaries.len());
        for summary in &record.summaries {
            summary_ids.push(
                self.get_or_create_summary(source_id, address_id, summary)
                    .await?,
            );
        }

        Ok(PersistedIds {
            source_id,
            address_id,
            association_id,
            summary_ids,
        })
    }

    // Source operations

    pub async fn get_or_create_source(&self, source: &SourceDescriptor) -> Result<Uuid> {
        let local_path = source.filepath.display().to_string();

        sqlx::query(
            r#"
            INSERT INTO source (id, url, local_path, state_abbrv, city, doctype, year, date, doc_id, descriptor, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (url, local_path) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(&source.url)
        .bind(&local_path)
        .bind(&source.state_abbrv)
        .bind(&source.city)
        .bind(&source.doctype)
        .bind(&source.year)
        .bind(&source.date)
        .bind(&source.id)
        .bind(serde_json::to_string(source)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let (id,): (String,) =
            sqlx::query_as("SELECT id FROM source WHERE url = ? AND local_path = ?")
                .bind(&source.url)
                .bind(&local_path)
                .fetch_one(&self.pool)
                .await?;

        parse_id(&id)
    }

    // Address operations

    /// A later run that geocodes a street fills in a coordinate the first run lacked.
    pub async fn get_or_create_address(
        &self,
        street: &str,
        source: &SourceDescriptor,
        coords: Option<Coord>,
    ) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO address (id, street, city, state, lat, lon, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (street, city) DO UPDATE SET
                lat = COALESCE(address.lat, excluded.lat),
                lon = COALESCE(address.lon, excluded.lon)
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(street)
        .bind(&source.city)
        .bind(&source.state)
        .bind(coords.map(|c| c.lat))
        .bind(coords.map(|c| c.lon))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let (id,): (String,) = sqlx::query_as("SELECT id FROM address WHERE street = ? AND city = ?")
            .bind(street)
            .bind(&source.city)
            .fetch_one(&self.pool)
            .await?;

        parse_id(&id)
    }

    pub async fn get_address_coords(&self, id: Uuid) -> Result<Option<Coord>> {
        let row: Option<(Option<f64>, Option<f64>)> =
            sqlx::query_as("SELECT lat, lon FROM address WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((Some(lat), Some(lon))) => Some(Coord { lat, lon }),
            _ => None,
        })
    }

    // Association operations

    pub async fn get_or_create_association(
        &self,
        source_id: Uuid,
        address_id: Uuid,
        detection: &AddressDetection,
    ) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO source_address_assoc (id, source_id, address_id, aliases, pages)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (source_id, address_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(source_id.to_string())
        .bind(address_id.to_string())
        .bind(serde_json::to_string(&detection.aliases)?)
        .bind(serde_json::to_string(&detection.pages)?)
        .execute(&self.pool)
        .await?;

        let (id,): (String,) = sqlx::query_as(
            "SELECT id FROM source_address_assoc WHERE source_id = ? AND address_id = ?",
        )
        .bind(source_id.to_string())
        .bind(address_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        parse_id(&id)
    }

    // Summary operations

    pub async fn get_or_create_summary(
        &self,
        source_id: Uuid,
        address_id: Uuid,
        summary: &Summary,
    ) -> Result<Uuid> {
        let page = i64::try_from(summary.page).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO summary (id, source_id, address_id, status, page, summary, tags, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_id, address_id, status, page, summary) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(source_id.to_string())
        .bind(address_id.to_string())
        .bind(summary.status.as_str())
        .bind(page)
        .bind(&summary.summary)
        .bind(serde_json::to_string(&summary.tags)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let (id,): (String,) = sqlx::query_as(
            r#"
            SELECT id FROM summary
            WHERE source_id = ? AND address_id = ? AND status = ? AND page = ? AND summary = ?
            "#,
        )
        .bind(source_id.to_string())
        .bind(address_id.to_string())
        .bind(summary.status.as_str())
        .bind(page)
        .bind(&summary.summary)
        .fetch_one(&self.pool)
        .await?;

        parse_id(&id)
    }

    pub async fn count_summaries(&self, address_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM summary WHERE address_id = ?")
            .bind(address_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    id.parse().map_err(|_| Error::InvalidId(id.to_string()))
}
