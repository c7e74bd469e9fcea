//! Catalog persisted in PostgreSQL.

use super::{
    split_comma_separated, BoundingBox, Catalog, CatalogError, FeatureType, MetadataUrl, Service,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS wfs_service (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        title TEXT NOT NULL,
        keywords TEXT,
        abstract TEXT,
        fees TEXT,
        access_constraints TEXT
    )",
    "CREATE TABLE IF NOT EXISTS wfs_featuretype (
        id BIGSERIAL PRIMARY KEY,
        service_id BIGINT NOT NULL REFERENCES wfs_service(id) ON DELETE CASCADE,
        name TEXT NOT NULL UNIQUE,
        title TEXT,
        keywords TEXT,
        abstract TEXT,
        srs TEXT NOT NULL DEFAULT 'EPSG:4326',
        othersrs TEXT DEFAULT 'EPSG:3857',
        model TEXT,
        fields TEXT,
        query TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS wfs_resolutionfilter (
        id BIGSERIAL PRIMARY KEY,
        featuretype_id BIGINT NOT NULL REFERENCES wfs_featuretype(id) ON DELETE CASCADE,
        min_resolution DOUBLE PRECISION NOT NULL,
        query TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS wfs_resolutionfilter_min_resolution
        ON wfs_resolutionfilter (min_resolution)",
    "CREATE TABLE IF NOT EXISTS wfs_boundingbox (
        id BIGSERIAL PRIMARY KEY,
        featuretype_id BIGINT NOT NULL REFERENCES wfs_featuretype(id) ON DELETE CASCADE,
        minx TEXT NOT NULL,
        miny TEXT NOT NULL,
        maxx TEXT NOT NULL,
        maxy TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS wfs_metadataurl (
        id BIGSERIAL PRIMARY KEY,
        featuretype_id BIGINT NOT NULL REFERENCES wfs_featuretype(id) ON DELETE CASCADE,
        url TEXT NOT NULL
    )",
];

pub const CATALOG_TABLES: &[&str] = &[
    "wfs_service",
    "wfs_featuretype",
    "wfs_resolutionfilter",
    "wfs_boundingbox",
    "wfs_metadataurl",
];

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

fn opt_text(row: &PgRow, column: &str) -> Result<String, sqlx::Error> {
    Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), CatalogError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!("catalog tables ready");
        Ok(())
    }

    pub async fn save_service(&self, service: &Service) -> Result<i64, CatalogError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO wfs_service (id, name, title, keywords, abstract, fees, access_constraints)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name, title = EXCLUDED.title, keywords = EXCLUDED.keywords,
                abstract = EXCLUDED.abstract, fees = EXCLUDED.fees,
                access_constraints = EXCLUDED.access_constraints
             RETURNING id",
        )
        .bind(service.id)
        .bind(&service.name)
        .bind(&service.title)
        .bind(service.keywords.join(","))
        .bind(&service.abstract_text)
        .bind(&service.fees)
        .bind(&service.access_constraints)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Upserts a feature type with its resolution filters, bounding boxes and
    /// metadata URLs. When the stored model differs from the new one the
    /// field list is cleared before writing.
    pub async fn save_feature_type(&self, feature_type: &mut FeatureType) -> Result<i64, CatalogError> {
        let mut tx = self.pool.begin().await?;

        if let Some(id) = feature_type.id {
            let stored: Option<Option<String>> =
                sqlx::query_scalar("SELECT model FROM wfs_featuretype WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(stored_model) = stored {
                if stored_model.as_deref() != feature_type.model() {
                    feature_type.set_fields(Vec::new());
                }
            }
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO wfs_featuretype
                (id, service_id, name, title, keywords, abstract, srs, othersrs, model, fields, query)
             VALUES (COALESCE($1, nextval(pg_get_serial_sequence('wfs_featuretype', 'id'))),
                     $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                service_id = EXCLUDED.service_id, name = EXCLUDED.name, title = EXCLUDED.title,
                keywords = EXCLUDED.keywords, abstract = EXCLUDED.abstract, srs = EXCLUDED.srs,
                othersrs = EXCLUDED.othersrs, model = EXCLUDED.model, fields = EXCLUDED.fields,
                query = EXCLUDED.query
             RETURNING id",
        )
        .bind(feature_type.id)
        .bind(feature_type.service_id)
        .bind(&feature_type.name)
        .bind(&feature_type.title)
        .bind(feature_type.keywords.join(","))
        .bind(&feature_type.abstract_text)
        .bind(&feature_type.srs)
        .bind(feature_type.other_srs.join(","))
        .bind(feature_type.model())
        .bind(feature_type.fields().join(","))
        .bind(&feature_type.query)
        .fetch_one(&mut *tx)
        .await?;

        for table in ["wfs_resolutionfilter", "wfs_boundingbox", "wfs_metadataurl"] {
            sqlx::query(&format!("DELETE FROM {} WHERE featuretype_id = $1", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for rf in feature_type.resolution_filters() {
            sqlx::query(
                "INSERT INTO wfs_resolutionfilter (featuretype_id, min_resolution, query) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(rf.min_resolution)
            .bind(&rf.query)
            .execute(&mut *tx)
            .await?;
        }
        for bb in &feature_type.bounding_boxes {
            sqlx::query(
                "INSERT INTO wfs_boundingbox (featuretype_id, minx, miny, maxx, maxy) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(&bb.minx)
            .bind(&bb.miny)
            .bind(&bb.maxx)
            .bind(&bb.maxy)
            .execute(&mut *tx)
            .await?;
        }
        for mu in &feature_type.metadata_urls {
            sqlx::query("INSERT INTO wfs_metadataurl (featuretype_id, url) VALUES ($1, $2)")
                .bind(id)
                .bind(&mu.url)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        feature_type.id = Some(id);
        Ok(id)
    }

    fn feature_type_from_row(row: &PgRow) -> Result<FeatureType, sqlx::Error> {
        let mut ft = FeatureType::new(row.try_get("service_id")?, row.try_get::<String, _>("name")?);
        ft.id = Some(row.try_get("id")?);
        ft.title = opt_text(row, "title")?;
        ft.keywords = split_comma_separated(&opt_text(row, "keywords")?);
        ft.abstract_text = opt_text(row, "abstract")?;
        ft.srs = row.try_get("srs")?;
        ft.other_srs = split_comma_separated(&opt_text(row, "othersrs")?);
        ft.set_model(row.try_get("model")?);
        ft.set_fields(split_comma_separated(&opt_text(row, "fields")?));
        ft.query = row.try_get("query")?;
        Ok(ft)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn service(&self, id: i64) -> Result<Option<Service>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, name, title, keywords, abstract, fees, access_constraints FROM wfs_service WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut service = Service::new(
            row.try_get("id")?,
            row.try_get::<String, _>("name")?,
            row.try_get::<String, _>("title")?,
        );
        service.keywords = split_comma_separated(&opt_text(&row, "keywords")?);
        service.abstract_text = opt_text(&row, "abstract")?;
        service.fees = opt_text(&row, "fees")?;
        service.access_constraints = opt_text(&row, "access_constraints")?;
        Ok(Some(service))
    }

    async fn feature_types(&self, service_id: i64) -> Result<Vec<FeatureType>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, service_id, name, title, keywords, abstract, srs, othersrs, model, fields, query
             FROM wfs_featuretype WHERE service_id = $1 ORDER BY name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        let mut types = Vec::with_capacity(rows.len());
        for row in &rows {
            types.push(Self::feature_type_from_row(row)?);
        }
        let ids: Vec<i64> = types.iter().filter_map(|ft| ft.id).collect();
        let mut by_id: HashMap<i64, &mut FeatureType> = types
            .iter_mut()
            .filter_map(|ft| ft.id.map(|id| (id, ft)))
            .collect();

        let filters = sqlx::query(
            "SELECT featuretype_id, min_resolution, query FROM wfs_resolutionfilter
             WHERE featuretype_id = ANY($1) ORDER BY min_resolution",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        for row in filters {
            if let Some(ft) = by_id.get_mut(&row.try_get::<i64, _>("featuretype_id")?) {
                ft.add_resolution_filter(row.try_get("min_resolution")?, row.try_get::<String, _>("query")?);
            }
        }

        let boxes = sqlx::query(
            "SELECT featuretype_id, minx, miny, maxx, maxy FROM wfs_boundingbox
             WHERE featuretype_id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        for row in boxes {
            if let Some(ft) = by_id.get_mut(&row.try_get::<i64, _>("featuretype_id")?) {
                ft.bounding_boxes.push(BoundingBox {
                    minx: row.try_get("minx")?,
                    miny: row.try_get("miny")?,
                    maxx: row.try_get("maxx")?,
                    maxy: row.try_get("maxy")?,
                });
            }
        }

        let urls = sqlx::query(
            "SELECT featuretype_id, url FROM wfs_metadataurl WHERE featuretype_id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        for row in urls {
            if let Some(ft) = by_id.get_mut(&row.try_get::<i64, _>("featuretype_id")?) {
                ft.metadata_urls.push(MetadataUrl {
                    url: row.try_get("url")?,
                });
            }
        }

        drop(by_id);
        Ok(types)
    }
}
