//! End-to-end test against a PostGIS database (`DATABASE_URL`):
//! 1) Create two small spatial tables and publish them in the catalog.
//! 2) Warm-start the model registry from the catalog.
//! 3) Serve the router on an ephemeral port and query it over HTTP.
//!
//! Run with `cargo test --test test_postgis_e2e -- --ignored --nocapture`.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use std::env;
use std::sync::Arc;
use wfs_service::domain::model::{DynamicModel, ModelDescriptor};
use wfs_service::{
    transport, FeatureType, ModelRegistry, PgCatalog, PgExecutor, Service, SharedModelRegistry,
    WfsService,
};

const SERVICE_ID: i64 = 9001;

const SETUP: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS postgis",
    "DROP TABLE IF EXISTS e2e_owner",
    "DROP TABLE IF EXISTS e2e_parcel",
    "DROP TABLE IF EXISTS e2e_road",
    "CREATE TABLE e2e_parcel (id SERIAL PRIMARY KEY, name TEXT NOT NULL, area NUMERIC(12,2), geom geometry(Polygon, 4326))",
    "CREATE TABLE e2e_owner (id SERIAL PRIMARY KEY, name TEXT NOT NULL, parcel_id INTEGER REFERENCES e2e_parcel(id))",
    "CREATE TABLE e2e_road (id INTEGER PRIMARY KEY, name TEXT, kind TEXT, geom geometry(LineString, 4326))",
    "INSERT INTO e2e_parcel (id, name, area, geom) VALUES
        (1, 'north', 120.50, ST_GeomFromText('POLYGON((16 48,17 48,17 49,16 49,16 48))', 4326)),
        (2, 'south', 80.00, ST_GeomFromText('POLYGON((16 46,17 46,17 47,16 47,16 46))', 4326))",
    "INSERT INTO e2e_owner (name, parcel_id) VALUES ('ann', 1), ('bob', 1), ('cid', 2)",
    "INSERT INTO e2e_road (id, name, kind, geom) VALUES
        (1, 'ring', 'primary', ST_GeomFromText('LINESTRING(16.1 48.1,16.9 48.9)', 4326)),
        (2, 'path', 'path', ST_GeomFromText('LINESTRING(16.1 46.1,16.2 46.2)', 4326))",
];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs DATABASE_URL pointing at PostGIS"]
async fn test_postgis_e2e() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let database_url = env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    for statement in SETUP {
        sqlx::query(statement).execute(&pool).await?;
    }

    // --- Publish the tables ---
    let catalog = PgCatalog::new(pool.clone());
    catalog.ensure_schema().await?;
    catalog
        .save_service(&Service::new(SERVICE_ID, "e2e", "End-to-end"))
        .await?;
    sqlx::query("DELETE FROM wfs_featuretype WHERE service_id = $1")
        .bind(SERVICE_ID)
        .execute(&pool)
        .await?;

    let mut roads = FeatureType::raw_sql(
        SERVICE_ID,
        "roads",
        "select id, name, kind, geom as shape from e2e_road",
    );
    roads.add_resolution_filter(10.0, "kind = 'primary'");
    catalog.save_feature_type(&mut roads).await?;
    let mut parcels = FeatureType::model_backed(SERVICE_ID, "parcels", "e2e_parcel");
    catalog.save_feature_type(&mut parcels).await?;

    // --- Warm start ---
    let registry = ModelRegistry::load_from_db(&pool).await?;
    assert!(
        registry.get("e2e_parcel").is_some(),
        "expected 'e2e_parcel' model to be present after warm-start"
    );
    let parcel = DynamicModel::introspect(&pool, "e2e_parcel").await?;
    assert_eq!(parcel.geometry_field().map(|f| f.name.as_str()), Some("geom"));

    // Without PostGIS on the search path the geometry lookup fails; that is an
    // error, not a model whose geometry silently became a scalar column.
    let blind_pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET search_path TO pg_catalog").await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;
    assert!(DynamicModel::introspect(&blind_pool, "e2e_parcel").await.is_err());
    // The catalog table is not visible either: warm start degrades to an empty registry.
    assert!(ModelRegistry::load_from_db(&blind_pool).await?.list_models().is_empty());
    blind_pool.close().await;

    let wfs = WfsService::new(
        Arc::new(catalog),
        Arc::new(SharedModelRegistry::new(registry, Some(pool.clone()))),
        Arc::new(PgExecutor::new(pool.clone(), 16)),
        "http://127.0.0.1",
    );
    let router = transport::http::create_router(transport::http::AppState::new(wfs, Some(pool.clone())));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}/{}", listener.local_addr()?, SERVICE_ID);
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    // Raw SQL type, bbox-filtered.
    let doc = client
        .get(format!(
            "{}/?service=WFS&request=GetFeature&typename=roads&outputformat=json&bbox=16,47.5,17,49.5",
            base_url
        ))
        .send()
        .await?
        .json::<JsonValue>()
        .await?;
    assert_eq!(doc["totalFeatures"], 1, "{}", doc);
    assert_eq!(doc["features"][0]["id"], "roads.1");
    assert_eq!(doc["features"][0]["geometry"]["type"], "LineString");

    // Resolution filter keeps only primary roads.
    let doc = client
        .get(format!(
            "{}/?service=WFS&request=GetFeature&typename=roads&outputformat=json&resolution=20",
            base_url
        ))
        .send()
        .await?
        .json::<JsonValue>()
        .await?;
    assert_eq!(doc["totalFeatures"], 1, "{}", doc);
    assert_eq!(doc["features"][0]["properties"]["kind"], "primary");

    // Model type by feature id, reprojected.
    let doc = client
        .get(format!(
            "{}/?service=WFS&request=GetFeature&featureid=parcels.2&outputformat=json&srsname=EPSG:3857",
            base_url
        ))
        .send()
        .await?
        .json::<JsonValue>()
        .await?;
    assert_eq!(doc["totalFeatures"], 1, "{}", doc);
    assert_eq!(doc["crs"]["properties"]["name"], "EPSG:3857");
    assert_eq!(doc["features"][0]["properties"]["name"], "south");
    assert_eq!(doc["features"][0]["properties"]["area"], 80.0);
    let x = doc["bbox"][0].as_f64().unwrap_or_default();
    assert!(x > 1_000_000.0, "expected web mercator coordinates, got {}", x);
    let related_url = doc["features"][0]["properties"]["e2e_owner"]["url"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert_eq!(related_url, format!("/{}/related/?id=parcels.2&field=e2e_owner", SERVICE_ID));

    // Related objects.
    let doc = client
        .get(format!("{}/related/?id=parcels.1&field=e2e_owner", base_url))
        .send()
        .await?
        .json::<JsonValue>()
        .await?;
    assert_eq!(doc["type"], "RelationCollection");
    assert_eq!(doc["totalObjects"], 2, "{}", doc);

    // GML output of the model type.
    let gml = client
        .get(format!("{}/?service=WFS&request=GetFeature&typename=parcels", base_url))
        .send()
        .await?
        .text()
        .await?;
    assert!(gml.contains("<gml:featureMember>"), "{}", gml);
    assert!(gml.contains("gml:Polygon"), "{}", gml);

    // Capabilities and schema.
    let caps = client
        .get(format!("{}/?service=WFS&request=GetCapabilities", base_url))
        .send()
        .await?
        .text()
        .await?;
    assert!(caps.contains("<Name>parcels</Name>"));
    let schema = client
        .get(format!(
            "{}/?service=WFS&request=DescribeFeatureType&typename=parcels",
            base_url
        ))
        .send()
        .await?
        .text()
        .await?;
    assert!(schema.contains("gml:PolygonPropertyType"), "{}", schema);

    server.abort();
    let _ = server.await;
    Ok(())
}
