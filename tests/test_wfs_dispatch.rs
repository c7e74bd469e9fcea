//! In-process dispatch tests:
//! the router is driven with `oneshot` against an in-memory catalog, a model
//! registry without a database and a scripted SQL executor.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use geo_types::{point, Geometry};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use wfs_service::domain::model::{DynamicModel, FieldInfo, FieldKind};
use wfs_service::geo::{ewkb, Extent};
use wfs_service::storage::cursor::{ColumnDesc, CursorError, RawCursor, RawRow, SqlParam, SqlValue};
use wfs_service::transport::http::{create_router, AppState};
use wfs_service::{
    FeatureType, InMemoryCatalog, ModelRegistry, Service, SharedModelRegistry, SqlExecutor, WfsService,
};

const ROADS_SQL: &str = "select id, name, geom as shape from roads";

/// Answers every statement containing `needle` with fixed columns and rows.
struct Script {
    needle: &'static str,
    columns: Vec<ColumnDesc>,
    rows: Vec<RawRow>,
}

#[derive(Default)]
struct ScriptedExecutor {
    scripts: Vec<Script>,
    extent: Option<Extent>,
    executed: Mutex<Vec<(String, Vec<SqlParam>)>>,
    /// When set, cursors are fed by a producer task and count their releases here.
    releases: Option<Arc<AtomicUsize>>,
}

/// Held by a cursor producer; counts once when the producer goes away.
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedExecutor {
    fn with(mut self, needle: &'static str, columns: &[(&str, &str)], rows: Vec<RawRow>) -> Self {
        self.scripts.push(Script {
            needle,
            columns: columns.iter().map(|(n, t)| ColumnDesc::new(*n, *t)).collect(),
            rows,
        });
        self
    }

    fn script(&self, sql: &str) -> Result<&Script, CursorError> {
        self.scripts
            .iter()
            .find(|s| sql.contains(s.needle))
            .ok_or_else(|| CursorError::Backend(format!("unexpected statement: {}", sql)))
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnDesc>, CursorError> {
        Ok(self.script(sql)?.columns.clone())
    }

    async fn open_cursor(&self, sql: &str, params: Vec<SqlParam>) -> Result<RawCursor, CursorError> {
        let script = self.script(sql)?;
        self.executed.lock().unwrap().push((sql.to_string(), params));
        let Some(releases) = &self.releases else {
            return Ok(RawCursor::from_rows(script.columns.clone(), script.rows.clone()));
        };
        let guard = ReleaseGuard(releases.clone());
        let rows = script.rows.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let producer = tokio::spawn(async move {
            let _guard = guard;
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
            }
            std::future::pending::<()>().await;
        });
        Ok(RawCursor::streamed(script.columns.clone(), rx, producer))
    }

    async fn extent(
        &self,
        sql: &str,
        _params: Vec<SqlParam>,
        _geometry_column: &str,
    ) -> Result<Option<Extent>, CursorError> {
        self.script(sql)?;
        Ok(self.extent)
    }
}

fn models() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register(
        DynamicModel::new(
            "parcel",
            "id",
            vec![
                FieldInfo::scalar("id", "int4"),
                FieldInfo::scalar("name", "text"),
                FieldInfo::geometry("geom", "POLYGON", 4326),
                FieldInfo {
                    name: "owner".into(),
                    kind: FieldKind::OneToMany {
                        model: "owner".into(),
                        column: "parcel_id".into(),
                    },
                },
            ],
        )
        .unwrap(),
    );
    registry.register(
        DynamicModel::new(
            "owner",
            "id",
            vec![
                FieldInfo::scalar("id", "int4"),
                FieldInfo::scalar("name", "text"),
                FieldInfo {
                    name: "parcel_id".into(),
                    kind: FieldKind::ForeignKey {
                        sql_type: "int4".into(),
                        model: "parcel".into(),
                    },
                },
            ],
        )
        .unwrap(),
    );
    registry
}

fn catalog() -> InMemoryCatalog {
    let mut service = Service::new(1, "demo", "Demo");
    service.keywords = vec!["roads".into(), "cadastre".into()];

    let roads = FeatureType::raw_sql(1, "roads", ROADS_SQL);
    let mut parcels = FeatureType::model_backed(1, "parcels", "parcel");
    parcels.srs = "EPSG:31256".into();
    parcels.other_srs = vec!["EPSG:900913".into(), "EPSG:4326".into()];
    let ghosts = FeatureType::model_backed(1, "ghosts", "ghost");

    InMemoryCatalog::new()
        .with_service(service)
        .with_feature_type(roads)
        .with_feature_type(parcels)
        .with_feature_type(ghosts)
}

fn app(executor: ScriptedExecutor) -> (Router, Arc<ScriptedExecutor>) {
    let executor = Arc::new(executor);
    let wfs = WfsService::new(
        Arc::new(catalog()),
        Arc::new(SharedModelRegistry::new(models(), None)),
        executor.clone(),
        "http://localhost:3000",
    );
    (create_router(AppState::new(wfs, None)), executor)
}

fn roads_executor(rows: Vec<RawRow>) -> ScriptedExecutor {
    ScriptedExecutor::default().with(
        "roads",
        &[("id", "INT4"), ("name", "TEXT"), ("shape", "BYTEA")],
        rows,
    )
}

async fn get(router: Router, uri: &str) -> (StatusCode, String, String) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

fn assert_exception(body: &str, code: &str, locator: &str) {
    let expected = format!(r#"code="{}" locator="{}""#, code, locator);
    assert!(body.contains(&expected), "expected {} in {}", expected, body);
}

#[tokio::test]
async fn unknown_service_is_reported_before_parameters() {
    let (router, _) = app(ScriptedExecutor::default());
    let (status, content_type, body) = get(router, "/42/?request=bogus").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/xml"));
    assert_exception(&body, "UnknownService", "");
}

#[tokio::test]
async fn unsupported_version_fails_negotiation() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(router, "/1/?service=WFS&request=GetCapabilities&version=99.99.99").await;
    assert_exception(&body, "VersionNegotiationFailed", "version");
}

#[tokio::test]
async fn capabilities_list_srs_names_in_natural_order() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, content_type, body) = get(router, "/1?SERVICE=WFS&REQUEST=GetCapabilities").await;
    assert!(content_type.starts_with("text/xml"));
    assert!(body.contains("<Name>parcels</Name>"));
    assert!(body.contains("http://localhost:3000/1/"));

    let positions: Vec<usize> = ["EPSG:3857", "EPSG:4326", "EPSG:31256", "EPSG:900913"]
        .iter()
        .map(|srs| body.find(&format!("<ows:Value>{}</ows:Value>", srs)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);
}

#[tokio::test]
async fn describe_feature_type_types_the_geometry_element() {
    let (router, _) = app(roads_executor(vec![]));
    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=DescribeFeatureType&typename=Roads,parcels&version=1.0.0",
    )
    .await;
    assert!(body.contains(r#"<element name="geometry" type="gml:GeometryAssociationType""#));
    assert!(body.contains(r#"<element name="geometry" type="gml:PolygonPropertyType""#));
    assert!(body.contains(r#"<element name="name" type="xsd:string""#));
    assert!(body.contains("2.1.2/feature.xsd"));
}

#[tokio::test]
async fn describe_feature_type_rejects_unknown_types() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(router, "/1/?service=wfs&request=DescribeFeatureType&typename=lakes").await;
    assert_exception(&body, "InvalidParameterValue", "typename");
}

#[tokio::test]
async fn get_feature_with_unknown_typename() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(router, "/1/?service=wfs&request=GetFeature&typename=lakes").await;
    assert_exception(&body, "InvalidParameterValue", "typename");
}

#[tokio::test]
async fn get_feature_without_typename_or_featureid() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(router, "/1/?service=wfs&request=GetFeature&outputformat=json").await;
    assert_exception(&body, "MissingParameter", "typename");
}

#[tokio::test]
async fn empty_geojson_collection_has_no_bbox() {
    let (router, _) = app(roads_executor(vec![]));
    let (_, content_type, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=roads&outputformat=application/json",
    )
    .await;
    assert_eq!(content_type, "application/json");
    assert_eq!(
        body,
        r#"{"type":"FeatureCollection","crs":{"type":"name","properties":{"name":"EPSG:4326"}},"features":[],"totalFeatures":0}"#
    );
}

#[tokio::test]
async fn raw_features_are_streamed_with_bbox_and_bound_parameters() {
    let shape = ewkb::encode(&Geometry::Point(point! { x: 16.3, y: 48.2 }), Some(4326)).unwrap();
    let mut executor = roads_executor(vec![vec![
        SqlValue::Int(7),
        SqlValue::Text("Ring".into()),
        SqlValue::Bytes(shape),
    ]]);
    executor.extent = Some(Extent::new(16.3, 48.2, 16.3, 48.2));
    let (router, executor) = app(executor);

    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=roads&outputformat=json&bbox=16,48,17,49&precision=0.5",
    )
    .await;
    let doc: JsonValue = serde_json::from_str(&body).unwrap();
    assert_eq!(doc["bbox"], json!([16.3, 48.2, 16.3, 48.2]));
    assert_eq!(doc["totalFeatures"], json!(1));
    assert_eq!(doc["features"][0]["id"], json!("roads.7"));
    assert_eq!(doc["features"][0]["properties"], json!({"id": 7, "name": "Ring"}));

    let executed = executor.executed.lock().unwrap();
    let (sql, params) = &executed[0];
    assert!(sql.contains("ST_Simplify"), "{}", sql);
    assert!(sql.contains("ST_Intersects"), "{}", sql);
    assert!(!sql.contains("16"), "bbox must be bound, not inlined: {}", sql);
    assert_eq!(params[0], SqlParam::Float(0.5));
    assert!(matches!(params[1], SqlParam::Bytes(_)));
}

#[tokio::test]
async fn raw_feature_types_cannot_render_gml() {
    let (router, _) = app(roads_executor(vec![]));
    let (_, _, body) = get(router, "/1/?service=wfs&request=GetFeature&typename=roads").await;
    assert_exception(&body, "NotImplemented", "outputformat");
}

#[tokio::test]
async fn open_cursors_are_released_when_a_later_typename_is_unknown() {
    let releases = Arc::new(AtomicUsize::new(0));
    let mut executor = roads_executor(vec![vec![SqlValue::Int(1), SqlValue::Null, SqlValue::Null]]);
    executor.releases = Some(releases.clone());
    let (router, executor) = app(executor);

    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=roads,missing&outputformat=json",
    )
    .await;
    assert_exception(&body, "InvalidParameterValue", "typename");
    assert_eq!(executor.executed.lock().unwrap().len(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_cursors_are_released_when_a_later_type_cannot_render_gml() {
    let releases = Arc::new(AtomicUsize::new(0));
    let mut executor = ScriptedExecutor::default()
        .with(
            "\"parcel\" AS t",
            &[("__pk", "INT4"), ("id", "INT4"), ("name", "TEXT"), ("__gml", "TEXT")],
            vec![],
        )
        .with(
            "roads",
            &[("id", "INT4"), ("name", "TEXT"), ("shape", "BYTEA")],
            vec![],
        );
    executor.releases = Some(releases.clone());
    let (router, executor) = app(executor);

    let (_, _, body) = get(router, "/1/?service=wfs&request=GetFeature&typename=parcels,roads").await;
    assert_exception(&body, "NotImplemented", "outputformat");
    assert_eq!(executor.executed.lock().unwrap().len(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsupported_parameters_are_not_implemented() {
    let (router, _) = app(roads_executor(vec![]));
    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=roads&propertyname=name",
    )
    .await;
    assert_exception(&body, "NotImplemented", "propertyname");
}

#[tokio::test]
async fn model_features_link_their_relations() {
    let mut executor = ScriptedExecutor::default().with(
        "\"parcel\" AS t",
        &[("__pk", "INT4"), ("id", "INT4"), ("name", "TEXT"), ("__geojson", "JSON")],
        vec![vec![
            SqlValue::Int(3),
            SqlValue::Int(3),
            SqlValue::Text("lot".into()),
            SqlValue::Json(json!({"type": "Point", "coordinates": [1.0, 2.0]})),
        ]],
    );
    executor.extent = Some(Extent::new(1.0, 2.0, 1.0, 2.0));
    let (router, executor) = app(executor);

    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=parcels&outputformat=json&srsname=EPSG:31256",
    )
    .await;
    let doc: JsonValue = serde_json::from_str(&body).unwrap();
    assert_eq!(doc["crs"]["properties"]["name"], json!("EPSG:31256"));
    assert_eq!(
        doc["features"][0],
        json!({
            "type": "Feature",
            "id": "parcels.3",
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {
                "id": 3,
                "name": "lot",
                "owner": {"url": "/1/related/?id=parcels.3&field=owner"}
            }
        })
    );
    let executed = executor.executed.lock().unwrap();
    assert!(executed[0].0.contains("ST_AsGeoJSON"), "{}", executed[0].0);
}

#[tokio::test]
async fn model_features_render_as_gml() {
    let executor = ScriptedExecutor::default().with(
        "\"parcel\" AS t",
        &[("__pk", "INT4"), ("id", "INT4"), ("name", "TEXT"), ("__gml", "TEXT")],
        vec![vec![
            SqlValue::Int(3),
            SqlValue::Int(3),
            SqlValue::Text("lot".into()),
            SqlValue::Text("<gml:Point><gml:pos>1 2</gml:pos></gml:Point>".into()),
        ]],
    );
    let (router, executor) = app(executor);

    let (_, content_type, body) = get(router, "/1/?service=wfs&request=GetFeature&typename=parcels").await;
    assert!(content_type.starts_with("text/xml"));
    assert!(body.contains(r#"<parcels gml:id="parcels.3">"#), "{}", body);
    assert!(body.contains("<gml:Point><gml:pos>1 2</gml:pos></gml:Point>"));
    assert!(!body.contains("boundedBy"));
    assert!(executor.executed.lock().unwrap()[0].0.contains("ST_AsGML(3"));
}

#[tokio::test]
async fn missing_feature_ids_are_skipped() {
    let (router, _) = app(roads_executor(vec![]));
    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&featureid=roads.99&outputformat=json",
    )
    .await;
    let doc: JsonValue = serde_json::from_str(&body).unwrap();
    assert_eq!(doc["totalFeatures"], json!(0));
}

#[tokio::test]
async fn malformed_feature_ids_are_rejected() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&featureid=roads.first&outputformat=json",
    )
    .await;
    assert_exception(&body, "InvalidParameterValue", "featureid");
}

#[tokio::test]
async fn query_faults_surface_as_malformed_json_query() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(
        router,
        "/1/?service=wfs&request=GetFeature&typename=ghosts&outputformat=json",
    )
    .await;
    assert_exception(&body, "MalformedJSONQuery", "query");
}

#[tokio::test]
async fn related_objects_are_streamed() {
    let executor = ScriptedExecutor::default().with(
        "\"owner\" AS t",
        &[("id", "INT4"), ("name", "TEXT")],
        vec![vec![SqlValue::Int(10), SqlValue::Text("ann".into())]],
    );
    let (router, executor) = app(executor);

    let (_, content_type, body) = get(router, "/1/related/?id=parcels.3&field=owner").await;
    assert_eq!(content_type, "application/json");
    assert_eq!(
        body,
        r#"{"type":"RelationCollection","objects":[{"id":10,"name":"ann"}],"totalObjects":1}"#
    );
    let executed = executor.executed.lock().unwrap();
    assert!(executed[0].0.contains("WHERE t.\"parcel_id\" = $1::int4"));
    assert_eq!(executed[0].1, vec![SqlParam::BigInt(3)]);
}

#[tokio::test]
async fn related_objects_validate_their_parameters() {
    let (router, _) = app(ScriptedExecutor::default());
    let (_, _, body) = get(router.clone(), "/1/related/?id=parcels.3").await;
    assert_exception(&body, "MissingParameter", "field");

    let (_, _, body) = get(router.clone(), "/1/related/?id=parcels.3&field=name").await;
    assert_exception(&body, "InvalidParameterValue", "field");

    let (_, _, body) = get(router, "/1/related/?id=roads.3&field=owner").await;
    assert_exception(&body, "InvalidParameterValue", "id");
}

#[tokio::test]
async fn health_without_database() {
    let (router, _) = app(ScriptedExecutor::default());
    let (status, _, body) = get(router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let doc: JsonValue = serde_json::from_str(&body).unwrap();
    assert_eq!(doc["success"], json!(true));
}
