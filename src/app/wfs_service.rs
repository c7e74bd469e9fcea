//! The WFS service.
//!
//! Sits between the HTTP layer and the data sources. It is responsible for:
//! 1.  Resolving services and feature types from the [`Catalog`].
//! 2.  Planning and opening one feature source per requested feature type.
//! 3.  Computing the request-wide bounding box before any feature is written.
//! 4.  Looking up related objects of model-backed features.

use crate::app::features::{FeatureSource, FeatureStream, ModelLayout, RawLayout};
use crate::domain::catalog::{Catalog, FeatureType, Service};
use crate::domain::crs::Crs;
use crate::domain::model::{
    FieldKind, GeometryAnnotation, ModelDescriptor, ModelProvider, GEOMETRY_COLUMN,
};
use crate::domain::query::augment::SHAPE_COLUMN;
use crate::domain::query::{
    effective_fields, plan_model, plan_raw, FeatureQuery, FunctionCache, FunctionTable, PlanError,
};
use crate::error::WfsException;
use crate::geo::{accumulate, BBox, Extent};
use crate::storage::cursor::{ColumnDesc, RawCursor, SqlExecutor};
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const JSON_OUTPUT_FORMATS: &[&str] = &["application/json", "json"];
pub const XML_OUTPUT_FORMATS: &[&str] = &[
    "application/gml+xml",
    "application/xml",
    "text/xml",
    "xml",
    "gml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Gml,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.to_ascii_lowercase();
        if JSON_OUTPUT_FORMATS.contains(&v.as_str()) {
            Some(OutputFormat::Json)
        } else if XML_OUTPUT_FORMATS.contains(&v.as_str()) {
            Some(OutputFormat::Gml)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WfsVersion {
    V1_0_0,
    V1_1_0,
    /// Any other dotted integer triple, accepted only with legacy negotiation.
    Legacy(String),
}

impl Default for WfsVersion {
    fn default() -> Self {
        WfsVersion::V1_1_0
    }
}

impl WfsVersion {
    pub fn parse(value: &str, legacy: bool) -> Option<Self> {
        match value {
            "1.0.0" => Some(WfsVersion::V1_0_0),
            "1.1.0" => Some(WfsVersion::V1_1_0),
            other if legacy && is_version_triple(other) => Some(WfsVersion::Legacy(other.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WfsVersion::V1_0_0 => "1.0.0",
            WfsVersion::V1_1_0 => "1.1.0",
            WfsVersion::Legacy(v) => v,
        }
    }

    pub fn is_v1_0_0(&self) -> bool {
        *self == WfsVersion::V1_0_0
    }

    pub fn capabilities_schema(&self) -> &'static str {
        if self.is_v1_0_0() {
            "1.0.0/WFS-capabilities.xsd"
        } else {
            "1.1.0/wfs.xsd"
        }
    }

    pub fn feature_schema(&self) -> &'static str {
        if self.is_v1_0_0() {
            "1.0.0/WFS-basic.xsd"
        } else {
            "1.1.0/wfs.xsd"
        }
    }

    pub fn gml_path(&self) -> &'static str {
        if self.is_v1_0_0() {
            "2.1.2/feature.xsd"
        } else {
            "3.1.1/base/gml.xsd"
        }
    }

    pub fn gml_version(&self) -> u8 {
        if self.is_v1_0_0() {
            2
        } else {
            3
        }
    }
}

fn is_version_triple(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Orders strings with embedded numbers the way people do (`EPSG:900913` after `EPSG:3857`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    fn chunks(s: &str) -> Vec<(bool, &str)> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut digits = None;
        for (i, c) in s.char_indices() {
            let d = c.is_ascii_digit();
            if digits != Some(d) {
                if i > start {
                    out.push((digits.unwrap_or(false), &s[start..i]));
                }
                start = i;
                digits = Some(d);
            }
        }
        if start < s.len() {
            out.push((digits.unwrap_or(false), &s[start..]));
        }
        out
    }

    let (ca, cb) = (chunks(a), chunks(b));
    for (x, y) in ca.iter().zip(cb.iter()) {
        let ord = match (x, y) {
            ((true, xs), (true, ys)) => {
                let xs = xs.trim_start_matches('0');
                let ys = ys.trim_start_matches('0');
                xs.len().cmp(&ys.len()).then_with(|| xs.cmp(ys))
            }
            ((_, xs), (_, ys)) => xs.cmp(ys),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ca.len().cmp(&cb.len())
}

/// `typename.id`, split at the last dot.
pub fn split_feature_id(value: &str) -> Option<(&str, i64)> {
    let (name, id) = value.rsplit_once('.')?;
    if name.is_empty() {
        return None;
    }
    Some((name, id.trim().parse().ok()?))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] WfsException),
    /// A stored query could not be built or executed.
    #[error("query failed: {0}")]
    Query(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl ServiceError {
    fn query(e: impl Into<anyhow::Error>) -> Self {
        ServiceError::Query(e.into())
    }
}

impl From<PlanError> for ServiceError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::NoGeometryField(_) => WfsException::no_geometry_field().into(),
            PlanError::GmlNotSupported(name) => WfsException::not_implemented_output_format(&name).into(),
            other => ServiceError::query(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub service: Service,
    pub feature_types: Vec<FeatureType>,
    /// Every primary and alternate SRS, naturally sorted.
    pub srs_names: Vec<String>,
    pub version: WfsVersion,
    pub online_resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaElement {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct FeatureTypeSchema {
    pub name: String,
    pub elements: Vec<SchemaElement>,
}

#[derive(Debug, Clone)]
pub struct FeatureSchemas {
    pub version: WfsVersion,
    pub types: Vec<FeatureTypeSchema>,
}

pub fn gml_property_type(geometry_type: &str) -> &'static str {
    match geometry_type.to_ascii_uppercase().as_str() {
        "POINT" => "gml:PointPropertyType",
        "LINESTRING" => "gml:LineStringPropertyType",
        "POLYGON" => "gml:PolygonPropertyType",
        "MULTIPOINT" => "gml:MultiPointPropertyType",
        "MULTILINESTRING" => "gml:MultiLineStringPropertyType",
        "MULTIPOLYGON" => "gml:MultiPolygonPropertyType",
        "GEOMETRYCOLLECTION" | "GEOMCOLLECTION" => "gml:MultiGeometryPropertyType",
        _ => "gml:GeometryPropertyType",
    }
}

/// Which features GetFeature returns.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSelection {
    TypeNames(Vec<String>),
    FeatureIds(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct GetFeatureRequest {
    pub selection: FeatureSelection,
    pub bbox: Option<BBox>,
    pub crs: Crs,
    pub precision: Option<f64>,
    pub resolution: Option<f64>,
    /// Validated but not applied.
    pub max_features: Option<u64>,
    pub output: OutputFormat,
    pub version: WfsVersion,
}

pub struct FeatureCollection {
    pub stream: FeatureStream,
    pub bbox: Option<Extent>,
    pub crs: Crs,
    pub version: WfsVersion,
    pub output: OutputFormat,
}

/// Rows of a related model, one JSON object each.
pub struct RelatedObjects {
    pub cursor: RawCursor,
}

/// The main service that answers WFS operations.
pub struct WfsService {
    catalog: Arc<dyn Catalog>,
    models: Arc<dyn ModelProvider>,
    executor: Arc<dyn SqlExecutor>,
    functions: FunctionTable,
    public_url: String,
}

impl WfsService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        models: Arc<dyn ModelProvider>,
        executor: Arc<dyn SqlExecutor>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            models,
            executor,
            functions: FunctionTable::standard(),
            public_url: public_url.into(),
        }
    }

    pub fn with_functions(mut self, functions: FunctionTable) -> Self {
        self.functions = functions;
        self
    }

    pub async fn service(&self, service_id: &str) -> Result<Service, ServiceError> {
        let id: i64 = service_id
            .parse()
            .map_err(|_| WfsException::unknown_service(service_id))?;
        self.catalog
            .service(id)
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?
            .ok_or_else(|| WfsException::unknown_service(service_id).into())
    }

    async fn feature_types(&self, service: &Service) -> Result<Vec<FeatureType>, ServiceError> {
        self.catalog
            .feature_types(service.id)
            .await
            .map_err(|e| ServiceError::Internal(e.into()))
    }

    async fn feature_type(&self, service: &Service, name: &str) -> Result<Option<FeatureType>, ServiceError> {
        self.catalog
            .feature_type(service.id, name)
            .await
            .map_err(|e| ServiceError::Internal(e.into()))
    }

    async fn model_of(&self, feature_type: &FeatureType) -> Result<Arc<dyn ModelDescriptor>, ServiceError> {
        let name = feature_type.model().unwrap_or_default();
        self.models.model(name).await.map_err(ServiceError::query)
    }

    pub async fn get_capabilities(
        &self,
        service: Service,
        version: WfsVersion,
    ) -> Result<Capabilities, ServiceError> {
        let feature_types = self.feature_types(&service).await?;
        let unique: BTreeSet<&str> = feature_types.iter().flat_map(|ft| ft.srs_names()).collect();
        let mut srs_names: Vec<String> = unique.into_iter().map(str::to_string).collect();
        srs_names.sort_by(|a, b| natural_cmp(a, b));

        Ok(Capabilities {
            online_resource: service.online_resource(&self.public_url),
            service,
            feature_types,
            srs_names,
            version,
        })
    }

    pub async fn describe_feature_type(
        &self,
        service: &Service,
        type_names: Option<&str>,
        version: WfsVersion,
    ) -> Result<FeatureSchemas, ServiceError> {
        let mut feature_types = self.feature_types(service).await?;
        if let Some(names) = type_names {
            let wanted: Vec<&str> = names.split(',').map(str::trim).collect();
            feature_types.retain(|ft| wanted.iter().any(|w| ft.name.eq_ignore_ascii_case(w)));
        }
        if feature_types.is_empty() {
            return Err(WfsException::invalid_parameter_value("typename", type_names.unwrap_or("")).into());
        }

        let mut types = Vec::with_capacity(feature_types.len());
        for ft in &feature_types {
            let elements = if ft.is_raw_sql() {
                let columns = self.executor.describe(&ft.query).await.map_err(ServiceError::query)?;
                raw_schema(&columns)
            } else {
                let model = self.model_of(ft).await?;
                let fields = effective_fields(ft, model.as_ref()).map_err(ServiceError::query)?;
                fields
                    .iter()
                    .filter_map(|f| match &f.kind {
                        FieldKind::Geometry { geometry_type, .. } => Some(SchemaElement {
                            name: "geometry".to_string(),
                            type_name: gml_property_type(geometry_type).to_string(),
                        }),
                        FieldKind::Scalar { .. } | FieldKind::ForeignKey { .. } => Some(SchemaElement {
                            name: f.name.clone(),
                            type_name: "xsd:string".to_string(),
                        }),
                        FieldKind::OneToMany { .. } => None,
                    })
                    .collect()
            };
            types.push(FeatureTypeSchema {
                name: ft.name.clone(),
                elements,
            });
        }
        Ok(FeatureSchemas { version, types })
    }

    pub async fn get_feature(
        &self,
        service: &Service,
        request: GetFeatureRequest,
    ) -> Result<FeatureCollection, ServiceError> {
        let mut stream = FeatureStream::new();
        let mut cache = FunctionCache::new();
        let filled = match &request.selection {
            FeatureSelection::TypeNames(names) => {
                self.open_types(service, names, &request, &mut cache, &mut stream).await
            }
            FeatureSelection::FeatureIds(ids) => {
                self.fetch_ids(service, ids, &request, &mut cache, &mut stream).await
            }
        };
        match filled {
            Ok(bbox) => Ok(FeatureCollection {
                stream,
                bbox,
                crs: request.crs,
                version: request.version,
                output: request.output,
            }),
            Err(e) => {
                stream.close().await;
                Err(e)
            }
        }
    }

    fn feature_query(request: &GetFeatureRequest, feature_id: Option<i64>) -> FeatureQuery {
        let encoding = match request.output {
            OutputFormat::Json => GeometryAnnotation::GeoJson,
            OutputFormat::Gml => GeometryAnnotation::Gml(request.version.gml_version()),
        };
        FeatureQuery {
            precision: request.precision,
            resolution: request.resolution,
            bbox: request.bbox.clone(),
            crs: request.crs.clone(),
            feature_id,
            encoding,
        }
    }

    /// Opens a source for one feature type and computes its extent.
    async fn open_source(
        &self,
        service: &Service,
        ft: &FeatureType,
        query: &FeatureQuery,
        cache: &mut FunctionCache,
    ) -> Result<(FeatureSource, Option<Extent>), ServiceError> {
        if ft.is_raw_sql() {
            let plan = plan_raw(ft, query)?;
            let extent = self
                .executor
                .extent(&plan.geometry_sql, plan.params.clone(), SHAPE_COLUMN)
                .await
                .map_err(ServiceError::query)?;
            let cursor = self
                .executor
                .open_cursor(&plan.sql, plan.params)
                .await
                .map_err(ServiceError::query)?;
            match RawLayout::from_cursor(&cursor) {
                Some(layout) => Ok((FeatureSource::RawSql { cursor, layout }, extent)),
                None => {
                    cursor.close().await;
                    Err(WfsException::no_geometry_field().into())
                }
            }
        } else {
            let model = self.model_of(ft).await?;
            let plan = plan_model(ft, model, query, &self.functions, cache)?;
            let extent = self
                .executor
                .extent(&plan.extent.sql, plan.extent.params, GEOMETRY_COLUMN)
                .await
                .map_err(ServiceError::query)?;
            let cursor = self
                .executor
                .open_cursor(&plan.query.sql, plan.query.params)
                .await
                .map_err(ServiceError::query)?;
            match ModelLayout::new(&cursor, service.id, &ft.name, &plan.fields, &plan.geometry_field) {
                Ok(layout) => Ok((FeatureSource::Modeled { cursor, layout }, extent)),
                Err(e) => {
                    cursor.close().await;
                    Err(ServiceError::query(e))
                }
            }
        }
    }

    async fn open_types(
        &self,
        service: &Service,
        names: &[String],
        request: &GetFeatureRequest,
        cache: &mut FunctionCache,
        stream: &mut FeatureStream,
    ) -> Result<Option<Extent>, ServiceError> {
        let query = Self::feature_query(request, None);
        let mut bbox = None;
        for name in names {
            let ft = self
                .feature_type(service, name)
                .await?
                .ok_or_else(|| WfsException::invalid_parameter_value("typename", name))?;
            let (source, extent) = self.open_source(service, &ft, &query, cache).await?;
            debug!(feature_type = %ft.name, ?extent, "opened feature source");
            accumulate(&mut bbox, extent);
            stream.push(&ft.name, source);
        }
        Ok(bbox)
    }

    async fn fetch_ids(
        &self,
        service: &Service,
        ids: &[String],
        request: &GetFeatureRequest,
        cache: &mut FunctionCache,
        stream: &mut FeatureStream,
    ) -> Result<Option<Extent>, ServiceError> {
        let mut bbox = None;
        for feature in ids {
            let (name, id) = split_feature_id(feature)
                .ok_or_else(|| WfsException::invalid_parameter_value("featureid", feature))?;
            let ft = self
                .feature_type(service, name)
                .await?
                .ok_or_else(|| WfsException::invalid_parameter_value("featureid", feature))?;

            let query = Self::feature_query(request, Some(id));
            let (mut source, extent) = self.open_source(service, &ft, &query, cache).await?;
            let first = source.next().await.transpose();
            source.close().await;
            let first = first.map_err(ServiceError::query)?;

            match first {
                Some(record) => {
                    accumulate(&mut bbox, extent);
                    stream.push(&ft.name, FeatureSource::Records(VecDeque::from([record])));
                }
                None => warn!(feature = %feature, "feature not found"),
            }
        }
        Ok(bbox)
    }

    pub async fn related(
        &self,
        service: &Service,
        id: Option<&str>,
        field: Option<&str>,
    ) -> Result<RelatedObjects, ServiceError> {
        let id = id.ok_or_else(|| WfsException::missing_parameter("id"))?;
        let field = field.ok_or_else(|| WfsException::missing_parameter("field"))?;
        let (name, fid) =
            split_feature_id(id).ok_or_else(|| WfsException::invalid_parameter_value("id", id))?;
        let ft = self
            .feature_type(service, name)
            .await?
            .filter(|ft| !ft.is_raw_sql())
            .ok_or_else(|| WfsException::invalid_parameter_value("id", id))?;

        let model = self.model_of(&ft).await?;
        let (related, column) = match model.field(field).map(|f| &f.kind) {
            Some(FieldKind::OneToMany { model, column }) => (model.clone(), column.clone()),
            _ => return Err(WfsException::invalid_parameter_value("field", field).into()),
        };
        let related = self.models.model(&related).await.map_err(ServiceError::query)?;
        let handle = related.related_query(&column, fid).map_err(ServiceError::query)?;
        let cursor = self
            .executor
            .open_cursor(&handle.sql, handle.params)
            .await
            .map_err(ServiceError::query)?;
        Ok(RelatedObjects { cursor })
    }
}

fn raw_schema(columns: &[ColumnDesc]) -> Vec<SchemaElement> {
    columns
        .iter()
        .map(|c| {
            if c.name == SHAPE_COLUMN {
                SchemaElement {
                    name: "geometry".to_string(),
                    type_name: "gml:GeometryAssociationType".to_string(),
                }
            } else {
                SchemaElement {
                    name: c.name.clone(),
                    type_name: "xsd:string".to_string(),
                }
            }
        })
        .collect()
}
