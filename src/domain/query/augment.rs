//! Query augmentation: turns a feature type plus request parameters into an
//! executable, fully parameterised plan.
//!
//! Raw SQL feature types have their stored SELECT rewritten: the `shape`
//! column may be simplified and transformed, and the resolution filter, bbox
//! and id restrictions are ANDed onto the WHERE clause. Model-backed feature
//! types are handed to their [`ModelDescriptor`] as a [`ModelQuery`].

use crate::domain::catalog::FeatureType;
use crate::domain::crs::{Crs, CrsError};
use crate::domain::model::{
    FieldInfo, GeometryAnnotation, ModelDescriptor, ModelError, ModelQuery, QueryHandle,
};
use crate::domain::query::functions::{parse_query, FunctionCache, FunctionError, FunctionTable};
use crate::geo::{BBox, GeoError};
use crate::storage::cursor::SqlParam;
use crate::storage::sql::{
    build_comparison, build_function_call, Fragment, PlaceholderStyle, SelectStatement, SqlError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const SHAPE_COLUMN: &str = "shape";
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("feature type '{0}' exposes no geometry")]
    NoGeometryField(String),
    #[error("GML output is not available for raw SQL feature type '{0}'")]
    GmlNotSupported(String),
    #[error(transparent)]
    Crs(#[from] CrsError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error(transparent)]
    Geometry(#[from] GeoError),
}

/// Request parameters that shape a feature query.
#[derive(Debug, Clone)]
pub struct FeatureQuery {
    pub precision: Option<f64>,
    pub resolution: Option<f64>,
    pub bbox: Option<BBox>,
    /// Output CRS.
    pub crs: Crs,
    pub feature_id: Option<i64>,
    pub encoding: GeometryAnnotation,
}

impl FeatureQuery {
    pub fn new(crs: Crs, encoding: GeometryAnnotation) -> Self {
        Self {
            precision: None,
            resolution: None,
            bbox: None,
            crs,
            feature_id: None,
            encoding,
        }
    }
}

/// A rewritten raw SELECT. `sql` returns `shape` as EWKB; `geometry_sql`
/// is the same query with `shape` still a geometry, for extents. Both take
/// `params` in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPlan {
    pub sql: String,
    pub geometry_sql: String,
    pub params: Vec<SqlParam>,
    /// `%s` rendering of `sql`, for logs.
    pub display: String,
}

pub struct ModelPlan {
    pub model: Arc<dyn ModelDescriptor>,
    /// Fields walked per row, in output order.
    pub fields: Vec<FieldInfo>,
    pub geometry_field: String,
    pub query: QueryHandle,
    pub extent: QueryHandle,
}

pub enum QueryPlan {
    Raw(RawPlan),
    Model(ModelPlan),
}

pub fn plan_raw(feature_type: &FeatureType, request: &FeatureQuery) -> Result<RawPlan, PlanError> {
    if let GeometryAnnotation::Gml(_) = request.encoding {
        return Err(PlanError::GmlNotSupported(feature_type.name.clone()));
    }
    let type_srid = feature_type.srid()?;
    let mut select = SelectStatement::parse(&feature_type.query)?;
    let shape = select
        .find_identifier(SHAPE_COLUMN)
        .map_err(|_| PlanError::NoGeometryField(feature_type.name.clone()))?
        .clone();

    let mut select_params = Vec::new();
    let mut where_params = Vec::new();

    let mut output = shape.clone();
    if output.alias().is_none() {
        output = output.with_alias(SHAPE_COLUMN);
    }
    if let Some(precision) = request.precision {
        output = build_function_call("ST_Simplify", &output, 1, true);
        select_params.push(SqlParam::Float(precision));
    }
    if request.crs.srid() != type_srid {
        output = build_function_call("ST_Transform", &output, 1, true);
        select_params.push(SqlParam::Int(request.crs.srid()));
    }
    if output != shape {
        select.replace_identifier(&shape, output.clone())?;
    }

    if let Some(resolution) = request.resolution {
        if let Some(filter) = feature_type.resolution_filter(resolution) {
            debug!(
                feature_type = %feature_type.name,
                min_resolution = filter.min_resolution,
                "applying resolution filter"
            );
            select.add_condition(filter.query.as_str())?;
        }
    }

    if let Some(bbox) = &request.bbox {
        let mut target = Fragment::call("ST_GeomFromEWKB", &[Fragment::param()]);
        where_params.push(SqlParam::Bytes(bbox.to_ewkb()?));
        if bbox.srid() != type_srid {
            target = Fragment::call("ST_Transform", &[target, Fragment::param()]);
            where_params.push(SqlParam::Int(type_srid));
        }
        select.add_condition(Fragment::call(
            "ST_Intersects",
            &[shape.bare().clone(), target],
        ))?;
    }

    if let Some(id) = request.feature_id {
        let id_column = select.find_identifier(ID_COLUMN)?.clone();
        select.add_condition(build_comparison(&id_column, "=")?)?;
        where_params.push(SqlParam::BigInt(id));
    }

    let geometry_sql = select.to_sql(PlaceholderStyle::Numbered);
    let encoded = build_function_call("ST_AsEWKB", &output, 0, true);
    select.replace_identifier(&output, encoded)?;

    let mut params = select_params;
    params.extend(where_params);
    debug_assert_eq!(params.len(), select.param_count());

    let display_sql = select.to_sql(PlaceholderStyle::Percent);
    debug!(feature_type = %feature_type.name, sql = %display_sql, "final SQL");
    Ok(RawPlan {
        sql: select.to_sql(PlaceholderStyle::Numbered),
        geometry_sql,
        params,
        display: display_sql,
    })
}

/// Fields of the feature type's restricted list, or all model fields when it is empty.
pub fn effective_fields(
    feature_type: &FeatureType,
    model: &dyn ModelDescriptor,
) -> Result<Vec<FieldInfo>, ModelError> {
    if feature_type.fields().is_empty() {
        return Ok(model.fields().to_vec());
    }
    feature_type
        .fields()
        .iter()
        .map(|name| {
            model.field(name).cloned().ok_or_else(|| ModelError::UnknownField {
                model: model.name().to_string(),
                field: name.clone(),
            })
        })
        .collect()
}

pub fn plan_model(
    feature_type: &FeatureType,
    model: Arc<dyn ModelDescriptor>,
    request: &FeatureQuery,
    functions: &FunctionTable,
    cache: &mut FunctionCache,
) -> Result<ModelPlan, PlanError> {
    let fields = effective_fields(feature_type, model.as_ref())?;
    let geometry_field = fields
        .iter()
        .find(|f| f.is_geometry())
        .map(|f| f.name.clone())
        .ok_or_else(|| PlanError::NoGeometryField(feature_type.name.clone()))?;

    let mut filters = vec![parse_query(&feature_type.query, functions, cache)?];
    if let Some(resolution) = request.resolution {
        if let Some(filter) = feature_type.resolution_filter(resolution) {
            debug!(
                feature_type = %feature_type.name,
                min_resolution = filter.min_resolution,
                "applying resolution filter"
            );
            filters.push(parse_query(&filter.query, functions, cache)?);
        }
    }

    let type_srid = feature_type.srid()?;
    let query = ModelQuery {
        fields: feature_type.fields().to_vec(),
        geometry_field: geometry_field.clone(),
        filters,
        bbox: request.bbox.clone(),
        target_srid: Some(request.crs.srid()).filter(|s| *s != type_srid),
        simplify: request.precision,
        annotation: Some(request.encoding),
        id: request.feature_id,
    };
    let handle = model.build_query(&query)?;
    let extent = model.extent_query(&query)?;
    debug!(feature_type = %feature_type.name, sql = %handle.sql, "final model SQL");

    Ok(ModelPlan {
        model,
        fields,
        geometry_field,
        query: handle,
        extent,
    })
}
