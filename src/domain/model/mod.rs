//! Dynamic model capability.
//!
//! A model is a database table described at runtime: its fields, which of
//! them is a geometry, its primary key and its incoming relations. The
//! feature engine only talks to the [`ModelDescriptor`] trait; [`DynamicModel`]
//! implements it by introspecting PostgreSQL.

use crate::domain::query::filter::FilterError;
use crate::geo::{BBox, GeoError};
use crate::storage::cursor::SqlParam;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub mod dynamic;
pub mod registry;

pub use dynamic::DynamicModel;
pub use registry::{ModelProvider, ModelRegistry, SharedModelRegistry};

/// Output column carrying the primary key of model rows.
pub const PK_COLUMN: &str = "__pk";
/// Output column carrying the geometry as EWKB.
pub const GEOMETRY_COLUMN: &str = "__geom";
pub const GML_COLUMN: &str = "__gml";
pub const GEOJSON_COLUMN: &str = "__geojson";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{0}' is not registered")]
    UnknownModel(String),
    #[error("invalid model name '{0}'")]
    InvalidName(String),
    #[error("model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },
    #[error("field '{0}' is not a geometry")]
    NotAGeometry(String),
    #[error("field '{0}' is not a one-to-many relation")]
    NotARelation(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Geometry(#[from] GeoError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A plain column; `sql_type` is the PostgreSQL type name used for casts.
    Scalar { sql_type: String },
    /// A column referencing another model's primary key.
    ForeignKey { sql_type: String, model: String },
    Geometry { geometry_type: String, srid: i32 },
    /// Rows of `model` whose `column` references this model.
    OneToMany { model: String, column: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldInfo {
    pub fn scalar(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar {
                sql_type: sql_type.into(),
            },
        }
    }

    pub fn geometry(name: impl Into<String>, geometry_type: impl Into<String>, srid: i32) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Geometry {
                geometry_type: geometry_type.into(),
                srid,
            },
        }
    }

    pub fn is_geometry(&self) -> bool {
        matches!(self.kind, FieldKind::Geometry { .. })
    }

    /// Stored in this model's own table.
    pub fn is_concrete(&self) -> bool {
        !matches!(self.kind, FieldKind::OneToMany { .. })
    }

    pub fn is_relation(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::ForeignKey { .. } | FieldKind::OneToMany { .. }
        )
    }

    pub fn sql_type(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Scalar { sql_type } | FieldKind::ForeignKey { sql_type, .. } => Some(sql_type),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryAnnotation {
    /// `ST_AsGML(version, ...)`, version 2 or 3.
    Gml(u8),
    GeoJson,
}

/// Everything a feature query can ask of a model.
#[derive(Debug, Clone, Default)]
pub struct ModelQuery {
    /// Fields to select; empty selects every field.
    pub fields: Vec<String>,
    pub geometry_field: String,
    /// Filter documents, ANDed.
    pub filters: Vec<Map<String, JsonValue>>,
    pub bbox: Option<BBox>,
    /// Output SRID when it differs from the stored one.
    pub target_srid: Option<i32>,
    pub simplify: Option<f64>,
    pub annotation: Option<GeometryAnnotation>,
    pub id: Option<i64>,
}

/// SQL with `$n` placeholders and the values bound to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryHandle {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl QueryHandle {
    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Registers `param` and returns its placeholder, cast when `cast` is given.
    pub fn placeholder(&mut self, param: SqlParam, cast: Option<&str>) -> String {
        self.params.push(param);
        match cast {
            Some(ty) => format!("${}::{}", self.params.len(), ty),
            None => format!("${}", self.params.len()),
        }
    }

    pub fn bind(&mut self, param: SqlParam, cast: Option<&str>) -> &mut Self {
        let p = self.placeholder(param, cast);
        self.sql.push_str(&p);
        self
    }
}

/// `"name"` with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub trait ModelDescriptor: Send + Sync {
    /// `schema.table`, or `table` for the public schema.
    fn name(&self) -> &str;

    fn fields(&self) -> &[FieldInfo];

    fn primary_key(&self) -> &str;

    fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields().iter().find(|f| f.name == name)
    }

    fn geometry_field(&self) -> Option<&FieldInfo> {
        self.fields().iter().find(|f| f.is_geometry())
    }

    /// Rows of the feature query: `__pk`, the selected concrete fields and the
    /// geometry as `__geom` (EWKB), `__gml` or `__geojson`.
    fn build_query(&self, query: &ModelQuery) -> Result<QueryHandle, ModelError>;

    /// The same filtered rows reduced to one `__geom` geometry column, for `ST_Extent`.
    fn extent_query(&self, query: &ModelQuery) -> Result<QueryHandle, ModelError>;

    /// Concrete, non-relation fields of rows whose `column` equals `id`.
    fn related_query(&self, column: &str, id: i64) -> Result<QueryHandle, ModelError>;
}
