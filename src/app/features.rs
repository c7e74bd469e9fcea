//! Feature iteration over raw SQL cursors and model queries.
//!
//! Every backend is adapted to the same [`FeatureRecord`] shape. A
//! [`FeatureStream`] concatenates the sources of all requested feature types
//! and owns their cursors until it is closed or dropped.

use crate::domain::model::{
    FieldInfo, FieldKind, GEOJSON_COLUMN, GEOMETRY_COLUMN, GML_COLUMN, PK_COLUMN,
};
use crate::geo::ewkb;
use crate::storage::cursor::{CursorError, RawCursor, RawRow, SqlValue};
use crate::domain::query::augment::{ID_COLUMN, SHAPE_COLUMN};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureGeometry {
    Geo(geo_types::Geometry<f64>),
    /// GeoJSON geometry object rendered by the database.
    GeoJson(JsonValue),
    /// GML fragment rendered by the database.
    Gml(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub id: Option<String>,
    pub geometry: Option<FeatureGeometry>,
    pub properties: Map<String, JsonValue>,
}

fn decode_geometry(value: &SqlValue, column: &str) -> Result<Option<FeatureGeometry>, CursorError> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Bytes(bytes) => ewkb::decode(bytes)
            .map(|g| Some(FeatureGeometry::Geo(g.geometry)))
            .map_err(|e| CursorError::Backend(format!("column '{}': {}", column, e))),
        SqlValue::Text(gml) => Ok(Some(FeatureGeometry::Gml(gml.clone()))),
        SqlValue::Json(geojson) => Ok(Some(FeatureGeometry::GeoJson(geojson.clone()))),
        _ => Err(CursorError::Decode {
            column: column.to_string(),
            type_name: "geometry".to_string(),
        }),
    }
}

fn cell<'a>(row: &'a RawRow, index: usize) -> &'a SqlValue {
    row.get(index).unwrap_or(&SqlValue::Null)
}

/// Column roles of a raw SQL result set.
#[derive(Debug, Clone)]
pub struct RawLayout {
    names: Vec<String>,
    geometry: usize,
    id: Option<usize>,
}

impl RawLayout {
    /// `None` when the result set has no `shape` column.
    pub fn from_cursor(cursor: &RawCursor) -> Option<Self> {
        Some(Self {
            names: cursor.columns().iter().map(|c| c.name.clone()).collect(),
            geometry: cursor.column_index(SHAPE_COLUMN)?,
            id: cursor.column_index(ID_COLUMN),
        })
    }

    /// Every column except `shape` becomes a property; `id` also names the feature.
    pub fn adapt(&self, row: &RawRow) -> Result<FeatureRecord, CursorError> {
        let mut properties = Map::new();
        for (i, name) in self.names.iter().enumerate() {
            if i != self.geometry {
                properties.insert(name.clone(), cell(row, i).to_json());
            }
        }
        Ok(FeatureRecord {
            id: self
                .id
                .map(|i| cell(row, i))
                .filter(|v| !matches!(v, SqlValue::Null))
                .map(SqlValue::to_text),
            geometry: decode_geometry(cell(row, self.geometry), SHAPE_COLUMN)?,
            properties,
        })
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Column(usize),
    Geometry,
    Link,
    Skip,
}

/// Field roles of a model query result.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    service_id: i64,
    type_name: String,
    pk: usize,
    geometry: Option<(usize, String)>,
    slots: Vec<(String, Slot)>,
}

impl ModelLayout {
    pub fn new(
        cursor: &RawCursor,
        service_id: i64,
        type_name: &str,
        fields: &[FieldInfo],
        geometry_field: &str,
    ) -> Result<Self, CursorError> {
        let missing = |c: &str| CursorError::Backend(format!("model query returned no '{}' column", c));
        let pk = cursor.column_index(PK_COLUMN).ok_or_else(|| missing(PK_COLUMN))?;
        let geometry = [GEOMETRY_COLUMN, GML_COLUMN, GEOJSON_COLUMN]
            .iter()
            .find_map(|c| cursor.column_index(c).map(|i| (i, c.to_string())));

        let mut slots = Vec::with_capacity(fields.len());
        for field in fields {
            let slot = match &field.kind {
                FieldKind::Geometry { .. } if field.name == geometry_field => Slot::Geometry,
                FieldKind::Geometry { .. } => Slot::Skip,
                FieldKind::OneToMany { .. } => Slot::Link,
                FieldKind::Scalar { .. } | FieldKind::ForeignKey { .. } => Slot::Column(
                    cursor
                        .column_index(&field.name)
                        .ok_or_else(|| missing(&field.name))?,
                ),
            };
            slots.push((field.name.clone(), slot));
        }

        Ok(Self {
            service_id,
            type_name: type_name.to_string(),
            pk,
            geometry,
            slots,
        })
    }

    /// Relative URL of the related-objects endpoint for one relation of one feature.
    pub fn related_url(service_id: i64, type_name: &str, id: &str, field: &str) -> String {
        format!("/{}/related/?id={}.{}&field={}", service_id, type_name, id, field)
    }

    pub fn adapt(&self, row: &RawRow) -> Result<FeatureRecord, CursorError> {
        let id = cell(row, self.pk).to_text();
        let mut record = FeatureRecord {
            id: Some(id.clone()),
            geometry: None,
            properties: Map::new(),
        };
        for (name, slot) in &self.slots {
            match slot {
                Slot::Column(i) => {
                    record.properties.insert(name.clone(), cell(row, *i).to_json());
                }
                Slot::Geometry => {
                    if let Some((i, column)) = &self.geometry {
                        record.geometry = decode_geometry(cell(row, *i), column)?;
                    }
                }
                Slot::Link => {
                    let url = Self::related_url(self.service_id, &self.type_name, &id, name);
                    record.properties.insert(name.clone(), json!({ "url": url }));
                }
                Slot::Skip => {}
            }
        }
        Ok(record)
    }
}

/// Where the features of one requested type come from.
pub enum FeatureSource {
    RawSql { cursor: RawCursor, layout: RawLayout },
    Modeled { cursor: RawCursor, layout: ModelLayout },
    /// Already fetched, e.g. single features looked up by id.
    Records(VecDeque<FeatureRecord>),
}

impl FeatureSource {
    pub async fn next(&mut self) -> Option<Result<FeatureRecord, CursorError>> {
        match self {
            FeatureSource::RawSql { cursor, layout } => match cursor.next_row().await? {
                Ok(row) => Some(layout.adapt(&row)),
                Err(e) => Some(Err(e)),
            },
            FeatureSource::Modeled { cursor, layout } => match cursor.next_row().await? {
                Ok(row) => Some(layout.adapt(&row)),
                Err(e) => Some(Err(e)),
            },
            FeatureSource::Records(records) => records.pop_front().map(Ok),
        }
    }

    pub async fn close(self) {
        match self {
            FeatureSource::RawSql { cursor, .. } | FeatureSource::Modeled { cursor, .. } => {
                cursor.close().await
            }
            FeatureSource::Records(_) => {}
        }
    }
}

/// Lazy, single-pass sequence of `(type name, feature)` across all requested types.
#[derive(Default)]
pub struct FeatureStream {
    sources: VecDeque<(Arc<str>, FeatureSource)>,
}

impl FeatureStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, type_name: &str, source: FeatureSource) {
        self.sources.push_back((Arc::from(type_name), source));
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Next feature; exhausted sources are closed as soon as they run dry.
    pub async fn next(&mut self) -> Option<Result<(Arc<str>, FeatureRecord), CursorError>> {
        loop {
            let (name, source) = self.sources.front_mut()?;
            match source.next().await {
                Some(Ok(record)) => return Some(Ok((name.clone(), record))),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    if let Some((_, done)) = self.sources.pop_front() {
                        done.close().await;
                    }
                }
            }
        }
    }

    /// Drains everything into memory, closing every cursor even on error.
    pub async fn collect(mut self) -> Result<Vec<(Arc<str>, FeatureRecord)>, CursorError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(feature) => out.push(feature),
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Releases every cursor still held. Release failures are logged by the cursors.
    pub async fn close(mut self) {
        let remaining = self.sources.len();
        while let Some((name, source)) = self.sources.pop_front() {
            source.close().await;
            tracing::trace!(feature_type = %name, "released feature source");
        }
        if remaining > 0 {
            debug!(remaining, "closed feature stream early");
        }
    }
}

impl Drop for FeatureStream {
    fn drop(&mut self) {
        if !self.sources.is_empty() {
            debug!(remaining = self.sources.len(), "feature stream dropped before close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cursor::ColumnDesc;
    use geo_types::{point, Geometry};

    fn point_ewkb() -> Vec<u8> {
        ewkb::encode(&Geometry::Point(point! { x: 5.0, y: 52.0 }), Some(4326)).unwrap()
    }

    #[tokio::test]
    async fn raw_rows_become_features_in_type_order() {
        let cols = vec![
            ColumnDesc::new("id", "INT4"),
            ColumnDesc::new("name", "TEXT"),
            ColumnDesc::new("shape", "BYTEA"),
        ];
        let first = RawCursor::from_rows(
            cols.clone(),
            vec![vec![SqlValue::Int(1), SqlValue::Text("a".into()), SqlValue::Bytes(point_ewkb())]],
        );
        let second = RawCursor::from_rows(
            cols,
            vec![vec![SqlValue::Int(9), SqlValue::Null, SqlValue::Null]],
        );

        let mut stream = FeatureStream::new();
        for (name, cursor) in [("roads", first), ("rivers", second)] {
            let layout = RawLayout::from_cursor(&cursor).unwrap();
            stream.push(name, FeatureSource::RawSql { cursor, layout });
        }

        let features = stream.collect().await.unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(&*features[0].0, "roads");
        assert_eq!(features[0].1.id.as_deref(), Some("1"));
        assert_eq!(
            features[0].1.properties,
            json!({"id": 1, "name": "a"}).as_object().unwrap().clone()
        );
        assert_eq!(
            features[0].1.geometry,
            Some(FeatureGeometry::Geo(Geometry::Point(point! { x: 5.0, y: 52.0 })))
        );
        assert_eq!(&*features[1].0, "rivers");
        assert_eq!(features[1].1.geometry, None);
    }

    #[test]
    fn raw_layout_requires_a_shape_column() {
        let cursor = RawCursor::from_rows(vec![ColumnDesc::new("id", "INT4")], vec![]);
        assert!(RawLayout::from_cursor(&cursor).is_none());
    }

    #[tokio::test]
    async fn model_rows_render_relations_as_links() {
        let fields = vec![
            FieldInfo::scalar("name", "text"),
            FieldInfo::geometry("geom", "POINT", 4326),
            FieldInfo {
                name: "owner".into(),
                kind: FieldKind::OneToMany {
                    model: "owner".into(),
                    column: "parcel_id".into(),
                },
            },
        ];
        let cursor = RawCursor::from_rows(
            vec![
                ColumnDesc::new("__pk", "INT4"),
                ColumnDesc::new("name", "TEXT"),
                ColumnDesc::new("__geojson", "JSON"),
            ],
            vec![vec![
                SqlValue::Int(3),
                SqlValue::Text("lot".into()),
                SqlValue::Json(json!({"type": "Point", "coordinates": [1.0, 2.0]})),
            ]],
        );
        let layout = ModelLayout::new(&cursor, 7, "parcels", &fields, "geom").unwrap();
        let mut stream = FeatureStream::new();
        stream.push("parcels", FeatureSource::Modeled { cursor, layout });

        let (_, record) = stream.next().await.unwrap().unwrap();
        assert_eq!(record.id.as_deref(), Some("3"));
        assert_eq!(
            record.properties["owner"],
            json!({"url": "/7/related/?id=parcels.3&field=owner"})
        );
        assert!(matches!(record.geometry, Some(FeatureGeometry::GeoJson(_))));
        assert!(stream.next().await.is_none());
        stream.close().await;
    }
}
