//! Chunked GeoJSON writers.
//!
//! Output is produced while the feature cursors are pulled; a chunk is handed
//! to the HTTP body once the buffer grows past [`FLUSH_THRESHOLD`].

use crate::app::features::{FeatureGeometry, FeatureRecord, FeatureStream};
use crate::app::wfs_service::{FeatureCollection, RelatedObjects};
use crate::domain::crs::Crs;
use crate::geo::Extent;
use crate::storage::cursor::{CursorError, RawCursor, RawRow};
use futures::Stream;
use serde_json::{json, Map, Value as JsonValue};
use tracing::error;

pub const FLUSH_THRESHOLD: usize = 16383;

/// Comma-separated JSON items between a header and a counted footer.
#[derive(Debug)]
struct JsonChunks {
    buffer: String,
    count: usize,
}

impl JsonChunks {
    fn new(header: String) -> Self {
        Self {
            buffer: header,
            count: 0,
        }
    }

    fn push(&mut self, item: &JsonValue) {
        if self.count > 0 {
            self.buffer.push(',');
        }
        self.buffer.push_str(&item.to_string());
        self.count += 1;
    }

    fn should_flush(&self) -> bool {
        self.buffer.len() > FLUSH_THRESHOLD
    }

    fn take(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn finish(&mut self, total_key: &str) -> String {
        self.buffer.push_str(&format!("],\"{}\":{}}}", total_key, self.count));
        self.take()
    }
}

pub fn collection_header(crs: &Crs, bbox: Option<&Extent>) -> String {
    let crs = json!({"type": "name", "properties": {"name": crs.to_legacy()}});
    let mut header = format!("{{\"type\":\"FeatureCollection\",\"crs\":{}", crs);
    if let Some(b) = bbox {
        header.push_str(&format!(",\"bbox\":{}", json!(b.as_array())));
    }
    header.push_str(",\"features\":[");
    header
}

fn geometry_json(geometry: Option<&FeatureGeometry>) -> JsonValue {
    match geometry {
        Some(FeatureGeometry::Geo(g)) => {
            match serde_json::to_value(geojson::Geometry::new(geojson::Value::from(g))) {
                Ok(value) => value,
                Err(e) => {
                    error!(error = %e, "cannot encode geometry as GeoJSON, writing null");
                    JsonValue::Null
                }
            }
        }
        Some(FeatureGeometry::GeoJson(v)) => v.clone(),
        Some(FeatureGeometry::Gml(_)) | None => JsonValue::Null,
    }
}

pub fn feature_json(type_name: &str, record: &FeatureRecord) -> JsonValue {
    json!({
        "type": "Feature",
        "id": record.id.as_ref().map(|id| format!("{}.{}", type_name, id)),
        "geometry": geometry_json(record.geometry.as_ref()),
        "properties": JsonValue::Object(record.properties.clone()),
    })
}

/// GeoJSON `FeatureCollection` over a [`FeatureStream`].
pub struct GeoJsonWriter {
    features: Option<FeatureStream>,
    chunks: JsonChunks,
}

impl GeoJsonWriter {
    pub fn new(collection: FeatureCollection) -> Self {
        let header = collection_header(&collection.crs, collection.bbox.as_ref());
        Self {
            features: Some(collection.stream),
            chunks: JsonChunks::new(header),
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<String, CursorError>> {
        let features = self.features.as_mut()?;
        loop {
            match features.next().await {
                Some(Ok((type_name, record))) => {
                    self.chunks.push(&feature_json(&type_name, &record));
                    if self.chunks.should_flush() {
                        return Some(Ok(self.chunks.take()));
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "feature stream failed mid-response");
                    if let Some(features) = self.features.take() {
                        features.close().await;
                    }
                    return Some(Err(e));
                }
                None => {
                    self.features = None;
                    return Some(Ok(self.chunks.finish("totalFeatures")));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String, CursorError>> + Send {
        futures::stream::unfold(self, |mut writer| async move {
            writer.next_chunk().await.map(|chunk| (chunk, writer))
        })
    }
}

fn row_object(columns: &[String], row: &RawRow) -> JsonValue {
    let mut object = Map::new();
    for (name, value) in columns.iter().zip(row) {
        object.insert(name.clone(), value.to_json());
    }
    JsonValue::Object(object)
}

/// `{"type":"RelationCollection","objects":[...],"totalObjects":N}`.
pub struct RelatedJsonWriter {
    columns: Vec<String>,
    cursor: Option<RawCursor>,
    chunks: JsonChunks,
}

impl RelatedJsonWriter {
    pub fn new(related: RelatedObjects) -> Self {
        Self {
            columns: related.cursor.columns().iter().map(|c| c.name.clone()).collect(),
            cursor: Some(related.cursor),
            chunks: JsonChunks::new("{\"type\":\"RelationCollection\",\"objects\":[".to_string()),
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<String, CursorError>> {
        let cursor = self.cursor.as_mut()?;
        loop {
            match cursor.next_row().await {
                Some(Ok(row)) => {
                    self.chunks.push(&row_object(&self.columns, &row));
                    if self.chunks.should_flush() {
                        return Some(Ok(self.chunks.take()));
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "related objects cursor failed mid-response");
                    if let Some(cursor) = self.cursor.take() {
                        cursor.close().await;
                    }
                    return Some(Err(e));
                }
                None => {
                    if let Some(cursor) = self.cursor.take() {
                        cursor.close().await;
                    }
                    return Some(Ok(self.chunks.finish("totalObjects")));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String, CursorError>> + Send {
        futures::stream::unfold(self, |mut writer| async move {
            writer.next_chunk().await.map(|chunk| (chunk, writer))
        })
    }
}
