use crate::domain::model::{
    quote_ident, FieldInfo, FieldKind, GeometryAnnotation, ModelDescriptor, ModelError, ModelQuery,
    QueryHandle, GEOJSON_COLUMN, GEOMETRY_COLUMN, GML_COLUMN, PK_COLUMN,
};
use crate::domain::query::filter;
use crate::storage::cursor::SqlParam;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

const ALIAS: &str = "t";

pub fn validate_ident(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits `schema.table` (schema defaults to `public`) and validates both parts.
pub fn split_model_name(name: &str) -> Result<(String, String), ModelError> {
    let (schema, table) = name.split_once('.').unwrap_or(("public", name));
    if !validate_ident(schema) || !validate_ident(table) {
        return Err(ModelError::InvalidName(name.to_string()));
    }
    Ok((schema.to_string(), table.to_string()))
}

fn model_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

/// A table described from `information_schema` and PostGIS `geometry_columns`.
#[derive(Debug, Clone)]
pub struct DynamicModel {
    name: String,
    schema: String,
    table: String,
    primary_key: String,
    fields: Vec<FieldInfo>,
}

impl DynamicModel {
    pub fn new(
        name: &str,
        primary_key: impl Into<String>,
        fields: Vec<FieldInfo>,
    ) -> Result<Self, ModelError> {
        let (schema, table) = split_model_name(name)?;
        Ok(Self {
            name: name.to_string(),
            schema,
            table,
            primary_key: primary_key.into(),
            fields,
        })
    }

    pub async fn introspect(pool: &PgPool, name: &str) -> Result<Self, ModelError> {
        let (schema, table) = split_model_name(name)?;

        let columns = sqlx::query(
            "SELECT column_name::text AS column_name, udt_name::text AS udt_name
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
        )
        .bind(&schema)
        .bind(&table)
        .fetch_all(pool)
        .await?;
        if columns.is_empty() {
            return Err(ModelError::UnknownModel(name.to_string()));
        }

        let geometry_rows = sqlx::query(
            "SELECT f_geometry_column::text AS column_name, type::text AS geometry_type, srid
             FROM geometry_columns
             WHERE f_table_schema = $1 AND f_table_name = $2",
        )
        .bind(&schema)
        .bind(&table)
        .fetch_all(pool)
        .await?;
        let mut geometries: HashMap<String, (String, i32)> = HashMap::new();
        for r in geometry_rows {
            geometries.insert(
                r.try_get("column_name")?,
                (r.try_get("geometry_type")?, r.try_get("srid")?),
            );
        }

        let pk: Option<String> = sqlx::query_scalar(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
             AND tc.table_name = kcu.table_name
            WHERE tc.table_schema = $1
              AND tc.table_name = $2
              AND tc.constraint_type = 'PRIMARY KEY'
            ORDER BY kcu.ordinal_position
            LIMIT 1
            "#,
        )
        .bind(&schema)
        .bind(&table)
        .fetch_optional(pool)
        .await?;
        let primary_key = pk.unwrap_or_else(|| "id".to_string());

        let outgoing = sqlx::query(
            r#"
            SELECT kcu.column_name::text AS column_name,
                   ccu.table_schema::text AS ref_schema,
                   ccu.table_name::text AS ref_table
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON tc.constraint_name = ccu.constraint_name
             AND tc.table_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
              AND tc.table_name = $2
            "#,
        )
        .bind(&schema)
        .bind(&table)
        .fetch_all(pool)
        .await?;
        let mut references: HashMap<String, String> = HashMap::new();
        for r in outgoing {
            let ref_schema: String = r.try_get("ref_schema")?;
            let ref_table: String = r.try_get("ref_table")?;
            references.insert(r.try_get("column_name")?, model_name(&ref_schema, &ref_table));
        }

        let mut fields = Vec::with_capacity(columns.len());
        for c in columns {
            let column: String = c.try_get("column_name")?;
            let udt: String = c.try_get("udt_name")?;
            let kind = if let Some((geometry_type, srid)) = geometries.remove(&column) {
                FieldKind::Geometry { geometry_type, srid }
            } else if udt == "geometry" {
                FieldKind::Geometry {
                    geometry_type: "GEOMETRY".to_string(),
                    srid: 0,
                }
            } else if let Some(model) = references.remove(&column) {
                FieldKind::ForeignKey { sql_type: udt, model }
            } else {
                FieldKind::Scalar { sql_type: udt }
            };
            fields.push(FieldInfo { name: column, kind });
        }

        let incoming = sqlx::query(
            r#"
            SELECT kcu.table_schema::text AS src_schema,
                   kcu.table_name::text AS src_table,
                   kcu.column_name::text AS column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON tc.constraint_name = ccu.constraint_name
             AND tc.table_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND ccu.table_schema = $1
              AND ccu.table_name = $2
            ORDER BY kcu.table_schema, kcu.table_name, kcu.column_name
            "#,
        )
        .bind(&schema)
        .bind(&table)
        .fetch_all(pool)
        .await?;
        for r in incoming {
            let src_schema: String = r.try_get("src_schema")?;
            let src_table: String = r.try_get("src_table")?;
            let column: String = r.try_get("column_name")?;
            let mut field_name = src_table.clone();
            if fields.iter().any(|f| f.name == field_name) {
                field_name = format!("{}_{}", src_table, column);
            }
            fields.push(FieldInfo {
                name: field_name,
                kind: FieldKind::OneToMany {
                    model: model_name(&src_schema, &src_table),
                    column,
                },
            });
        }

        tracing::debug!(model = %name, fields = fields.len(), "introspected model");
        Ok(Self {
            name: name.to_string(),
            schema,
            table,
            primary_key,
            fields,
        })
    }

    fn from_clause(&self) -> String {
        format!(
            " FROM {}.{} AS {}",
            quote_ident(&self.schema),
            quote_ident(&self.table),
            ALIAS
        )
    }

    fn column(name: &str) -> String {
        format!("{}.{}", ALIAS, quote_ident(name))
    }

    fn require(&self, name: &str) -> Result<&FieldInfo, ModelError> {
        self.field(name).ok_or_else(|| ModelError::UnknownField {
            model: self.name.clone(),
            field: name.to_string(),
        })
    }

    fn pk_type(&self) -> &str {
        self.field(&self.primary_key)
            .and_then(FieldInfo::sql_type)
            .unwrap_or("int8")
    }

    /// Stored geometry column and its SRID.
    fn geometry_of(&self, query: &ModelQuery) -> Result<(String, i32), ModelError> {
        let field = self.require(&query.geometry_field)?;
        match field.kind {
            FieldKind::Geometry { srid, .. } => Ok((Self::column(&field.name), srid)),
            _ => Err(ModelError::NotAGeometry(field.name.clone())),
        }
    }

    fn output_geometry(
        &self,
        query: &ModelQuery,
        handle: &mut QueryHandle,
        simplify: bool,
    ) -> Result<String, ModelError> {
        let (mut expr, srid) = self.geometry_of(query)?;
        if let Some(target) = query.target_srid.filter(|t| *t != srid) {
            let p = handle.placeholder(SqlParam::Int(target), None);
            expr = format!("ST_Transform({}, {})", expr, p);
        }
        if let Some(tolerance) = query.simplify.filter(|_| simplify) {
            let p = handle.placeholder(SqlParam::Float(tolerance), None);
            expr = format!("ST_Simplify({}, {})", expr, p);
        }
        Ok(expr)
    }

    fn where_clause(&self, query: &ModelQuery, handle: &mut QueryHandle) -> Result<(), ModelError> {
        let mut conditions = Vec::new();
        for doc in &query.filters {
            conditions.extend(filter::compile(doc, self, ALIAS, handle)?);
        }
        if let Some(bbox) = &query.bbox {
            let (column, srid) = self.geometry_of(query)?;
            let p = handle.placeholder(SqlParam::Bytes(bbox.to_ewkb()?), None);
            let target = if bbox.srid() == srid || srid == 0 {
                format!("ST_GeomFromEWKB({})", p)
            } else {
                let s = handle.placeholder(SqlParam::Int(srid), None);
                format!("ST_Transform(ST_GeomFromEWKB({}), {})", p, s)
            };
            conditions.push(format!("{} && {}", column, target));
        }
        if let Some(id) = query.id {
            let p = handle.placeholder(SqlParam::BigInt(id), Some(self.pk_type()));
            conditions.push(format!("{} = {}", Self::column(&self.primary_key), p));
        }
        if !conditions.is_empty() {
            handle.push(" WHERE ");
            handle.push(&conditions.join(" AND "));
        }
        Ok(())
    }
}

impl ModelDescriptor for DynamicModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn build_query(&self, query: &ModelQuery) -> Result<QueryHandle, ModelError> {
        let mut handle = QueryHandle::default();
        let mut select = vec![format!(
            "{} AS {}",
            Self::column(&self.primary_key),
            quote_ident(PK_COLUMN)
        )];

        let selected: Vec<&FieldInfo> = if query.fields.is_empty() {
            self.fields.iter().collect()
        } else {
            query
                .fields
                .iter()
                .map(|name| self.require(name))
                .collect::<Result<_, _>>()?
        };
        for field in selected {
            if field.is_concrete() && !field.is_geometry() {
                select.push(Self::column(&field.name));
            }
        }

        let geometry = self.output_geometry(query, &mut handle, true)?;
        select.push(match query.annotation {
            Some(GeometryAnnotation::Gml(version)) => {
                format!("ST_AsGML({}, {}) AS {}", version, geometry, quote_ident(GML_COLUMN))
            }
            Some(GeometryAnnotation::GeoJson) => {
                format!("ST_AsGeoJSON({})::json AS {}", geometry, quote_ident(GEOJSON_COLUMN))
            }
            None => format!("ST_AsEWKB({}) AS {}", geometry, quote_ident(GEOMETRY_COLUMN)),
        });

        handle.push("SELECT ").push(&select.join(", ")).push(&self.from_clause());
        self.where_clause(query, &mut handle)?;
        handle.push(" ORDER BY ").push(&Self::column(&self.primary_key));
        Ok(handle)
    }

    fn extent_query(&self, query: &ModelQuery) -> Result<QueryHandle, ModelError> {
        let mut handle = QueryHandle::default();
        let geometry = self.output_geometry(query, &mut handle, false)?;
        handle
            .push("SELECT ")
            .push(&geometry)
            .push(" AS ")
            .push(&quote_ident(GEOMETRY_COLUMN))
            .push(&self.from_clause());
        self.where_clause(query, &mut handle)?;
        Ok(handle)
    }

    fn related_query(&self, column: &str, id: i64) -> Result<QueryHandle, ModelError> {
        let fk = self.require(column)?;
        let cast = fk.sql_type().unwrap_or("int8").to_string();
        let columns: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.is_concrete() && !f.is_relation() && !f.is_geometry())
            .map(|f| Self::column(&f.name))
            .collect();

        let mut handle = QueryHandle::default();
        handle
            .push("SELECT ")
            .push(&columns.join(", "))
            .push(&self.from_clause())
            .push(" WHERE ")
            .push(&Self::column(column))
            .push(" = ")
            .bind(SqlParam::BigInt(id), Some(cast.as_str()))
            .push(" ORDER BY ")
            .push(&Self::column(&self.primary_key));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::crs::Crs;
    use crate::geo::BBox;
    use serde_json::json;

    fn parcel() -> DynamicModel {
        DynamicModel::new(
            "cadastre.parcel",
            "id",
            vec![
                FieldInfo::scalar("id", "int4"),
                FieldInfo::scalar("name", "text"),
                FieldInfo::scalar("area", "float8"),
                FieldInfo::geometry("geom", "MULTIPOLYGON", 28992),
                FieldInfo {
                    name: "building".into(),
                    kind: FieldKind::OneToMany {
                        model: "cadastre.building".into(),
                        column: "parcel_id".into(),
                    },
                },
            ],
        )
        .unwrap()
    }

    fn query() -> ModelQuery {
        ModelQuery {
            geometry_field: "geom".into(),
            ..ModelQuery::default()
        }
    }

    #[test]
    fn model_names_are_validated() {
        assert!(DynamicModel::new("public.roads", "id", vec![]).is_ok());
        assert!(DynamicModel::new("roads", "id", vec![]).is_ok());
        assert!(matches!(
            DynamicModel::new("roads; drop", "id", vec![]),
            Err(ModelError::InvalidName(_))
        ));
    }

    #[test]
    fn plain_query_selects_concrete_fields_and_ewkb() {
        let handle = parcel().build_query(&query()).unwrap();
        assert_eq!(
            handle.sql,
            "SELECT t.\"id\" AS \"__pk\", t.\"id\", t.\"name\", t.\"area\", \
             ST_AsEWKB(t.\"geom\") AS \"__geom\" FROM \"cadastre\".\"parcel\" AS t ORDER BY t.\"id\""
        );
        assert!(handle.params.is_empty());
    }

    #[test]
    fn transform_simplify_bbox_and_id() {
        let mut q = query();
        q.fields = vec!["name".into(), "geom".into()];
        q.target_srid = Some(4326);
        q.simplify = Some(0.5);
        q.annotation = Some(GeometryAnnotation::Gml(3));
        q.bbox = Some(BBox::new([0.0, 0.0, 1.0, 1.0], Crs::from_srid(4326)));
        q.id = Some(42);

        let handle = parcel().build_query(&q).unwrap();
        assert_eq!(
            handle.sql,
            "SELECT t.\"id\" AS \"__pk\", t.\"name\", \
             ST_AsGML(3, ST_Simplify(ST_Transform(t.\"geom\", $1), $2)) AS \"__gml\" \
             FROM \"cadastre\".\"parcel\" AS t \
             WHERE t.\"geom\" && ST_Transform(ST_GeomFromEWKB($3), $4) AND t.\"id\" = $5::int4 \
             ORDER BY t.\"id\""
        );
        assert_eq!(handle.params[0], SqlParam::Int(4326));
        assert_eq!(handle.params[1], SqlParam::Float(0.5));
        assert_eq!(handle.params[3], SqlParam::Int(28992));
        assert_eq!(handle.params[4], SqlParam::BigInt(42));
    }

    #[test]
    fn filters_are_anded_into_the_where_clause() {
        let mut q = query();
        q.filters = vec![
            json!({"area__gt": 10}).as_object().unwrap().clone(),
            json!({"name__icontains": "farm"}).as_object().unwrap().clone(),
        ];
        let handle = parcel().extent_query(&q).unwrap();
        assert_eq!(
            handle.sql,
            "SELECT t.\"geom\" AS \"__geom\" FROM \"cadastre\".\"parcel\" AS t \
             WHERE t.\"area\" > $1::float8 AND t.\"name\"::text ILIKE $2"
        );
        assert_eq!(handle.params[1], SqlParam::Text("%farm%".into()));
    }

    #[test]
    fn unknown_or_non_geometry_fields_fail() {
        let mut q = query();
        q.fields = vec!["nope".into()];
        assert!(matches!(
            parcel().build_query(&q),
            Err(ModelError::UnknownField { .. })
        ));
        let mut q = query();
        q.geometry_field = "name".into();
        assert!(matches!(
            parcel().build_query(&q),
            Err(ModelError::NotAGeometry(_))
        ));
    }

    #[test]
    fn related_query_filters_by_foreign_key() {
        let building = DynamicModel::new(
            "cadastre.building",
            "id",
            vec![
                FieldInfo::scalar("id", "int4"),
                FieldInfo::scalar("height", "numeric"),
                FieldInfo {
                    name: "parcel_id".into(),
                    kind: FieldKind::ForeignKey {
                        sql_type: "int4".into(),
                        model: "cadastre.parcel".into(),
                    },
                },
            ],
        )
        .unwrap();
        let handle = building.related_query("parcel_id", 7).unwrap();
        assert_eq!(
            handle.sql,
            "SELECT t.\"id\", t.\"height\" FROM \"cadastre\".\"building\" AS t \
             WHERE t.\"parcel_id\" = $1::int4 ORDER BY t.\"id\""
        );
    }
}
