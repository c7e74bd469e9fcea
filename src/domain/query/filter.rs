//! Compiles `field__lookup` filter documents into parameterised predicates.

use crate::domain::model::{quote_ident, FieldKind, ModelDescriptor, QueryHandle};
use crate::storage::cursor::SqlParam;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("unsupported lookup '{lookup}' on field '{field}'")]
    UnsupportedLookup { field: String, lookup: String },
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

const LOOKUPS: &[&str] = &[
    "exact",
    "iexact",
    "contains",
    "icontains",
    "startswith",
    "istartswith",
    "endswith",
    "iendswith",
    "gt",
    "gte",
    "lt",
    "lte",
    "in",
    "range",
    "isnull",
];

/// `name__lookup` → (`name`, `lookup`); a key without a known suffix is an `exact` match.
fn split_key(key: &str) -> (&str, &str) {
    if let Some((field, lookup)) = key.rsplit_once("__") {
        if LOOKUPS.contains(&lookup) && !field.is_empty() {
            return (field, lookup);
        }
    }
    (key, "exact")
}

fn to_param(value: &JsonValue) -> SqlParam {
    match value {
        JsonValue::Null => SqlParam::Null,
        JsonValue::Bool(b) => SqlParam::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlParam::BigInt(i),
            None => SqlParam::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => SqlParam::Text(s.clone()),
        other => SqlParam::Json(other.clone()),
    }
}

fn text_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Appends no SQL; returns one predicate per key with its values bound in `handle`.
pub fn compile<M: ModelDescriptor + ?Sized>(
    doc: &Map<String, JsonValue>,
    model: &M,
    alias: &str,
    handle: &mut QueryHandle,
) -> Result<Vec<String>, FilterError> {
    let mut predicates = Vec::with_capacity(doc.len());
    for (key, value) in doc {
        let (name, lookup) = split_key(key);
        let field = model
            .field(name)
            .ok_or_else(|| FilterError::UnknownField(name.to_string()))?;
        let column = format!("{}.{}", alias, quote_ident(&field.name));
        let invalid = |reason: &str| FilterError::InvalidValue {
            key: key.clone(),
            reason: reason.to_string(),
        };

        let sql_type = match &field.kind {
            FieldKind::Scalar { sql_type } | FieldKind::ForeignKey { sql_type, .. } => sql_type.as_str(),
            FieldKind::Geometry { .. } if lookup == "isnull" => "geometry",
            _ => {
                return Err(FilterError::UnsupportedLookup {
                    field: name.to_string(),
                    lookup: lookup.to_string(),
                })
            }
        };

        let predicate = match lookup {
            "exact" if value.is_null() => format!("{} IS NULL", column),
            "exact" => {
                let p = handle.placeholder(to_param(value), Some(sql_type));
                format!("{} = {}", column, p)
            }
            "iexact" => {
                let p = handle.placeholder(SqlParam::Text(text_of(value)), None);
                format!("UPPER({}::text) = UPPER({})", column, p)
            }
            "gt" | "gte" | "lt" | "lte" => {
                if value.is_null() {
                    return Err(invalid("comparison with null"));
                }
                let op = match lookup {
                    "gt" => ">",
                    "gte" => ">=",
                    "lt" => "<",
                    _ => "<=",
                };
                let p = handle.placeholder(to_param(value), Some(sql_type));
                format!("{} {} {}", column, op, p)
            }
            "contains" | "icontains" | "startswith" | "istartswith" | "endswith" | "iendswith" => {
                let escaped = escape_like(&text_of(value));
                let pattern = match lookup.trim_start_matches('i') {
                    "contains" => format!("%{}%", escaped),
                    "startswith" => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                let op = if lookup.starts_with('i') { "ILIKE" } else { "LIKE" };
                let p = handle.placeholder(SqlParam::Text(pattern), None);
                format!("{}::text {} {}", column, op, p)
            }
            "in" => {
                let items = value.as_array().ok_or_else(|| invalid("expected an array"))?;
                if items.is_empty() {
                    "FALSE".to_string()
                } else {
                    let ps: Vec<String> = items
                        .iter()
                        .map(|v| handle.placeholder(to_param(v), Some(sql_type)))
                        .collect();
                    format!("{} IN ({})", column, ps.join(", "))
                }
            }
            "range" => match value.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => {
                    let lo = handle.placeholder(to_param(lo), Some(sql_type));
                    let hi = handle.placeholder(to_param(hi), Some(sql_type));
                    format!("{} BETWEEN {} AND {}", column, lo, hi)
                }
                _ => return Err(invalid("expected a two element array")),
            },
            "isnull" => match value.as_bool() {
                Some(true) => format!("{} IS NULL", column),
                Some(false) => format!("{} IS NOT NULL", column),
                None => return Err(invalid("expected a boolean")),
            },
            other => {
                return Err(FilterError::UnsupportedLookup {
                    field: name.to_string(),
                    lookup: other.to_string(),
                })
            }
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{DynamicModel, FieldInfo};
    use serde_json::json;

    fn model() -> DynamicModel {
        DynamicModel::new(
            "roads",
            "id",
            vec![
                FieldInfo::scalar("id", "int4"),
                FieldInfo::scalar("kind", "varchar"),
                FieldInfo::scalar("opened", "timestamptz"),
                FieldInfo::geometry("geom", "LINESTRING", 4326),
            ],
        )
        .unwrap()
    }

    fn compile_doc(doc: JsonValue) -> Result<(Vec<String>, QueryHandle), FilterError> {
        let mut handle = QueryHandle::default();
        let preds = compile(doc.as_object().unwrap(), &model(), "t", &mut handle)?;
        Ok((preds, handle))
    }

    #[test]
    fn lookups_render_casted_placeholders() {
        let (preds, handle) = compile_doc(json!({
            "kind": "primary",
            "id__in": [1, 2],
            "opened__gte": "2020-01-01T00:00:00Z",
            "kind__istartswith": "pri_",
            "geom__isnull": false,
        }))
        .unwrap();
        assert_eq!(
            preds,
            vec![
                "t.\"kind\" = $1::varchar",
                "t.\"id\" IN ($2::int4, $3::int4)",
                "t.\"opened\" >= $4::timestamptz",
                "t.\"kind\"::text ILIKE $5",
                "t.\"geom\" IS NOT NULL",
            ]
        );
        assert_eq!(handle.params[4], SqlParam::Text("pri\\_%".into()));
    }

    #[test]
    fn nulls_empty_lists_and_ranges() {
        let (preds, handle) = compile_doc(json!({
            "kind": null,
            "id__in": [],
            "id__range": [1, 9],
        }))
        .unwrap();
        assert_eq!(
            preds,
            vec![
                "t.\"kind\" IS NULL",
                "FALSE",
                "t.\"id\" BETWEEN $1::int4 AND $2::int4",
            ]
        );
        assert_eq!(handle.params, vec![SqlParam::BigInt(1), SqlParam::BigInt(9)]);
    }

    #[test]
    fn unknown_fields_and_bad_values_are_rejected() {
        assert!(matches!(
            compile_doc(json!({"owner__name": "x"})),
            Err(FilterError::UnknownField(f)) if f == "owner__name"
        ));
        assert!(matches!(
            compile_doc(json!({"id__range": [1]})),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(matches!(
            compile_doc(json!({"geom__gt": 1})),
            Err(FilterError::UnsupportedLookup { .. })
        ));
    }
}
