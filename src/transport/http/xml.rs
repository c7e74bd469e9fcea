//! XML documents rendered through askama templates (`templates/`).

use crate::app::features::{FeatureGeometry, FeatureRecord};
use crate::app::wfs_service::{Capabilities, FeatureSchemas, FeatureTypeSchema, WfsVersion};
use crate::domain::catalog::{FeatureType, Service};
use crate::error::WfsException;
use crate::geo::Extent;
use askama::Template;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

pub fn xml_response(body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

/// Renders a document; a failing template is logged and answered with `UnknownError`.
pub fn render_template<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(body) => xml_response(body),
        Err(e) => {
            tracing::error!("Template rendering failed: {}", e);
            exception_response(&WfsException::unknown_error())
        }
    }
}

#[derive(Template)]
#[template(path = "exception.xml")]
pub struct ExceptionView<'a> {
    pub code: &'a str,
    pub locator: &'a str,
    pub text: &'a str,
}

/// Exception reports are protocol documents and always use HTTP 200.
pub fn exception_response(exception: &WfsException) -> Response {
    let view = ExceptionView {
        code: exception.code.as_str(),
        locator: &exception.locator,
        text: &exception.text,
    };
    match view.render() {
        Ok(body) => xml_response(body),
        Err(e) => {
            tracing::error!("Failed to render exception report: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, exception.to_string()).into_response()
        }
    }
}

#[derive(Template)]
#[template(path = "getCapabilities-1.0.0.xml")]
pub struct CapabilitiesV100View<'a> {
    pub service: &'a Service,
    pub keywords: String,
    pub feature_types: &'a [FeatureType],
    pub online_resource: &'a str,
    pub wfs_path: &'static str,
}

#[derive(Template)]
#[template(path = "getCapabilities-1.1.0.xml")]
pub struct CapabilitiesV110View<'a> {
    pub service: &'a Service,
    pub feature_types: &'a [FeatureType],
    pub srs_names: &'a [String],
    pub online_resource: &'a str,
    pub wfs_path: &'static str,
    pub version: &'a str,
}

pub fn capabilities(caps: &Capabilities) -> Response {
    if caps.version.is_v1_0_0() {
        render_template(CapabilitiesV100View {
            service: &caps.service,
            keywords: caps.service.keywords.join(", "),
            feature_types: &caps.feature_types,
            online_resource: &caps.online_resource,
            wfs_path: caps.version.capabilities_schema(),
        })
    } else {
        render_template(CapabilitiesV110View {
            service: &caps.service,
            feature_types: &caps.feature_types,
            srs_names: &caps.srs_names,
            online_resource: &caps.online_resource,
            wfs_path: caps.version.capabilities_schema(),
            version: caps.version.as_str(),
        })
    }
}

#[derive(Template)]
#[template(path = "describeFeatureType.xml")]
pub struct DescribeFeatureTypeView<'a> {
    pub types: &'a [FeatureTypeSchema],
    pub gml_path: &'static str,
}

pub fn describe_feature_type(schemas: &FeatureSchemas) -> Response {
    render_template(DescribeFeatureTypeView {
        types: &schemas.types,
        gml_path: schemas.version.gml_path(),
    })
}

pub struct GmlProperty {
    pub name: String,
    pub value: String,
}

pub struct GmlFeature {
    pub type_name: String,
    pub id: String,
    /// Pre-rendered GML geometry, inserted unescaped.
    pub geometry: String,
    pub properties: Vec<GmlProperty>,
}

impl GmlFeature {
    pub fn new(type_name: &str, record: FeatureRecord) -> Self {
        let geometry = match record.geometry {
            Some(FeatureGeometry::Gml(gml)) => gml,
            _ => String::new(),
        };
        let properties = record
            .properties
            .into_iter()
            .map(|(name, value)| GmlProperty {
                name,
                value: match value {
                    serde_json::Value::Null => String::new(),
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
            })
            .collect();
        Self {
            type_name: type_name.to_string(),
            id: record.id.unwrap_or_default(),
            geometry,
            properties,
        }
    }
}

#[derive(Template)]
#[template(path = "getFeature.xml")]
pub struct FeatureCollectionView {
    pub features: Vec<GmlFeature>,
    pub bbox: Option<Extent>,
    pub crs: String,
    pub gml2: bool,
    pub wfs_path: &'static str,
}

impl FeatureCollectionView {
    pub fn new(
        features: Vec<(Arc<str>, FeatureRecord)>,
        bbox: Option<Extent>,
        crs: String,
        version: &WfsVersion,
    ) -> Self {
        Self {
            features: features
                .into_iter()
                .map(|(type_name, record)| GmlFeature::new(&type_name, record))
                .collect(),
            bbox,
            crs,
            gml2: version.is_v1_0_0(),
            wfs_path: version.feature_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wfs_service::SchemaElement;
    use crate::domain::catalog::BoundingBox;
    use serde_json::json;

    #[test]
    fn exception_report_escapes_text() {
        let e = WfsException::invalid_parameter_value("bbox", "<1>");
        let body = ExceptionView {
            code: e.code.as_str(),
            locator: &e.locator,
            text: &e.text,
        }
        .render()
        .unwrap();
        assert!(body.contains(r#"<ServiceException code="InvalidParameterValue" locator="bbox">"#));
        assert!(body.contains("&lt;1&gt;"));
    }

    #[test]
    fn capabilities_list_every_feature_type() {
        let mut service = Service::new(3, "demo", "Demo service");
        service.keywords = vec!["roads".into(), "water".into()];
        let mut ft = FeatureType::raw_sql(3, "roads", "select 1");
        ft.title = "Roads".into();
        ft.bounding_boxes.push(BoundingBox {
            minx: "1".into(),
            miny: "2".into(),
            maxx: "3".into(),
            maxy: "4".into(),
        });
        let caps = Capabilities {
            online_resource: service.online_resource("http://localhost:3000"),
            service,
            feature_types: vec![ft],
            srs_names: vec!["EPSG:3857".into(), "EPSG:4326".into()],
            version: WfsVersion::V1_1_0,
        };

        let v110 = CapabilitiesV110View {
            service: &caps.service,
            feature_types: &caps.feature_types,
            srs_names: &caps.srs_names,
            online_resource: &caps.online_resource,
            wfs_path: caps.version.capabilities_schema(),
            version: caps.version.as_str(),
        }
        .render()
        .unwrap();
        assert!(v110.contains("<Name>roads</Name>"));
        assert!(v110.contains("<DefaultSRS>EPSG:4326</DefaultSRS>"));
        assert!(v110.contains("<ows:Value>EPSG:3857</ows:Value>"));
        assert!(v110.contains("http://schemas.opengis.net/wfs/1.1.0/wfs.xsd"));

        let v100 = CapabilitiesV100View {
            service: &caps.service,
            keywords: caps.service.keywords.join(", "),
            feature_types: &caps.feature_types,
            online_resource: &caps.online_resource,
            wfs_path: WfsVersion::V1_0_0.capabilities_schema(),
        }
        .render()
        .unwrap();
        assert!(v100.contains("<Keywords>roads, water</Keywords>"));
        assert!(v100.contains(r#"<LatLongBoundingBox minx="1" miny="2" maxx="3" maxy="4"/>"#));
        assert!(v100.contains("1.0.0/WFS-capabilities.xsd"));
    }

    #[test]
    fn schema_elements_are_typed() {
        let types = vec![FeatureTypeSchema {
            name: "parcels".into(),
            elements: vec![SchemaElement {
                name: "geometry".into(),
                type_name: "gml:MultiPolygonPropertyType".into(),
            }],
        }];
        let body = DescribeFeatureTypeView {
            types: &types,
            gml_path: WfsVersion::V1_0_0.gml_path(),
        }
        .render()
        .unwrap();
        assert!(body.contains(r#"<element name="parcels" type="wfs:parcels_Type" substitutionGroup="gml:_Feature"/>"#));
        assert!(body.contains(r#"<element name="geometry" type="gml:MultiPolygonPropertyType" minOccurs="0" nillable="true"/>"#));
        assert!(body.contains("2.1.2/feature.xsd"));
    }

    #[test]
    fn gml_geometry_is_not_escaped() {
        let record = FeatureRecord {
            id: Some("9".into()),
            geometry: Some(FeatureGeometry::Gml("<gml:Point><gml:pos>1 2</gml:pos></gml:Point>".into())),
            properties: json!({"name": "a & b"}).as_object().unwrap().clone(),
        };
        let body = FeatureCollectionView::new(
            vec![(Arc::from("roads"), record)],
            Some(Extent::new(1.0, 2.0, 1.0, 2.0)),
            "EPSG:4326".into(),
            &WfsVersion::V1_1_0,
        )
        .render()
        .unwrap();
        assert!(body.contains("<gml:Point><gml:pos>1 2</gml:pos></gml:Point>"));
        assert!(body.contains(r#"<roads gml:id="roads.9">"#));
        assert!(body.contains("<name>a &amp; b</name>"));
        assert!(body.contains("<gml:lowerCorner>1 2</gml:lowerCorner>"));
    }
}
