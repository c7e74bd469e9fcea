//! Case-insensitive KVP parameter scanning.
//!
//! `scan_request` is the global dispatcher pass; each operation then re-scans
//! only the parameters it understands.

use crate::app::wfs_service::{
    FeatureSelection, GetFeatureRequest, OutputFormat, WfsVersion,
};
use crate::domain::catalog::split_comma_separated;
use crate::domain::crs::{Crs, WGS84};
use crate::error::WfsException;
use crate::geo::BBox;

const UNSUPPORTED: &[&str] = &["propertyname", "featureversion", "filter"];

/// Query string pairs with lower-cased keys; values are kept verbatim.
#[derive(Debug, Clone, Default)]
pub struct KvpParams {
    pairs: Vec<(String, String)>,
}

impl KvpParams {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value of `key` (already lower-case).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetCapabilities,
    DescribeFeatureType,
    GetFeature,
}

impl RequestKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "getcapabilities" => Some(RequestKind::GetCapabilities),
            "describefeaturetype" => Some(RequestKind::DescribeFeatureType),
            "getfeature" => Some(RequestKind::GetFeature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub request: RequestKind,
    pub version: WfsVersion,
}

/// Validates `request`, `version` and `service` in query order; the first bad value wins.
pub fn scan_request(params: &KvpParams, legacy_versions: bool) -> Result<Dispatch, WfsException> {
    let mut request = None;
    let mut version = WfsVersion::default();
    let mut has_service = false;

    for (key, value) in params.iter() {
        match key {
            "request" => {
                request = Some(RequestKind::parse(value).ok_or_else(|| WfsException::invalid_request(value))?)
            }
            "version" => {
                version = WfsVersion::parse(value, legacy_versions)
                    .ok_or_else(|| WfsException::version_negotiation_failed(value))?
            }
            "service" => {
                if !value.eq_ignore_ascii_case("wfs") {
                    return Err(WfsException::invalid_service(value));
                }
                has_service = true;
            }
            _ => {}
        }
    }

    let request = request.ok_or_else(|| WfsException::missing_parameter("request"))?;
    if !has_service {
        return Err(WfsException::missing_parameter("service"));
    }
    Ok(Dispatch { request, version })
}

/// DescribeFeatureType: the optional `typename` list.
pub fn scan_describe(params: &KvpParams) -> Result<Option<String>, WfsException> {
    let mut type_names = None;
    for (key, value) in params.iter() {
        match key {
            "outputformat" if !value.eq_ignore_ascii_case("xmlschema") => {
                return Err(WfsException::invalid_parameter_value("outputformat", value))
            }
            "typename" => type_names = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(type_names)
}

fn parse_float(key: &str, value: &str) -> Result<f64, WfsException> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| WfsException::invalid_parameter_value(key, value))
}

/// `minx,miny,maxx,maxy[,crs]`; the CRS is only allowed after 1.0.0.
fn parse_bbox(value: &str, version: &WfsVersion) -> Result<([f64; 4], Option<Crs>), WfsException> {
    let invalid = || WfsException::invalid_parameter_value("bbox", value);
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let crs = match parts.len() {
        4 => None,
        5 if !version.is_v1_0_0() => Some(Crs::parse(parts[4]).map_err(|_| invalid())?),
        _ => return Err(invalid()),
    };
    let mut values = [0f64; 4];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(invalid)?;
    }
    Ok((values, crs))
}

pub fn scan_get_feature(params: &KvpParams, version: WfsVersion) -> Result<GetFeatureRequest, WfsException> {
    if let Some((key, _)) = params.iter().find(|(k, _)| UNSUPPORTED.contains(k)) {
        return Err(WfsException::not_implemented_parameter(key));
    }

    let mut type_names = Vec::new();
    let mut feature_ids = Vec::new();
    let mut bbox = None;
    let mut crs: Option<Crs> = None;
    let mut precision = None;
    let mut resolution = None;
    let mut max_features = None;
    let mut output = OutputFormat::Gml;

    for (key, value) in params.iter() {
        match key {
            "maxfeatures" => {
                let n = value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| WfsException::invalid_parameter_value(key, value))?;
                max_features = Some(n);
            }
            "typename" => type_names = split_comma_separated(value),
            "featureid" => feature_ids = split_comma_separated(value),
            "resolution" => resolution = Some(parse_float(key, value)?),
            "precision" => precision = Some(parse_float(key, value)?),
            "bbox" => bbox = Some(parse_bbox(value, &version)?),
            "srsname" => {
                let parsed =
                    Crs::parse(value).map_err(|_| WfsException::invalid_parameter_value(key, value))?;
                crs = Some(if parsed.is_crs84() { WGS84.clone() } else { parsed });
            }
            "outputformat" => {
                output = OutputFormat::parse(value)
                    .ok_or_else(|| WfsException::invalid_parameter_value(key, value))?
            }
            _ => {}
        }
    }

    let selection = if !feature_ids.is_empty() {
        FeatureSelection::FeatureIds(feature_ids)
    } else if !type_names.is_empty() {
        FeatureSelection::TypeNames(type_names)
    } else {
        return Err(WfsException::missing_parameter("typename"));
    };

    let crs = crs.unwrap_or_else(|| WGS84.clone());
    let bbox = bbox.map(|(values, own)| BBox::new(values, own.unwrap_or_else(|| crs.clone())));

    Ok(GetFeatureRequest {
        selection,
        bbox,
        crs,
        precision,
        resolution,
        max_features,
        output,
        version,
    })
}
