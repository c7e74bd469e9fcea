//! Coordinate reference system identifiers.
//!
//! Accepts the OGC URN form `urn:{ogc|opengis}:def:crs:{OGC|EPSG}:{version}:{id}`
//! as well as the legacy `EPSG:{id}` and opengis.net URL spellings, and
//! normalises them into one value.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Registry version used for identifiers that do not carry one.
pub const DEFAULT_EPSG_VERSION: &str = "6.9";

pub const CRS84: &str = "CRS84";

static CRS_URN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^urn:([a-z]+):def:crs:([a-z]+):([0-9]+\.[0-9]+(\.[0-9]+)?)?:([0-9]+|crs84)$")
        .expect("static CRS URN regex")
});

const LEGACY_PREFIXES: &[&str] = &[
    "epsg:",
    "http://www.opengis.net/def/crs/epsg/0/",
    "http://www.opengis.net/gml/srs/epsg.xml#",
];

/// WGS84 in longitude/latitude order; the fallback CRS and the substitute for CRS84.
pub static WGS84: LazyLock<Crs> = LazyLock::new(|| Crs::from_srid(4326));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrsError {
    #[error("Unknown CRS URI [{0}] specified")]
    Unknown(String),
    #[error("CRS URI [{uri}] contains unknown domain [{domain}]")]
    UnknownDomain { uri: String, domain: String },
    #[error("CRS URI [{uri}] contains unknown authority [{authority}]")]
    UnknownAuthority { uri: String, authority: String },
    #[error("OGC CRS URI [{uri}] contains unknown id [{id}]")]
    UnknownOgcId { uri: String, id: String },
    #[error("CRS URI [{0}] contains an alphanumeric string where an SRID number is expected.")]
    AlphanumericSrid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Ogc,
    Epsg,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Ogc => "OGC",
            Authority::Epsg => "EPSG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crs {
    domain: String,
    authority: Authority,
    version: String,
    crsid: String,
    srid: i32,
}

impl Crs {
    /// `urn:ogc:def:crs:EPSG:6.9:{srid}`.
    pub fn from_srid(srid: i32) -> Self {
        Self {
            domain: "ogc".to_string(),
            authority: Authority::Epsg,
            version: DEFAULT_EPSG_VERSION.to_string(),
            crsid: srid.to_string(),
            srid,
        }
    }

    pub fn parse(uri: &str) -> Result<Self, CrsError> {
        let luri = uri.trim().to_lowercase();

        if let Some(caps) = CRS_URN_REGEX.captures(&luri) {
            let domain = caps[1].to_string();
            if domain != "ogc" && domain != "opengis" {
                return Err(CrsError::UnknownDomain {
                    uri: uri.to_string(),
                    domain,
                });
            }

            let version = caps
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let id = &caps[5];

            return match caps[2].to_uppercase().as_str() {
                "EPSG" => {
                    let srid = parse_srid(uri, id)?;
                    Ok(Self {
                        domain,
                        authority: Authority::Epsg,
                        version,
                        crsid: srid.to_string(),
                        srid,
                    })
                }
                "OGC" => {
                    let crsid = id.to_uppercase();
                    if crsid != CRS84 {
                        return Err(CrsError::UnknownOgcId {
                            uri: uri.to_string(),
                            id: crsid,
                        });
                    }
                    Ok(Self {
                        domain,
                        authority: Authority::Ogc,
                        version,
                        crsid,
                        srid: 4326,
                    })
                }
                other => Err(CrsError::UnknownAuthority {
                    uri: uri.to_string(),
                    authority: other.to_string(),
                }),
            };
        }

        for head in LEGACY_PREFIXES {
            if let Some(id) = luri.strip_prefix(head) {
                return Ok(Self::from_srid(parse_srid(uri, id)?));
            }
        }

        Err(CrsError::Unknown(uri.to_string()))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn crsid(&self) -> &str {
        &self.crsid
    }

    pub fn srid(&self) -> i32 {
        self.srid
    }

    pub fn is_crs84(&self) -> bool {
        self.authority == Authority::Ogc && self.crsid == CRS84
    }

    pub fn to_urn(&self) -> String {
        format!(
            "urn:{}:def:crs:{}:{}:{}",
            self.domain,
            self.authority.as_str(),
            self.version,
            self.crsid
        )
    }

    /// `EPSG:{srid}`.
    pub fn to_legacy(&self) -> String {
        format!("EPSG:{}", self.srid)
    }
}

fn parse_srid(uri: &str, id: &str) -> Result<i32, CrsError> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CrsError::AlphanumericSrid(uri.to_string()));
    }
    id.parse::<i32>()
        .map_err(|_| CrsError::AlphanumericSrid(uri.to_string()))
}

impl From<i32> for Crs {
    fn from(srid: i32) -> Self {
        Self::from_srid(srid)
    }
}

impl FromStr for Crs {
    type Err = CrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_urn())
    }
}
