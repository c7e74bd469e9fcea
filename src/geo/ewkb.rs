//! PostGIS Extended Well-Known Binary.
//!
//! Geometries leave the database as `ST_AsEWKB(...)` and bounding boxes are
//! bound as EWKB parameters, so this is the only geometry codec the service
//! needs.

use super::GeoError;
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn from_byte(byte: u8) -> Result<Self, GeoError> {
        match byte {
            0x00 => Ok(ByteOrder::Big),
            0x01 => Ok(ByteOrder::Little),
            other => Err(GeoError::Ewkb(format!("invalid byte order marker {}", other))),
        }
    }
}

mod type_codes {
    pub const POINT: u32 = 1;
    pub const LINESTRING: u32 = 2;
    pub const POLYGON: u32 = 3;
    pub const MULTIPOINT: u32 = 4;
    pub const MULTILINESTRING: u32 = 5;
    pub const MULTIPOLYGON: u32 = 6;
    pub const GEOMETRYCOLLECTION: u32 = 7;

    pub const Z_FLAG: u32 = 0x8000_0000;
    pub const M_FLAG: u32 = 0x4000_0000;
    pub const SRID_FLAG: u32 = 0x2000_0000;
}

/// A decoded geometry and the SRID embedded in it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Ewkb {
    pub srid: Option<i32>,
    pub geometry: Geometry<f64>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], GeoError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| GeoError::Ewkb(format!("unexpected end of data at byte {}", self.pos)))?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, GeoError> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self, order: ByteOrder) -> Result<u32, GeoError> {
        let buf = self.take::<4>()?;
        Ok(match order {
            ByteOrder::Little => u32::from_le_bytes(buf),
            ByteOrder::Big => u32::from_be_bytes(buf),
        })
    }

    fn f64(&mut self, order: ByteOrder) -> Result<f64, GeoError> {
        let buf = self.take::<8>()?;
        Ok(match order {
            ByteOrder::Little => f64::from_le_bytes(buf),
            ByteOrder::Big => f64::from_be_bytes(buf),
        })
    }
}

struct Header {
    order: ByteOrder,
    kind: u32,
    extra_dims: usize,
    srid: Option<i32>,
}

fn read_header(r: &mut Reader<'_>) -> Result<Header, GeoError> {
    let order = ByteOrder::from_byte(r.u8()?)?;
    let raw = r.u32(order)?;
    let srid = if raw & type_codes::SRID_FLAG != 0 {
        Some(r.u32(order)? as i32)
    } else {
        None
    };

    // ISO WKB encodes dimensions as 1000/2000/3000 offsets.
    let base = raw & 0x0000_FFFF;
    let (kind, iso_dims) = (base % 1000, base / 1000);
    let mut extra_dims = match iso_dims {
        0 => 0,
        1 | 2 => 1,
        3 => 2,
        _ => return Err(GeoError::Ewkb(format!("unsupported geometry type {}", base))),
    };
    if raw & type_codes::Z_FLAG != 0 {
        extra_dims += 1;
    }
    if raw & type_codes::M_FLAG != 0 {
        extra_dims += 1;
    }

    Ok(Header {
        order,
        kind,
        extra_dims,
        srid,
    })
}

fn read_coord(r: &mut Reader<'_>, h: &Header) -> Result<Coord<f64>, GeoError> {
    let x = r.f64(h.order)?;
    let y = r.f64(h.order)?;
    for _ in 0..h.extra_dims {
        r.f64(h.order)?;
    }
    Ok(Coord { x, y })
}

fn read_line(r: &mut Reader<'_>, h: &Header) -> Result<LineString<f64>, GeoError> {
    let n = r.u32(h.order)?;
    let coords = (0..n)
        .map(|_| read_coord(r, h))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn read_polygon(r: &mut Reader<'_>, h: &Header) -> Result<Polygon<f64>, GeoError> {
    let rings = r.u32(h.order)?;
    if rings == 0 {
        return Ok(Polygon::new(LineString::new(vec![]), vec![]));
    }
    let exterior = read_line(r, h)?;
    let interiors = (1..rings)
        .map(|_| read_line(r, h))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn read_parts<T>(
    r: &mut Reader<'_>,
    h: &Header,
    expected: u32,
    extract: impl Fn(Geometry<f64>) -> Option<T>,
) -> Result<Vec<T>, GeoError> {
    let n = r.u32(h.order)?;
    let mut parts = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (_, part, kind) = read_geometry(r)?;
        if kind != expected {
            return Err(GeoError::Ewkb(format!(
                "expected geometry type {} inside collection, found {}",
                expected, kind
            )));
        }
        parts.extend(extract(part));
    }
    Ok(parts)
}

fn read_geometry(r: &mut Reader<'_>) -> Result<(Option<i32>, Geometry<f64>, u32), GeoError> {
    let h = read_header(r)?;
    let geometry = match h.kind {
        type_codes::POINT => {
            let c = read_coord(r, &h)?;
            Geometry::Point(Point::from(c))
        }
        type_codes::LINESTRING => Geometry::LineString(read_line(r, &h)?),
        type_codes::POLYGON => Geometry::Polygon(read_polygon(r, &h)?),
        type_codes::MULTIPOINT => {
            let points = read_parts(r, &h, type_codes::POINT, |g| match g {
                Geometry::Point(p) => Some(p),
                _ => None,
            })?;
            Geometry::MultiPoint(MultiPoint::new(points))
        }
        type_codes::MULTILINESTRING => {
            let lines = read_parts(r, &h, type_codes::LINESTRING, |g| match g {
                Geometry::LineString(l) => Some(l),
                _ => None,
            })?;
            Geometry::MultiLineString(MultiLineString::new(lines))
        }
        type_codes::MULTIPOLYGON => {
            let polygons = read_parts(r, &h, type_codes::POLYGON, |g| match g {
                Geometry::Polygon(p) => Some(p),
                _ => None,
            })?;
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
        type_codes::GEOMETRYCOLLECTION => {
            let n = r.u32(h.order)?;
            let members = (0..n)
                .map(|_| read_geometry(r).map(|(_, g, _)| g))
                .collect::<Result<Vec<_>, _>>()?;
            Geometry::GeometryCollection(GeometryCollection::new_from(members))
        }
        other => return Err(GeoError::Ewkb(format!("unsupported geometry type {}", other))),
    };
    Ok((h.srid, geometry, h.kind))
}

pub fn decode(bytes: &[u8]) -> Result<Ewkb, GeoError> {
    let mut reader = Reader { bytes, pos: 0 };
    let (srid, geometry, _) = read_geometry(&mut reader)?;
    Ok(Ewkb { srid, geometry })
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_coord(buf: &mut Vec<u8>, c: Coord<f64>) {
    buf.extend_from_slice(&c.x.to_le_bytes());
    buf.extend_from_slice(&c.y.to_le_bytes());
}

fn put_line(buf: &mut Vec<u8>, line: &LineString<f64>) {
    put_u32(buf, line.0.len() as u32);
    for c in &line.0 {
        put_coord(buf, *c);
    }
}

fn put_polygon(buf: &mut Vec<u8>, polygon: &Polygon<f64>) {
    let rings = 1 + polygon.interiors().len();
    put_u32(buf, rings as u32);
    put_line(buf, polygon.exterior());
    for ring in polygon.interiors() {
        put_line(buf, ring);
    }
}

fn put_geometry(buf: &mut Vec<u8>, geometry: &Geometry<f64>, srid: Option<i32>) -> Result<(), GeoError> {
    let kind = match geometry {
        Geometry::Point(_) => type_codes::POINT,
        Geometry::LineString(_) => type_codes::LINESTRING,
        Geometry::Polygon(_) => type_codes::POLYGON,
        Geometry::MultiPoint(_) => type_codes::MULTIPOINT,
        Geometry::MultiLineString(_) => type_codes::MULTILINESTRING,
        Geometry::MultiPolygon(_) => type_codes::MULTIPOLYGON,
        Geometry::GeometryCollection(_) => type_codes::GEOMETRYCOLLECTION,
        Geometry::Rect(r) => return put_geometry(buf, &Geometry::Polygon(r.to_polygon()), srid),
        Geometry::Triangle(t) => return put_geometry(buf, &Geometry::Polygon(t.to_polygon()), srid),
        Geometry::Line(l) => {
            return put_geometry(buf, &Geometry::LineString(LineString::new(vec![l.start, l.end])), srid)
        }
    };

    buf.push(0x01);
    match srid {
        Some(srid) => {
            put_u32(buf, kind | type_codes::SRID_FLAG);
            put_u32(buf, srid as u32);
        }
        None => put_u32(buf, kind),
    }

    match geometry {
        Geometry::Point(p) => put_coord(buf, p.0),
        Geometry::LineString(l) => put_line(buf, l),
        Geometry::Polygon(p) => put_polygon(buf, p),
        Geometry::MultiPoint(mp) => {
            put_u32(buf, mp.0.len() as u32);
            for p in &mp.0 {
                put_geometry(buf, &Geometry::Point(*p), None)?;
            }
        }
        Geometry::MultiLineString(ml) => {
            put_u32(buf, ml.0.len() as u32);
            for l in &ml.0 {
                put_geometry(buf, &Geometry::LineString(l.clone()), None)?;
            }
        }
        Geometry::MultiPolygon(mp) => {
            put_u32(buf, mp.0.len() as u32);
            for p in &mp.0 {
                put_geometry(buf, &Geometry::Polygon(p.clone()), None)?;
            }
        }
        Geometry::GeometryCollection(gc) => {
            put_u32(buf, gc.0.len() as u32);
            for g in &gc.0 {
                put_geometry(buf, g, None)?;
            }
        }
        _ => return Err(GeoError::Ewkb("unsupported geometry variant".to_string())),
    }
    Ok(())
}

/// Little-endian EWKB, with the SRID flag set when `srid` is given.
pub fn encode(geometry: &Geometry<f64>, srid: Option<i32>) -> Result<Vec<u8>, GeoError> {
    let mut buf = Vec::new();
    put_geometry(&mut buf, geometry, srid)?;
    Ok(buf)
}
