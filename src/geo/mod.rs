pub mod ewkb;

use crate::domain::crs::{Crs, WGS84};
use geo_types::{coord, Geometry, Rect};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("malformed EWKB: {0}")]
    Ewkb(String),
}

/// Axis-aligned extent of a result set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Extent {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    /// Grows `self` to cover `other`; never shrinks.
    pub fn expand(&mut self, other: &Extent) {
        self.minx = self.minx.min(other.minx);
        self.miny = self.miny.min(other.miny);
        self.maxx = self.maxx.max(other.maxx);
        self.maxy = self.maxy.max(other.maxy);
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.minx, self.miny, self.maxx, self.maxy]
    }
}

/// Folds an optional per-type extent into the request-wide one.
pub fn accumulate(total: &mut Option<Extent>, next: Option<Extent>) {
    if let Some(n) = next {
        match total.as_mut() {
            Some(t) => t.expand(&n),
            None => *total = Some(n),
        }
    }
}

/// Request bounding box in its own CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct BBox {
    pub extent: Extent,
    pub crs: Crs,
}

impl BBox {
    /// CRS84 boxes have their axis pairs swapped and are re-labelled as WGS84.
    pub fn new(values: [f64; 4], crs: Crs) -> Self {
        let [a, b, c, d] = values;
        if crs.is_crs84() {
            Self {
                extent: Extent::new(b, a, d, c),
                crs: WGS84.clone(),
            }
        } else {
            Self {
                extent: Extent::new(a, b, c, d),
                crs,
            }
        }
    }

    pub fn srid(&self) -> i32 {
        self.crs.srid()
    }

    pub fn to_geometry(&self) -> Geometry<f64> {
        let e = &self.extent;
        Geometry::Polygon(
            Rect::new(coord! { x: e.minx, y: e.miny }, coord! { x: e.maxx, y: e.maxy }).to_polygon(),
        )
    }

    /// Polygon EWKB carrying the box's SRID, bound as a query parameter.
    pub fn to_ewkb(&self) -> Result<Vec<u8>, GeoError> {
        ewkb::encode(&self.to_geometry(), Some(self.srid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_accumulates_without_shrinking() {
        let mut total = None;
        accumulate(&mut total, None);
        assert_eq!(total, None);
        accumulate(&mut total, Some(Extent::new(0.0, 0.0, 2.0, 2.0)));
        accumulate(&mut total, Some(Extent::new(1.0, -1.0, 1.5, 3.0)));
        accumulate(&mut total, None);
        assert_eq!(total.unwrap().as_array(), [0.0, -1.0, 2.0, 3.0]);
    }

    #[test]
    fn crs84_bbox_is_swapped_to_wgs84() {
        let crs84 = Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap();
        let bbox = BBox::new([1.0, 2.0, 3.0, 4.0], crs84);
        assert_eq!(bbox.extent.as_array(), [2.0, 1.0, 4.0, 3.0]);
        assert_eq!(bbox.crs, *WGS84);

        let plain = BBox::new([1.0, 2.0, 3.0, 4.0], Crs::from_srid(28992));
        assert_eq!(plain.extent.as_array(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn bbox_ewkb_is_a_closed_polygon_with_srid() {
        let bbox = BBox::new([0.0, 0.0, 10.0, 5.0], Crs::from_srid(3857));
        let decoded = ewkb::decode(&bbox.to_ewkb().unwrap()).unwrap();
        assert_eq!(decoded.srid, Some(3857));
        match decoded.geometry {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 5);
                assert_eq!(p.exterior().0.first(), p.exterior().0.last());
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }
}
