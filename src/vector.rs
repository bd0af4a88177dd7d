// ============================================================================
// VECTOR EXPORT: valued polygons as a GeoJSON feature collection
// ============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MaskError, MaskResult};
use crate::geometry::{Point, Polygon, Ring, ValuedPolygon};

/// Name of the integer class attribute on every feature.
pub const CLASS_FIELD: &str = "class";

type Position = [f64; 2];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct Feature {
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

fn ring_coords(ring: &Ring) -> Vec<Position> {
    ring.iter().map(|p| [p.x, p.y]).collect()
}

fn polygon_coords(polygon: &Polygon) -> Vec<Vec<Position>> {
    polygon.rings().map(ring_coords).collect()
}

fn coords_polygon(rings: &[Vec<Position>]) -> MaskResult<Polygon> {
    let mut rings = rings.iter().map(|r| r.iter().map(|&[x, y]| Point::new(x, y)).collect::<Ring>());
    let exterior = rings
        .next()
        .ok_or_else(|| MaskError::geometry("polygon without an exterior ring"))?;
    let polygon = Polygon::new(exterior, rings.collect());
    polygon.validate()?;
    Ok(polygon)
}

impl Feature {
    pub fn from_polygon(polygon: &ValuedPolygon) -> Self {
        let mut properties = Map::new();
        properties.insert(CLASS_FIELD.to_string(), Value::from(polygon.value));
        Self {
            geometry: Geometry::Polygon { coordinates: polygon_coords(&polygon.polygon) },
            properties,
        }
    }

    /// Class value of the feature, if it carries a usable one.
    pub fn class(&self) -> Option<u16> {
        self.properties
            .get(CLASS_FIELD)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Polygon parts; a MultiPolygon yields one entry per part.
    pub fn polygons(&self) -> MaskResult<Vec<Polygon>> {
        match &self.geometry {
            Geometry::Polygon { coordinates } => Ok(vec![coords_polygon(coordinates)?]),
            Geometry::MultiPolygon { coordinates } => coordinates.iter().map(|p| coords_polygon(p)).collect(),
        }
    }
}

impl FeatureCollection {
    pub fn from_polygons<'a>(polygons: impl IntoIterator<Item = &'a ValuedPolygon>) -> Self {
        Self { features: polygons.into_iter().map(Feature::from_polygon).collect() }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Flatten to valued polygons. Every feature must carry an integer
    /// `class` attribute.
    pub fn to_polygons(&self) -> MaskResult<Vec<ValuedPolygon>> {
        let mut out = Vec::with_capacity(self.features.len());
        for (i, feature) in self.features.iter().enumerate() {
            let value = feature.class().ok_or_else(|| {
                MaskError::Json(format!("feature {} has no integer '{}' attribute", i + 1, CLASS_FIELD))
            })?;
            for polygon in feature.polygons()? {
                out.push(ValuedPolygon::new(polygon, value));
            }
        }
        Ok(out)
    }

    pub fn to_json(&self) -> MaskResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> MaskResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> MaskResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> MaskResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(value: u16) -> ValuedPolygon {
        let mut p = Polygon::rect(0.0, 0.0, 4.0, 4.0);
        p.holes.push(crate::geometry::close_ring(vec![
            Point::new(1.0, 1.0),
            Point::new(1.0, 2.0),
            Point::new(2.0, 2.0),
            Point::new(2.0, 1.0),
        ]));
        ValuedPolygon::new(p, value)
    }

    #[test]
    fn export_has_type_tags_and_class_attribute() {
        let fc = FeatureCollection::from_polygons(&[square(7)]);
        let json: Value = serde_json::from_str(&fc.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        let f = &json["features"][0];
        assert_eq!(f["type"], "Feature");
        assert_eq!(f["geometry"]["type"], "Polygon");
        assert_eq!(f["properties"]["class"], 7);
        // exterior plus one hole, both closed
        assert_eq!(f["geometry"]["coordinates"].as_array().unwrap().len(), 2);
        assert_eq!(f["geometry"]["coordinates"][0].as_array().unwrap().len(), 5);
    }

    #[test]
    fn import_reads_polygons_and_multipolygons() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"class": 2, "name": "field"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[3,0],[3,3],[0,3],[0,0]]]}},
                {"type": "Feature", "properties": {"class": 5},
                 "geometry": {"type": "MultiPolygon", "coordinates": [
                    [[[10,10],[11,10],[11,11],[10,10]]],
                    [[[20,20],[21,20],[21,21],[20,20]]]
                 ]}}
            ]
        }"#;
        let polygons = FeatureCollection::from_json(text).unwrap().to_polygons().unwrap();
        assert_eq!(polygons.iter().map(|p| p.value).collect::<Vec<_>>(), vec![2, 5, 5]);
        assert_eq!(polygons[0].polygon.area(), 9.0);
    }

    #[test]
    fn features_without_a_class_are_rejected() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"class": -1},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
        ]}"#;
        let err = FeatureCollection::from_json(text).unwrap().to_polygons().unwrap_err();
        assert!(matches!(err, MaskError::Json(_)));
    }

    #[test]
    fn degenerate_rings_fail_validation() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"class": 1},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,1],[0,0]]]}}
        ]}"#;
        let err = FeatureCollection::from_json(text).unwrap().to_polygons().unwrap_err();
        assert!(matches!(err, MaskError::Geometry(_)));
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.geojson");
        let fc = FeatureCollection::from_polygons(&[square(3), square(4)]);
        fc.save(&path).unwrap();
        assert_eq!(FeatureCollection::load(&path).unwrap(), fc);
    }
}
