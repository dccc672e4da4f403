use indexmap::IndexMap;

use crate::envelope::Envelope;
use crate::fid::FeatureId;
use crate::geometry::Shape;
use crate::schema::Value;

/// One record of a shapefile set: identifier, geometry and attribute row.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    id: FeatureId,
    geometry: Shape,
    attributes: IndexMap<String, Value>,
}

impl Feature {
    pub fn new(id: FeatureId, geometry: Shape, attributes: IndexMap<String, Value>) -> Feature {
        Feature {
            id,
            geometry,
            attributes,
        }
    }

    pub fn id(&self) -> &FeatureId {
        &self.id
    }

    pub fn geometry(&self) -> &Shape {
        &self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Shape) {
        self.geometry = geometry;
    }

    pub fn envelope(&self) -> Envelope {
        self.geometry.envelope()
    }

    pub fn attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }
}
