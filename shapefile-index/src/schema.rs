//! Feature types, attribute descriptors and attribute values.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ShapefileError, ShapefileResult};
use crate::geometry::ShapeType;

/// Storage kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    /// The default geometry; stored in `.shp`, never in `.dbf`.
    Geometry(ShapeType),
    Text { length: u16 },
    Integer { length: u16 },
    Float { length: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: AttributeKind,
}

impl AttributeDescriptor {
    pub fn is_geometry(&self) -> bool {
        matches!(self.kind, AttributeKind::Geometry(_))
    }
}

/// Schema of a shapefile set.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureType {
    type_name: String,
    attributes: Vec<AttributeDescriptor>,
    crs: Option<String>,
}

impl FeatureType {
    /// Starts a feature type with a geometry attribute named `the_geom`.
    pub fn new(type_name: impl Into<String>, geometry: ShapeType) -> FeatureType {
        FeatureType {
            type_name: type_name.into(),
            attributes: vec![AttributeDescriptor {
                name: "the_geom".to_string(),
                kind: AttributeKind::Geometry(geometry),
            }],
            crs: None,
        }
    }

    pub(crate) fn from_parts(
        type_name: impl Into<String>,
        attributes: Vec<AttributeDescriptor>,
        crs: Option<String>,
    ) -> FeatureType {
        FeatureType {
            type_name: type_name.into(),
            attributes,
            crs,
        }
    }

    pub fn with_text(self, name: &str, length: u16) -> Self {
        self.with_attribute(name, AttributeKind::Text { length })
    }

    pub fn with_integer(self, name: &str, length: u16) -> Self {
        self.with_attribute(name, AttributeKind::Integer { length })
    }

    pub fn with_float(self, name: &str, length: u16) -> Self {
        self.with_attribute(name, AttributeKind::Float { length })
    }

    /// Projection definition, persisted as the `.prj` text.
    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    fn with_attribute(mut self, name: &str, kind: AttributeKind) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    pub fn geometry_type(&self) -> ShapeType {
        self.attributes
            .iter()
            .find_map(|a| match a.kind {
                AttributeKind::Geometry(t) => Some(t),
                _ => None,
            })
            .unwrap_or(ShapeType::Null)
    }

    /// Attributes stored in `.dbf`, in declaration order.
    pub fn row_attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.iter().filter(|a| !a.is_geometry())
    }

    pub fn has_row_attributes(&self) -> bool {
        self.row_attributes().next().is_some()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn validate(&self) -> ShapefileResult<()> {
        if self.type_name.is_empty() {
            return Err(ShapefileError::Schema("Type name must not be empty".into()));
        }
        let geometries = self.attributes.iter().filter(|a| a.is_geometry()).count();
        if geometries > 1 {
            return Err(ShapefileError::Schema(
                "A feature type holds at most one geometry attribute".into(),
            ));
        }
        for (i, a) in self.attributes.iter().enumerate() {
            if a.name.is_empty() {
                return Err(ShapefileError::Schema("Attribute name must not be empty".into()));
            }
            if self.attributes[..i].iter().any(|b| b.name == a.name) {
                return Err(ShapefileError::Schema(format!(
                    "Duplicate attribute name: {}",
                    a.name
                )));
            }
            match a.kind {
                AttributeKind::Text { length }
                | AttributeKind::Integer { length }
                | AttributeKind::Float { length }
                    if length == 0 =>
                {
                    return Err(ShapefileError::Schema(format!(
                        "Attribute {} has zero length",
                        a.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// An attribute value read from or written to a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}
