//! Geometry model stored in the `.shp` records.
//!
//! Shapes are deliberately simple: a handful of variants over a flat
//! coordinate type, an envelope, and a decimating generalization used when
//! features are streamed for display at a coarse resolution.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::envelope::Envelope;

/// A 2D coordinate (x, y).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Calculates the Euclidean distance to another coordinate.
    pub fn distance(&self, other: &Coordinate) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.y)
    }
}

/// Geometry kind declared by a feature type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeType {
    Null,
    Point,
    MultiPoint,
    LineString,
    Polygon,
}

/// A record's geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// No geometry; its envelope is null.
    Null,
    Point(Coordinate),
    MultiPoint(Vec<Coordinate>),
    /// One or more parts.
    LineString(Vec<Vec<Coordinate>>),
    /// Rings; the first is the shell, the rest are holes.
    Polygon(Vec<Vec<Coordinate>>),
}

impl Shape {
    pub fn point(x: f64, y: f64) -> Shape {
        Shape::Point(Coordinate::new(x, y))
    }

    /// Single-part line from `(x, y)` pairs.
    pub fn line(coords: &[(f64, f64)]) -> Shape {
        Shape::LineString(vec![coords
            .iter()
            .map(|&(x, y)| Coordinate::new(x, y))
            .collect()])
    }

    /// Axis-aligned rectangle polygon covering `env`.
    pub fn rectangle(env: &Envelope) -> Shape {
        Shape::Polygon(vec![vec![
            Coordinate::new(env.min_x, env.min_y),
            Coordinate::new(env.max_x, env.min_y),
            Coordinate::new(env.max_x, env.max_y),
            Coordinate::new(env.min_x, env.max_y),
            Coordinate::new(env.min_x, env.min_y),
        ]])
    }

    pub fn shape_type(&self) -> ShapeType {
        match self {
            Shape::Null => ShapeType::Null,
            Shape::Point(_) => ShapeType::Point,
            Shape::MultiPoint(_) => ShapeType::MultiPoint,
            Shape::LineString(_) => ShapeType::LineString,
            Shape::Polygon(_) => ShapeType::Polygon,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Shape::Null)
    }

    pub fn envelope(&self) -> Envelope {
        let mut env = Envelope::null();
        self.for_each_coordinate(|c| env.expand_to_include(c.x, c.y));
        env
    }

    pub fn num_points(&self) -> usize {
        let mut n = 0;
        self.for_each_coordinate(|_| n += 1);
        n
    }

    fn for_each_coordinate(&self, mut f: impl FnMut(&Coordinate)) {
        match self {
            Shape::Null => {}
            Shape::Point(c) => f(c),
            Shape::MultiPoint(points) => points.iter().for_each(f),
            Shape::LineString(parts) | Shape::Polygon(parts) => {
                parts.iter().flatten().for_each(f)
            }
        }
    }

    /// Drops vertices closer than `distance` to the last kept vertex. The
    /// first and last vertex of every part survive; lines keep at least two
    /// vertices and rings at least four so they stay closed.
    pub fn generalized(&self, distance: f64) -> Shape {
        if distance <= 0.0 {
            return self.clone();
        }
        match self {
            Shape::LineString(parts) => Shape::LineString(
                parts.iter().map(|p| decimate(p, distance, 2)).collect(),
            ),
            Shape::Polygon(rings) => {
                Shape::Polygon(rings.iter().map(|r| decimate(r, distance, 4)).collect())
            }
            other => other.clone(),
        }
    }
}

fn decimate(part: &[Coordinate], distance: f64, min_points: usize) -> Vec<Coordinate> {
    if part.len() <= min_points {
        return part.to_vec();
    }

    let last = part.len() - 1;
    let mut kept = Vec::with_capacity(part.len());
    kept.push(part[0]);
    for c in &part[1..last] {
        if let Some(prev) = kept.last() {
            if prev.distance(c) >= distance {
                kept.push(*c);
            }
        }
    }
    kept.push(part[last]);

    if kept.len() < min_points {
        // too aggressive for this part; fall back to evenly picked vertices
        let step = last as f64 / (min_points - 1) as f64;
        return (0..min_points)
            .map(|i| part[((i as f64 * step).round() as usize).min(last)])
            .collect();
    }
    kept
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_list(f: &mut fmt::Formatter<'_>, coords: &[Coordinate]) -> fmt::Result {
            write!(f, "(")?;
            for (i, c) in coords.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, ")")
        }

        fn write_parts(f: &mut fmt::Formatter<'_>, parts: &[Vec<Coordinate>]) -> fmt::Result {
            write!(f, "(")?;
            for (i, p) in parts.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_list(f, p)?;
            }
            write!(f, ")")
        }

        match self {
            Shape::Null => write!(f, "NULL"),
            Shape::Point(c) => write!(f, "POINT ({})", c),
            Shape::MultiPoint(points) => {
                write!(f, "MULTIPOINT ")?;
                write_list(f, points)
            }
            Shape::LineString(parts) => {
                write!(f, "MULTILINESTRING ")?;
                write_parts(f, parts)
            }
            Shape::Polygon(rings) => {
                write!(f, "POLYGON ")?;
                write_parts(f, rings)
            }
        }
    }
}
