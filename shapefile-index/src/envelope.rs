use std::hash::Hash;

/// A 2D envelope represented by minimum and maximum coordinates.
///
/// `Envelope` defines a rectangular area in 2D space using the minimum
/// (min_x, min_y) and maximum (max_x, max_y) corners. It is the unit of
/// every spatial decision in this crate: record headers carry one, quad-tree
/// nodes carry one and bounding-box queries are expressed as one.
///
/// Degenerate envelopes (a single point) are legal. The *null* envelope,
/// where the minimum exceeds the maximum, stands for "no geometry" and
/// intersects nothing.
///
/// # Examples
///
/// ```rust
/// use shapefile_index::Envelope;
///
/// let query = Envelope::new(40.0, 40.0, 60.0, 60.0);
/// assert!(query.contains_point(50.0, 50.0));
/// assert!(!Envelope::null().intersects(&query));
/// ```
#[derive(Clone, Copy, PartialEq, Debug, serde::Deserialize, serde::Serialize)]
pub struct Envelope {
    /// Minimum X coordinate
    pub min_x: f64,
    /// Minimum Y coordinate
    pub min_y: f64,
    /// Maximum X coordinate
    pub max_x: f64,
    /// Maximum Y coordinate
    pub max_y: f64,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::null()
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.min_x.to_bits().hash(state);
        self.min_y.to_bits().hash(state);
        self.max_x.to_bits().hash(state);
        self.max_y.to_bits().hash(state);
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "Envelope(null)");
        }
        write!(
            f,
            "Envelope({}, {}, {}, {})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

impl Envelope {
    /// Creates a new envelope with the specified coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The envelope of "no geometry". Unioning with it is the identity.
    pub fn null() -> Envelope {
        Envelope {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Envelope of a single coordinate.
    pub fn of_point(x: f64, y: f64) -> Envelope {
        Envelope::new(x, y, x, y)
    }

    /// Smallest envelope covering every coordinate in `coords`.
    pub fn of_coords<'a, I>(coords: I) -> Envelope
    where
        I: IntoIterator<Item = &'a [f64; 2]>,
    {
        let mut env = Envelope::null();
        for c in coords {
            env.expand_to_include(c[0], c[1]);
        }
        env
    }

    /// True when the envelope covers no coordinate at all.
    pub fn is_null(&self) -> bool {
        !(self.min_x <= self.max_x && self.min_y <= self.max_y)
    }

    pub fn width(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    /// Returns the center point of the envelope.
    pub fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    /// Checks if this envelope contains a point. Edges count as inside.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Checks if this envelope fully contains another one.
    pub fn contains(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Checks if this envelope intersects another. Touching edges intersect.
    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Returns the union of this envelope with another.
    pub fn union(&self, other: &Envelope) -> Envelope {
        if self.is_null() {
            return *other;
        }
        if other.is_null() {
            return *self;
        }
        Envelope::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn expand_to_include(&mut self, x: f64, y: f64) {
        if self.is_null() {
            *self = Envelope::of_point(x, y);
            return;
        }
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn expand_to_include_envelope(&mut self, other: &Envelope) {
        *self = self.union(other);
    }

    /// Returns the intersection of this envelope with another, if they intersect.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        ))
    }

    /// Splits the envelope into its four quadrants around the centre, in
    /// the order south-west, south-east, north-west, north-east.
    pub(crate) fn quadrants(&self) -> [Envelope; 4] {
        let (cx, cy) = self.center();
        [
            Envelope::new(self.min_x, self.min_y, cx, cy),
            Envelope::new(cx, self.min_y, self.max_x, cy),
            Envelope::new(self.min_x, cy, cx, self.max_y),
            Envelope::new(cx, cy, self.max_x, self.max_y),
        ]
    }
}
