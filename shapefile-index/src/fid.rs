use std::cmp::Ordering;
use std::fmt;

/// Identifier of a feature, conventionally `"<type>.<n>"`.
///
/// Ordering: an identifier with a numeric suffix is keyed by its prefix,
/// anything else by its full string. Keys compare lexicographically; under an
/// equal key numbered identifiers come first, by number, so
/// `roads.9 < roads.10`. Remaining ties break on the full string, which keeps
/// the order total and consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> FeatureId {
        FeatureId(id.into())
    }

    /// Builds `"<type_name>.<n>"`.
    pub fn synthesize(type_name: &str, n: u64) -> FeatureId {
        FeatureId(format!("{}.{}", type_name, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into prefix and numeric suffix when the identifier has one.
    pub fn split(&self) -> Option<(&str, u64)> {
        let (prefix, suffix) = self.0.rsplit_once('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().map(|n| (prefix, n))
    }

    /// Numeric suffix, if any.
    pub fn number(&self) -> Option<u64> {
        self.split().map(|(_, n)| n)
    }
}

impl FeatureId {
    fn sort_key(&self) -> (&str, bool, u64) {
        match self.split() {
            Some((prefix, n)) => (prefix, false, n),
            None => (self.0.as_str(), true, 0),
        }
    }
}

impl Ord for FeatureId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for FeatureId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        FeatureId(value.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(value: String) -> Self {
        FeatureId(value)
    }
}

/// Position of a record inside the geometry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RecordLocation {
    /// 1-based record number
    pub record_number: u32,
    /// Byte offset of the record header in the geometry file
    pub byte_offset: u64,
}

impl RecordLocation {
    pub fn new(record_number: u32, byte_offset: u64) -> RecordLocation {
        RecordLocation {
            record_number,
            byte_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_suffix_ordering() {
        let a = FeatureId::from("roads.9");
        let b = FeatureId::from("roads.10");
        assert!(a < b);
        assert!(FeatureId::from("roads.10") > FeatureId::from("roads.2"));
    }

    #[test]
    fn test_different_prefix_is_lexicographic() {
        let a = FeatureId::from("alpha.10");
        let b = FeatureId::from("beta.2");
        assert!(a < b);
    }

    #[test]
    fn test_no_numeric_suffix_sorts_after_numbered() {
        let a = FeatureId::from("roads.x");
        let b = FeatureId::from("roads.10");
        assert_eq!(a.split(), None);
        assert!(b < a);
        assert!(FeatureId::from("roads.1") < FeatureId::from("roads"));
    }

    #[test]
    fn test_ordering_is_transitive() {
        let a = FeatureId::from("t.9");
        let b = FeatureId::from("t.10");
        let c = FeatureId::from("t.5.x");
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);

        let ids = ["t.5.x", "t.10", "t", "t.9", "t.5", "t.5.2", "t.09", "u.1", "t.x"];
        let mut sorted: Vec<FeatureId> = ids.into_iter().map(FeatureId::from).collect();
        sorted.sort();
        for (i, x) in sorted.iter().enumerate() {
            for y in &sorted[i + 1..] {
                assert_eq!(x.cmp(y), Ordering::Less, "{} vs {}", x, y);
                assert_eq!(y.cmp(x), Ordering::Greater, "{} vs {}", y, x);
            }
        }

        let set: std::collections::BTreeSet<FeatureId> = sorted.iter().cloned().collect();
        assert_eq!(set.len(), ids.len());
        for id in &sorted {
            assert!(set.contains(id));
        }
    }

    #[test]
    fn test_leading_zero_ties_break_on_string() {
        let a = FeatureId::from("t.01");
        let b = FeatureId::from("t.1");
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_sort() {
        let mut ids: Vec<FeatureId> = ["t.3", "t.11", "t.1", "t.20"]
            .into_iter()
            .map(FeatureId::from)
            .collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(sorted, vec!["t.1", "t.3", "t.11", "t.20"]);
    }

    #[test]
    fn test_synthesize_and_number() {
        let id = FeatureId::synthesize("roads", 42);
        assert_eq!(id.as_str(), "roads.42");
        assert_eq!(id.number(), Some(42));
        assert_eq!(FeatureId::from("plain").number(), None);
    }
}
