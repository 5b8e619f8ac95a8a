use serde::{Deserialize, Serialize};

/// Separator between the segments of a joined resource path.
pub const PATH_SEPARATOR: char = '/';

/// Width numeric segments are zero-padded to, so that lexical and numeric
/// ordering agree for values up to ten digits.
pub const NUMERIC_SEGMENT_WIDTH: usize = 10;

/// One segment of a composite resource path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Number(u64),
    Text(String),
}

impl PathSegment {
    fn write_to(&self, out: &mut String) {
        match self {
            PathSegment::Number(n) => {
                out.push_str(&format!("{:0width$}", n, width = NUMERIC_SEGMENT_WIDTH))
            }
            PathSegment::Text(s) => out.push_str(s),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Text(value.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        PathSegment::Text(value)
    }
}

impl From<&String> for PathSegment {
    fn from(value: &String) -> Self {
        PathSegment::Text(value.clone())
    }
}

macro_rules! unsigned_segment {
    ($($t:ty),*) => {
        $(impl From<$t> for PathSegment {
            fn from(value: $t) -> Self {
                PathSegment::Number(value as u64)
            }
        })*
    };
}

macro_rules! signed_segment {
    ($($t:ty),*) => {
        $(impl From<$t> for PathSegment {
            /// Negative values keep the padded rendering but are stored as text.
            fn from(value: $t) -> Self {
                match u64::try_from(value) {
                    Ok(n) => PathSegment::Number(n),
                    Err(_) => PathSegment::Text(format!(
                        "{:0width$}",
                        value,
                        width = NUMERIC_SEGMENT_WIDTH
                    )),
                }
            }
        })*
    };
}

unsigned_segment!(u8, u16, u32, u64, usize);
signed_segment!(i8, i16, i32, i64, isize);

/// Ordered, heterogeneous address of a staged resource.
///
/// ```
/// use batch_staging_core::{resource_path, ResourcePath};
///
/// let path = resource_path!["outgoing", "001-002", 42];
/// assert_eq!(path.join(), "outgoing/001-002/0000000042");
/// assert_eq!(ResourcePath::new().push("outgoing").push(42u64).join(), "outgoing/0000000042");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<PathSegment>,
}

impl ResourcePath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Append a segment.
    pub fn push(mut self, segment: impl Into<PathSegment>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Join the segments into one relative path, padding numeric segments.
    pub fn join(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push(PATH_SEPARATOR);
            }
            segment.write_to(&mut out);
        }
        out
    }
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.join())
    }
}

/// A single already-joined path, e.g. one recovered from a directory scan.
impl From<&str> for ResourcePath {
    fn from(value: &str) -> Self {
        Self {
            segments: vec![PathSegment::from(value)],
        }
    }
}

impl From<String> for ResourcePath {
    fn from(value: String) -> Self {
        Self {
            segments: vec![PathSegment::Text(value)],
        }
    }
}

/// Build a [`ResourcePath`] from a mix of string and integer segments.
#[macro_export]
macro_rules! resource_path {
    ($($segment:expr),* $(,)?) => {
        $crate::ResourcePath::from_segments(vec![$($crate::PathSegment::from($segment)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_path;

    #[test]
    fn test_numeric_segments_are_padded() {
        assert_eq!(resource_path!["batch", 42].join(), "batch/0000000042");
        assert_eq!(resource_path![7u32].join(), "0000000007");
        assert_eq!(resource_path![1234567890u64].join(), "1234567890");
    }

    #[test]
    fn test_padding_preserves_numeric_order() {
        let seven = resource_path![7].join();
        let seventy = resource_path![70].join();
        assert!(seven < seventy);

        let mut values = vec![9_999_999_999u64, 10, 7, 70, 1_000_000, 0, 123];
        let mut joined: Vec<String> = values.iter().map(|v| resource_path![*v].join()).collect();
        joined.sort();
        values.sort();
        let expected: Vec<String> = values.iter().map(|v| resource_path![*v].join()).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn test_mixed_segments() {
        let node = String::from("001-002");
        let path = resource_path!["outgoing", &node, 5usize];
        assert_eq!(path.join(), "outgoing/001-002/0000000005");
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.to_string(), path.join());
    }

    #[test]
    fn test_negative_numbers_render_padded() {
        assert_eq!(resource_path![-5i64].join(), "-000000005");
        assert_eq!(PathSegment::from(5i32), PathSegment::Number(5));
    }

    #[test]
    fn test_joined_string_is_single_segment() {
        let path = ResourcePath::from("outgoing/0000000001");
        assert_eq!(path.join(), "outgoing/0000000001");
        assert!(!path.is_empty());
        assert!(ResourcePath::new().is_empty());
        assert_eq!(ResourcePath::new().join(), "");
    }
}
