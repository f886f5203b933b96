use std::fmt;

use serde_json::Value;

/// One step of a [`ValuePath`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    /// Object field access.
    Field(String),
    /// Array element access.
    Index(usize),
}

/// Dot-path location of a value inside a decoded document, rooted at `$`.
///
/// Rendered as `$.posts[2].author`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValuePath {
    segments: Vec<PathSegment>,
}

impl ValuePath {
    /// The root path `$`.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Extend with a field access.
    #[must_use]
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Field(name.into()));
        Self { segments }
    }

    /// Extend with an array index access.
    #[must_use]
    pub fn index(&self, idx: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Index(idx));
        Self { segments }
    }

    /// The path segments from the root.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

/// Why a value failed to decode at a given path.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DecodeErrorKind {
    /// The JSON kind does not match the schema kind.
    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        /// Human-readable expectation (e.g. `string`, `object`).
        expected: String,
        /// JSON kind of the offending value.
        actual: String,
    },

    /// A required object field is absent.
    #[error("missing required field `{field}`")]
    MissingField {
        /// The absent field name.
        field: String,
    },

    /// An object carries a field the schema does not declare.
    #[error("unknown field `{field}`")]
    UnknownField {
        /// The undeclared field name.
        field: String,
    },

    /// An integer is outside its declared bounds.
    #[error("value {value} outside bounds [{minimum:?}, {maximum:?}]")]
    OutOfBounds {
        /// The offending value.
        value: i64,
        /// Declared inclusive minimum.
        minimum: Option<i64>,
        /// Declared inclusive maximum.
        maximum: Option<i64>,
    },

    /// A literal type received a different value.
    #[error("expected literal {expected}")]
    LiteralMismatch {
        /// The only accepted value.
        expected: Value,
    },

    /// No union variant accepted the value.
    #[error("no variant matched (tried {tried:?})")]
    NoVariantMatched {
        /// Variant names tried, in order.
        tried: Vec<String>,
    },
}

/// Structured, path-tracked decode failure.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("decode failed at {path}: {kind}")]
pub struct DecodeError {
    /// Where in the document decoding failed.
    pub path: ValuePath,
    /// What went wrong.
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    /// Build an error at the given path.
    #[must_use]
    pub fn new(path: ValuePath, kind: DecodeErrorKind) -> Self {
        Self { path, kind }
    }
}
