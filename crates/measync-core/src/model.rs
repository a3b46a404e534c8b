//! Measurement data model types.
//!
//! A [`DataModel`] is one snapshot of measurement data:
//! - Named entries holding typed arrays, scalars or nested models
//! - A flat `metadata` attribute map attached to the model itself
//! - Top-level entry names ("graph keys") naming independently plottable streams

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved key under which attributes of a node are exposed.
pub const METADATA_KEY: &str = "metadata";

/// Separator used by [`DataModel::lookup`] for nested paths.
pub const PATH_SEPARATOR: char = '/';

/// Errors raised when building a data model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// The key is reserved for node attributes.
    #[error("`{0}` is reserved for attributes, use set_attr instead")]
    ReservedKey(String),

    /// The key is empty or contains the path separator.
    #[error("Invalid entry name {0:?}")]
    InvalidKey(String),
}

/// Errors raised when building an array.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArrayError {
    /// The shape does not describe the number of elements supplied.
    #[error("Shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// The product of the dimensions does not fit in `usize`.
    #[error("Shape {0:?} is too large")]
    ShapeOverflow(Vec<usize>),

    /// Arrays need at least one dimension; single numbers are scalars.
    #[error("Array shape must have at least one dimension")]
    ZeroDimensional,
}

/// Element type of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    I64,
    I32,
    U64,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            DType::F64 | DType::I64 | DType::U64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::U8 | DType::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U64 => "u64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

/// Typed element storage of an [`Array`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl ArrayData {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ArrayData::F64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::F64(_) => DType::F64,
            ArrayData::F32(_) => DType::F32,
            ArrayData::I64(_) => DType::I64,
            ArrayData::I32(_) => DType::I32,
            ArrayData::U64(_) => DType::U64,
            ArrayData::U8(_) => DType::U8,
            ArrayData::Bool(_) => DType::Bool,
        }
    }
}

/// An n-dimensional, row-major numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArray")]
pub struct Array {
    shape: Vec<usize>,
    data: ArrayData,
}

/// Unchecked wire form of an [`Array`].
#[derive(Deserialize)]
struct RawArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl TryFrom<RawArray> for Array {
    type Error = ArrayError;

    fn try_from(raw: RawArray) -> Result<Self, Self::Error> {
        Array::new(raw.shape, raw.data)
    }
}

impl Array {
    /// Create an array, checking that `shape` covers exactly the supplied elements.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self, ArrayError> {
        if shape.is_empty() {
            return Err(ArrayError::ZeroDimensional);
        }
        let Some(expected) = shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim)) else {
            return Err(ArrayError::ShapeOverflow(shape));
        };
        if expected != data.len() {
            return Err(ArrayError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the elements if this is an `f64` array.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ArrayData::F64(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! array_from_vec {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Array {
                fn from(values: Vec<$ty>) -> Self {
                    Self {
                        shape: vec![values.len()],
                        data: ArrayData::$variant(values),
                    }
                }
            }

            impl From<Vec<$ty>> for Value {
                fn from(values: Vec<$ty>) -> Self {
                    Value::Array(Array::from(values))
                }
            }
        )*
    };
}

array_from_vec! {
    f64 => F64,
    f32 => F32,
    i64 => I64,
    i32 => I32,
    u64 => U64,
    u8 => U8,
    bool => Bool,
}

/// A single attribute or scalar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Str(s) => write!(f, "{}", s),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// A value stored under an entry name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Array(Array),
    Scalar(Scalar),
    Group(DataModel),
}

impl Value {
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&DataModel> {
        match self {
            Value::Group(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

impl From<DataModel> for Value {
    fn from(m: DataModel) -> Self {
        Value::Group(m)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::Str(s))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(Scalar::Float(x))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

/// One snapshot of measurement data.
///
/// Entries are kept in name order so iteration (and encoding) is
/// deterministic. Attributes live beside the entries, so the reserved
/// `metadata` name can never clash with a data channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawModel")]
pub struct DataModel {
    entries: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Scalar>,
}

/// Unchecked wire form of a [`DataModel`]; entry names are validated on
/// conversion.
#[derive(Deserialize)]
struct RawModel {
    entries: BTreeMap<String, Value>,
    #[serde(default)]
    metadata: BTreeMap<String, Scalar>,
}

impl TryFrom<RawModel> for DataModel {
    type Error = ModelError;

    fn try_from(raw: RawModel) -> Result<Self, Self::Error> {
        for key in raw.entries.keys() {
            validate_key(key)?;
        }
        Ok(Self {
            entries: raw.entries,
            metadata: raw.metadata,
        })
    }
}

impl DataModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the value it replaced.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, ModelError> {
        let key = key.into();
        validate_key(&key)?;
        Ok(self.entries.insert(key, value.into()))
    }

    /// Builder form of [`DataModel::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, ModelError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Builder form of [`DataModel::set_attr`].
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Get a nested value by a `/`-separated path (e.g. "scan/detector/counts").
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(PATH_SEPARATOR).filter(|s| !s.is_empty());
        let mut current = self.entries.get(segments.next()?)?;
        for segment in segments {
            current = current.as_group()?.entries.get(segment)?;
        }
        Some(current)
    }

    /// Iterate entries in name order (attributes excluded).
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Attributes attached to this node.
    pub fn metadata(&self) -> &BTreeMap<String, Scalar> {
        &self.metadata
    }

    pub fn attr(&self, key: &str) -> Option<&Scalar> {
        self.metadata.get(key)
    }

    /// Set an attribute on this node, returning the one it replaced.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Option<Scalar> {
        self.metadata.insert(key.into(), value.into())
    }

    /// Names of the independently plottable streams: top-level entries,
    /// never the attribute map.
    pub fn graph_keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries (attributes excluded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.metadata.is_empty()
    }

    /// Count arrays and scalars at every nesting level.
    pub fn leaf_count(&self) -> usize {
        self.entries
            .values()
            .map(|v| match v {
                Value::Group(g) => g.leaf_count(),
                _ => 1,
            })
            .sum()
    }
}

fn validate_key(key: &str) -> Result<(), ModelError> {
    if key == METADATA_KEY {
        return Err(ModelError::ReservedKey(key.to_string()));
    }
    if key.is_empty() || key.contains(PATH_SEPARATOR) {
        return Err(ModelError::InvalidKey(key.to_string()));
    }
    Ok(())
}
