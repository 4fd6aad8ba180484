//! vecfarm Array Codec
//!
//! This crate defines the codec-neutral numeric array exchanged between
//! workers and the master: a flat byte buffer plus a shape and a dtype tag.
//! It performs no I/O and holds no state.
//!
//! # Layout
//!
//! - `shape` lists dimension sizes in row-major order.
//! - `data` holds the raw element bytes in that order.
//! - `dtype` names the element type using numpy-style tags (`"float32"`,
//!   `"uint8"`, ...).
//!
//! An `Array` is only ever constructed through validation, so every value in
//! circulation satisfies `data.len() == product(shape) * dtype.size()`.

#![deny(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Failure to interpret an array's declared layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The dtype tag does not name a supported element type.
    #[error("unknown dtype: {0:?}")]
    UnknownDtype(String),

    /// A dimension on the wire was negative.
    #[error("negative dimension {dim} at axis {axis}")]
    NegativeDimension { axis: usize, dim: i64 },

    /// Element count or byte length does not fit in `usize`.
    #[error("shape {shape:?} overflows the addressable size")]
    ShapeOverflow { shape: Vec<usize> },

    /// Declared shape and dtype disagree with the buffer length.
    #[error("data length mismatch: shape {shape:?} of {dtype} needs {expected} bytes, got {actual}")]
    LengthMismatch {
        shape: Vec<usize>,
        dtype: DType,
        expected: usize,
        actual: usize,
    },
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

// ============================================================================
// DType
// ============================================================================

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Wire tag for this dtype.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = CodecError;

    fn from_str(tag: &str) -> Result<Self> {
        let dtype = match tag {
            "bool" => Self::Bool,
            "int8" => Self::Int8,
            "uint8" => Self::UInt8,
            "int16" => Self::Int16,
            "uint16" => Self::UInt16,
            "int32" => Self::Int32,
            "uint32" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "float16" => Self::Float16,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            other => return Err(CodecError::UnknownDtype(other.to_string())),
        };
        Ok(dtype)
    }
}

// ============================================================================
// Array
// ============================================================================

/// Immutable numeric array value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Array {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DType,
}

impl Array {
    /// Build an array, checking that `data` holds exactly the declared elements.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(&shape, dtype)?;
        if expected != data.len() {
            return Err(CodecError::LengthMismatch {
                shape,
                dtype,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, shape, dtype })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the array, returning `(shape, dtype, data)`.
    pub fn into_parts(self) -> (Vec<usize>, DType, Vec<u8>) {
        (self.shape, self.dtype, self.data)
    }

    /// Lowercase hex SHA-256 of the raw element bytes.
    pub fn digest_hex(&self) -> String {
        format!("{:x}", Sha256::digest(&self.data))
    }
}

/// Byte length implied by `shape` and `dtype`.
fn byte_len(shape: &[usize], dtype: DType) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|count| count.checked_mul(dtype.size()))
        .ok_or_else(|| CodecError::ShapeOverflow {
            shape: shape.to_vec(),
        })
}

// ============================================================================
// Codec Entry Points
// ============================================================================

/// Encode raw parts into an [`Array`].
///
/// `dims` are taken as they appear on the wire; negative values are rejected.
pub fn encode(dims: &[i64], dtype: &str, data: Vec<u8>) -> Result<Array> {
    let dtype: DType = dtype.parse()?;
    let shape = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| {
            usize::try_from(dim).map_err(|_| CodecError::NegativeDimension { axis, dim })
        })
        .collect::<Result<Vec<_>>>()?;
    Array::new(shape, dtype, data)
}

/// Decode an [`Array`] into `(shape, dtype tag, data)`.
pub fn decode(array: Array) -> (Vec<usize>, &'static str, Vec<u8>) {
    let (shape, dtype, data) = array.into_parts();
    (shape, dtype.as_str(), data)
}

// ============================================================================
// Tests
// ============================================================================
