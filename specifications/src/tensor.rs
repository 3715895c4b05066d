//  TENSOR.rs
//    by Lut99
//
//  Created:
//    14 Mar 2024, 10:41:17
//  Last edited:
//    30 Jul 2024, 17:02:56
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the tensor data model shared by the frontends and the
//!   dispatcher core. A tensor is a dtype tag, a shape and either a
//!   contiguous little-endian byte buffer (numeric dtypes) or a list of
//!   byte strings (string/bytes dtypes). Tensors are immutable once
//!   constructed.
//

use std::fmt::{Display, Formatter, Result as FResult};

use enum_debug::EnumDebug;


/***** ERRORS *****/
/// Errors that relate to constructing [`Tensor`]s.
#[derive(Debug)]
pub enum TensorError {
    /// The packed buffer does not match `element_count * itemsize`.
    DataSizeMismatch { dtype: DataType, expected: usize, got: usize },
    /// The number of byte-string elements does not match the shape's element count.
    ElementCountMismatch { expected: usize, got: usize },
    /// The shape contains a negative dimension.
    NegativeDimension { shape: Vec<i64> },
    /// A packed buffer was given for a string/bytes dtype (or vice versa).
    IllegalDataKind { dtype: DataType, packed: bool },
}
impl Display for TensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use TensorError::*;
        match self {
            DataSizeMismatch { dtype, expected, got } => {
                write!(f, "Data size {got} does not match expected size {expected} of a {} tensor", dtype.variant())
            },
            ElementCountMismatch { expected, got } => write!(f, "Got {got} byte-string elements, expected {expected}"),
            NegativeDimension { shape } => write!(f, "Shape {shape:?} contains a negative dimension"),
            IllegalDataKind { dtype, packed } => {
                write!(f, "A {} buffer cannot carry a {} tensor", if *packed { "packed" } else { "byte-string" }, dtype.variant())
            },
        }
    }
}
impl std::error::Error for TensorError {}





/***** AUXILLARY *****/
/// The closed set of element types a [`Tensor`] may have.
#[derive(Clone, Copy, Debug, EnumDebug, Eq, Hash, PartialEq)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    Bytes,
    String,
}
impl DataType {
    /// Returns the size in bytes of a single element of this type.
    ///
    /// Note that [`DataType::Bytes`] and [`DataType::String`] elements are variable-sized; for those, this function returns 0.
    #[inline]
    pub fn itemsize(&self) -> usize {
        use DataType::*;
        match self {
            Bool | Int8 | Uint8 => 1,
            Int16 | Uint16 | Float16 => 2,
            Int32 | Uint32 | Float32 => 4,
            Int64 | Uint64 | Float64 => 8,
            Bytes | String => 0,
        }
    }

    /// Returns whether this type is packed into a contiguous buffer (as opposed to a list of byte strings).
    #[inline]
    pub fn is_packed(&self) -> bool { !matches!(self, Self::Bytes | Self::String) }

    /// Attempts to parse the given REST-side type name (e.g., `"int16"`, `"fp32"`, `"str"`) into a DataType.
    ///
    /// # Arguments
    /// - `name`: The name to parse.
    ///
    /// # Returns
    /// The matching DataType, or else [`None`] if the name is unknown.
    pub fn from_rest_name(name: &str) -> Option<Self> {
        use DataType::*;
        match name {
            "bool" => Some(Bool),
            "int8" => Some(Int8),
            "int16" => Some(Int16),
            "int32" => Some(Int32),
            "int64" => Some(Int64),
            "uint8" => Some(Uint8),
            "uint16" => Some(Uint16),
            "uint32" => Some(Uint32),
            "uint64" => Some(Uint64),
            "fp16" | "float16" => Some(Float16),
            "fp32" | "float32" => Some(Float32),
            "fp64" | "float64" => Some(Float64),
            "bytes" => Some(Bytes),
            "str" => Some(String),
            _ => None,
        }
    }

    /// Returns the canonical REST-side name of this type.
    pub fn rest_name(&self) -> &'static str {
        use DataType::*;
        match self {
            Bool => "bool",
            Int8 => "int8",
            Int16 => "int16",
            Int32 => "int32",
            Int64 => "int64",
            Uint8 => "uint8",
            Uint16 => "uint16",
            Uint32 => "uint32",
            Uint64 => "uint64",
            Float16 => "float16",
            Float32 => "float32",
            Float64 => "float64",
            Bytes => "bytes",
            String => "str",
        }
    }
}



/// The payload of a [`Tensor`].
#[derive(Clone, Debug, EnumDebug, Eq, PartialEq)]
pub enum TensorData {
    /// Contiguous little-endian elements, for the numeric dtypes.
    Packed(Vec<u8>),
    /// One byte string per element, for [`DataType::Bytes`] / [`DataType::String`].
    Elements(Vec<Vec<u8>>),
}





/***** HELPER MACROS *****/
/// Implements a typed constructor and accessor pair on [`Tensor`] for the given primitive.
macro_rules! typed_accessors {
    ($from:ident, $to:ident, $ty:ty, $dtype:ident) => {
        /// Constructor for a Tensor that packs the given typed values.
        ///
        /// # Arguments
        /// - `shape`: The shape of the new tensor. The product of its dimensions must equal `values.len()`.
        /// - `values`: The elements of the new tensor, in row-major order.
        ///
        /// # Errors
        /// This function errors if the shape does not match the number of values given.
        pub fn $from(shape: impl Into<Vec<i64>>, values: &[$ty]) -> Result<Self, TensorError> {
            let mut data: Vec<u8> = Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
            for value in values {
                data.extend_from_slice(&value.to_le_bytes());
            }
            Self::new_packed(DataType::$dtype, shape, data)
        }

        /// Decodes this tensor's buffer as typed values.
        ///
        /// # Returns
        /// The decoded elements in row-major order, or [`None`] if this tensor is of another dtype.
        pub fn $to(&self) -> Option<Vec<$ty>> {
            if self.dtype != DataType::$dtype {
                return None;
            }
            match &self.data {
                TensorData::Packed(data) => {
                    Some(data.chunks_exact(std::mem::size_of::<$ty>()).map(|b| <$ty>::from_le_bytes(b.try_into().unwrap())).collect())
                },
                TensorData::Elements(_) => None,
            }
        }
    };
}





/***** LIBRARY *****/
/// Defines a single tensor: a dtype, a shape and the matching payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// The element type.
    dtype: DataType,
    /// The shape, as an ordered list of dimensions.
    shape: Vec<i64>,
    /// The payload, matching the dtype's representation.
    data:  TensorData,
}
impl Tensor {
    /// Constructor for a Tensor with a packed (numeric) payload.
    ///
    /// # Arguments
    /// - `dtype`: The (numeric) element type.
    /// - `shape`: The shape of the new tensor.
    /// - `data`: The little-endian packed elements.
    ///
    /// # Errors
    /// This function errors if the dtype is not packed, the shape has negative dimensions or the buffer size does not equal
    /// `element_count * itemsize`.
    pub fn new_packed(dtype: DataType, shape: impl Into<Vec<i64>>, data: impl Into<Vec<u8>>) -> Result<Self, TensorError> {
        let shape: Vec<i64> = shape.into();
        let data: Vec<u8> = data.into();
        if !dtype.is_packed() {
            return Err(TensorError::IllegalDataKind { dtype, packed: true });
        }
        let count: usize = Self::count_elements(&shape)?;
        let expected: usize = count * dtype.itemsize();
        if data.len() != expected {
            return Err(TensorError::DataSizeMismatch { dtype, expected, got: data.len() });
        }
        Ok(Self { dtype, shape, data: TensorData::Packed(data) })
    }

    /// Constructor for a Tensor with a byte-string payload.
    ///
    /// # Arguments
    /// - `dtype`: Either [`DataType::Bytes`] or [`DataType::String`].
    /// - `shape`: The shape of the new tensor.
    /// - `elements`: The byte-string elements, one per logical element.
    ///
    /// # Errors
    /// This function errors if the dtype is a packed one, the shape has negative dimensions or the number of elements does not match the shape.
    pub fn new_elements(dtype: DataType, shape: impl Into<Vec<i64>>, elements: impl Into<Vec<Vec<u8>>>) -> Result<Self, TensorError> {
        let shape: Vec<i64> = shape.into();
        let elements: Vec<Vec<u8>> = elements.into();
        if dtype.is_packed() {
            return Err(TensorError::IllegalDataKind { dtype, packed: false });
        }
        let count: usize = Self::count_elements(&shape)?;
        if elements.len() != count {
            return Err(TensorError::ElementCountMismatch { expected: count, got: elements.len() });
        }
        Ok(Self { dtype, shape, data: TensorData::Elements(elements) })
    }

    /// Computes the number of elements implied by the given shape.
    ///
    /// # Errors
    /// This function errors if any dimension is negative.
    fn count_elements(shape: &[i64]) -> Result<usize, TensorError> {
        let mut count: usize = 1;
        for dim in shape {
            if *dim < 0 {
                return Err(TensorError::NegativeDimension { shape: shape.to_vec() });
            }
            count *= *dim as usize;
        }
        Ok(count)
    }

    // Typed constructors / accessors for the numeric dtypes the frontends work with.
    typed_accessors!(from_i8, to_i8_vec, i8, Int8);
    typed_accessors!(from_i16, to_i16_vec, i16, Int16);
    typed_accessors!(from_i32, to_i32_vec, i32, Int32);
    typed_accessors!(from_i64, to_i64_vec, i64, Int64);
    typed_accessors!(from_u8, to_u8_vec, u8, Uint8);
    typed_accessors!(from_u16, to_u16_vec, u16, Uint16);
    typed_accessors!(from_u32, to_u32_vec, u32, Uint32);
    typed_accessors!(from_u64, to_u64_vec, u64, Uint64);
    typed_accessors!(from_f32, to_f32_vec, f32, Float32);
    typed_accessors!(from_f64, to_f64_vec, f64, Float64);

    /// Constructor for a boolean Tensor.
    ///
    /// # Errors
    /// This function errors if the shape does not match the number of values given.
    pub fn from_bool(shape: impl Into<Vec<i64>>, values: &[bool]) -> Result<Self, TensorError> {
        let data: Vec<u8> = values.iter().map(|b| u8::from(*b)).collect();
        Self::new_packed(DataType::Bool, shape, data)
    }

    /// Decodes this tensor's buffer as booleans, or [`None`] if it is of another dtype.
    pub fn to_bool_vec(&self) -> Option<Vec<bool>> {
        if self.dtype != DataType::Bool {
            return None;
        }
        match &self.data {
            TensorData::Packed(data) => Some(data.iter().map(|b| *b != 0).collect()),
            TensorData::Elements(_) => None,
        }
    }

    /// Returns the element type of this tensor.
    #[inline]
    pub fn dtype(&self) -> DataType { self.dtype }

    /// Returns the shape of this tensor.
    #[inline]
    pub fn shape(&self) -> &[i64] { &self.shape }

    /// Returns the number of elements in this tensor.
    #[inline]
    pub fn element_count(&self) -> usize {
        // Safe, since the constructors reject negative dimensions
        self.shape.iter().product::<i64>() as usize
    }

    /// Returns the payload of this tensor.
    #[inline]
    pub fn data(&self) -> &TensorData { &self.data }

    /// Returns the packed buffer of this tensor, if it is a numeric one.
    #[inline]
    pub fn packed_data(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::Packed(data) => Some(data),
            TensorData::Elements(_) => None,
        }
    }

    /// Returns the byte-string elements of this tensor, if it is a string/bytes one.
    #[inline]
    pub fn elements(&self) -> Option<&[Vec<u8>]> {
        match &self.data {
            TensorData::Packed(_) => None,
            TensorData::Elements(elements) => Some(elements),
        }
    }

    /// Consumes this tensor into its parts.
    #[inline]
    pub fn into_parts(self) -> (DataType, Vec<i64>, TensorData) { (self.dtype, self.shape, self.data) }
}
