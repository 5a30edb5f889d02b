//! Element types and tensor literal values.

use crate::tensor::Tensor;

/// Enum specifying the element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DataType {
    Float,
    Int32,
    Int8,
    UInt8,
}

impl DataType {
    /// Return the size of elements of this type in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Int32 | DataType::Float => 4,
            DataType::Int8 | DataType::UInt8 => 1,
        }
    }
}

impl std::fmt::Display for DataType {
    /// Format this enum value in the style of the corresponding Rust type
    /// (eg. "i32" for `DataType::Int32`).
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DataType::Float => "f32",
                DataType::Int32 => "i32",
                DataType::Int8 => "i8",
                DataType::UInt8 => "u8",
            }
        )
    }
}

/// Get the [`DataType`] that corresponds to a given Rust type.
pub trait DataTypeOf {
    fn dtype_of() -> DataType;
}

macro_rules! impl_data_type_of {
    ($type:ty, $dtype:ident) => {
        impl DataTypeOf for $type {
            fn dtype_of() -> DataType {
                DataType::$dtype
            }
        }
    };
}

impl_data_type_of!(f32, Float);
impl_data_type_of!(i32, Int32);
impl_data_type_of!(i8, Int8);
impl_data_type_of!(u8, UInt8);

/// A tensor literal, used for graph constants and interpreter results.
///
/// Boolean masks (eg. the outputs of comparison operators) are stored as
/// `u8` tensors containing zeros and ones.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(Tensor<f32>),
    Int32(Tensor<i32>),
    Mask(Tensor<u8>),
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int32(_) => DataType::Int32,
            Value::Mask(_) => DataType::UInt8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(t) => t.shape(),
            Value::Int32(t) => t.shape(),
            Value::Mask(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Return the single element of a zero-rank or single-element float
    /// tensor.
    pub fn item_f32(&self) -> Option<f32> {
        match self {
            Value::Float(t) => t.item().copied(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&Tensor<f32>> {
        match self {
            Value::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&Tensor<i32>> {
        match self {
            Value::Int32(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_mask(&self) -> Option<&Tensor<u8>> {
        match self {
            Value::Mask(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Tensor<f32>> for Value {
    fn from(t: Tensor<f32>) -> Value {
        Value::Float(t)
    }
}

impl From<Tensor<i32>> for Value {
    fn from(t: Tensor<i32>) -> Value {
        Value::Int32(t)
    }
}

impl From<Tensor<u8>> for Value {
    fn from(t: Tensor<u8>) -> Value {
        Value::Mask(t)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::Float(Tensor::from_scalar(x))
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Value {
        Value::Int32(Tensor::from_scalar(x))
    }
}
