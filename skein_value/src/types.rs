//! Element types, scalar values, and host-side tensors.

use serde::{Deserialize, Serialize};

use crate::error::ValueError;
use crate::layout::MemoryLayout;

/// The closed set of element types that may flow through a graph or an
/// emitted module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementType {
    /// Boolean.
    Bool,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Bool | Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Returns true for `F32`/`F64`.
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Returns true for the signed integer types.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Returns true if arithmetic is defined for this type.
    pub fn is_numeric(self) -> bool {
        self.is_float() || self.is_integer()
    }

    /// Short lowercase name, used in decorated function names and archives.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Inverse of [`ElementType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "f32" => Self::F32,
            "f64" => Self::F64,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single value of one of the element types.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Scalar {
    /// Boolean value.
    Bool(bool),
    /// `i8` value.
    I8(i8),
    /// `i16` value.
    I16(i16),
    /// `i32` value.
    I32(i32),
    /// `i64` value.
    I64(i64),
    /// `f32` value.
    F32(f32),
    /// `f64` value.
    F64(f64),
}

impl Scalar {
    /// The element type of this scalar.
    pub fn element_type(self) -> ElementType {
        match self {
            Self::Bool(_) => ElementType::Bool,
            Self::I8(_) => ElementType::I8,
            Self::I16(_) => ElementType::I16,
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
        }
    }

    /// The zero (or `false`) value of the given type.
    pub fn zero(ty: ElementType) -> Self {
        match ty {
            ElementType::Bool => Self::Bool(false),
            ElementType::I8 => Self::I8(0),
            ElementType::I16 => Self::I16(0),
            ElementType::I32 => Self::I32(0),
            ElementType::I64 => Self::I64(0),
            ElementType::F32 => Self::F32(0.0),
            ElementType::F64 => Self::F64(0.0),
        }
    }

    /// Widens to `f64`, for numeric types.
    pub fn as_f64(self) -> Option<f64> {
        Some(match self {
            Self::Bool(_) => return None,
            Self::I8(v) => v as f64,
            Self::I16(v) => v as f64,
            Self::I32(v) => v as f64,
            Self::I64(v) => v as f64,
            Self::F32(v) => v as f64,
            Self::F64(v) => v,
        })
    }

    /// Widens to `i64`, for integer types.
    pub fn as_i64(self) -> Option<i64> {
        Some(match self {
            Self::I8(v) => v as i64,
            Self::I16(v) => v as i64,
            Self::I32(v) => v as i64,
            Self::I64(v) => v,
            _ => return None,
        })
    }

    /// Boolean payload, for `Bool` scalars.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Narrows an `f64` into the given numeric type.
    pub fn from_f64(ty: ElementType, v: f64) -> Option<Self> {
        Some(match ty {
            ElementType::Bool => return None,
            ElementType::I8 => Self::I8(v as i8),
            ElementType::I16 => Self::I16(v as i16),
            ElementType::I32 => Self::I32(v as i32),
            ElementType::I64 => Self::I64(v as i64),
            ElementType::F32 => Self::F32(v as f32),
            ElementType::F64 => Self::F64(v),
        })
    }

    /// Narrows an `i64` into the given type. Floats round-trip through `f64`.
    pub fn from_i64(ty: ElementType, v: i64) -> Option<Self> {
        Some(match ty {
            ElementType::Bool => return None,
            ElementType::I8 => Self::I8(v as i8),
            ElementType::I16 => Self::I16(v as i16),
            ElementType::I32 => Self::I32(v as i32),
            ElementType::I64 => Self::I64(v),
            ElementType::F32 => Self::F32(v as f32),
            ElementType::F64 => Self::F64(v as f64),
        })
    }
}

/// Maps Rust element types onto [`ElementType`] tags. Implemented for exactly
/// the closed set of supported types.
pub trait HostElement: Copy + Default + 'static {
    /// The tag for this Rust type.
    const ELEMENT_TYPE: ElementType;

    /// Wraps a value as a [`Scalar`].
    fn to_scalar(self) -> Scalar;
    /// Unwraps a [`Scalar`], if the tag matches.
    fn from_scalar(scalar: Scalar) -> Option<Self>;
}

macro_rules! impl_host_element {
    ( $( $rust:ty => $variant:ident, )* ) => {
        $(
            impl HostElement for $rust {
                const ELEMENT_TYPE: ElementType = ElementType::$variant;

                fn to_scalar(self) -> Scalar {
                    Scalar::$variant(self)
                }
                fn from_scalar(scalar: Scalar) -> Option<Self> {
                    match scalar {
                        Scalar::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}
impl_host_element![
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
];

/// Type-erased host storage for a rectangle of elements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    /// Boolean storage.
    Bool(Vec<bool>),
    /// `i8` storage.
    I8(Vec<i8>),
    /// `i16` storage.
    I16(Vec<i16>),
    /// `i32` storage.
    I32(Vec<i32>),
    /// `i64` storage.
    I64(Vec<i64>),
    /// `f32` storage.
    F32(Vec<f32>),
    /// `f64` storage.
    F64(Vec<f64>),
}

impl Buffer {
    /// A zero-filled buffer of `len` elements of the given type.
    pub fn zeros(ty: ElementType, len: usize) -> Self {
        match ty {
            ElementType::Bool => Self::Bool(vec![false; len]),
            ElementType::I8 => Self::I8(vec![0; len]),
            ElementType::I16 => Self::I16(vec![0; len]),
            ElementType::I32 => Self::I32(vec![0; len]),
            ElementType::I64 => Self::I64(vec![0; len]),
            ElementType::F32 => Self::F32(vec![0.0; len]),
            ElementType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    /// Wraps a typed vector.
    pub fn from_vec<T: HostElement>(values: Vec<T>) -> Self {
        let mut buffer = Self::zeros(T::ELEMENT_TYPE, values.len());
        for (i, v) in values.into_iter().enumerate() {
            buffer.set(i, v.to_scalar());
        }
        buffer
    }

    /// Element type tag of this buffer.
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Bool(_) => ElementType::Bool,
            Self::I8(_) => ElementType::I8,
            Self::I16(_) => ElementType::I16,
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// Returns true if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads element `index`. Panics if out of bounds.
    pub fn get(&self, index: usize) -> Scalar {
        match self {
            Self::Bool(v) => Scalar::Bool(v[index]),
            Self::I8(v) => Scalar::I8(v[index]),
            Self::I16(v) => Scalar::I16(v[index]),
            Self::I32(v) => Scalar::I32(v[index]),
            Self::I64(v) => Scalar::I64(v[index]),
            Self::F32(v) => Scalar::F32(v[index]),
            Self::F64(v) => Scalar::F64(v[index]),
        }
    }

    /// Writes element `index`. Panics if out of bounds or if the scalar's
    /// type does not match the buffer's.
    pub fn set(&mut self, index: usize, value: Scalar) {
        match (self, value) {
            (Self::Bool(v), Scalar::Bool(x)) => v[index] = x,
            (Self::I8(v), Scalar::I8(x)) => v[index] = x,
            (Self::I16(v), Scalar::I16(x)) => v[index] = x,
            (Self::I32(v), Scalar::I32(x)) => v[index] = x,
            (Self::I64(v), Scalar::I64(x)) => v[index] = x,
            (Self::F32(v), Scalar::F32(x)) => v[index] = x,
            (Self::F64(v), Scalar::F64(x)) => v[index] = x,
            (buffer, value) => panic!(
                "stored {} into a {} buffer",
                value.element_type(),
                buffer.element_type()
            ),
        }
    }

    /// Copies out as a typed vector, if the tag matches.
    pub fn to_vec<T: HostElement>(&self) -> Option<Vec<T>> {
        if self.element_type() != T::ELEMENT_TYPE {
            return None;
        }
        Some((0..self.len()).map(|i| T::from_scalar(self.get(i)).unwrap()).collect())
    }
}

/// A host-side tensor: a buffer plus the memory layout describing it.
///
/// Tensors are what flows across the compiled artifact's boundary
/// (`set_input` / `get_output`) and what node reference semantics compute on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    buffer: Buffer,
    layout: MemoryLayout,
}

impl Tensor {
    /// A zero tensor with the given layout.
    pub fn zeros(ty: ElementType, layout: MemoryLayout) -> Self {
        let len = layout.allocated_size();
        Self {
            buffer: Buffer::zeros(ty, len),
            layout,
        }
    }

    /// A one-dimensional canonical tensor from a vector.
    pub fn from_vec<T: HostElement>(values: Vec<T>) -> Self {
        let layout = MemoryLayout::vector(values.len());
        Self {
            buffer: Buffer::from_vec(values),
            layout,
        }
    }

    /// Wraps a buffer with an explicit layout.
    pub fn from_buffer(buffer: Buffer, layout: MemoryLayout) -> Result<Self, ValueError> {
        if buffer.len() != layout.allocated_size() {
            return Err(ValueError::LayoutSize {
                expected: layout.allocated_size(),
                actual: buffer.len(),
            });
        }
        Ok(Self { buffer, layout })
    }

    /// The element type.
    pub fn element_type(&self) -> ElementType {
        self.buffer.element_type()
    }

    /// The memory layout.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// The raw backing buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The raw backing buffer, mutably.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Consumes the tensor, returning the backing buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }

    /// Reads the element at a logical index vector.
    pub fn get(&self, index: &[usize]) -> Scalar {
        self.buffer.get(self.layout.flat_offset(index))
    }

    /// Writes the element at a logical index vector.
    pub fn set(&mut self, index: &[usize], value: Scalar) {
        let offset = self.layout.flat_offset(index);
        self.buffer.set(offset, value);
    }

    /// Copies the active elements out in logical row-major order.
    pub fn to_vec<T: HostElement>(&self) -> Option<Vec<T>> {
        if self.element_type() != T::ELEMENT_TYPE {
            return None;
        }
        let mut out = Vec::with_capacity(self.layout.active_count());
        for index in self.layout.active_indices() {
            out.push(T::from_scalar(self.get(&index)).unwrap());
        }
        Some(out)
    }

    /// Fills the active region from logical row-major values.
    pub fn fill_from<T: HostElement>(&mut self, values: &[T]) -> Result<(), ValueError> {
        if self.element_type() != T::ELEMENT_TYPE {
            return Err(ValueError::ElementType {
                expected: self.element_type(),
                actual: T::ELEMENT_TYPE,
            });
        }
        if values.len() != self.layout.active_count() {
            return Err(ValueError::LayoutSize {
                expected: self.layout.active_count(),
                actual: values.len(),
            });
        }
        let indices: Vec<_> = self.layout.active_indices().collect();
        for (index, v) in indices.into_iter().zip(values) {
            self.set(&index, v.to_scalar());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        assert_eq!(Some(3.5), Scalar::F64(3.5).as_f64());
        assert_eq!(Some(-2), Scalar::I16(-2).as_i64());
        assert_eq!(None, Scalar::Bool(true).as_f64());
        assert_eq!(Scalar::I32(7), Scalar::from_i64(ElementType::I32, 7).unwrap());
    }

    #[test]
    fn buffer_get_set() {
        let mut buffer = Buffer::zeros(ElementType::F32, 4);
        buffer.set(2, Scalar::F32(1.5));
        assert_eq!(Scalar::F32(1.5), buffer.get(2));
        assert_eq!(Scalar::F32(0.0), buffer.get(0));
    }

    #[test]
    #[should_panic(expected = "stored f64 into a f32 buffer")]
    fn buffer_set_wrong_type_panics() {
        let mut buffer = Buffer::zeros(ElementType::F32, 1);
        buffer.set(0, Scalar::F64(1.0));
    }

    #[test]
    fn tensor_vector_round_trip() {
        let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
        assert_eq!(ElementType::F32, tensor.element_type());
        assert_eq!(Some(vec![1.0f32, 2.0, 3.0]), tensor.to_vec::<f32>());
        assert_eq!(None, tensor.to_vec::<f64>());
    }

    #[test]
    fn tensor_indexing_uses_layout() {
        let layout = MemoryLayout::canonical(&[2, 3]);
        let mut tensor = Tensor::zeros(ElementType::I32, layout);
        tensor.set(&[1, 2], Scalar::I32(42));
        assert_eq!(Scalar::I32(42), tensor.get(&[1, 2]));
        assert_eq!(Scalar::I32(0), tensor.get(&[0, 2]));
    }
}
