//! The type system of the IR.
//!
//! Types come in three families that are legal at different points in the
//! pipeline:
//!
//! - **Scalars** are legal everywhere.
//! - **Tensors** are only legal before tensor lowering, after which every
//!   tensor has been assigned a buffer.
//! - **Slices** describe a byte range of a buffer, and are legal from tensor
//!   lowering up to the final lowering to LLVM, which turns them into
//!   [`Type::Ptr`].

use std::fmt::{Display, Formatter};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{affine::AffineExpr, ids::BufferId};

/// The scalar numeric types.
///
/// # Value Semantics
///
/// It is intended that this type is used as having value semantics, and not
/// ever have a reference returned to it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// The boolean type.
    I1,

    /// The 8-bit wide integer type.
    I8,

    /// The 16-bit wide integer type.
    I16,

    /// The 32-bit wide integer type.
    I32,

    /// The 64-bit wide integer type.
    I64,

    /// The target-sized integer used for indexing, treated as 64 bits wide.
    Index,

    /// The IEEE-754 `binary16` floating point type.
    F16,

    /// The brain floating point type: the upper half of an IEEE-754
    /// `binary32`.
    BF16,

    /// The IEEE-754 `binary32` floating point type.
    F32,

    /// The IEEE-754 `binary64` floating point type.
    F64,
}

impl ScalarType {
    /// Gets the width of the type in bits.
    #[must_use]
    pub fn bit_width(self) -> u32 {
        match self {
            Self::I1 => 1,
            Self::I8 => 8,
            Self::I16 | Self::F16 | Self::BF16 => 16,
            Self::I32 | Self::F32 => 32,
            Self::I64 | Self::Index | Self::F64 => 64,
        }
    }

    /// Gets the number of bytes that a value of this type occupies in memory.
    #[must_use]
    pub fn byte_size(self) -> u64 {
        u64::from(self.bit_width().div_ceil(8))
    }

    /// Returns `true` if the type is a floating point type.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Returns `true` if the type is an integer type, including `index`.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    /// Gets the integer type with the same width as `self`, which is the type
    /// that a bitcast of `self` produces.
    #[must_use]
    pub fn same_width_integer(self) -> Self {
        match self.bit_width() {
            1 => Self::I1,
            8 => Self::I8,
            16 => Self::I16,
            32 => Self::I32,
            _ => Self::I64,
        }
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::I1 => "i1",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Index => "index",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        write!(f, "{name}")
    }
}

/// A single dimension of a tensor shape.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Dim {
    /// A dimension with an extent known at compile time.
    Static(u64),

    /// A dimension whose extent is only known at runtime.
    ///
    /// If `bound` is present, the extent is guaranteed to never exceed it, and
    /// storage can be laid out as if the dimension had that extent.
    Dynamic { bound: Option<u64> },
}

impl Dim {
    /// Gets the largest extent that the dimension can have, if it is bounded.
    #[must_use]
    pub fn extent_bound(self) -> Option<u64> {
        match self {
            Self::Static(extent) => Some(extent),
            Self::Dynamic { bound } => bound,
        }
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(extent) => write!(f, "{extent}"),
            Self::Dynamic { bound: Some(bound) } => write!(f, "?<={bound}"),
            Self::Dynamic { bound: None } => write!(f, "?"),
        }
    }
}

/// A value-semantic multidimensional array of scalars.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct TensorType {
    /// The dimensions of the tensor, outermost first.
    pub shape: Vec<Dim>,

    /// The type of each element of the tensor.
    pub element: ScalarType,
}

impl TensorType {
    /// Creates a tensor type with a fully static `shape`.
    #[must_use]
    pub fn new(shape: &[u64], element: ScalarType) -> Self {
        let shape = shape.iter().copied().map(Dim::Static).collect();
        Self { shape, element }
    }

    /// Gets the extent of every dimension, using the bound of each dynamic
    /// dimension, or [`None`] if some dimension is unbounded.
    #[must_use]
    pub fn extents(&self) -> Option<Vec<u64>> {
        self.shape.iter().map(|d| d.extent_bound()).collect()
    }

    /// Gets the row-major stride of every dimension in elements, or [`None`]
    /// if some dimension is unbounded.
    #[must_use]
    pub fn strides(&self) -> Option<Vec<u64>> {
        let extents = self.extents()?;
        let mut strides = vec![1u64; extents.len()];
        for i in (0..extents.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1].checked_mul(extents[i + 1])?;
        }
        Some(strides)
    }

    /// Gets the number of bytes required to store the tensor, or [`None`] if
    /// some dimension is unbounded.
    #[must_use]
    pub fn byte_size(&self) -> Option<u64> {
        self.extents()?
            .into_iter()
            .try_fold(self.element.byte_size(), u64::checked_mul)
    }
}

impl Display for TensorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dims = self.shape.iter().map(ToString::to_string).join("x");
        if dims.is_empty() {
            write!(f, "tensor<{}>", self.element)
        } else {
            write!(f, "tensor<{dims}x{}>", self.element)
        }
    }
}

/// The offset of a slice from the start of its buffer, in bytes.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SliceOffset {
    /// The offset has not been computed yet.
    #[default]
    Pending,

    /// The offset is given by the affine expression, over the function's index
    /// values and join symbols.
    Affine(AffineExpr),

    /// The offset could not be expressed in closed form. Opaque slices never
    /// take part in merging.
    Opaque,
}

impl SliceOffset {
    /// Gets the affine offset expression if it has been resolved.
    #[must_use]
    pub fn as_affine(&self) -> Option<&AffineExpr> {
        match self {
            Self::Affine(expr) => Some(expr),
            _ => None,
        }
    }
}

impl Display for SliceOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "?"),
            Self::Affine(expr) => write!(f, "{expr}"),
            Self::Opaque => write!(f, "opaque"),
        }
    }
}

/// A byte range within a buffer from the module's allocation table.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SliceType {
    /// The buffer that backs the slice.
    pub buffer: BufferId,

    /// The offset of the slice within its buffer.
    pub offset: SliceOffset,

    /// The length of the slice in bytes.
    pub length: u64,

    /// The type of the scalars stored in the slice.
    pub element: ScalarType,
}

impl SliceType {
    /// Creates a new slice type whose offset has not yet been computed.
    #[must_use]
    pub fn new(buffer: BufferId, length: u64, element: ScalarType) -> Self {
        let offset = SliceOffset::Pending;
        Self {
            buffer,
            offset,
            length,
            element,
        }
    }

    /// Returns `true` if `self` and `other` describe storage of the same
    /// buffer with the same length, ignoring their offsets.
    ///
    /// This is the notion of type equality used at control-flow merge points,
    /// where offsets are allowed to differ.
    #[must_use]
    pub fn same_storage(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.length == other.length && self.element == other.element
    }
}

impl Display for SliceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slice<{}[{}; {}], {}>",
            self.buffer, self.offset, self.length, self.element
        )
    }
}

/// The type of a value in the IR.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Type {
    /// A scalar number.
    Scalar(ScalarType),

    /// A value-semantic tensor.
    Tensor(TensorType),

    /// A range of bytes within a buffer.
    Slice(SliceType),

    /// An opaque pointer, as used by the LLVM instruction vocabulary.
    Ptr,
}

impl Type {
    /// The `index` type.
    pub const INDEX: Type = Type::Scalar(ScalarType::Index);

    /// The `i1` type.
    pub const I1: Type = Type::Scalar(ScalarType::I1);

    /// Creates a scalar type.
    #[must_use]
    pub fn scalar(scalar: ScalarType) -> Self {
        Self::Scalar(scalar)
    }

    /// Creates a statically-shaped tensor type.
    #[must_use]
    pub fn tensor(shape: &[u64], element: ScalarType) -> Self {
        Self::Tensor(TensorType::new(shape, element))
    }

    /// Gets the scalar type if `self` is a scalar.
    #[must_use]
    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    /// Gets the tensor type if `self` is a tensor.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Gets the slice type if `self` is a slice.
    #[must_use]
    pub fn as_slice(&self) -> Option<&SliceType> {
        match self {
            Self::Slice(s) => Some(s),
            _ => None,
        }
    }

    /// Gets the slice type mutably if `self` is a slice.
    pub fn as_slice_mut(&mut self) -> Option<&mut SliceType> {
        match self {
            Self::Slice(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if the type is a tensor.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    /// Returns `true` if the type is an index or integer type.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        self.as_scalar().is_some_and(ScalarType::is_integer)
    }

    /// Returns `true` if values of the two types can flow into one another at
    /// a control-flow merge point.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Slice(a), Self::Slice(b)) => a.same_storage(b),
            _ => self == other,
        }
    }
}

impl From<ScalarType> for Type {
    fn from(value: ScalarType) -> Self {
        Self::Scalar(value)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Tensor(t) => write!(f, "{t}"),
            Self::Slice(s) => write!(f, "{s}"),
            Self::Ptr => write!(f, "ptr"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::types::{Dim, ScalarType, SliceType, TensorType, Type};

    #[test]
    fn strides_are_row_major() {
        let ty = TensorType::new(&[2, 3, 4], ScalarType::F32);
        assert_eq!(ty.strides(), Some(vec![12, 4, 1]));
        assert_eq!(ty.byte_size(), Some(96));
    }

    #[test]
    fn bounded_dynamic_dims_use_their_bound() {
        let ty = TensorType {
            shape:   vec![Dim::Dynamic { bound: Some(8) }, Dim::Static(2)],
            element: ScalarType::BF16,
        };
        assert_eq!(ty.byte_size(), Some(32));
        assert_eq!(ty.to_string(), "tensor<?<=8x2xbf16>");
    }

    #[test]
    fn unbounded_dynamic_dims_have_no_size() {
        let ty = TensorType {
            shape:   vec![Dim::Dynamic { bound: None }],
            element: ScalarType::I8,
        };
        assert_eq!(ty.byte_size(), None);
        assert_eq!(ty.strides(), None);
    }

    #[test]
    fn slices_are_compatible_regardless_of_offset() {
        let mut a = SliceType::new(1usize.into(), 16, ScalarType::F32);
        let b = a.clone();
        a.offset = crate::types::SliceOffset::Opaque;
        assert!(Type::Slice(a).is_compatible_with(&Type::Slice(b)));
    }

    #[test]
    fn bool_occupies_a_byte() {
        assert_eq!(ScalarType::I1.byte_size(), 1);
        assert_eq!(ScalarType::Index.byte_size(), 8);
        assert_eq!(ScalarType::BF16.same_width_integer(), ScalarType::I16);
    }
}
