//! Element type tags on both sides of the boundary and the table between them

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::CN_MAX;

/// Element type of a host runtime array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
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
    Complex64,
    Complex128,
}

impl ElementType {
    /// Size of one element in bytes
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
        }
    }

    pub const fn name(self) -> &'static str {
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
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-channel element depth of a native matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Depth {
    U8,
    S8,
    U16,
    S16,
    S32,
    F32,
    F64,
}

impl Depth {
    pub const ALL: [Self; 7] = [
        Self::U8,
        Self::S8,
        Self::U16,
        Self::S16,
        Self::S32,
        Self::F32,
        Self::F64,
    ];

    /// Size of one channel value in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "8U",
            Self::S8 => "8S",
            Self::U16 => "16U",
            Self::S16 => "16S",
            Self::S32 => "32S",
            Self::F32 => "32F",
            Self::F64 => "64F",
        }
    }

    /// Host element type storing this depth. Every depth has one.
    pub const fn element_type(self) -> ElementType {
        DEPTH_TABLE[self as usize].1
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Depth plus channel count, the full element type of a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatType {
    depth: Depth,
    channels: usize,
}

impl MatType {
    pub fn new(depth: Depth, channels: usize) -> Result<Self> {
        if channels == 0 || channels > CN_MAX {
            return Err(BridgeError::InvalidMatrix(format!(
                "channel count {channels} outside 1..={CN_MAX}"
            )));
        }
        Ok(Self { depth, channels })
    }

    pub const fn single(depth: Depth) -> Self {
        Self { depth, channels: 1 }
    }

    pub const fn depth(self) -> Depth {
        self.depth
    }

    pub const fn channels(self) -> usize {
        self.channels
    }

    /// Size of a whole element, all channels included
    pub const fn elem_size(self) -> usize {
        self.depth.size() * self.channels
    }

    #[must_use]
    pub const fn with_depth(self, depth: Depth) -> Self {
        Self {
            depth,
            channels: self.channels,
        }
    }
}

impl fmt::Display for MatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}C{}", self.depth.name(), self.channels)
    }
}

/// Outcome of looking a host element type up in the depth table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMapping {
    /// The array can be viewed as-is with this depth
    Direct(Depth),
    /// The array must be cast to the depth's element type first
    RequiresCast(Depth),
    Unsupported,
}

/// Indexed by `Depth as usize`.
const DEPTH_TABLE: [(Depth, ElementType); 7] = [
    (Depth::U8, ElementType::UInt8),
    (Depth::S8, ElementType::Int8),
    (Depth::U16, ElementType::UInt16),
    (Depth::S16, ElementType::Int16),
    (Depth::S32, ElementType::Int32),
    (Depth::F32, ElementType::Float32),
    (Depth::F64, ElementType::Float64),
];

const CAST_TABLE: [(ElementType, Depth); 2] = [
    (ElementType::Int64, Depth::S32),
    (ElementType::UInt64, Depth::S32),
];

/// Map a host element type onto a matrix depth
pub fn lookup(element_type: ElementType) -> TypeMapping {
    if let Some(&(depth, _)) = DEPTH_TABLE.iter().find(|(_, ty)| *ty == element_type) {
        return TypeMapping::Direct(depth);
    }
    if let Some(&(_, depth)) = CAST_TABLE.iter().find(|(ty, _)| *ty == element_type) {
        return TypeMapping::RequiresCast(depth);
    }
    TypeMapping::Unsupported
}

/// Rust types that can be read from and written to host arrays
pub trait Element: bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    const ELEMENT_TYPE: ElementType;
}

/// Element types that also have a native matrix depth
pub trait DepthElement: Element {
    const DEPTH: Depth;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(impl Element for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$tag;
        })*
    };
}

macro_rules! impl_depth_element {
    ($($ty:ty => $depth:ident),* $(,)?) => {
        $(impl DepthElement for $ty {
            const DEPTH: Depth = Depth::$depth;
        })*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

impl_depth_element! {
    u8 => U8,
    i8 => S8,
    u16 => U16,
    i16 => S16,
    i32 => S32,
    f32 => F32,
    f64 => F64,
}
