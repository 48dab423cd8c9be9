//! Host runtime values: reference-counted arrays and the objects that carry them

use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::depth::{Element, ElementType};
use crate::error::{BridgeError, Result};
use crate::layout::{
    byte_span, contiguous_strides, element_count, for_each_offset, ArrayDescriptor,
};
use crate::runtime::Runtime;
use crate::scalar;
use crate::storage::Storage;

/// Any value passed across the boundary
#[derive(Debug, Clone)]
pub enum ForeignObject {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(ForeignArray),
    Tuple(Vec<ForeignObject>),
}

impl ForeignObject {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Array(_) => "ndarray",
            Self::Tuple(_) => "tuple",
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub const fn as_array(&self) -> Option<&ForeignArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<ForeignArray> for ForeignObject {
    fn from(array: ForeignArray) -> Self {
        Self::Array(array)
    }
}

impl From<&str> for ForeignObject {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ForeignObject {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Handle to an array object owned by the host runtime.
///
/// Cloning a handle adds a reference, dropping it releases one. The storage
/// block is freed once no array object references it any more. Views created
/// by [`transposed`](Self::transposed), [`flipped`](Self::flipped) and
/// [`as_strided`](Self::as_strided) are new array objects over the same storage.
#[derive(Clone)]
pub struct ForeignArray {
    inner: Arc<ArrayObject>,
}

struct ArrayObject {
    element_type: ElementType,
    extents: Vec<usize>,
    strides: Vec<isize>,
    offset: usize,
    storage: Arc<Storage>,
}

impl ForeignArray {
    fn from_parts(
        element_type: ElementType,
        extents: Vec<usize>,
        strides: Vec<isize>,
        offset: usize,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            inner: Arc::new(ArrayObject {
                element_type,
                extents,
                strides,
                offset,
                storage,
            }),
        }
    }

    /// Allocate a packed, zero-filled array
    pub fn zeros(runtime: &Runtime, extents: &[usize], element_type: ElementType) -> Result<Self> {
        let item_size = element_type.item_size();
        let storage = runtime.allocate(element_count(extents) * item_size)?;
        Ok(Self::from_parts(
            element_type,
            extents.to_vec(),
            contiguous_strides(extents, item_size),
            0,
            storage,
        ))
    }

    /// Build a packed array from row-major values
    pub fn from_vec<T: Element>(runtime: &Runtime, extents: &[usize], data: Vec<T>) -> Result<Self> {
        Self::from_bytes(runtime, extents, T::ELEMENT_TYPE, bytemuck::cast_slice(&data))
    }

    /// Build a packed array from raw row-major element bytes
    pub fn from_bytes(
        runtime: &Runtime,
        extents: &[usize],
        element_type: ElementType,
        bytes: &[u8],
    ) -> Result<Self> {
        let expected = element_count(extents) * element_type.item_size();
        if bytes.len() != expected {
            return Err(BridgeError::InvalidArray(format!(
                "{} bytes given for a {element_type} array of shape {extents:?} ({expected} bytes)",
                bytes.len()
            )));
        }
        let array = Self::zeros(runtime, extents, element_type)?;
        array.inner.storage.write(|dst| dst.copy_from_slice(bytes));
        Ok(array)
    }

    pub fn from_ndarray<T: Element>(runtime: &Runtime, array: &ArrayD<T>) -> Result<Self> {
        let data: Vec<T> = array.iter().copied().collect();
        Self::from_vec(runtime, array.shape(), data)
    }

    /// A rank-0 array holding one value
    pub fn scalar<T: Element>(runtime: &Runtime, value: T) -> Result<Self> {
        Self::from_vec(runtime, &[], vec![value])
    }

    pub fn element_type(&self) -> ElementType {
        self.inner.element_type
    }

    pub fn extents(&self) -> &[usize] {
        &self.inner.extents
    }

    /// Byte strides, one per dimension
    pub fn strides(&self) -> &[isize] {
        &self.inner.strides
    }

    pub fn rank(&self) -> usize {
        self.inner.extents.len()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        element_count(&self.inner.extents)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptor(&self) -> ArrayDescriptor {
        ArrayDescriptor::new(
            self.inner.element_type,
            self.inner.extents.clone(),
            self.inner.strides.clone(),
        )
    }

    /// Address of the element at index zero
    pub fn data_ptr(&self) -> *const u8 {
        (self.inner.storage.addr() + self.inner.offset) as *const u8
    }

    /// Byte offset of the element at index zero inside the storage block
    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    /// Number of live handles to this array object
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True if both handles refer to the same array object
    pub fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True if both arrays view the same storage block
    pub fn shares_memory(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.strides
            == contiguous_strides(&self.inner.extents, self.inner.element_type.item_size())
    }

    fn view(&self, extents: Vec<usize>, strides: Vec<isize>, offset: usize) -> Self {
        Self::from_parts(
            self.inner.element_type,
            extents,
            strides,
            offset,
            Arc::clone(&self.inner.storage),
        )
    }

    /// View with the axis order reversed
    #[must_use]
    pub fn transposed(&self) -> Self {
        let mut extents = self.inner.extents.clone();
        let mut strides = self.inner.strides.clone();
        extents.reverse();
        strides.reverse();
        self.view(extents, strides, self.inner.offset)
    }

    /// View with `axis` traversed backwards
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn flipped(&self, axis: usize) -> Result<Self> {
        let extent = *self.inner.extents.get(axis).ok_or_else(|| {
            BridgeError::InvalidArray(format!("axis {axis} out of range for rank {}", self.rank()))
        })?;
        let mut strides = self.inner.strides.clone();
        let mut offset = self.inner.offset as isize;
        if extent > 0 {
            offset += (extent as isize - 1) * strides[axis];
            strides[axis] = -strides[axis];
        }
        Ok(self.view(self.inner.extents.clone(), strides, offset as usize))
    }

    /// View with arbitrary extents and byte strides starting at this array's first element
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn as_strided(&self, extents: &[usize], strides: &[isize]) -> Result<Self> {
        if extents.len() != strides.len() {
            return Err(BridgeError::InvalidArray(format!(
                "{} extents but {} strides",
                extents.len(),
                strides.len()
            )));
        }
        let base = self.inner.offset as isize;
        let (start, end) = byte_span(extents, strides, self.inner.element_type.item_size());
        if base + start < 0 || base + end > self.inner.storage.len() as isize {
            return Err(BridgeError::InvalidArray(format!(
                "view {extents:?}/{strides:?} reaches outside the {}-byte buffer",
                self.inner.storage.len()
            )));
        }
        Ok(self.view(extents.to_vec(), strides.to_vec(), self.inner.offset))
    }

    fn offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.len());
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        for_each_offset(
            &self.inner.extents,
            &self.inner.strides,
            self.inner.offset as isize,
            |offset| offsets.push(offset as usize),
        );
        offsets
    }

    /// Packed row-major copy of the element bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let item_size = self.inner.element_type.item_size();
        let offsets = self.offsets();
        self.inner.storage.read(|src| {
            let mut out = Vec::with_capacity(offsets.len() * item_size);
            for offset in offsets {
                out.extend_from_slice(&src[offset..offset + item_size]);
            }
            out
        })
    }

    /// Packed row-major copy in a freshly allocated array
    pub fn to_contiguous(&self, runtime: &Runtime) -> Result<Self> {
        Self::from_bytes(runtime, self.extents(), self.element_type(), &self.to_bytes())
    }

    /// Element-wise conversion into a new packed array. Integer narrowing wraps,
    /// floats truncate toward zero.
    pub fn cast(&self, runtime: &Runtime, target: ElementType) -> Result<Self> {
        let source = self.element_type();
        let from_size = source.item_size();
        let to_size = target.item_size();
        let offsets = self.offsets();
        let out = Self::zeros(runtime, self.extents(), target)?;

        let converted = out.inner.storage.copy_from(&self.inner.storage, |src, dst| {
            for (i, offset) in offsets.into_iter().enumerate() {
                let Some(value) = scalar::read(&src[offset..offset + from_size], source) else {
                    return false;
                };
                if !scalar::write_cast(value, target, &mut dst[i * to_size..(i + 1) * to_size]) {
                    return false;
                }
            }
            true
        });

        if converted {
            Ok(out)
        } else {
            Err(BridgeError::InvalidArray(format!(
                "cannot cast {source} to {target}"
            )))
        }
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn element_offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.rank() {
            return None;
        }
        let mut offset = self.inner.offset as isize;
        for ((&i, &extent), &stride) in index.iter().zip(&self.inner.extents).zip(&self.inner.strides) {
            if i >= extent {
                return None;
            }
            offset += i as isize * stride;
        }
        Some(offset as usize)
    }

    /// Read one element; `None` on a type mismatch or an out-of-range index
    pub fn get<T: Element>(&self, index: &[usize]) -> Option<T> {
        if T::ELEMENT_TYPE != self.element_type() {
            return None;
        }
        let offset = self.element_offset(index)?;
        let size = std::mem::size_of::<T>();
        Some(
            self.inner
                .storage
                .read(|bytes| bytemuck::pod_read_unaligned(&bytes[offset..offset + size])),
        )
    }

    /// Write one element in place, visible through every view of the storage
    pub fn set<T: Element>(&self, index: &[usize], value: T) -> Result<()> {
        if T::ELEMENT_TYPE != self.element_type() {
            return Err(BridgeError::InvalidArray(format!(
                "cannot store {} in a {} array",
                T::ELEMENT_TYPE,
                self.element_type()
            )));
        }
        let offset = self.element_offset(index).ok_or_else(|| {
            BridgeError::InvalidArray(format!(
                "index {index:?} out of range for shape {:?}",
                self.extents()
            ))
        })?;
        let size = std::mem::size_of::<T>();
        self.inner.storage.write(|bytes| {
            bytes[offset..offset + size].copy_from_slice(bytemuck::bytes_of(&value));
        });
        Ok(())
    }

    /// Values in row-major logical order
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::ELEMENT_TYPE != self.element_type() {
            return Err(BridgeError::InvalidArray(format!(
                "cannot read a {} array as {}",
                self.element_type(),
                T::ELEMENT_TYPE
            )));
        }
        Ok(self
            .to_bytes()
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    pub fn to_ndarray<T: Element>(&self) -> Result<ArrayD<T>> {
        let data = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(self.extents()), data)
            .map_err(|e| BridgeError::InvalidArray(e.to_string()))
    }
}

impl fmt::Debug for ForeignArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignArray")
            .field("element_type", &self.inner.element_type)
            .field("extents", &self.inner.extents)
            .field("strides", &self.inner.strides)
            .field("offset", &self.inner.offset)
            .field("refs", &self.ref_count())
            .finish()
    }
}
