//! Native image matrix with shared ownership of its pixel buffer

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::depth::{Depth, DepthElement, MatType};
use crate::error::{BridgeError, Result};
use crate::foreign::ForeignArray;
use crate::layout::{contiguous_strides, element_count, for_each_offset, MatrixLayout};
use crate::runtime::Runtime;
use crate::scalar;
use crate::storage::Storage;
use crate::MAX_DIMS;

/// Identity of the default heap allocator
pub const STD_ALLOCATOR_ID: u64 = 0;

/// One reference on a host array, held on behalf of a matrix and all of its
/// shallow clones. The reference is released, under the interpreter lock,
/// when the last clone drops.
pub struct ForeignHold {
    array: ManuallyDrop<ForeignArray>,
    runtime: Arc<Runtime>,
    allocator_id: u64,
}

impl ForeignHold {
    pub(crate) fn new(array: ForeignArray, runtime: Arc<Runtime>, allocator_id: u64) -> Arc<Self> {
        runtime.stats().hold_acquired();
        Arc::new(Self {
            array: ManuallyDrop::new(array),
            runtime,
            allocator_id,
        })
    }

    pub fn array(&self) -> &ForeignArray {
        &self.array
    }

    pub const fn allocator_id(&self) -> u64 {
        self.allocator_id
    }
}

impl Drop for ForeignHold {
    fn drop(&mut self) {
        let _gil = self.runtime.gil().ensure();
        // SAFETY: `array` is not used again after this point and is dropped exactly once.
        unsafe { ManuallyDrop::drop(&mut self.array) };
        self.runtime.stats().hold_released();
        log::trace!("Released native hold on a host array");
    }
}

impl fmt::Debug for ForeignHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHold")
            .field("array", &*self.array)
            .field("allocator_id", &self.allocator_id)
            .finish()
    }
}

/// Who frees a matrix's buffer
#[derive(Debug, Clone)]
pub enum Ownership {
    /// The buffer belongs to the native side alone
    Native,
    /// The buffer belongs to a host array kept alive by the hold
    Foreign(Arc<ForeignHold>),
}

/// Buffer behind a matrix: storage block, offset of the first element, owner
#[derive(Debug, Clone)]
pub struct MatrixData {
    storage: Arc<Storage>,
    offset: usize,
    owner: Ownership,
}

impl MatrixData {
    pub const fn native(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            offset: 0,
            owner: Ownership::Native,
        }
    }

    pub(crate) fn foreign(hold: Arc<ForeignHold>) -> Self {
        let storage = Arc::clone(hold.array().storage());
        let offset = hold.array().offset();
        Self {
            storage,
            offset,
            owner: Ownership::Foreign(hold),
        }
    }

    pub const fn owner(&self) -> &Ownership {
        &self.owner
    }
}

/// Result of an allocator call
#[derive(Debug)]
pub struct Allocation {
    pub data: MatrixData,
    pub steps: Vec<usize>,
}

/// Source of matrix buffers
pub trait MatAllocator: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    fn allocate(&self, dims: &[usize], mat_type: MatType) -> Result<Allocation>;
}

/// Plain heap allocator, the default when a matrix has none bound
#[derive(Debug, Default)]
pub struct StdAllocator;

impl MatAllocator for StdAllocator {
    fn id(&self) -> u64 {
        STD_ALLOCATOR_ID
    }

    fn allocate(&self, dims: &[usize], mat_type: MatType) -> Result<Allocation> {
        let storage = Storage::zeroed(element_count(dims) * mat_type.elem_size(), None);
        Ok(Allocation {
            data: MatrixData::native(storage),
            steps: packed_steps(dims, mat_type.elem_size()),
        })
    }
}

#[allow(clippy::cast_sign_loss)]
fn packed_steps(dims: &[usize], elem_size: usize) -> Vec<usize> {
    contiguous_strides(dims, elem_size)
        .into_iter()
        .map(|stride| stride as usize)
        .collect()
}

fn validate_dims(dims: &[usize]) -> Result<()> {
    if dims.is_empty() || dims.len() > MAX_DIMS {
        return Err(BridgeError::InvalidMatrix(format!(
            "rank {} outside 1..={MAX_DIMS}",
            dims.len()
        )));
    }
    Ok(())
}

/// An n-dimensional image matrix. Two dimensions (rows, columns) for images,
/// with the per-pixel channels folded into the element type.
///
/// Cloning is shallow: clones share the buffer and its ownership token.
/// Use [`deep_clone`](Self::deep_clone) for an independent copy.
#[derive(Clone)]
pub struct NativeMatrix {
    mat_type: MatType,
    dims: Vec<usize>,
    steps: Vec<usize>,
    data: Option<MatrixData>,
    allocator: Option<Arc<dyn MatAllocator>>,
}

impl Default for NativeMatrix {
    fn default() -> Self {
        Self::empty()
    }
}

impl NativeMatrix {
    /// A matrix without data or bound allocator
    pub const fn empty() -> Self {
        Self {
            mat_type: MatType::single(Depth::U8),
            dims: Vec::new(),
            steps: Vec::new(),
            data: None,
            allocator: None,
        }
    }

    /// Allocate a zero-filled matrix on the heap
    pub fn new(dims: &[usize], mat_type: MatType) -> Result<Self> {
        let mut matrix = Self::empty();
        matrix.create(dims, mat_type)?;
        Ok(matrix)
    }

    /// Build a matrix from row-major, channel-interleaved values
    pub fn from_slice<T: DepthElement>(dims: &[usize], channels: usize, values: &[T]) -> Result<Self> {
        let mat_type = MatType::new(T::DEPTH, channels)?;
        let expected = element_count(dims) * channels;
        if values.len() != expected {
            return Err(BridgeError::InvalidMatrix(format!(
                "{} values given for {dims:?} x {channels} channels ({expected} expected)",
                values.len()
            )));
        }
        let matrix = Self::new(dims, mat_type)?;
        if let Some(data) = &matrix.data {
            data.storage
                .write(|bytes| bytes.copy_from_slice(bytemuck::cast_slice(values)));
        }
        Ok(matrix)
    }

    pub(crate) fn from_layout(
        layout: MatrixLayout,
        data: MatrixData,
        allocator: Option<Arc<dyn MatAllocator>>,
    ) -> Self {
        Self {
            mat_type: layout.mat_type,
            dims: layout.dims,
            steps: layout.steps,
            data: Some(data),
            allocator,
        }
    }

    /// Bind an allocator used by later calls to [`create`](Self::create)
    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn MatAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn set_allocator(&mut self, allocator: Option<Arc<dyn MatAllocator>>) {
        self.allocator = allocator;
    }

    /// Identity of the bound allocator, if any
    pub fn allocator_id(&self) -> Option<u64> {
        self.allocator.as_ref().map(|allocator| allocator.id())
    }

    /// (Re)allocate the buffer through the bound allocator. Keeps the current
    /// buffer when shape and type already match.
    pub fn create(&mut self, dims: &[usize], mat_type: MatType) -> Result<()> {
        validate_dims(dims)?;
        if self.data.is_some() && self.dims == dims && self.mat_type == mat_type {
            return Ok(());
        }
        self.release();
        let allocation = match &self.allocator {
            Some(allocator) => allocator.allocate(dims, mat_type)?,
            None => StdAllocator.allocate(dims, mat_type)?,
        };
        self.mat_type = mat_type;
        self.dims = dims.to_vec();
        self.steps = allocation.steps;
        self.data = Some(allocation.data);
        Ok(())
    }

    /// Drop this matrix's reference to its buffer, keeping the allocator binding
    pub fn release(&mut self) {
        self.data = None;
        self.dims.clear();
        self.steps.clear();
    }

    pub const fn mat_type(&self) -> MatType {
        self.mat_type
    }

    pub const fn depth(&self) -> Depth {
        self.mat_type.depth()
    }

    pub const fn channels(&self) -> usize {
        self.mat_type.channels()
    }

    pub const fn elem_size(&self) -> usize {
        self.mat_type.elem_size()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Byte step of each dimension
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        match self.dims.len() {
            0 => 0,
            1 => 1,
            _ => self.dims[1],
        }
    }

    /// Number of elements (pixels), channels not counted
    pub fn total(&self) -> usize {
        if self.data.is_none() {
            return 0;
        }
        element_count(&self.dims)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub const fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Address of the first element
    pub fn data_ptr(&self) -> Option<*const u8> {
        self.data
            .as_ref()
            .map(|data| (data.storage.addr() + data.offset) as *const u8)
    }

    pub fn ownership(&self) -> Option<&Ownership> {
        self.data.as_ref().map(MatrixData::owner)
    }

    pub(crate) fn foreign_hold(&self) -> Option<&Arc<ForeignHold>> {
        match self.ownership()? {
            Ownership::Foreign(hold) => Some(hold),
            Ownership::Native => None,
        }
    }

    /// The host array this matrix aliases, if any
    pub fn foreign_array(&self) -> Option<&ForeignArray> {
        self.foreign_hold().map(|hold| hold.array())
    }

    /// True when elements are stored back to back without gaps
    pub fn is_continuous(&self) -> bool {
        self.steps == packed_steps(&self.dims, self.elem_size())
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn element_offsets(&self) -> Vec<usize> {
        let Some(data) = &self.data else {
            return Vec::new();
        };
        let steps: Vec<isize> = self.steps.iter().map(|&step| step as isize).collect();
        let mut offsets = Vec::with_capacity(element_count(&self.dims));
        for_each_offset(&self.dims, &steps, data.offset as isize, |offset| {
            offsets.push(offset as usize);
        });
        offsets
    }

    /// Element bytes in row-major order with no gaps
    pub fn packed_bytes(&self) -> Vec<u8> {
        let Some(data) = &self.data else {
            return Vec::new();
        };
        let elem_size = self.elem_size();
        let offsets = self.element_offsets();
        data.storage.read(|src| {
            let mut out = Vec::with_capacity(offsets.len() * elem_size);
            for offset in offsets {
                out.extend_from_slice(&src[offset..offset + elem_size]);
            }
            out
        })
    }

    fn value_offset(&self, index: &[usize], channel: usize) -> Option<usize> {
        let data = self.data.as_ref()?;
        if index.len() != self.dims.len() || channel >= self.channels() {
            return None;
        }
        let mut offset = data.offset + channel * self.depth().size();
        for ((&i, &extent), &step) in index.iter().zip(&self.dims).zip(&self.steps) {
            if i >= extent {
                return None;
            }
            offset += i * step;
        }
        Some(offset)
    }

    /// Read one channel value; `None` on a depth mismatch or out-of-range index
    pub fn get<T: DepthElement>(&self, index: &[usize], channel: usize) -> Option<T> {
        if T::DEPTH != self.depth() {
            return None;
        }
        let offset = self.value_offset(index, channel)?;
        let size = std::mem::size_of::<T>();
        self.data.as_ref().map(|data| {
            data.storage
                .read(|bytes| bytemuck::pod_read_unaligned(&bytes[offset..offset + size]))
        })
    }

    /// Write one channel value in place. The write is visible through every
    /// matrix or array sharing the buffer.
    pub fn set<T: DepthElement>(&self, index: &[usize], channel: usize, value: T) -> Result<()> {
        if T::DEPTH != self.depth() {
            return Err(BridgeError::InvalidMatrix(format!(
                "cannot store {} values in a {} matrix",
                T::DEPTH,
                self.mat_type
            )));
        }
        let (Some(offset), Some(data)) = (self.value_offset(index, channel), &self.data) else {
            return Err(BridgeError::InvalidMatrix(format!(
                "index {index:?} channel {channel} out of range for {:?} x {}",
                self.dims,
                self.channels()
            )));
        };
        let size = std::mem::size_of::<T>();
        data.storage.write(|bytes| {
            bytes[offset..offset + size].copy_from_slice(bytemuck::bytes_of(&value));
        });
        Ok(())
    }

    /// Channel values in row-major, channel-interleaved order
    pub fn to_vec<T: DepthElement>(&self) -> Result<Vec<T>> {
        if T::DEPTH != self.depth() {
            return Err(BridgeError::InvalidMatrix(format!(
                "cannot read a {} matrix as {}",
                self.mat_type,
                T::DEPTH
            )));
        }
        Ok(self
            .packed_bytes()
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// Independent, packed, natively owned copy
    pub fn deep_clone(&self) -> Result<Self> {
        if self.data.is_none() {
            return Ok(Self {
                data: None,
                ..self.clone()
            });
        }
        let storage = Storage::from_bytes(&self.packed_bytes(), None);
        Ok(Self {
            mat_type: self.mat_type,
            dims: self.dims.clone(),
            steps: packed_steps(&self.dims, self.elem_size()),
            data: Some(MatrixData::native(storage)),
            allocator: None,
        })
    }

    /// Copy into a new matrix of another depth with the same channel count.
    /// Values saturate to the target range, floats round half to even.
    pub fn convert_to(&self, depth: Depth) -> Result<Self> {
        if self.data.is_none() {
            return Err(BridgeError::InvalidMatrix(
                "cannot convert an empty matrix".to_string(),
            ));
        }
        let source = self.depth();
        let from_size = source.size();
        let to_size = depth.size();
        let packed = self.packed_bytes();

        let mut out = vec![0_u8; packed.len() / from_size * to_size];
        for (src, dst) in packed.chunks_exact(from_size).zip(out.chunks_exact_mut(to_size)) {
            let value = scalar::read(src, source.element_type()).ok_or_else(|| {
                BridgeError::InvalidMatrix(format!("unreadable {source} value"))
            })?;
            scalar::write_saturating(value, depth, dst);
        }

        let mat_type = self.mat_type.with_depth(depth);
        Ok(Self {
            mat_type,
            dims: self.dims.clone(),
            steps: packed_steps(&self.dims, mat_type.elem_size()),
            data: Some(MatrixData::native(Storage::from_bytes(&out, None))),
            allocator: None,
        })
    }
}

impl fmt::Debug for NativeMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMatrix")
            .field("type", &format_args!("{}", self.mat_type))
            .field("dims", &self.dims)
            .field("steps", &self.steps)
            .field("owner", &self.ownership())
            .field("allocator", &self.allocator_id())
            .finish()
    }
}
