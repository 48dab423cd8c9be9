//! Cross-boundary conversion between host arrays and native matrices.
//!
//! [`Converter::to_matrix`] aliases the host array's memory whenever the
//! layout allows and copies it into a packed array otherwise. Either way the
//! resulting matrix keeps exactly one reference on the array that backs its
//! buffer. [`Converter::to_foreign`] hands such an array back without
//! copying; every other matrix is copied into a fresh host array.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::depth::{ElementType, MatType};
use crate::error::{BridgeError, Result};
use crate::foreign::{ForeignArray, ForeignObject};
use crate::layout::{classify, MatrixLayout};
use crate::matrix::{Allocation, ForeignHold, MatAllocator, MatrixData, NativeMatrix};
use crate::runtime::{ErrorKind, Runtime};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Shape of the host array storing a matrix: its dims, plus a trailing
/// channel dimension for multichannel element types
fn array_shape(dims: &[usize], mat_type: MatType) -> Vec<usize> {
    let mut shape = dims.to_vec();
    if mat_type.channels() > 1 {
        shape.push(mat_type.channels());
    }
    shape
}

/// Matrix allocator whose buffers are host arrays
#[derive(Debug)]
pub struct ForeignAllocator {
    id: u64,
    runtime: Arc<Runtime>,
}

impl ForeignAllocator {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
        }
    }

    pub const fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Wrap `array` in a hold owned by this allocator
    fn hold(&self, array: ForeignArray) -> Arc<ForeignHold> {
        ForeignHold::new(array, Arc::clone(&self.runtime), self.id)
    }
}

impl MatAllocator for ForeignAllocator {
    fn id(&self) -> u64 {
        self.id
    }

    fn allocate(&self, dims: &[usize], mat_type: MatType) -> Result<Allocation> {
        let _gil = self.runtime.gil().ensure();
        let shape = array_shape(dims, mat_type);
        let element_type = mat_type.depth().element_type();
        let array = ForeignArray::zeros(&self.runtime, &shape, element_type).map_err(|e| {
            BridgeError::InvalidArray(format!(
                "the {element_type} array of shape {shape:?} cannot be created: {e}"
            ))
        })?;

        #[allow(clippy::cast_sign_loss)]
        let steps = array.strides()[..dims.len()]
            .iter()
            .map(|&stride| stride as usize)
            .collect();
        log::trace!("Allocated {mat_type} matrix {dims:?} as a host array");
        Ok(Allocation {
            data: MatrixData::foreign(self.hold(array)),
            steps,
        })
    }
}

/// Converts host arrays to native matrices and back
#[derive(Debug)]
pub struct Converter {
    runtime: Arc<Runtime>,
    allocator: Arc<ForeignAllocator>,
    allow_nd: bool,
}

impl Converter {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let allocator = Arc::new(ForeignAllocator::new(Arc::clone(&runtime)));
        Self {
            runtime,
            allocator,
            allow_nd: true,
        }
    }

    /// Whether matrices with more than two dimensions may be produced (default true)
    #[must_use]
    pub const fn with_allow_nd(mut self, allow_nd: bool) -> Self {
        self.allow_nd = allow_nd;
        self
    }

    pub const fn allow_nd(&self) -> bool {
        self.allow_nd
    }

    pub const fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn allocator(&self) -> Arc<dyn MatAllocator> {
        Arc::clone(&self.allocator) as Arc<dyn MatAllocator>
    }

    pub fn allocator_id(&self) -> u64 {
        self.allocator.id
    }

    /// A matrix without data whose later allocations go through this converter
    pub fn empty_matrix(&self) -> NativeMatrix {
        NativeMatrix::empty().with_allocator(self.allocator())
    }

    /// Convert a host object into a matrix
    pub fn to_matrix(&self, object: &ForeignObject) -> Result<NativeMatrix> {
        let mut matrix = self.empty_matrix();
        self.convert_into(object, &mut matrix)?;
        Ok(matrix)
    }

    /// Convert a host object into `dst`. On failure `dst` is left empty with
    /// this converter's allocator bound, and the error is also raised on the
    /// runtime's error indicator.
    pub fn convert_into(&self, object: &ForeignObject, dst: &mut NativeMatrix) -> Result<()> {
        let _gil = self.runtime.gil().ensure();
        *dst = self.empty_matrix();
        match self.build_matrix(object) {
            Ok(matrix) => {
                *dst = matrix;
                Ok(())
            }
            Err(error) => {
                log::warn!("Conversion to matrix failed: {error}");
                self.runtime.set_error(ErrorKind::TypeError, error.to_string());
                Err(error)
            }
        }
    }

    fn build_matrix(&self, object: &ForeignObject) -> Result<NativeMatrix> {
        let ForeignObject::Array(array) = object else {
            return Err(BridgeError::NotAnArray {
                found: object.type_name(),
            });
        };

        let classification = classify(&array.descriptor())?;

        let source = if classification.requires_cast {
            log::debug!(
                "Casting {} array to {} before conversion",
                array.element_type(),
                ElementType::Int32
            );
            array.cast(&self.runtime, classification.depth.element_type())?
        } else if classification.needs_copy() {
            log::debug!(
                "Copying non-contiguous array {:?}/{:?}",
                array.extents(),
                array.strides()
            );
            array.to_contiguous(&self.runtime)?
        } else {
            array.clone()
        };

        let layout = MatrixLayout::from_array(classification.depth, source.extents(), source.strides())?;
        if layout.dims.len() > 2 && !self.allow_nd {
            return Err(BridgeError::TooManyDimensions {
                rank: layout.dims.len(),
            });
        }

        log::trace!(
            "Matrix {} {:?} over array {:?}",
            layout.mat_type,
            layout.dims,
            source
        );
        let data = MatrixData::foreign(self.allocator.hold(source));
        Ok(NativeMatrix::from_layout(layout, data, Some(self.allocator())))
    }

    /// Convert a matrix into a host object. An empty matrix becomes `None`;
    /// a matrix backed by a host array through this converter returns that
    /// array with one more reference; anything else is copied.
    pub fn to_foreign(&self, matrix: &NativeMatrix) -> Result<ForeignObject> {
        let _gil = self.runtime.gil().ensure();
        if matrix.is_empty() {
            return Ok(ForeignObject::None);
        }

        if let Some(hold) = matrix.foreign_hold() {
            if hold.allocator_id() == self.allocator.id
                && matrix.data_ptr() == Some(hold.array().data_ptr())
            {
                return Ok(ForeignObject::Array(hold.array().clone()));
            }
        }

        let shape = array_shape(matrix.dims(), matrix.mat_type());
        let array = ForeignArray::from_bytes(
            &self.runtime,
            &shape,
            matrix.depth().element_type(),
            &matrix.packed_bytes(),
        )
        .map_err(|error| {
            self.runtime.set_error(ErrorKind::MemoryError, error.to_string());
            error
        })?;
        log::trace!("Copied {} matrix into a new array", matrix.mat_type());
        Ok(ForeignObject::Array(array))
    }
}
