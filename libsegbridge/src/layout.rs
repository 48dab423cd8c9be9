//! Buffer descriptor interpretation: classify a host array's layout and
//! decide whether a matrix may alias its memory.
//!
//! A layout is aliasable when the last dimension is exactly one element wide,
//! strides never increase from one dimension to the next (so transposed,
//! flipped and broadcast views are rejected), and, for channel-interleaved
//! images, the channel dimension sits tightly packed after the column
//! dimension. Everything else is copied into a packed buffer first.

use serde::Serialize;
use thiserror::Error;

use crate::depth::{lookup, Depth, ElementType, MatType, TypeMapping};
use crate::error::{BridgeError, Result};
use crate::{CN_MAX, MAX_DIMS};

/// Shape, byte strides and element type of a host array
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArrayDescriptor {
    pub element_type: ElementType,
    pub extents: Vec<usize>,
    pub strides: Vec<isize>,
}

impl ArrayDescriptor {
    pub fn new(element_type: ElementType, extents: Vec<usize>, strides: Vec<isize>) -> Self {
        debug_assert_eq!(extents.len(), strides.len());
        Self {
            element_type,
            extents,
            strides,
        }
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("element type {0} has no matrix depth")]
    UnsupportedType(ElementType),

    #[error("rank {rank} exceeds the maximum of {max}")]
    RankTooHigh { rank: usize, max: usize },
}

impl From<ClassifyError> for BridgeError {
    fn from(error: ClassifyError) -> Self {
        match error {
            ClassifyError::UnsupportedType(element_type) => {
                Self::UnsupportedDataType { element_type }
            }
            ClassifyError::RankTooHigh { rank, max } => Self::DimensionalityTooHigh { rank, max },
        }
    }
}

/// What the converter needs to know about a host array
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub depth: Depth,
    /// The array holds 64-bit integers and must be narrowed to `depth` by a copy
    pub requires_cast: bool,
    pub rank: usize,
    pub extents: Vec<usize>,
    pub strides: Vec<isize>,
    pub multichannel: bool,
}

impl Classification {
    pub const fn elem_size(&self) -> usize {
        self.depth.size()
    }

    /// True when the matrix cannot alias the array's memory
    pub fn needs_copy(&self) -> bool {
        self.requires_cast || needs_copy(&self.extents, &self.strides, self.elem_size())
    }
}

/// Classify a host array. Unsupported element types and ranks above
/// [`MAX_DIMS`] are rejected, 64-bit integers are flagged for a cast.
pub fn classify(descriptor: &ArrayDescriptor) -> std::result::Result<Classification, ClassifyError> {
    let (depth, requires_cast) = match lookup(descriptor.element_type) {
        TypeMapping::Direct(depth) => (depth, false),
        TypeMapping::RequiresCast(depth) => (depth, true),
        TypeMapping::Unsupported => {
            return Err(ClassifyError::UnsupportedType(descriptor.element_type))
        }
    };

    let rank = descriptor.rank();
    if rank > MAX_DIMS {
        return Err(ClassifyError::RankTooHigh {
            rank,
            max: MAX_DIMS,
        });
    }

    Ok(Classification {
        depth,
        requires_cast,
        rank,
        extents: descriptor.extents.clone(),
        strides: descriptor.strides.clone(),
        multichannel: is_multichannel(&descriptor.extents),
    })
}

/// A rank-3 array whose trailing extent fits in a matrix element's channels
pub fn is_multichannel(extents: &[usize]) -> bool {
    extents.len() == 3 && (1..=CN_MAX).contains(&extents[2])
}

/// Decide whether a layout has to be copied before a matrix can view it
#[allow(clippy::cast_possible_wrap)]
pub fn needs_copy(extents: &[usize], strides: &[isize], elem_size: usize) -> bool {
    let rank = extents.len();
    if rank == 0 {
        return false;
    }
    let elem_size = elem_size as isize;

    if strides[rank - 1] != elem_size {
        return true;
    }
    if strides.windows(2).any(|pair| pair[0] < pair[1]) {
        return true;
    }
    is_multichannel(extents) && strides[1] != elem_size * extents[2] as isize
}

/// Row-major packed strides for `extents`
#[allow(clippy::cast_possible_wrap)]
pub fn contiguous_strides(extents: &[usize], item_size: usize) -> Vec<isize> {
    let mut strides = vec![0; extents.len()];
    let mut acc = item_size as isize;
    for (stride, &extent) in strides.iter_mut().zip(extents).rev() {
        *stride = acc;
        acc *= extent.max(1) as isize;
    }
    strides
}

/// Number of elements addressed by `extents`
pub fn element_count(extents: &[usize]) -> usize {
    extents.iter().product()
}

/// Byte range `[start, end)` relative to the base offset touched by a view
#[allow(clippy::cast_possible_wrap)]
pub fn byte_span(extents: &[usize], strides: &[isize], item_size: usize) -> (isize, isize) {
    if extents.contains(&0) {
        return (0, 0);
    }
    let mut start = 0;
    let mut end = item_size as isize;
    for (&extent, &stride) in extents.iter().zip(strides) {
        let reach = (extent as isize - 1) * stride;
        if reach < 0 {
            start += reach;
        } else {
            end += reach;
        }
    }
    (start, end)
}

/// Visit the byte offset of every element in row-major logical order
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn for_each_offset(
    extents: &[usize],
    strides: &[isize],
    base: isize,
    mut f: impl FnMut(isize),
) {
    if extents.contains(&0) {
        return;
    }
    let rank = extents.len();
    let mut index = vec![0_usize; rank];
    let mut offset = base;
    loop {
        f(offset);
        let mut axis = rank;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            offset += strides[axis];
            if index[axis] < extents[axis] {
                break;
            }
            offset -= strides[axis] * extents[axis] as isize;
            index[axis] = 0;
        }
    }
}

/// Shape of the matrix viewing an (already aliasable) array layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixLayout {
    pub mat_type: MatType,
    pub dims: Vec<usize>,
    pub steps: Vec<usize>,
}

impl MatrixLayout {
    /// Build the matrix shape for an array of `depth` elements. Rank 0 becomes
    /// a single element, a rank-3 channel dimension folds into the element type.
    pub fn from_array(depth: Depth, extents: &[usize], strides: &[isize]) -> Result<Self> {
        let mut dims = extents.to_vec();
        let mut steps = strides
            .iter()
            .map(|&stride| usize::try_from(stride))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| {
                BridgeError::InvalidArray(format!("negative stride in layout {strides:?}"))
            })?;

        if dims.is_empty() {
            dims.push(1);
            steps.push(depth.size());
        }

        let mut mat_type = MatType::single(depth);
        if is_multichannel(extents) {
            let channels = dims.pop().unwrap_or(1);
            steps.pop();
            mat_type = MatType::new(depth, channels)?;
        }

        Ok(Self {
            mat_type,
            dims,
            steps,
        })
    }
}
