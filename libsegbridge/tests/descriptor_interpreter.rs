use segbridge::layout::{
    classify, contiguous_strides, is_multichannel, needs_copy, ArrayDescriptor, ClassifyError,
    MatrixLayout,
};
use segbridge::*;

fn descriptor(element_type: ElementType, extents: &[usize]) -> ArrayDescriptor {
    ArrayDescriptor::new(
        element_type,
        extents.to_vec(),
        contiguous_strides(extents, element_type.item_size()),
    )
}

#[test]
fn test_classify_packed_image() {
    let class = classify(&descriptor(ElementType::UInt8, &[4, 4])).unwrap();
    assert_eq!(class.depth, Depth::U8);
    assert_eq!(class.rank, 2);
    assert!(!class.requires_cast);
    assert!(!class.multichannel);
    assert!(!class.needs_copy());
}

#[test]
fn test_classify_rgb_image_is_multichannel() {
    let class = classify(&descriptor(ElementType::Float32, &[2, 2, 3])).unwrap();
    assert_eq!(class.depth, Depth::F32);
    assert!(class.multichannel);
    assert!(!class.needs_copy());
}

#[test]
fn test_classify_int64_requires_cast() {
    let class = classify(&descriptor(ElementType::Int64, &[3])).unwrap();
    assert_eq!(class.depth, Depth::S32);
    assert!(class.requires_cast);
    assert!(class.needs_copy());
}

#[test]
fn test_classify_rejects_unsupported_type() {
    let error = classify(&descriptor(ElementType::Complex64, &[2, 2])).unwrap_err();
    assert_eq!(error, ClassifyError::UnsupportedType(ElementType::Complex64));
}

#[test]
fn test_classify_rank_limit() {
    let at_limit = vec![1; MAX_DIMS];
    assert!(classify(&descriptor(ElementType::UInt8, &at_limit)).is_ok());

    let over_limit = vec![1; MAX_DIMS + 1];
    let error = classify(&descriptor(ElementType::UInt8, &over_limit)).unwrap_err();
    assert_eq!(
        error,
        ClassifyError::RankTooHigh {
            rank: MAX_DIMS + 1,
            max: MAX_DIMS
        }
    );
}

#[test]
fn test_needs_copy_accepts_packed_layouts() {
    assert!(!needs_copy(&[4, 4], &[4, 1], 1));
    assert!(!needs_copy(&[2, 2, 3], &[6, 3, 1], 1));
    assert!(!needs_copy(&[5], &[8], 8));
    assert!(!needs_copy(&[], &[], 4));
}

#[test]
fn test_needs_copy_accepts_padded_rows() {
    // 3 columns of u16 stored in 8-byte rows
    assert!(!needs_copy(&[2, 3], &[8, 2], 2));
}

#[test]
fn test_needs_copy_rejects_transposed() {
    assert!(needs_copy(&[4, 3], &[1, 4], 1));
    assert!(needs_copy(&[3, 4, 2], &[4, 12, 1], 1));
}

#[test]
fn test_needs_copy_rejects_flipped() {
    assert!(needs_copy(&[4, 4], &[-4, 1], 1));
    assert!(needs_copy(&[4, 4], &[4, -1], 1));
}

#[test]
fn test_needs_copy_rejects_strided_columns() {
    assert!(needs_copy(&[4, 2], &[4, 2], 1));
}

#[test]
fn test_needs_copy_rejects_broadcast() {
    assert!(needs_copy(&[3, 4], &[0, 1], 1));
}

#[test]
fn test_needs_copy_rejects_loose_channels() {
    // channels packed, but each pixel padded to 4 bytes
    assert!(needs_copy(&[2, 2, 3], &[8, 4, 1], 1));
}

#[test]
fn test_multichannel_detection() {
    assert!(is_multichannel(&[2, 2, 3]));
    assert!(is_multichannel(&[2, 2, CN_MAX]));
    assert!(!is_multichannel(&[2, 2, CN_MAX + 1]));
    assert!(!is_multichannel(&[2, 2, 0]));
    assert!(!is_multichannel(&[2, 3]));
    assert!(!is_multichannel(&[1, 2, 2, 3]));
}

#[test]
fn test_layout_promotes_rank_zero() {
    let layout = MatrixLayout::from_array(Depth::F64, &[], &[]).unwrap();
    assert_eq!(layout.dims, vec![1]);
    assert_eq!(layout.steps, vec![8]);
    assert_eq!(layout.mat_type, MatType::single(Depth::F64));
}

#[test]
fn test_layout_folds_channels() {
    let layout = MatrixLayout::from_array(Depth::U16, &[2, 5, 4], &[40, 8, 2]).unwrap();
    assert_eq!(layout.dims, vec![2, 5]);
    assert_eq!(layout.steps, vec![40, 8]);
    assert_eq!(layout.mat_type, MatType::new(Depth::U16, 4).unwrap());
}

#[test]
fn test_layout_keeps_wide_trailing_dimension() {
    let extents = [2, 2, CN_MAX + 1];
    let strides = contiguous_strides(&extents, 1);
    let layout = MatrixLayout::from_array(Depth::U8, &extents, &strides).unwrap();
    assert_eq!(layout.dims, extents.to_vec());
    assert_eq!(layout.mat_type.channels(), 1);
}

#[test]
fn test_contiguous_strides() {
    assert_eq!(contiguous_strides(&[2, 3, 4], 2), vec![24, 8, 2]);
    assert_eq!(contiguous_strides(&[], 4), Vec::<isize>::new());
}
