use std::sync::Arc;

use proptest::prelude::*;
use segbridge::*;

fn image_strategy() -> impl Strategy<Value = (usize, usize, usize, Vec<u8>)> {
    (1_usize..8, 1_usize..8, prop::sample::select(vec![1_usize, 3, 4])).prop_flat_map(
        |(rows, cols, channels)| {
            prop::collection::vec(any::<u8>(), rows * cols * channels)
                .prop_map(move |data| (rows, cols, channels, data))
        },
    )
}

proptest! {
    #[test]
    fn prop_packed_arrays_alias_and_return_unchanged((rows, cols, channels, data) in image_strategy()) {
        let runtime = Runtime::new();
        let converter = Converter::new(Arc::clone(&runtime));
        let shape = if channels == 1 { vec![rows, cols] } else { vec![rows, cols, channels] };
        let array = ForeignArray::from_vec(&runtime, &shape, data.clone()).unwrap();

        let matrix = converter.to_matrix(&array.clone().into()).unwrap();
        prop_assert_eq!(matrix.dims(), &[rows, cols][..]);
        prop_assert_eq!(matrix.channels(), channels);
        prop_assert_eq!(matrix.data_ptr(), Some(array.data_ptr()));

        let back = converter.to_foreign(&matrix).unwrap();
        prop_assert!(back.as_array().unwrap().is_same(&array));
        prop_assert_eq!(matrix.to_vec::<u8>().unwrap(), data);
    }

    #[test]
    fn prop_native_matrices_survive_the_round_trip((rows, cols, channels, data) in image_strategy()) {
        let runtime = Runtime::new();
        let converter = Converter::new(Arc::clone(&runtime));
        let matrix = NativeMatrix::from_slice(&[rows, cols], channels, &data).unwrap();

        let object = converter.to_foreign(&matrix).unwrap();
        let back = converter.to_matrix(&object).unwrap();
        prop_assert_eq!(back.mat_type(), matrix.mat_type());
        prop_assert_eq!(back.dims(), matrix.dims());
        prop_assert_eq!(back.to_vec::<u8>().unwrap(), data);

        drop(object);
        drop(back);
        prop_assert_eq!(runtime.live_storage(), 0);
    }

    #[test]
    fn prop_views_convert_to_their_logical_values(
        rows in 1_usize..6,
        cols in 1_usize..6,
        flip_axis in 0_usize..2,
    ) {
        let runtime = Runtime::new();
        let converter = Converter::new(Arc::clone(&runtime));
        let values: Vec<i16> = (0..rows * cols).map(|v| i16::try_from(v).unwrap() - 10).collect();
        let array = ForeignArray::from_vec(&runtime, &[rows, cols], values).unwrap();

        for view in [array.transposed(), array.flipped(flip_axis).unwrap()] {
            let expected = view.to_vec::<i16>().unwrap();
            let matrix = converter.to_matrix(&view.into()).unwrap();
            prop_assert_eq!(matrix.to_vec::<i16>().unwrap(), expected);
        }
    }
}
