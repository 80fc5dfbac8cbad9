use affine_fusion::{
    AffineMatrix, ChunkPlanner, ChunkSize, ChunkWindow, ChunkedArray, CpuDevice,
    DistributedTransformCoordinator, ElementType, HostVolume, InMemoryArray, Method,
    TransformJob, Volume, VolumeResampler,
};
use ndarray::Array3;
use proptest::prelude::*;

fn volume_strategy() -> impl Strategy<Value = Array3<u16>> {
    (1usize..7, 1usize..7, 1usize..7).prop_flat_map(|shape| {
        prop::collection::vec(any::<u16>(), shape.0 * shape.1 * shape.2)
            .prop_map(move |data| Array3::from_shape_vec(shape, data).unwrap())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn windows_cover_every_voxel_once(
        shape in (1usize..24, 1usize..24, 1usize..24),
        chunk in (1usize..24, 1usize..24, 1usize..24),
    ) {
        prop_assume!(chunk.0 <= shape.0 && chunk.1 <= shape.1 && chunk.2 <= shape.2);
        let windows = ChunkPlanner::plan(shape, ChunkSize::from(chunk)).unwrap();

        let mut hits = Array3::<u8>::zeros(shape);
        for w in &windows {
            let (z, y, x) = w.shape();
            prop_assert!(z <= chunk.0 && y <= chunk.1 && x <= chunk.2);
            prop_assert!(w.z.end <= shape.0 && w.y.end <= shape.1 && w.x.end <= shape.2);
            hits.slice_mut(ndarray::s![w.z.clone(), w.y.clone(), w.x.clone()])
                .mapv_inplace(|h| h + 1);
        }
        prop_assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn chunks_larger_than_the_shape_are_rejected(dim in 1usize..16, extra in 1usize..4) {
        let result = ChunkPlanner::plan((dim, dim, dim), ChunkSize::Uniform(dim + extra));
        prop_assert!(result.is_err());
    }

    #[test]
    fn nearest_identity_is_exact(data in volume_strategy()) {
        let device = CpuDevice::new(0);
        let host = HostVolume::from(data);
        let input = Volume::upload(&device, &host).unwrap();
        let out = VolumeResampler::new(&device)
            .resample(&input, &AffineMatrix::identity(), Method::Nearest, true, None, (2, 2, 2))
            .unwrap();
        prop_assert_eq!(out.to_host(&device).unwrap(), host);
    }

    #[test]
    fn chunked_translation_matches_in_memory(
        data in volume_strategy(),
        shift in (-3i32..4, -3i32..4, -3i32..4),
        chunk in 1usize..4,
    ) {
        let host = HostVolume::from(data);
        let (z, y, x) = host.shape();
        prop_assume!(chunk <= z && chunk <= y && chunk <= x);
        let transform = AffineMatrix::translation(shift.2 as f64, shift.1 as f64, shift.0 as f64);

        let device = CpuDevice::new(0);
        let input = Volume::upload(&device, &host).unwrap();
        let expected = VolumeResampler::new(&device)
            .resample(&input, &transform, Method::Linear, true, None, (2, 2, 2))
            .unwrap()
            .to_host(&device)
            .unwrap();

        let mut job = TransformJob::new(transform, ChunkSize::Uniform(chunk));
        job.preserve_dtype = true;
        job.block_shape = (2, 2, 2);
        let source = InMemoryArray::from_volume(host);
        let output = InMemoryArray::new(expected.shape(), ElementType::U16, 0.0);
        let coordinator = DistributedTransformCoordinator::new(CpuDevice::pool(2)).unwrap();
        let report = coordinator.run_into(&source, &output, &job).unwrap();

        prop_assert!(report.is_complete());
        prop_assert!(output.is_complete());
        prop_assert_eq!(
            output.read_region(&ChunkWindow::full(expected.shape())).unwrap(),
            expected
        );
    }
}
