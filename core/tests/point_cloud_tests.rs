use hegn_core::dataset::{load_batches, InMemoryDataset, RegistrationDataset};
use hegn_core::transforms::{Compose, RandomSimilarity, Resampler};
use hegn_core::{PairedBatch, PointBatch, PointCloud, Similarity};
use nalgebra::{Point3, Vector3};
use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_point_cloud_array_handling() {
    let cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 2.0, 3.0)]);
    let array = cloud.to_array();
    assert_eq!(array.shape(), &[2, 3]);
    assert_eq!(PointCloud::from_array(array.view()).unwrap(), cloud);

    let bad = Array2::<f32>::zeros((4, 2));
    let err = PointCloud::from_array(bad.view()).unwrap_err();
    assert!(err.to_string().contains("[N, 3]"));

    assert_eq!(PointCloud::default().centroid(), None);
    assert_eq!(cloud.centroid(), Some(Point3::new(0.5, 1.0, 1.5)));
}

#[test]
fn test_batch_rejects_ragged_clouds() {
    let a = PointCloud::new(vec![Point3::origin(); 4]);
    let b = PointCloud::new(vec![Point3::origin(); 3]);
    let err = PointBatch::from_clouds(&[a.clone(), b]).unwrap_err();
    assert!(err.to_string().contains("has 3 points"));
    assert!(PointBatch::from_clouds(&[]).is_err());
    assert_eq!(PointBatch::from_clouds(&[a.clone(), a]).unwrap().batch_size(), 2);
}

#[test]
fn test_features_put_coordinates_on_the_vector_axis() {
    let points = Array3::from_shape_fn((2, 5, 3), |(b, n, d)| (b * 100 + n * 10 + d) as f32);
    let batch = PointBatch::new(points.clone()).unwrap();
    let features = batch.to_features();
    assert_eq!(features.shape(), &[2, 1, 3, 5]);
    assert_eq!(features[[1, 0, 2, 4]], points[[1, 4, 2]]);
    assert_eq!(features.index_axis(Axis(1), 0).shape(), &[2, 3, 5]);
}

#[test]
fn test_batch_transform_is_per_element() {
    let cloud = PointCloud::new(vec![Point3::new(1.0, 0.0, 0.0)]);
    let batch = PointBatch::from_clouds(&[cloud.clone(), cloud]).unwrap();
    let moved = batch
        .transformed(&[
            Similarity::identity(),
            Similarity::new(nalgebra::Matrix3::identity(), Vector3::repeat(2.0), Vector3::z()),
        ])
        .unwrap();
    assert_eq!(moved.view()[[0, 0, 0]], 1.0);
    assert_eq!(moved.view()[[1, 0, 0]], 2.0);
    assert_eq!(moved.view()[[1, 0, 2]], 1.0);
    assert!(batch.transformed(&[Similarity::identity()]).is_err());
}

#[test]
fn test_dataset_batches_carry_ground_truth() {
    let clouds = (0..5)
        .map(|k| {
            PointCloud::new(
                (0..20)
                    .map(|i| Point3::new(i as f32 * 0.1, k as f32, (i % 4) as f32))
                    .collect(),
            )
        })
        .collect();
    let data = InMemoryDataset::new(clouds).with_transform(
        Compose::new()
            .then(Resampler::new(16))
            .then(RandomSimilarity::new(45.0, 0.5, Some((0.8, 1.2)))),
    );
    assert_eq!(data.len(), 5);

    let mut rng = StdRng::seed_from_u64(3);
    let batches = load_batches(&data, 2, &mut rng).unwrap();
    let sizes: Vec<usize> = batches.iter().map(|b| b.batch_size()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let first = &batches[0];
    assert_eq!(first.pair.num_points(), 16);
    assert_eq!(first.rotation.shape(), &[2, 3, 3]);
    assert_eq!(first.translation.shape(), &[2, 3]);
    assert_eq!(first.scale[[0, 0, 1]], 0.0);

    // target is the source moved by the recorded similarity
    let moved = first.pair.x().transformed(&first.similarities).unwrap();
    let diff = (&moved.view() - &first.pair.y().view()).mapv(f32::abs);
    assert!(diff.iter().all(|d| *d < 1e-4));

    let pair = PairedBatch::new(moved, first.pair.y().clone()).unwrap();
    assert_eq!(pair.batch_size(), 2);
}
