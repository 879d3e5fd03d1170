use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trcf_rust::{
    AnomalyDescriptor, DetectorConfig, DetectorError, ForestMode, ImputationMethod, ScoreDescriptor,
    ScoringBackend, ScoringStrategy, ThresholdedRandomCutForest, TransformMethod,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn detector(dimensions: usize, seed: u64) -> ThresholdedRandomCutForest {
    let config = DetectorConfig::builder(dimensions)
        .number_of_trees(30)
        .sample_size(128)
        .random_seed(seed)
        .build()
        .unwrap();
    ThresholdedRandomCutForest::new(config).unwrap()
}

fn noisy_level(n: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| vec![1.0 + rng.gen_range(-0.01..0.01)])
        .collect()
}

#[test]
fn spike_after_steady_stream_is_graded() {
    init_logging();
    let mut d = detector(1, 42);
    for (t, point) in noisy_level(300, 1).iter().enumerate() {
        d.process(point, t as i64, &[]).unwrap();
    }
    assert!(d.forest().is_output_ready());
    let record = d.process(&[10.0], 300, &[]).unwrap();
    assert!(record.grade > 0.0, "grade {} score {} threshold {}", record.grade, record.score, record.threshold);
    assert!(record.score > record.threshold);
    let attribution = record.attribution.unwrap();
    assert!(attribution.high[0] > 8.0);
    assert_eq!(d.last_anomaly().unwrap().timestamp, 300);
}

#[test]
fn timestamp_length_mismatch_cites_both_lengths() {
    let mut d = detector(1, 1);
    let err = d
        .process_sequentially(&[vec![1.0], vec![2.0]], Some(&[1000]), None)
        .unwrap_err();
    assert!(err.is_validation());
    assert!(
        err.to_string().contains("length 1 must equal data length 2"),
        "{err}"
    );
    assert_eq!(d.total_updates(), 0);
}

#[test]
fn descending_timestamps_are_rejected() {
    let mut d = detector(1, 1);
    let err = d
        .process_sequentially(&[vec![1.0], vec![2.0]], Some(&[1000, 900]), None)
        .unwrap_err();
    assert!(matches!(err, DetectorError::NonAscendingTimestamps { .. }));
    assert!(err.to_string().contains("ascending"));
    let err = d
        .process_sequentially(&[vec![1.0], vec![2.0]], Some(&[1000, 1000]), None)
        .unwrap_err();
    assert!(matches!(err, DetectorError::NonAscendingTimestamps { .. }));
    assert_eq!(d.total_updates(), 0);
}

#[test]
fn missing_indices_are_validated() {
    let mut d = detector(2, 1);
    let err = d.process(&[1.0, 2.0], 0, &[-1]).unwrap_err();
    assert!(err.to_string().contains("cannot be negative"), "{err}");
    let err = d.process(&[1.0, 2.0], 0, &[2]).unwrap_err();
    let message = err.to_string();
    assert!(message.contains('2') && message.contains("point length 2"), "{message}");
    assert_eq!(d.total_updates(), 0);
}

#[test]
fn batch_validation_happens_before_any_update() {
    let mut d = detector(2, 1);
    let points = vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0]];
    assert!(d.process_sequentially(&points, None, None).is_err());
    assert_eq!(d.total_updates(), 0);
}

#[test]
fn same_seed_reproduces_every_record() {
    let mut stream = noisy_level(250, 9);
    stream[200] = vec![4.0];
    let run = |seed: u64| {
        let mut d = detector(1, seed);
        stream
            .iter()
            .enumerate()
            .map(|(t, p)| d.process(p, t as i64, &[]).unwrap())
            .collect::<Vec<_>>()
    };
    let first = run(77);
    assert_eq!(first, run(77));
    assert_ne!(
        first.iter().map(|r| r.score).collect::<Vec<_>>(),
        run(78).iter().map(|r| r.score).collect::<Vec<_>>()
    );
}

#[test]
fn default_filter_keeps_positive_grades() {
    let mut d = detector(1, 5);
    let mut points = noisy_level(300, 2);
    points.push(vec![25.0]);
    let kept = d.process_sequentially(&points, None, None).unwrap();
    assert!(!kept.is_empty());
    assert!(kept.iter().all(|r| r.grade > 0.0));
    assert_eq!(kept.last().unwrap().timestamp, 300);

    let everything = d
        .process_sequentially(&noisy_level(10, 3), None, Some(&|_: &AnomalyDescriptor| true))
        .unwrap();
    assert_eq!(everything.len(), 10);
    // generated timestamps continue after the previous batch
    assert_eq!(everything[0].timestamp, 301);
}

#[test]
fn checkpoint_round_trip_continues_identically() {
    let mut original = detector(2, 13);
    let mut rng = StdRng::seed_from_u64(4);
    let mut next_point = move || {
        let x: f64 = rng.gen_range(-1.0..1.0);
        vec![x, 3.0 * x + rng.gen_range(-0.1..0.1)]
    };
    for t in 0..150 {
        original.process(&next_point(), t, &[]).unwrap();
    }

    let bytes = original.to_checkpoint(false).unwrap();
    let mut restored = ThresholdedRandomCutForest::from_checkpoint(&bytes).unwrap();
    assert_eq!(restored.total_updates(), original.total_updates());

    for t in 150..250 {
        let point = next_point();
        let a = original.process(&point, t, &[]).unwrap();
        let b = restored.process(&point, t, &[]).unwrap();
        assert_eq!(a, b, "diverged at {t}");
    }
}

#[test]
fn corrupted_checkpoint_fails_closed() {
    let mut d = detector(1, 2);
    for t in 0..20 {
        d.process(&[t as f64], t, &[]).unwrap();
    }
    let mut bytes = d.to_checkpoint(false).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    let err = ThresholdedRandomCutForest::from_checkpoint(&bytes).unwrap_err();
    assert!(matches!(err, DetectorError::ChecksumMismatch));
    assert!(!err.is_validation());
}

#[test]
fn zero_cache_fraction_is_restored_after_each_call() {
    let config = DetectorConfig::builder(1)
        .number_of_trees(10)
        .sample_size(32)
        .bounding_box_cache_fraction(0.0)
        .random_seed(8)
        .build()
        .unwrap();
    let mut d = ThresholdedRandomCutForest::new(config).unwrap();
    for t in 0..40 {
        d.process(&[(t % 5) as f64], t, &[]).unwrap();
        assert_eq!(d.forest().cache_fraction(), 0.0);
    }
    d.process_sequentially(&noisy_level(5, 1), None, None).unwrap();
    assert_eq!(d.forest().cache_fraction(), 0.0);
    assert!(d.forest().trees().iter().all(|t| !t.is_caching()));
    assert!(d.process(&[1.0], 100, &[-3]).is_err());
    assert_eq!(d.forest().cache_fraction(), 0.0);
}

#[test]
fn model_imputation_follows_correlation() {
    let config = DetectorConfig::builder(2)
        .number_of_trees(20)
        .sample_size(64)
        .imputation_method(ImputationMethod::DelegateToModel)
        .random_seed(3)
        .build()
        .unwrap();
    let mut d = ThresholdedRandomCutForest::new(config).unwrap();
    for t in 0..300 {
        let x = (t % 10) as f64;
        d.process(&[x, 2.0 * x], t, &[]).unwrap();
    }
    let record = d.process(&[4.0, f64::NAN], 300, &[1]).unwrap();
    assert_eq!(record.imputed_count, 1);
    assert!((record.input[1] - 8.0).abs() < 0.5, "imputed {}", record.input[1]);
}

#[test]
fn time_augmented_normalized_stream_stays_in_range() {
    let config = DetectorConfig::builder(2)
        .shingle_size(4)
        .forest_mode(ForestMode::TimeAugmented)
        .transform_method(TransformMethod::NormalizeDifference)
        .number_of_trees(10)
        .sample_size(32)
        .random_seed(6)
        .build()
        .unwrap();
    let mut d = ThresholdedRandomCutForest::new(config).unwrap();
    assert_eq!(d.forest().dimensions(), 12);
    let mut rng = StdRng::seed_from_u64(6);
    let mut t = 0;
    for _ in 0..200 {
        t += rng.gen_range(5..15);
        let record = d
            .process(&[rng.gen_range(0.0..1.0), rng.gen_range(10.0..11.0)], t, &[])
            .unwrap();
        assert!((0.0..=1.0).contains(&record.grade));
        if let Some(expected) = &record.expected_values {
            assert_eq!(expected.len(), 2);
        }
    }
}

/// Scores a point by its magnitude and always expects 1.0.
#[derive(Clone, Debug, Default)]
struct Magnitude {
    updates: u64,
}

impl ScoringBackend for Magnitude {
    fn score(&self, point: &[f64]) -> ScoreDescriptor {
        if self.updates == 0 {
            return ScoreDescriptor::empty();
        }
        ScoreDescriptor {
            score: point[0].abs() / 10.0,
            expected_point: Some(vec![1.0]),
            attribution: None,
        }
    }

    fn update(&mut self, _point: &[f64]) {
        self.updates += 1;
    }

    fn total_updates(&self) -> u64 {
        self.updates
    }

    fn shingle_size(&self) -> usize {
        1
    }

    fn dimensions(&self) -> usize {
        1
    }
}

#[test]
fn custom_backend_drives_the_pipeline() {
    let config = DetectorConfig::builder(1).build().unwrap();
    let mut d = ThresholdedRandomCutForest::with_backend(config, Magnitude::default()).unwrap();
    for (t, point) in noisy_level(100, 11).iter().enumerate() {
        d.process(point, t as i64, &[]).unwrap();
    }
    let record = d.process(&[9.0], 100, &[]).unwrap();
    assert!(record.grade > 0.0, "score {} threshold {}", record.score, record.threshold);
    assert!((record.score - 0.9).abs() < 1e-12);
    assert_eq!(record.expected_values, Some(vec![1.0]));
    assert_eq!(d.backend().total_updates(), 101);
    assert_eq!(d.total_updates(), 101);
    assert_eq!(d.last_anomaly().unwrap().timestamp, 100);
}

#[test]
fn custom_backend_must_match_feature_width() {
    let config = DetectorConfig::builder(2).build().unwrap();
    let err = ThresholdedRandomCutForest::with_backend(config, Magnitude::default()).unwrap_err();
    assert!(matches!(err, DetectorError::InvalidConfig(_)));
    assert!(err.to_string().contains("backend accepts 1 features"), "{err}");

    let config = DetectorConfig::builder(1).shingle_size(2).build().unwrap();
    assert!(ThresholdedRandomCutForest::with_backend(config, Magnitude::default()).is_err());
}

#[test]
fn distance_strategy_flags_far_points() {
    let config = DetectorConfig::builder(1)
        .number_of_trees(30)
        .sample_size(128)
        .scoring_strategy(ScoringStrategy::Distance)
        .random_seed(17)
        .build()
        .unwrap();
    let mut d = ThresholdedRandomCutForest::new(config).unwrap();
    for (t, point) in noisy_level(300, 4).iter().enumerate() {
        d.process(point, t as i64, &[]).unwrap();
    }
    let record = d.process(&[10.0], 300, &[]).unwrap();
    assert!(record.distance > 8.0, "distance {}", record.distance);
    assert!(record.distance > record.threshold);
    assert!(record.grade > 0.0, "distance {} threshold {}", record.distance, record.threshold);
}

#[test]
fn default_reservoir_retains_uniformly() {
    // with the default configuration every point offered to a reservoir
    // has the same chance of surviving, so both halves of the stream are
    // equally represented on average
    let trials = 300u64;
    let (mut early, mut late) = (0u64, 0u64);
    for trial in 0..trials {
        let config = DetectorConfig::builder(1)
            .number_of_trees(1)
            .sample_size(16)
            .random_seed((trial + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .build()
            .unwrap();
        assert_eq!(config.sampler_time_decay, 0.0);
        let mut d = ThresholdedRandomCutForest::new(config).unwrap();
        for t in 0..160 {
            d.process(&[t as f64], t, &[]).unwrap();
        }
        for point in d.forest().trees()[0].sampler().iter() {
            if point[0] < 80.0 {
                early += 1;
            } else {
                late += 1;
            }
        }
    }
    assert_eq!(early + late, trials * 16);
    let expected = trials * 8;
    assert!(early.abs_diff(expected) < 200, "early {early} late {late}");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn grade_is_always_within_unit_interval(
        values in prop::collection::vec(-1.0e3f64..1.0e3, 1..80),
        seed in any::<u64>(),
    ) {
        let config = DetectorConfig::builder(1)
            .number_of_trees(5)
            .sample_size(16)
            .random_seed(seed)
            .build()
            .unwrap();
        let mut d = ThresholdedRandomCutForest::new(config).unwrap();
        for (t, &v) in values.iter().enumerate() {
            let record = d.process(&[v], t as i64, &[]).unwrap();
            prop_assert!((0.0..=1.0).contains(&record.grade));
            prop_assert!(record.threshold >= 0.0);
        }
    }
}
