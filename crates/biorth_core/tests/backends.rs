use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use biorth_core::mapping::Mapping;
use biorth_core::{
    AccumulationConfig, BackendKind, Basis, BasisConfig, CoefFrame, CoefHistory, CoefficientAccumulator,
    ContextConfig, ForceEvaluator, Geometry, HarmonicFilter, HostBackend, MultistepReconciler, Particle, Playback,
    SimContext, StagedBackend, TrimPolicy,
};

fn ctx(threads: usize) -> SimContext {
    SimContext::new(ContextConfig {
        threads,
        verbose: false,
    })
    .unwrap()
}

fn disk_config() -> BasisConfig {
    BasisConfig {
        geometry: Geometry::Cylinder,
        lmax: 4,
        nmax: 4,
        numr: 120,
        numz: 30,
        zmax: 0.3,
        rmap: Mapping::Identity,
        ..BasisConfig::default()
    }
}

fn disk_cloud(n: usize, seed: u64) -> Vec<Particle> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let r: f64 = rng.gen_range(0.0..0.9);
            let a: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
            let z: f64 = rng.gen_range(-0.05..0.05);
            Particle::new(i as u64, [r * a.cos(), r * a.sin(), z], 1.0 / n as f64)
        })
        .collect()
}

#[test]
fn thread_count_does_not_change_the_result() {
    let particles = disk_cloud(3000, 4);
    let config = AccumulationConfig {
        chunk_size: 128,
        subsample_fraction: 0.5,
        sample_groups: 4,
        ..AccumulationConfig::default()
    };

    let mut results = Vec::new();
    for threads in [1, 4] {
        let ctx = ctx(threads);
        let basis = Basis::build(&ctx, &disk_config()).unwrap();
        let acc = CoefficientAccumulator::new(&basis, config).unwrap();
        results.push(acc.pass(&ctx, &particles, &[0], 1, 9).unwrap());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn host_and_staged_backends_agree() {
    let ctx = ctx(3);
    let basis = Basis::build(&ctx, &disk_config()).unwrap();
    let particles = disk_cloud(1500, 12);

    let mut passes = Vec::new();
    for kind in [BackendKind::Host, BackendKind::Staged] {
        let config = AccumulationConfig {
            backend: kind,
            chunk_size: 100,
            sample_groups: 3,
            ..AccumulationConfig::default()
        };
        let acc = CoefficientAccumulator::new(&basis, config).unwrap();
        passes.push(acc.pass(&ctx, &particles, &[0], 1, 0).unwrap());
    }
    let (host, staged) = (&passes[0], &passes[1]);
    let diff = host.levels[0].1.coefs.max_abs_diff(&staged.levels[0].1.coefs).unwrap();
    assert!(diff < 1e-12 * host.levels[0].1.coefs.max_abs());
    assert_eq!(host.levels[0].1.count, staged.levels[0].1.count);
    assert_eq!(host.groups.len(), staged.groups.len());

    let coefs = &host.levels[0].1.coefs;
    let eval = ForceEvaluator::new(&basis, coefs, HarmonicFilter::default()).unwrap();
    let points: Vec<[f64; 3]> = (0..37).map(|i| [0.02 * i as f64, 0.3, 0.01 * (i % 5) as f64 - 0.02]).collect();
    let a = eval.evaluate_points(&ctx, &HostBackend, &points).unwrap();
    let b = eval.evaluate_points(&ctx, &StagedBackend, &points).unwrap();
    assert_eq!(a.len(), points.len());
    for (x, y) in a.iter().zip(&b) {
        assert!((x.potential - y.potential).abs() < 1e-12);
        for k in 0..3 {
            assert!((x.force[k] - y.force[k]).abs() < 1e-12);
        }
    }
}

#[test]
fn subsampling_is_reproducible_and_rescales_mass() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &disk_config()).unwrap();
    let particles = disk_cloud(4000, 30);
    let config = AccumulationConfig {
        subsample_fraction: 0.25,
        ..AccumulationConfig::default()
    };
    let acc = CoefficientAccumulator::new(&basis, config).unwrap();

    let first = acc.pass(&ctx, &particles, &[0], 1, 2).unwrap();
    let again = acc.pass(&ctx, &particles, &[0], 1, 2).unwrap();
    let other = acc.pass(&ctx, &particles, &[0], 1, 3).unwrap();
    assert_eq!(first, again);
    assert_ne!(first.levels[0].1.coefs, other.levels[0].1.coefs);

    let level = &first.levels[0].1;
    assert!(level.count > 800 && level.count < 1200, "selected {}", level.count);
    assert!((level.mass - 1.0).abs() < 0.15, "mass {}", level.mass);
}

#[test]
fn noise_trimming_leaves_well_measured_terms() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &disk_config()).unwrap();
    let particles = disk_cloud(4000, 77);
    let config = AccumulationConfig {
        sample_groups: 8,
        trim: TrimPolicy::Truncate { snr_min: 1.0 },
        ..AccumulationConfig::default()
    };
    let acc = CoefficientAccumulator::new(&basis, config).unwrap();
    let result = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap();
    let noise = result.noise().unwrap();
    assert_eq!(noise.groups, 8);

    assert!(result.trimmed);
    let total = result.total(basis.layout()).unwrap();
    // Truncation is idempotent on an already trimmed set.
    let again = noise.trimmed(&total.coefs, config.trim).unwrap();
    assert_eq!(again, total.coefs);
    // The axisymmetric leading term of a uniform disk is measured well.
    assert_ne!(total.coefs.get(0, 0, 0).unwrap(), Complex64::new(0.0, 0.0));
    assert!(noise.snr[(0, 0)] > 100.0);
}

#[test]
fn trim_policy_shapes_committed_levels() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &disk_config()).unwrap();
    let particles = disk_cloud(2000, 12);
    let committed = |trim: TrimPolicy| {
        let config = AccumulationConfig {
            sample_groups: 4,
            trim,
            ..AccumulationConfig::default()
        };
        let acc = CoefficientAccumulator::new(&basis, config).unwrap();
        let mut reconciler = MultistepReconciler::new(basis.layout(), 1).unwrap();
        let result = acc.accumulate(&ctx, &particles, &[0], &mut reconciler, 0).unwrap();
        (result, reconciler.reconcile(0.0).unwrap().clone())
    };

    let (plain, kept) = committed(TrimPolicy::None);
    assert!(!plain.trimmed);
    assert_eq!(kept, plain.levels[0].1.coefs);

    let (trimmed, zeroed) = committed(TrimPolicy::Truncate { snr_min: 1e30 });
    assert!(trimmed.trimmed);
    assert_eq!(trimmed.groups, plain.groups);
    assert_eq!(zeroed.get(0, 0, 0).unwrap(), Complex64::new(0.0, 0.0));
    assert_ne!(zeroed, kept);

    let (_, hall) = committed(TrimPolicy::Hall);
    let lead = hall.get(0, 0, 0).unwrap().re / kept.get(0, 0, 0).unwrap().re;
    assert!(lead > 0.9 && lead < 1.0, "{lead}");
}

#[test]
fn playback_reproduces_recorded_frames_exactly() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &disk_config()).unwrap();
    let acc = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();

    let mut history = CoefHistory::new(basis.layout());
    for (step, time) in [0.0, 0.5, 1.5].into_iter().enumerate() {
        let particles = disk_cloud(400, step as u64);
        let coefs = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap().levels[0].1.coefs.clone();
        let mut frame = CoefFrame::new("disk", time, coefs);
        frame.set_center(&[0.0, 0.0, 0.01 * step as f64]).unwrap();
        history.push(frame).unwrap();
    }
    let path = std::env::temp_dir().join(format!("biorth-playback-{}.bin", std::process::id()));
    history.write(&path).unwrap();
    let playback = Playback::new(CoefHistory::read(&path).unwrap()).unwrap();
    std::fs::remove_file(&path).unwrap();

    let point = [0.31, -0.2, 0.04];
    for frame in history.frames() {
        let replayed = playback.coefficients_at(frame.time).unwrap();
        assert_eq!(replayed.coefs, frame.coefs);
        let live = ForceEvaluator::new(&basis, &frame.coefs, HarmonicFilter::default()).unwrap();
        let played = ForceEvaluator::new(&basis, &replayed.coefs, HarmonicFilter::default()).unwrap();
        assert_eq!(
            live.evaluate_cartesian(point).unwrap(),
            played.evaluate_cartesian(point).unwrap()
        );
    }

    let mid = playback.coefficients_at(1.0).unwrap();
    let a = history.frames()[1].coefs.get(2, 2, 1).unwrap();
    let b = history.frames()[2].coefs.get(2, 2, 1).unwrap();
    let expected = (a + b) * Complex64::new(0.5, 0.0);
    assert!((mid.coefs.get(2, 2, 1).unwrap() - expected).norm() < 1e-15);
    assert!((mid.center[2] - 0.015).abs() < 1e-15);
    assert!(playback.coefficients_at(2.0).is_err());
}
