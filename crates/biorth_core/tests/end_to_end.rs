use std::f64::consts::PI;

use biorth_core::basis::OrthoSummary;
use biorth_core::mapping::Mapping;
use biorth_core::{
    AccumulationConfig, Basis, BasisConfig, CoefficientAccumulator, ContextConfig, Field, ForceEvaluator, Geometry,
    HarmonicFilter, Particle, SimContext,
};

fn ctx(threads: usize) -> SimContext {
    SimContext::new(ContextConfig {
        threads,
        verbose: false,
    })
    .unwrap()
}

fn monopole_config(nmax: usize) -> BasisConfig {
    BasisConfig {
        geometry: Geometry::Sphere,
        lmax: 0,
        nmax,
        numr: 2000,
        rmin: 0.0,
        rmax: 1.0,
        ..BasisConfig::default()
    }
}

#[test]
fn single_particle_reconstruction_matches_tabulated_sum() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &monopole_config(4)).unwrap();
    let acc = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
    let particles = [Particle::new(0, [0.5, 0.0, 0.0], 1.0)];
    let result = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap();
    let coefs = &result.levels[0].1.coefs;
    assert_eq!(result.off_grid, 0);

    let interp = basis.interpolator();
    let y00 = 1.0 / (4.0 * PI).sqrt();
    for n in 0..4 {
        let expected = -interp.evaluate(Field::Potential, 0, n, 0.5, 0.0).unwrap() * y00;
        let c = coefs.get(0, 0, n).unwrap();
        assert!((c.re - expected).abs() < 1e-12 * expected.abs().max(1.0));
        assert_eq!(c.im, 0.0);
    }

    let eval = ForceEvaluator::new(&basis, coefs, HarmonicFilter::default()).unwrap();
    for r in [0.05, 0.3, 0.5, 0.75, 0.95] {
        let mut sum = 0.0;
        for n in 0..4 {
            let pot = interp.evaluate(Field::Potential, 0, n, r, 0.0).unwrap();
            sum += coefs.get(0, 0, n).unwrap().re * y00 * pot;
        }
        let got = eval.evaluate([r, 1.1, 0.4]).unwrap().potential;
        assert!((got - sum).abs() < 1e-12 * sum.abs().max(1.0), "r = {r}: {got} vs {sum}");
    }
}

#[test]
fn monopole_expansion_approaches_point_mass_shell_potential() {
    let ctx = ctx(2);
    let basis = Basis::build(&ctx, &monopole_config(24)).unwrap();
    let acc = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
    let particles = [Particle::new(0, [0.0, 0.0, 0.5], 1.0)];
    let result = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap();
    let eval = ForceEvaluator::new(&basis, &result.levels[0].1.coefs, HarmonicFilter::default()).unwrap();

    for r in [0.2_f64, 0.35, 0.7, 0.9] {
        let exact = -1.0 / r.max(0.5);
        let got = eval.evaluate([r, 0.7, 0.0]).unwrap().potential;
        assert!((got - exact).abs() < 3e-2 * exact.abs(), "r = {r}: {got} vs {exact}");
    }
}

#[test]
fn sphere_basis_is_biorthonormal() {
    let config = BasisConfig {
        lmax: 2,
        nmax: 6,
        numr: 2000,
        knots: 200,
        ..BasisConfig::default()
    };
    let basis = Basis::build(&ctx(2), &config).unwrap();
    let matrices = basis.ortho_check().unwrap();
    assert_eq!(matrices.len(), 3);
    for m in &matrices {
        for i in 0..6 {
            assert!((m[(i, i)] + 1.0).abs() < 1e-2, "diagonal {}", m[(i, i)]);
        }
    }
    let summary = OrthoSummary::from_matrices(&matrices);
    assert!(summary.off_diagonal < 1e-3, "{summary:?}");
}

#[test]
fn disk_basis_is_biorthonormal_on_the_midplane() {
    let config = BasisConfig {
        geometry: Geometry::Cylinder,
        lmax: 2,
        nmax: 5,
        numr: 2000,
        numz: 4,
        zmax: 0.1,
        rmap: Mapping::Identity,
        knots: 200,
        ..BasisConfig::default()
    };
    let basis = Basis::build(&ctx(2), &config).unwrap();
    let matrices = basis.ortho_check().unwrap();
    assert_eq!(matrices.len(), 3);
    for m in &matrices {
        for i in 0..5 {
            assert!((m[(i, i)] + 1.0).abs() < 1e-2, "diagonal {}", m[(i, i)]);
        }
    }
    let summary = OrthoSummary::from_matrices(&matrices);
    assert!(summary.off_diagonal < 1e-3, "{summary:?}");
}

#[test]
fn vertical_force_is_odd_and_potential_even() {
    let ctx = ctx(2);
    let config = BasisConfig {
        geometry: Geometry::Cylinder,
        lmax: 3,
        nmax: 4,
        numr: 200,
        numz: 60,
        zmax: 0.4,
        rmap: Mapping::Identity,
        ..BasisConfig::default()
    };
    let basis = Basis::build(&ctx, &config).unwrap();
    let interp = basis.interpolator();
    for (h, n, r, z) in [(0, 0, 0.3, 0.05), (2, 3, 0.71, 0.2), (3, 1, 0.05, 0.33)] {
        let up = interp.evaluate(Field::VerticalForce, h, n, r, z).unwrap();
        let down = interp.evaluate(Field::VerticalForce, h, n, r, -z).unwrap();
        assert_eq!(up, -down);
        let pu = interp.evaluate(Field::Potential, h, n, r, z).unwrap();
        let pd = interp.evaluate(Field::Potential, h, n, r, -z).unwrap();
        assert_eq!(pu, pd);
    }

    let particles: Vec<Particle> = (0..16)
        .map(|i| {
            let a = 0.4 * i as f64;
            Particle::new(i, [0.5 * a.cos(), 0.5 * a.sin(), 0.01 * (i % 3) as f64], 1.0 / 16.0)
        })
        .collect();
    let acc = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
    let coefs = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap().levels[0].1.coefs.clone();
    let eval = ForceEvaluator::new(&basis, &coefs, HarmonicFilter::default()).unwrap();
    let up = eval.evaluate([0.4, 0.9, 0.15]).unwrap();
    let down = eval.evaluate([0.4, 0.9, -0.15]).unwrap();
    assert_eq!(up.force[2], -down.force[2]);
    assert_eq!(up.potential, down.potential);
}

#[test]
fn monopole_filter_is_rotation_invariant() {
    let ctx = ctx(2);
    let config = BasisConfig {
        lmax: 4,
        nmax: 6,
        numr: 600,
        ..BasisConfig::default()
    };
    let basis = Basis::build(&ctx, &config).unwrap();
    let particles: Vec<Particle> = (0..40)
        .map(|i| {
            let t = i as f64;
            Particle::new(i, [0.4 * (1.3 * t).cos(), 0.3 * (0.7 * t).sin(), 0.2 * (0.9 * t).cos()], 0.025)
        })
        .collect();
    let acc = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
    let coefs = acc.pass(&ctx, &particles, &[0], 1, 0).unwrap().levels[0].1.coefs.clone();
    let eval = ForceEvaluator::new(&basis, &coefs, HarmonicFilter::monopole_only()).unwrap();

    let reference = eval.evaluate([0.45, 0.3, 0.0]).unwrap();
    for (theta, phi) in [(1.2, 2.0), (2.9, -1.0), (0.01, 4.0)] {
        let v = eval.evaluate([0.45, theta, phi]).unwrap();
        assert!((v.potential - reference.potential).abs() < 1e-13);
        assert!((v.force[0] - reference.force[0]).abs() < 1e-13);
        assert!(v.force[1].abs() < 1e-13);
        assert!(v.force[2].abs() < 1e-13);
    }
}
