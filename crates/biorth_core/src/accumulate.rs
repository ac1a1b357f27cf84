//! Projection of particles onto the basis.
//!
//! One accumulation pass covers the particles on a chosen set of
//! time-step levels. Work is split into fixed-size chunks, each chunk is
//! reduced into its own partial sums, and the partials are folded in chunk
//! order. The result therefore does not depend on how many worker threads
//! ran the chunks.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::backend::{self, AccumulationJob, ProjectionBackend};
use crate::basis::Basis;
use crate::coefs::{AngularRow, CoefLayout, CoefficientSet};
use crate::config::{AccumulationConfig, Geometry, TrimPolicy};
use crate::context::SimContext;
use crate::error::{Error, Result};
use crate::multistep::MultistepReconciler;
use crate::noise::NoiseEstimate;
use crate::special::{ylm_norm, LegendreTable};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub index: u64,
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub mass: f64,
    /// Multistep level; 0 is the coarsest time step.
    pub level: usize,
}

impl Particle {
    pub fn new(index: u64, position: [f64; 3], mass: f64) -> Self {
        Self {
            index,
            position,
            velocity: [0.0; 3],
            mass,
            level: 0,
        }
    }
}

/// Coefficients with the mass and particle count that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelBuffer {
    pub coefs: CoefficientSet,
    pub mass: f64,
    pub count: usize,
}

impl LevelBuffer {
    pub fn zeros(layout: CoefLayout) -> Self {
        Self {
            coefs: CoefficientSet::zeros(layout),
            mass: 0.0,
            count: 0,
        }
    }

    pub fn layout(&self) -> CoefLayout {
        self.coefs.layout()
    }

    pub fn add(&mut self, other: &LevelBuffer) -> Result<()> {
        self.coefs.add_assign(&other.coefs)?;
        self.mass += other.mass;
        self.count += other.count;
        Ok(())
    }

    pub fn subtract(&mut self, other: &LevelBuffer) -> Result<()> {
        self.coefs.sub_assign(&other.coefs)?;
        self.mass -= other.mass;
        self.count = self.count.saturating_sub(other.count);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.coefs.clear();
        self.mass = 0.0;
        self.count = 0;
    }

    /// Coefficients, mass and count flattened for a collective sum.
    pub fn to_reals(&self) -> Vec<f64> {
        let mut reals = self.coefs.to_reals();
        reals.push(self.mass);
        reals.push(self.count as f64);
        reals
    }

    pub fn set_reals(&mut self, reals: &[f64]) -> Result<()> {
        let n = reals.len();
        if n < 2 {
            return Err(Error::SizeMismatch {
                what: "level buffer reals",
                expected: 2 * self.coefs.layout().len() + 2,
                found: n,
            });
        }
        self.coefs.set_reals(&reals[..n - 2])?;
        self.mass = reals[n - 2];
        self.count = reals[n - 1].round() as usize;
        Ok(())
    }

    /// Elementwise sum over all processes.
    pub fn all_reduce(&mut self, ctx: &SimContext) -> Result<()> {
        if ctx.collective().size() <= 1 {
            return Ok(());
        }
        let mut reals = self.to_reals();
        ctx.collective().all_reduce_sum(&mut reals)?;
        self.set_reals(&reals)
    }
}

/// Per-worker scratch for projecting single particles.
#[derive(Debug, Clone)]
pub struct Projector<'a> {
    basis: &'a Basis,
    rows: Vec<AngularRow>,
    potential: DMatrix<f64>,
    legendre: LegendreTable,
    norms: Vec<f64>,
}

impl<'a> Projector<'a> {
    pub fn new(basis: &'a Basis) -> Self {
        let layout = basis.layout();
        let rows = layout.angular_rows();
        let norms = rows
            .iter()
            .map(|r| match layout.geometry {
                Geometry::Sphere => ylm_norm(r.harmonic, r.m),
                Geometry::Cylinder => 1.0 / (2.0 * PI),
            })
            .collect();
        Self {
            basis,
            rows,
            potential: DMatrix::zeros(layout.lmax + 1, layout.nmax),
            legendre: LegendreTable::new(match layout.geometry {
                Geometry::Sphere => layout.lmax,
                Geometry::Cylinder => 0,
            }),
            norms,
        }
    }

    /// Add the contribution of a point mass at `position` into `out`.
    /// Returns `false`, leaving `out` untouched, when the point lies past
    /// the outer radius or beyond the vertical extent. Points inside the
    /// inner radius are projected with the inner edge values.
    pub fn project(&mut self, position: [f64; 3], mass: f64, out: &mut CoefficientSet) -> Result<bool> {
        let [x, y, z] = position;
        let interp = self.basis.interpolator();
        let phi = y.atan2(x);

        match self.basis.geometry() {
            Geometry::Sphere => {
                let r = (x * x + y * y + z * z).sqrt();
                if !interp.within_outer_edge(r, 0.0) {
                    return Ok(false);
                }
                interp.evaluate_potential(interp.clamp_inner(r), 0.0, &mut self.potential)?;
                self.legendre.fill(if r > 0.0 { z / r } else { 1.0 });
                for (row, norm) in self.rows.iter().zip(&self.norms) {
                    let angular = -mass * norm * self.legendre.p(row.harmonic, row.m);
                    let phase = Complex64::from_polar(angular, -(row.m as f64) * phi);
                    for n in 0..self.potential.ncols() {
                        *out.at_mut(row.row, n) += phase * self.potential[(row.harmonic, n)];
                    }
                }
            }
            Geometry::Cylinder => {
                let r = x.hypot(y);
                if !interp.within_outer_edge(r, z) {
                    return Ok(false);
                }
                interp.evaluate_potential(interp.clamp_inner(r), z, &mut self.potential)?;
                for (row, norm) in self.rows.iter().zip(&self.norms) {
                    let phase = Complex64::from_polar(-mass * norm, -(row.m as f64) * phi);
                    for n in 0..self.potential.ncols() {
                        *out.at_mut(row.row, n) += phase * self.potential[(row.harmonic, n)];
                    }
                }
            }
        }
        Ok(true)
    }
}

/// Subsampling decision and sub-group for one particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub selected: bool,
    pub group: u32,
}

/// Draw subsample membership and sub-groups serially from one seeded
/// stream, so the assignment is independent of the worker layout.
pub fn draw_selection(count: usize, config: &AccumulationConfig, pass_index: u64) -> Vec<Draw> {
    let groups = if config.uses_groups() {
        config.sample_groups as u32
    } else {
        0
    };
    let subsample = config.subsample_fraction < 1.0;
    if !subsample && groups == 0 {
        return vec![
            Draw {
                selected: true,
                group: 0
            };
            count
        ];
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(pass_index));
    (0..count)
        .map(|_| {
            let selected = !subsample || rng.gen::<f64>() < config.subsample_fraction;
            let group = if selected && groups > 0 {
                rng.gen_range(0..groups)
            } else {
                0
            };
            Draw { selected, group }
        })
        .collect()
}

/// Sums from one accumulation pass, already reduced across processes.
#[derive(Debug, Clone, PartialEq)]
pub struct PassResult {
    /// One buffer per requested level, in request order.
    pub levels: Vec<(usize, LevelBuffer)>,
    /// One buffer per statistical sub-group; empty when groups are off.
    pub groups: Vec<LevelBuffer>,
    /// Selected particles that fell outside the tabulated domain.
    pub off_grid: usize,
    /// True when the level buffers had the configured trim policy applied.
    pub trimmed: bool,
    /// Subsample draw of every particle, in particle order.
    pub draws: Vec<Draw>,
}

impl PassResult {
    pub fn total(&self, layout: CoefLayout) -> Result<LevelBuffer> {
        let mut total = LevelBuffer::zeros(layout);
        for (_, buffer) in &self.levels {
            total.add(buffer)?;
        }
        Ok(total)
    }

    pub fn noise(&self) -> Result<NoiseEstimate> {
        NoiseEstimate::from_groups(&self.groups)
    }
}

pub struct CoefficientAccumulator<'a> {
    basis: &'a Basis,
    config: AccumulationConfig,
    backend: Box<dyn ProjectionBackend>,
}

impl<'a> CoefficientAccumulator<'a> {
    pub fn new(basis: &'a Basis, config: AccumulationConfig) -> Result<Self> {
        Self::with_backend(basis, config, backend::select(config.backend))
    }

    pub fn with_backend(
        basis: &'a Basis,
        config: AccumulationConfig,
        backend: Box<dyn ProjectionBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            basis,
            config,
            backend,
        })
    }

    pub fn basis(&self) -> &Basis {
        self.basis
    }

    pub fn config(&self) -> &AccumulationConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Project the particles whose level is in `levels`. `nlevels` bounds
    /// every particle's level. `pass_index` varies the random draw between
    /// passes.
    pub fn pass(
        &self,
        ctx: &SimContext,
        particles: &[Particle],
        levels: &[usize],
        nlevels: usize,
        pass_index: u64,
    ) -> Result<PassResult> {
        let mut active = vec![false; nlevels];
        for &level in levels {
            *active.get_mut(level).ok_or(Error::LevelIndexOutOfRange {
                what: "level",
                index: level,
                limit: nlevels.saturating_sub(1),
            })? = true;
        }
        if let Some(p) = particles.iter().find(|p| p.level >= nlevels) {
            return Err(Error::LevelIndexOutOfRange {
                what: "particle level",
                index: p.level,
                limit: nlevels.saturating_sub(1),
            });
        }

        let draws = draw_selection(particles.len(), &self.config, pass_index);
        let job = AccumulationJob {
            basis: self.basis,
            particles,
            draws: &draws,
            active: &active,
            mass_scale: 1.0 / self.config.subsample_fraction,
            groups: if self.config.uses_groups() {
                self.config.sample_groups
            } else {
                0
            },
            chunk_size: self.config.chunk_size,
        };
        let mut sums = self.backend.accumulate(ctx, &job)?;

        let mut result = PassResult {
            levels: Vec::with_capacity(levels.len()),
            groups: Vec::with_capacity(sums.groups.len()),
            off_grid: sums.off_grid,
            trimmed: false,
            draws,
        };
        for &level in levels {
            let mut buffer = std::mem::replace(&mut sums.levels[level], LevelBuffer::zeros(self.basis.layout()));
            buffer.all_reduce(ctx)?;
            result.levels.push((level, buffer));
        }
        for mut group in sums.groups {
            group.all_reduce(ctx)?;
            result.groups.push(group);
        }
        self.trim(ctx, &mut result)?;
        if result.off_grid > 0 {
            ctx.note(format_args!(
                "{} particles outside the basis domain were skipped",
                result.off_grid
            ));
        }
        Ok(result)
    }

    /// Apply the trim policy to every level buffer, using the signal to
    /// noise measured across the sub-groups of this pass. The factors act
    /// per coefficient, so the trimmed levels still sum to the trimmed
    /// total.
    fn trim(&self, ctx: &SimContext, result: &mut PassResult) -> Result<()> {
        if self.config.trim == TrimPolicy::None || result.groups.is_empty() {
            return Ok(());
        }
        let noise = match result.noise() {
            Ok(noise) => noise,
            Err(Error::InvalidState(reason)) => {
                ctx.warn(format_args!("coefficients left untrimmed: {reason}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for (_, buffer) in &mut result.levels {
            buffer.coefs = noise.trimmed(&buffer.coefs, self.config.trim)?;
        }
        result.trimmed = true;
        Ok(())
    }

    /// Recompute `levels` and commit them to the reconciler.
    pub fn accumulate(
        &self,
        ctx: &SimContext,
        particles: &[Particle],
        levels: &[usize],
        reconciler: &mut MultistepReconciler,
        pass_index: u64,
    ) -> Result<PassResult> {
        for &level in levels {
            reconciler.begin_cycle(level)?;
        }
        let result = self.pass(ctx, particles, levels, reconciler.levels(), pass_index)?;
        for (level, buffer) in &result.levels {
            reconciler.commit(*level, buffer.clone())?;
        }
        Ok(result)
    }

    /// Contribution of one particle, for level-change bookkeeping. Only
    /// valid without subsampling; see [`Self::contribution_in`].
    pub fn contribution(&self, particle: &Particle) -> Result<LevelBuffer> {
        if self.config.subsample_fraction < 1.0 {
            return Err(Error::InvalidState(
                "a subsampled level change needs the particle's draw; use contribution_in".into(),
            ));
        }
        self.contribution_in(particle, Draw { selected: true, group: 0 })
    }

    /// Contribution of one particle as the pass that drew `draw` counted
    /// it: zero when it was not selected, otherwise scaled by the inverse
    /// subsample fraction. Trimming is not applied.
    pub fn contribution_in(&self, particle: &Particle, draw: Draw) -> Result<LevelBuffer> {
        let mut buffer = LevelBuffer::zeros(self.basis.layout());
        if !draw.selected {
            return Ok(buffer);
        }
        let mass = particle.mass * (1.0 / self.config.subsample_fraction);
        let mut projector = Projector::new(self.basis);
        if projector.project(particle.position, mass, &mut buffer.coefs)? {
            buffer.mass = mass;
            buffer.count = 1;
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::Field;
    use crate::config::{BasisConfig, ContextConfig, RangePolicy};
    use crate::mapping::Mapping;

    fn setup() -> (SimContext, Basis) {
        let ctx = SimContext::new(ContextConfig {
            threads: 2,
            verbose: false,
        })
        .unwrap();
        let config = BasisConfig {
            lmax: 2,
            nmax: 3,
            numr: 200,
            ..BasisConfig::default()
        };
        let basis = Basis::build(&ctx, &config).unwrap();
        (ctx, basis)
    }

    fn cloud(n: usize, seed: u64) -> Vec<Particle> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let p = [
                    rng.gen_range(-0.5..0.5),
                    rng.gen_range(-0.5..0.5),
                    rng.gen_range(-0.5..0.5),
                ];
                let mut particle = Particle::new(i as u64, p, 1.0 / n as f64);
                particle.level = i % 2;
                particle
            })
            .collect()
    }

    #[test]
    fn full_sampling_needs_no_random_draws() {
        let draws = draw_selection(5, &AccumulationConfig::default(), 3);
        assert!(draws.iter().all(|d| d.selected && d.group == 0));
    }

    #[test]
    fn draws_are_reproducible_and_respect_fraction() {
        let config = AccumulationConfig {
            subsample_fraction: 0.25,
            sample_groups: 4,
            ..AccumulationConfig::default()
        };
        let a = draw_selection(4000, &config, 0);
        let b = draw_selection(4000, &config, 0);
        assert_eq!(a, b);
        let selected = a.iter().filter(|d| d.selected).count();
        assert!((800..1200).contains(&selected), "{selected}");
        assert!(a.iter().all(|d| d.group < 4));
        assert_ne!(a, draw_selection(4000, &config, 1));
    }

    #[test]
    fn particles_outside_the_table_are_skipped() {
        let (ctx, basis) = setup();
        let accumulator = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
        let particles = vec![
            Particle::new(0, [0.2, 0.0, 0.1], 1.0),
            Particle::new(1, [2.0, 0.0, 0.0], 1.0),
        ];
        let result = accumulator.pass(&ctx, &particles, &[0], 1, 0).unwrap();
        assert_eq!(result.off_grid, 1);
        assert_eq!(result.levels[0].1.count, 1);
        assert_eq!(result.levels[0].1.mass, 1.0);
    }

    #[test]
    fn mass_inside_the_inner_radius_uses_the_edge_values() {
        let ctx = SimContext::new(ContextConfig::default()).unwrap();
        for range_policy in [RangePolicy::Clamp, RangePolicy::Strict] {
            let config = BasisConfig {
                lmax: 0,
                nmax: 3,
                numr: 200,
                rmin: 0.01,
                rmap: Mapping::Log,
                range_policy,
                ..BasisConfig::default()
            };
            let basis = Basis::build(&ctx, &config).unwrap();
            let accumulator = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
            let particles = [Particle::new(0, [0.005, 0.0, 0.0], 1.0)];
            let result = accumulator.pass(&ctx, &particles, &[0], 1, 0).unwrap();
            let level = &result.levels[0].1;
            assert_eq!(result.off_grid, 0);
            assert_eq!(level.mass, 1.0);

            let y00 = 1.0 / (4.0 * PI).sqrt();
            for n in 0..3 {
                let edge = basis.interpolator().evaluate(Field::Potential, 0, n, 0.01, 0.0).unwrap();
                let c = level.coefs.get(0, 0, n).unwrap();
                assert!((c.re + edge * y00).abs() < 1e-12 * edge.abs().max(1.0));
            }
        }
    }

    #[test]
    fn level_passes_sum_to_the_full_pass() {
        let (ctx, basis) = setup();
        let accumulator = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
        let particles = cloud(500, 4);
        let split = accumulator.pass(&ctx, &particles, &[0, 1], 2, 0).unwrap();
        let total = split.total(basis.layout()).unwrap();

        let mut merged = particles.clone();
        for p in &mut merged {
            p.level = 0;
        }
        let whole = accumulator.pass(&ctx, &merged, &[0], 1, 0).unwrap();
        let diff = total.coefs.max_abs_diff(&whole.levels[0].1.coefs).unwrap();
        assert!(diff < 1e-12, "{diff}");
        assert_eq!(total.count, 500);
    }

    #[test]
    fn subsampling_rescales_mass() {
        let (ctx, basis) = setup();
        let config = AccumulationConfig {
            subsample_fraction: 0.5,
            ..AccumulationConfig::default()
        };
        let accumulator = CoefficientAccumulator::new(&basis, config).unwrap();
        let particles = cloud(4000, 9);
        let result = accumulator.pass(&ctx, &particles, &[0, 1], 2, 0).unwrap();
        let total = result.total(basis.layout()).unwrap();
        // Unit total mass survives the 1/fraction rescaling on average.
        assert!((total.mass - 1.0).abs() < 0.1, "{}", total.mass);
        assert!(total.count < 2400);
    }

    #[test]
    fn unknown_levels_are_rejected() {
        let (ctx, basis) = setup();
        let accumulator = CoefficientAccumulator::new(&basis, AccumulationConfig::default()).unwrap();
        let particles = cloud(10, 1);
        assert!(matches!(
            accumulator.pass(&ctx, &particles, &[3], 2, 0),
            Err(Error::LevelIndexOutOfRange { .. })
        ));
        assert!(matches!(
            accumulator.pass(&ctx, &particles, &[0], 1, 0),
            Err(Error::LevelIndexOutOfRange { what: "particle level", .. })
        ));
    }

    #[test]
    fn level_buffers_flatten_for_collectives() {
        let layout = CoefLayout::new(Geometry::Cylinder, 1, 2);
        let mut buffer = LevelBuffer::zeros(layout);
        buffer.coefs.set(1, 1, 0, Complex64::new(1.0, -2.0)).unwrap();
        buffer.mass = 3.0;
        buffer.count = 4;
        let reals = buffer.to_reals();
        assert_eq!(reals.len(), 2 * layout.len() + 2);
        let mut back = LevelBuffer::zeros(layout);
        back.set_reals(&reals).unwrap();
        assert_eq!(back, buffer);
    }
}
