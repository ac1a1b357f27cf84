//! Compute backends for projection and batched field evaluation.
//!
//! Both backends split the work into fixed-size blocks and fold the block
//! results in block order, so their output does not depend on the number
//! of worker threads. [`HostBackend`] runs the projection kernel directly
//! on the particle slice. [`StagedBackend`] follows the layout of a device
//! offload: particles are uploaded once as structure-of-arrays, each block
//! writes its sums into a flat output buffer, and the buffers are
//! downloaded and reduced on the host.

use rayon::prelude::*;

use crate::accumulate::{Draw, LevelBuffer, Particle, Projector};
use crate::basis::Basis;
use crate::coefs::{CoefLayout, CoefficientSet};
use crate::config::BackendKind;
use crate::context::SimContext;
use crate::error::{Error, Result};
use crate::force::{FieldValues, ForceEvaluator};

/// Points per block for batched evaluation.
const EVAL_BLOCK: usize = 1024;

/// Everything a backend needs for one accumulation pass.
#[derive(Debug, Clone, Copy)]
pub struct AccumulationJob<'a> {
    pub basis: &'a Basis,
    pub particles: &'a [Particle],
    /// One entry per particle.
    pub draws: &'a [Draw],
    /// Which levels this pass accumulates, indexed by level.
    pub active: &'a [bool],
    /// Applied to every selected particle's mass.
    pub mass_scale: f64,
    /// Number of statistical sub-groups, zero when disabled.
    pub groups: usize,
    pub chunk_size: usize,
}

impl AccumulationJob<'_> {
    fn check(&self) -> Result<()> {
        if self.draws.len() != self.particles.len() {
            return Err(Error::SizeMismatch {
                what: "particle draws",
                expected: self.particles.len(),
                found: self.draws.len(),
            });
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        Ok(())
    }

    fn wants(&self, particle: &Particle, draw: &Draw) -> bool {
        draw.selected && self.active.get(particle.level).copied().unwrap_or(false)
    }
}

/// Reduced sums of one pass or one block.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialSums {
    /// Indexed by level; inactive levels stay zero.
    pub levels: Vec<LevelBuffer>,
    pub groups: Vec<LevelBuffer>,
    pub off_grid: usize,
}

impl PartialSums {
    pub fn zeros(layout: CoefLayout, levels: usize, groups: usize) -> Self {
        Self {
            levels: vec![LevelBuffer::zeros(layout); levels],
            groups: vec![LevelBuffer::zeros(layout); groups],
            off_grid: 0,
        }
    }

    pub fn merge(&mut self, other: &PartialSums) -> Result<()> {
        for (a, b) in self.levels.iter_mut().zip(&other.levels) {
            a.add(b)?;
        }
        for (a, b) in self.groups.iter_mut().zip(&other.groups) {
            a.add(b)?;
        }
        self.off_grid += other.off_grid;
        Ok(())
    }
}

pub trait ProjectionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn accumulate(&self, ctx: &SimContext, job: &AccumulationJob<'_>) -> Result<PartialSums>;

    /// Cartesian density, potential and force at each point.
    fn evaluate(
        &self,
        ctx: &SimContext,
        evaluator: &ForceEvaluator<'_>,
        points: &[[f64; 3]],
    ) -> Result<Vec<FieldValues>>;
}

pub fn select(kind: BackendKind) -> Box<dyn ProjectionBackend> {
    match kind {
        BackendKind::Host => Box::new(HostBackend),
        BackendKind::Staged => Box::new(StagedBackend),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl HostBackend {
    fn project_chunk(job: &AccumulationJob<'_>, particles: &[Particle], draws: &[Draw]) -> Result<PartialSums> {
        let layout = job.basis.layout();
        let mut sums = PartialSums::zeros(layout, job.active.len(), job.groups);
        let mut projector = Projector::new(job.basis);
        let mut contrib = CoefficientSet::zeros(layout);

        for (p, d) in particles.iter().zip(draws) {
            if !job.wants(p, d) {
                continue;
            }
            let mass = p.mass * job.mass_scale;
            let inside = if job.groups == 0 {
                projector.project(p.position, mass, &mut sums.levels[p.level].coefs)?
            } else {
                contrib.clear();
                let inside = projector.project(p.position, mass, &mut contrib)?;
                if inside {
                    sums.levels[p.level].coefs.add_assign(&contrib)?;
                    let group = &mut sums.groups[d.group as usize];
                    group.coefs.add_assign(&contrib)?;
                    group.mass += mass;
                    group.count += 1;
                }
                inside
            };
            if inside {
                sums.levels[p.level].mass += mass;
                sums.levels[p.level].count += 1;
            } else {
                sums.off_grid += 1;
            }
        }
        Ok(sums)
    }
}

impl ProjectionBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn accumulate(&self, ctx: &SimContext, job: &AccumulationJob<'_>) -> Result<PartialSums> {
        job.check()?;
        let partials = ctx.pool().install(|| {
            job.particles
                .par_chunks(job.chunk_size)
                .zip(job.draws.par_chunks(job.chunk_size))
                .map(|(particles, draws)| Self::project_chunk(job, particles, draws))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut total = PartialSums::zeros(job.basis.layout(), job.active.len(), job.groups);
        for partial in &partials {
            total.merge(partial)?;
        }
        Ok(total)
    }

    fn evaluate(
        &self,
        ctx: &SimContext,
        evaluator: &ForceEvaluator<'_>,
        points: &[[f64; 3]],
    ) -> Result<Vec<FieldValues>> {
        let blocks = ctx.pool().install(|| {
            points
                .par_chunks(EVAL_BLOCK)
                .map(|block| {
                    let mut scratch = evaluator.scratch();
                    block
                        .iter()
                        .map(|&x| evaluator.evaluate_cartesian_with(&mut scratch, x))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(blocks.into_iter().flatten().collect())
    }
}

/// Structure-of-arrays copy of the particles a pass will project.
#[derive(Debug, Default)]
struct DeviceParticles {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    mass: Vec<f64>,
    level: Vec<u32>,
    group: Vec<u32>,
}

impl DeviceParticles {
    fn upload(job: &AccumulationJob<'_>) -> Self {
        let mut device = Self::default();
        for (p, d) in job.particles.iter().zip(job.draws) {
            if !job.wants(p, d) {
                continue;
            }
            device.x.push(p.position[0]);
            device.y.push(p.position[1]);
            device.z.push(p.position[2]);
            device.mass.push(p.mass * job.mass_scale);
            device.level.push(p.level as u32);
            device.group.push(d.group);
        }
        device
    }

    fn len(&self) -> usize {
        self.x.len()
    }
}

/// Offsets into a block's flat output buffer. Each level and group slot
/// holds interleaved coefficients followed by mass and count; the final
/// word counts particles outside the domain.
#[derive(Debug, Clone, Copy)]
struct OutputLayout {
    slot: usize,
    levels: usize,
    groups: usize,
}

impl OutputLayout {
    fn new(layout: CoefLayout, levels: usize, groups: usize) -> Self {
        Self {
            slot: 2 * layout.len() + 2,
            levels,
            groups,
        }
    }

    fn len(&self) -> usize {
        self.slot * (self.levels + self.groups) + 1
    }

    fn level(&self, level: usize) -> usize {
        level * self.slot
    }

    fn group(&self, group: usize) -> usize {
        (self.levels + group) * self.slot
    }

    fn off_grid(&self) -> usize {
        self.len() - 1
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StagedBackend;

impl StagedBackend {
    fn kernel(
        job: &AccumulationJob<'_>,
        device: &DeviceParticles,
        out_layout: OutputLayout,
        range: std::ops::Range<usize>,
    ) -> Result<Vec<f64>> {
        let layout = job.basis.layout();
        let mut out = vec![0.0; out_layout.len()];
        let mut projector = Projector::new(job.basis);
        let mut contrib = CoefficientSet::zeros(layout);

        for i in range {
            contrib.clear();
            let position = [device.x[i], device.y[i], device.z[i]];
            if !projector.project(position, device.mass[i], &mut contrib)? {
                out[out_layout.off_grid()] += 1.0;
                continue;
            }
            let reals = contrib.to_reals();
            let mut deposit = |offset: usize| {
                let slot = &mut out[offset..offset + out_layout.slot];
                for (dst, v) in slot.iter_mut().zip(&reals) {
                    *dst += v;
                }
                slot[out_layout.slot - 2] += device.mass[i];
                slot[out_layout.slot - 1] += 1.0;
            };
            deposit(out_layout.level(device.level[i] as usize));
            if out_layout.groups > 0 {
                deposit(out_layout.group(device.group[i] as usize));
            }
        }
        Ok(out)
    }
}

impl ProjectionBackend for StagedBackend {
    fn name(&self) -> &'static str {
        "staged"
    }

    fn accumulate(&self, ctx: &SimContext, job: &AccumulationJob<'_>) -> Result<PartialSums> {
        job.check()?;
        let layout = job.basis.layout();
        let device = DeviceParticles::upload(job);
        let out_layout = OutputLayout::new(layout, job.active.len(), job.groups);
        let block = job.chunk_size;
        let blocks = device.len().div_ceil(block);

        let outputs = ctx.pool().install(|| {
            (0..blocks)
                .into_par_iter()
                .map(|b| {
                    let range = b * block..((b + 1) * block).min(device.len());
                    Self::kernel(job, &device, out_layout, range)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        // Download and reduce in block order.
        let mut flat = vec![0.0; out_layout.len()];
        for output in &outputs {
            for (dst, v) in flat.iter_mut().zip(output) {
                *dst += v;
            }
        }

        let mut sums = PartialSums::zeros(layout, job.active.len(), job.groups);
        for (level, buffer) in sums.levels.iter_mut().enumerate() {
            let at = out_layout.level(level);
            buffer.set_reals(&flat[at..at + out_layout.slot])?;
        }
        for (group, buffer) in sums.groups.iter_mut().enumerate() {
            let at = out_layout.group(group);
            buffer.set_reals(&flat[at..at + out_layout.slot])?;
        }
        sums.off_grid = flat[out_layout.off_grid()].round() as usize;
        Ok(sums)
    }

    fn evaluate(
        &self,
        ctx: &SimContext,
        evaluator: &ForceEvaluator<'_>,
        points: &[[f64; 3]],
    ) -> Result<Vec<FieldValues>> {
        const WIDTH: usize = 5;
        let x: Vec<f64> = points.iter().map(|p| p[0]).collect();
        let y: Vec<f64> = points.iter().map(|p| p[1]).collect();
        let z: Vec<f64> = points.iter().map(|p| p[2]).collect();
        let blocks = points.len().div_ceil(EVAL_BLOCK);

        let outputs = ctx.pool().install(|| {
            (0..blocks)
                .into_par_iter()
                .map(|b| -> Result<Vec<f64>> {
                    let range = b * EVAL_BLOCK..((b + 1) * EVAL_BLOCK).min(points.len());
                    let mut scratch = evaluator.scratch();
                    let mut out = Vec::with_capacity(range.len() * WIDTH);
                    for i in range {
                        let v = evaluator.evaluate_cartesian_with(&mut scratch, [x[i], y[i], z[i]])?;
                        out.extend([v.density, v.potential, v.force[0], v.force[1], v.force[2]]);
                    }
                    Ok(out)
                })
                .collect::<Result<Vec<Vec<f64>>>>()
        })?;

        Ok(outputs
            .iter()
            .flat_map(|out| out.chunks_exact(WIDTH))
            .map(|w| FieldValues {
                density: w[0],
                potential: w[1],
                force: [w[2], w[3], w[4]],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::draw_selection;
    use crate::config::{AccumulationConfig, BasisConfig, ContextConfig, Geometry};
    use crate::mapping::Mapping;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn disk_basis(ctx: &SimContext) -> Basis {
        let config = BasisConfig {
            geometry: Geometry::Cylinder,
            lmax: 2,
            nmax: 3,
            numr: 60,
            numz: 20,
            zmax: 0.3,
            rmap: Mapping::Identity,
            ..BasisConfig::default()
        };
        Basis::build(ctx, &config).unwrap()
    }

    fn particles(n: usize) -> Vec<Particle> {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        (0..n)
            .map(|i| {
                let r: f64 = 1.1 * rng.gen::<f64>();
                let phi: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
                let z: f64 = rng.gen_range(-0.2..0.2);
                let mut p = Particle::new(i as u64, [r * phi.cos(), r * phi.sin(), z], 1e-3);
                p.level = i % 3;
                p
            })
            .collect()
    }

    #[test]
    fn host_and_staged_sums_agree() {
        let ctx = SimContext::new(ContextConfig {
            threads: 3,
            verbose: false,
        })
        .unwrap();
        let basis = disk_basis(&ctx);
        let particles = particles(3000);
        let config = AccumulationConfig {
            sample_groups: 4,
            chunk_size: 256,
            ..AccumulationConfig::default()
        };
        let draws = draw_selection(particles.len(), &config, 0);
        let job = AccumulationJob {
            basis: &basis,
            particles: &particles,
            draws: &draws,
            active: &[true, false, true],
            mass_scale: 1.0,
            groups: 4,
            chunk_size: 256,
        };
        let host = HostBackend.accumulate(&ctx, &job).unwrap();
        let staged = StagedBackend.accumulate(&ctx, &job).unwrap();

        assert_eq!(host.off_grid, staged.off_grid);
        assert!(host.off_grid > 0);
        for (a, b) in host.levels.iter().zip(&staged.levels).chain(host.groups.iter().zip(&staged.groups)) {
            assert_eq!(a.count, b.count);
            assert!((a.mass - b.mass).abs() < 1e-12);
            let diff = a.coefs.max_abs_diff(&b.coefs).unwrap();
            assert!(diff <= 1e-10 * a.coefs.max_abs().max(1.0), "{diff}");
        }
        assert_eq!(host.levels[1].count, 0);
    }

    #[test]
    fn mismatched_draws_are_rejected() {
        let ctx = SimContext::new(ContextConfig::default()).unwrap();
        let basis = disk_basis(&ctx);
        let particles = particles(4);
        let job = AccumulationJob {
            basis: &basis,
            particles: &particles,
            draws: &[],
            active: &[true],
            mass_scale: 1.0,
            groups: 0,
            chunk_size: 2,
        };
        assert!(HostBackend.accumulate(&ctx, &job).is_err());
        assert!(StagedBackend.accumulate(&ctx, &job).is_err());
    }

    #[test]
    fn select_matches_kind() {
        assert_eq!(select(BackendKind::Host).name(), "host");
        assert_eq!(select(BackendKind::Staged).name(), "staged");
    }
}
