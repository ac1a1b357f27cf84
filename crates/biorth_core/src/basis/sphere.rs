//! Spherical Bessel basis inside a sphere of radius `rmax`.
//!
//! The `(l, n)` pair uses `k = a/rmax` where `a` is the `n`-th zero of
//! `j_{l-1}`, which makes the potential join smoothly onto the exterior
//! solution `r^{-(l+1)}`. With
//!
//! ```text
//! ρ = j_l(kr)/N,   Φ = -4π j_l(kr)/(k² N),   N² = (4π/k²)(rmax³/2) j_l(a)²
//! ```
//!
//! the pairs satisfy `∫ Φ_n ρ_p r² dr = -δ_np` on `[0, rmax]`.

use std::f64::consts::PI;

use rayon::prelude::*;

use super::table::{BasisTable, FieldTable};
use super::ModeValues;
use crate::config::{BasisConfig, Geometry};
use crate::context::SimContext;
use crate::error::Result;
use crate::mapping::AxisGrid;
use crate::roots::RootFamily;
use crate::special::{spherical_bessel_j, spherical_bessel_jp};

/// One radial function of the spherical basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereMode {
    pub l: usize,
    pub k: f64,
    pub norm: f64,
}

impl SphereMode {
    /// Mode built on `root`, a zero of `j_{l-1}`.
    pub fn new(l: usize, root: f64, rmax: f64) -> Self {
        let k = root / rmax;
        let jl = spherical_bessel_j(l, root)[l];
        let norm = (4.0 * PI / (k * k) * 0.5 * rmax.powi(3) * jl * jl).sqrt();
        Self { l, k, norm }
    }

    pub fn eval(&self, r: f64) -> ModeValues {
        let l = self.l;
        let j = spherical_bessel_j(l + 1, self.k * r);
        let jl = j[l];
        let jp = spherical_bessel_jp(l, &j);
        ModeValues {
            potential: -4.0 * PI * jl / (self.k * self.k * self.norm),
            density: jl / self.norm,
            radial_force: 4.0 * PI * jp / (self.k * self.norm),
            vertical_force: 0.0,
        }
    }
}

pub(crate) fn tabulate(ctx: &SimContext, config: &BasisConfig) -> Result<BasisTable> {
    let radial = AxisGrid::new(config.rmap, config.scale, config.rmin, config.rmax, config.numr)?;
    let nmax = config.nmax;
    let numr = config.numr;

    let blocks: Vec<[Vec<f64>; 3]> = ctx.pool().install(|| {
        (0..=config.lmax)
            .into_par_iter()
            .map(|l| {
                let roots = ctx
                    .roots()
                    .get(RootFamily::SphericalBessel, l as i32 - 1, nmax)?;
                let mut potential = vec![0.0; nmax * numr];
                let mut density = vec![0.0; nmax * numr];
                let mut rforce = vec![0.0; nmax * numr];
                for (n, &root) in roots.zeros.iter().enumerate() {
                    let mode = SphereMode::new(l, root, config.rmax);
                    for i in 0..numr {
                        let v = mode.eval(radial.node(i));
                        potential[n * numr + i] = v.potential;
                        density[n * numr + i] = v.density;
                        rforce[n * numr + i] = v.radial_force;
                    }
                }
                Ok([potential, density, rforce])
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut potential = Vec::with_capacity(blocks.len());
    let mut density = Vec::with_capacity(blocks.len());
    let mut rforce = Vec::with_capacity(blocks.len());
    for [p, d, f] in blocks {
        potential.push(p);
        density.push(d);
        rforce.push(f);
    }

    Ok(BasisTable {
        geometry: Geometry::Sphere,
        lmax: config.lmax,
        nmax,
        radial,
        vertical: AxisGrid::single(),
        potential: FieldTable::from_blocks(nmax, numr, potential)?,
        density: FieldTable::from_blocks(nmax, numr, density)?,
        rforce: FieldTable::from_blocks(nmax, numr, rforce)?,
        zforce: None,
    })
}
