//! Bessel basis of a razor-thin disk of radius `rmax`.
//!
//! For harmonic `m` and `k = a/rmax`, with `a` a zero of `J_m`, the surface
//! density `Σ = J_m(kR)/N` generates
//!
//! ```text
//! Φ(R, z) = -(2π/k) J_m(kR) e^{-k|z|} / N,   N² = (2π/k)(rmax²/2) J_{m+1}(a)²
//! ```
//!
//! and the pairs satisfy `∫ Φ_n(R, 0) Σ_p R dR = -δ_np`. Tables cover
//! `z >= 0`; the vertical force is odd in `z`.

use std::f64::consts::PI;

use rayon::prelude::*;

use super::table::{BasisTable, FieldTable};
use super::ModeValues;
use crate::config::{BasisConfig, Geometry};
use crate::context::SimContext;
use crate::error::Result;
use crate::mapping::AxisGrid;
use crate::roots::RootFamily;
use crate::special::{bessel_j, bessel_jp};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskMode {
    pub m: usize,
    pub k: f64,
    pub norm: f64,
}

impl DiskMode {
    /// Mode built on `root`, a zero of `J_m`.
    pub fn new(m: usize, root: f64, rmax: f64) -> Self {
        let k = root / rmax;
        let jm1 = bessel_j(m + 1, root)[m + 1];
        let norm = (2.0 * PI / k * 0.5 * rmax * rmax * jm1 * jm1).sqrt();
        Self { m, k, norm }
    }

    pub fn eval(&self, r: f64, z: f64) -> ModeValues {
        let j = bessel_j(self.m + 1, self.k * r);
        let jm = j[self.m];
        let jp = bessel_jp(self.m, &j);
        let decay = (-self.k * z.abs()).exp();
        let sign = if z < 0.0 { -1.0 } else { 1.0 };
        ModeValues {
            potential: -2.0 * PI / self.k * jm * decay / self.norm,
            density: jm / self.norm,
            radial_force: 2.0 * PI * jp * decay / self.norm,
            vertical_force: -sign * 2.0 * PI * jm * decay / self.norm,
        }
    }
}

pub(crate) fn tabulate(ctx: &SimContext, config: &BasisConfig) -> Result<BasisTable> {
    let radial = AxisGrid::new(config.rmap, config.scale, config.rmin, config.rmax, config.numr)?;
    let vertical = AxisGrid::new(config.zmap, config.scale, 0.0, config.zmax, config.numz)?;
    let nmax = config.nmax;
    let numr = config.numr;
    let numz = config.numz;
    let grid_len = numr * numz;

    let blocks: Vec<[Vec<f64>; 4]> = ctx.pool().install(|| {
        (0..=config.lmax)
            .into_par_iter()
            .map(|m| {
                let roots = ctx
                    .roots()
                    .get(RootFamily::CylindricalBessel, m as i32, nmax)?;
                let mut potential = vec![0.0; nmax * grid_len];
                let mut density = vec![0.0; nmax * grid_len];
                let mut rforce = vec![0.0; nmax * grid_len];
                let mut zforce = vec![0.0; nmax * grid_len];
                for (n, &root) in roots.zeros.iter().enumerate() {
                    let mode = DiskMode::new(m, root, config.rmax);
                    for i in 0..numr {
                        // The radial factor is shared by every height.
                        let base = mode.eval(radial.node(i), 0.0);
                        for jz in 0..numz {
                            let decay = (-mode.k * vertical.node(jz)).exp();
                            let at = n * grid_len + i * numz + jz;
                            potential[at] = base.potential * decay;
                            density[at] = base.density;
                            rforce[at] = base.radial_force * decay;
                            zforce[at] = base.vertical_force * decay;
                        }
                    }
                }
                Ok([potential, density, rforce, zforce])
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut fields: [Vec<Vec<f64>>; 4] = Default::default();
    for block in blocks {
        for (dst, src) in fields.iter_mut().zip(block) {
            dst.push(src);
        }
    }
    let [potential, density, rforce, zforce] = fields;

    Ok(BasisTable {
        geometry: Geometry::Cylinder,
        lmax: config.lmax,
        nmax,
        radial,
        vertical,
        potential: FieldTable::from_blocks(nmax, grid_len, potential)?,
        density: FieldTable::from_blocks(nmax, grid_len, density)?,
        rforce: FieldTable::from_blocks(nmax, grid_len, rforce)?,
        zforce: Some(FieldTable::from_blocks(nmax, grid_len, zforce)?),
    })
}
