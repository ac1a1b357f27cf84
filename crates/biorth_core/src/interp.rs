//! Bilinear interpolation in mapped coordinates.
//!
//! Queries are converted to grid coordinates once per point; the resulting
//! stencil is reused for every `(harmonic, order)` pair and every field.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::basis::{BasisTable, Field, FieldTable};
use crate::config::RangePolicy;
use crate::error::{Error, Result};
use crate::mapping::AxisGrid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil {
    i: usize,
    j: usize,
    ax: f64,
    ay: f64,
    /// `-1` below the midplane, used to flip odd fields.
    z_sign: f64,
    two_d: bool,
}

/// Tabulated values of several fields at one point, one matrix per field
/// with rows indexed by harmonic and columns by radial order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatrices {
    pub potential: DMatrix<f64>,
    pub density: DMatrix<f64>,
    pub rforce: DMatrix<f64>,
    pub zforce: DMatrix<f64>,
}

impl FieldMatrices {
    pub fn zeros(harmonics: usize, orders: usize) -> Self {
        Self {
            potential: DMatrix::zeros(harmonics, orders),
            density: DMatrix::zeros(harmonics, orders),
            rforce: DMatrix::zeros(harmonics, orders),
            zforce: DMatrix::zeros(harmonics, orders),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Interpolator {
    table: Arc<BasisTable>,
    policy: RangePolicy,
}

impl Interpolator {
    pub fn new(table: Arc<BasisTable>, policy: RangePolicy) -> Self {
        Self { table, policy }
    }

    pub fn table(&self) -> &BasisTable {
        &self.table
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// True when `(r, z)` lies inside the tabulated domain. `z` is ignored
    /// for one-dimensional tables.
    pub fn contains(&self, r: f64, z: f64) -> bool {
        let radial = &self.table.radial;
        if !(r >= radial.lo && r <= radial.hi) {
            return false;
        }
        if !self.table.is_two_dimensional() {
            return true;
        }
        let az = z.abs();
        az <= self.table.vertical.hi
    }

    /// True unless `(r, z)` lies past the outer radial edge or beyond the
    /// vertical extent. Radii inside the inner edge count as inside.
    pub fn within_outer_edge(&self, r: f64, z: f64) -> bool {
        if !(r <= self.table.radial.hi) {
            return false;
        }
        !self.table.is_two_dimensional() || z.abs() <= self.table.vertical.hi
    }

    /// Radius moved onto the inner edge when it falls inside it.
    pub fn clamp_inner(&self, r: f64) -> f64 {
        r.max(self.table.radial.lo)
    }

    pub fn stencil(&self, r: f64, z: f64) -> Result<Stencil> {
        let (i, ax) = locate(&self.table.radial, r, "r", self.policy)?;
        let two_d = self.table.is_two_dimensional();
        let (j, ay) = if two_d {
            locate(&self.table.vertical, z.abs(), "z", self.policy)?
        } else {
            (0, 0.0)
        };
        Ok(Stencil {
            i,
            j,
            ax,
            ay,
            z_sign: if z < 0.0 { -1.0 } else { 1.0 },
            two_d,
        })
    }

    /// One field for one `(harmonic, order)` pair.
    pub fn evaluate(&self, field: Field, harmonic: usize, order: usize, r: f64, z: f64) -> Result<f64> {
        let table = self.table.field(field)?;
        self.table.check_index(harmonic, order)?;
        let stencil = self.stencil(r, z)?;
        Ok(self.apply(&stencil, field, table.slice(harmonic, order)))
    }

    /// Every `(harmonic, order)` pair of one field into `out`, which is
    /// resized to `(lmax + 1) x nmax` when needed.
    pub fn evaluate_all(&self, field: Field, r: f64, z: f64, out: &mut DMatrix<f64>) -> Result<()> {
        let table = self.table.field(field)?;
        let stencil = self.stencil(r, z)?;
        self.fill(&stencil, field, table, out);
        Ok(())
    }

    /// Potential, density and forces sharing one stencil. The vertical
    /// force matrix is left at zero for one-dimensional tables.
    pub fn evaluate_fields(&self, r: f64, z: f64, out: &mut FieldMatrices) -> Result<()> {
        let stencil = self.stencil(r, z)?;
        self.fill(&stencil, Field::Potential, &self.table.potential, &mut out.potential);
        self.fill(&stencil, Field::Density, &self.table.density, &mut out.density);
        self.fill(&stencil, Field::RadialForce, &self.table.rforce, &mut out.rforce);
        match &self.table.zforce {
            Some(zforce) => self.fill(&stencil, Field::VerticalForce, zforce, &mut out.zforce),
            None => {
                reshape(&self.table, &mut out.zforce);
                out.zforce.fill(0.0);
            }
        }
        Ok(())
    }

    /// Potential only, for projection.
    pub fn evaluate_potential(&self, r: f64, z: f64, out: &mut DMatrix<f64>) -> Result<()> {
        self.evaluate_all(Field::Potential, r, z, out)
    }

    fn fill(&self, stencil: &Stencil, field: Field, table: &FieldTable, out: &mut DMatrix<f64>) {
        reshape(&self.table, out);
        for h in 0..=self.table.lmax {
            for n in 0..self.table.nmax {
                out[(h, n)] = self.apply(stencil, field, table.slice(h, n));
            }
        }
    }

    fn apply(&self, s: &Stencil, field: Field, values: &[f64]) -> f64 {
        let v = if s.two_d {
            let ny = self.table.vertical.num;
            let at = |i: usize, j: usize| values[i * ny + j];
            (1.0 - s.ax) * (1.0 - s.ay) * at(s.i, s.j)
                + s.ax * (1.0 - s.ay) * at(s.i + 1, s.j)
                + (1.0 - s.ax) * s.ay * at(s.i, s.j + 1)
                + s.ax * s.ay * at(s.i + 1, s.j + 1)
        } else {
            (1.0 - s.ax) * values[s.i] + s.ax * values[s.i + 1]
        };
        if field.is_odd() {
            s.z_sign * v
        } else {
            v
        }
    }
}

fn reshape(table: &BasisTable, out: &mut DMatrix<f64>) {
    let shape = (table.lmax + 1, table.nmax);
    if out.shape() != shape {
        *out = DMatrix::zeros(shape.0, shape.1);
    }
}

/// Cell index and fractional offset of `x` on `grid`.
fn locate(grid: &AxisGrid, x: f64, coordinate: &'static str, policy: RangePolicy) -> Result<(usize, f64)> {
    let outside = Error::OutOfRangeQuery {
        coordinate,
        value: x,
        min: grid.lo,
        max: grid.hi,
    };
    if x.is_nan() {
        return Err(outside);
    }
    let x = if x < grid.lo || x > grid.hi {
        match policy {
            RangePolicy::Strict => return Err(outside),
            RangePolicy::Clamp => x.clamp(grid.lo, grid.hi),
        }
    } else {
        x
    };

    let f = (grid.mapping.forward(x, grid.scale) - grid.xmin) / grid.dx;
    let cell = if f.is_finite() { f.floor().max(0.0) as usize } else { 0 };
    let i = cell.min(grid.num - 2);
    let a = if f.is_finite() { (f - i as f64).clamp(0.0, 1.0) } else { 0.0 };
    Ok((i, a))
}
