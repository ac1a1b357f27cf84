//! Density, potential and force from a coefficient set.
//!
//! The expansion is summed over `m >= 0`, with `m > 0` terms counted twice
//! to account for their negative-`m` partners:
//!
//! ```text
//! f(x) = Σ_{rows, n} w_m Re(c e^{imφ}) A(θ) f_n(r),   w_0 = 1, w_{m>0} = 2
//! ```
//!
//! where `A` is `N_lm P_l^m(cos θ)` for spheres and `1` for disks.

use num_complex::Complex64;

use crate::backend::ProjectionBackend;
use crate::basis::Basis;
use crate::coefs::{AngularRow, CoefficientSet};
use crate::config::{Geometry, HarmonicFilter};
use crate::context::SimContext;
use crate::error::{Error, Result};
use crate::interp::FieldMatrices;
use crate::special::{ylm_norm, LegendreTable};

/// Radii below this are treated as the origin, where angular force
/// components vanish.
const AXIS_EPS: f64 = 1.0e-12;

/// Field values at one point. Force components are in the coordinate
/// system of the call that produced them: `(r, θ, φ)` for spheres and
/// `(R, φ, z)` for disks from [`ForceEvaluator::evaluate`], Cartesian from
/// [`ForceEvaluator::evaluate_cartesian`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldValues {
    pub density: f64,
    pub potential: f64,
    pub force: [f64; 3],
}

/// Per-thread scratch for evaluation.
#[derive(Debug, Clone)]
pub struct EvalScratch {
    fields: FieldMatrices,
    legendre: LegendreTable,
}

/// Read-only view of a coefficient set for evaluation. Cheap to build;
/// the coefficients are borrowed, never copied.
#[derive(Debug, Clone)]
pub struct ForceEvaluator<'a> {
    basis: &'a Basis,
    coefs: &'a CoefficientSet,
    filter: HarmonicFilter,
    rows: Vec<AngularRow>,
    norms: Vec<f64>,
}

impl<'a> ForceEvaluator<'a> {
    pub fn new(basis: &'a Basis, coefs: &'a CoefficientSet, filter: HarmonicFilter) -> Result<Self> {
        let layout = basis.layout();
        if coefs.layout() != layout {
            return Err(Error::SizeMismatch {
                what: "coefficient set",
                expected: layout.len(),
                found: coefs.layout().len(),
            });
        }
        let rows: Vec<AngularRow> = layout
            .angular_rows()
            .into_iter()
            .filter(|r| filter.keeps(r.harmonic))
            .collect();
        let norms = rows
            .iter()
            .map(|r| match layout.geometry {
                Geometry::Sphere => ylm_norm(r.harmonic, r.m),
                Geometry::Cylinder => 1.0,
            })
            .collect();
        Ok(Self {
            basis,
            coefs,
            filter,
            rows,
            norms,
        })
    }

    pub fn filter(&self) -> HarmonicFilter {
        self.filter
    }

    pub fn scratch(&self) -> EvalScratch {
        let layout = self.basis.layout();
        EvalScratch {
            fields: FieldMatrices::zeros(layout.lmax + 1, layout.nmax),
            legendre: LegendreTable::new(match layout.geometry {
                Geometry::Sphere => layout.lmax,
                Geometry::Cylinder => 0,
            }),
        }
    }

    /// Evaluate at native coordinates: `(r, θ, φ)` for spheres, `(R, φ, z)`
    /// for disks.
    pub fn evaluate(&self, coords: [f64; 3]) -> Result<FieldValues> {
        self.evaluate_with(&mut self.scratch(), coords)
    }

    pub fn evaluate_with(&self, scratch: &mut EvalScratch, coords: [f64; 3]) -> Result<FieldValues> {
        match self.basis.geometry() {
            Geometry::Sphere => self.sphere(scratch, coords[0], coords[1], coords[2]),
            Geometry::Cylinder => self.disk(scratch, coords[0], coords[1], coords[2]),
        }
    }

    /// Evaluate at a Cartesian point with the force in Cartesian components.
    pub fn evaluate_cartesian(&self, x: [f64; 3]) -> Result<FieldValues> {
        self.evaluate_cartesian_with(&mut self.scratch(), x)
    }

    pub fn evaluate_cartesian_with(&self, scratch: &mut EvalScratch, x: [f64; 3]) -> Result<FieldValues> {
        let phi = x[1].atan2(x[0]);
        let (sp, cp) = phi.sin_cos();
        match self.basis.geometry() {
            Geometry::Sphere => {
                let r = (x[0] * x[0] + x[1] * x[1] + x[2] * x[2]).sqrt();
                let theta = if r > 0.0 { (x[2] / r).clamp(-1.0, 1.0).acos() } else { 0.0 };
                let v = self.sphere(scratch, r, theta, phi)?;
                let (st, ct) = theta.sin_cos();
                let [fr, ft, fp] = v.force;
                Ok(FieldValues {
                    force: [
                        fr * st * cp + ft * ct * cp - fp * sp,
                        fr * st * sp + ft * ct * sp + fp * cp,
                        fr * ct - ft * st,
                    ],
                    ..v
                })
            }
            Geometry::Cylinder => {
                let big_r = x[0].hypot(x[1]);
                let v = self.disk(scratch, big_r, phi, x[2])?;
                let [fr, fp, fz] = v.force;
                Ok(FieldValues {
                    force: [fr * cp - fp * sp, fr * sp + fp * cp, fz],
                    ..v
                })
            }
        }
    }

    /// Cartesian evaluation of many points on the given backend.
    pub fn evaluate_points(
        &self,
        ctx: &SimContext,
        backend: &dyn ProjectionBackend,
        points: &[[f64; 3]],
    ) -> Result<Vec<FieldValues>> {
        backend.evaluate(ctx, self, points)
    }

    fn sphere(&self, s: &mut EvalScratch, r: f64, theta: f64, phi: f64) -> Result<FieldValues> {
        self.basis
            .interpolator()
            .evaluate_fields(r, 0.0, &mut s.fields)?;
        s.legendre.fill(theta.cos());

        let mut out = FieldValues::default();
        let mut dpot_dtheta = 0.0;
        let mut dpot_dphi = 0.0;
        for (row, norm) in self.rows.iter().zip(&self.norms) {
            let weight = if row.m == 0 { 1.0 } else { 2.0 };
            let ylm = norm * s.legendre.p(row.harmonic, row.m);
            let dylm = norm * s.legendre.dp_dtheta(row.harmonic, row.m);
            let rotation = Complex64::from_polar(weight, row.m as f64 * phi);
            for n in 0..self.coefs.layout().nmax {
                let c = self.coefs.at(row.row, n) * rotation;
                let pot = s.fields.potential[(row.harmonic, n)];
                out.potential += c.re * ylm * pot;
                out.density += c.re * ylm * s.fields.density[(row.harmonic, n)];
                out.force[0] += c.re * ylm * s.fields.rforce[(row.harmonic, n)];
                dpot_dtheta += c.re * dylm * pot;
                dpot_dphi -= row.m as f64 * c.im * ylm * pot;
            }
        }

        let sin_theta = theta.sin();
        if r > AXIS_EPS {
            out.force[1] = -dpot_dtheta / r;
            if r * sin_theta.abs() > AXIS_EPS {
                out.force[2] = -dpot_dphi / (r * sin_theta);
            }
        }
        Ok(out)
    }

    fn disk(&self, s: &mut EvalScratch, big_r: f64, phi: f64, z: f64) -> Result<FieldValues> {
        self.basis
            .interpolator()
            .evaluate_fields(big_r, z, &mut s.fields)?;

        let mut out = FieldValues::default();
        let mut dpot_dphi = 0.0;
        for row in &self.rows {
            let weight = if row.m == 0 { 1.0 } else { 2.0 };
            let rotation = Complex64::from_polar(weight, row.m as f64 * phi);
            for n in 0..self.coefs.layout().nmax {
                let c = self.coefs.at(row.row, n) * rotation;
                let pot = s.fields.potential[(row.harmonic, n)];
                out.potential += c.re * pot;
                out.density += c.re * s.fields.density[(row.harmonic, n)];
                out.force[0] += c.re * s.fields.rforce[(row.harmonic, n)];
                out.force[2] += c.re * s.fields.zforce[(row.harmonic, n)];
                dpot_dphi -= row.m as f64 * c.im * pot;
            }
        }
        if big_r > AXIS_EPS {
            out.force[1] = -dpot_dphi / big_r;
        }
        Ok(out)
    }
}
