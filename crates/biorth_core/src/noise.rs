//! Coefficient noise estimates from statistical sub-groups.
//!
//! Each sub-group holds a random fraction of the particles. Rescaled by the
//! inverse of its mass fraction it is an independent estimate of the full
//! coefficient set, and the scatter between groups gives the variance of
//! their mean.

use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::accumulate::LevelBuffer;
use crate::coefs::{CoefLayout, CoefficientSet};
use crate::config::TrimPolicy;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseEstimate {
    pub mean: CoefficientSet,
    /// Variance of the mean, per coefficient.
    pub variance: DMatrix<f64>,
    /// `|mean|² / variance`; infinite where the variance vanishes.
    pub snr: DMatrix<f64>,
    pub groups: usize,
}

impl NoiseEstimate {
    pub fn from_groups(groups: &[LevelBuffer]) -> Result<Self> {
        let populated: Vec<&LevelBuffer> = groups.iter().filter(|g| g.mass > 0.0).collect();
        if populated.len() < 2 {
            return Err(Error::InvalidState(format!(
                "noise estimate needs at least two populated sub-groups, got {}",
                populated.len()
            )));
        }
        let layout = populated[0].layout();
        let total_mass: f64 = populated.iter().map(|g| g.mass).sum();
        let s = populated.len() as f64;

        let estimates: Vec<DMatrix<Complex64>> = populated
            .iter()
            .map(|g| g.coefs.matrix() * Complex64::new(total_mass / g.mass, 0.0))
            .collect();
        let mut mean: DMatrix<Complex64> = DMatrix::zeros(layout.rows(), layout.nmax);
        for e in &estimates {
            if e.shape() != mean.shape() {
                return Err(Error::SizeMismatch {
                    what: "sub-group coefficients",
                    expected: layout.len(),
                    found: e.len(),
                });
            }
            mean += e;
        }
        mean /= Complex64::new(s, 0.0);

        let mut variance: DMatrix<f64> = DMatrix::zeros(layout.rows(), layout.nmax);
        for e in &estimates {
            variance += (e - &mean).map(|d| d.norm_sqr());
        }
        variance /= s * (s - 1.0);

        let snr = mean.zip_map(&variance, |m, v| {
            if v > 0.0 {
                m.norm_sqr() / v
            } else {
                f64::INFINITY
            }
        });

        let mut set = CoefficientSet::zeros(layout);
        set.set_matrix(mean)?;
        Ok(Self {
            mean: set,
            variance,
            snr,
            groups: populated.len(),
        })
    }

    pub fn layout(&self) -> CoefLayout {
        self.mean.layout()
    }

    /// A copy of `coefs` with the trimming policy applied. The input set is
    /// left unchanged.
    pub fn trimmed(&self, coefs: &CoefficientSet, policy: TrimPolicy) -> Result<CoefficientSet> {
        if coefs.layout() != self.layout() {
            return Err(Error::SizeMismatch {
                what: "coefficient set",
                expected: self.layout().len(),
                found: coefs.layout().len(),
            });
        }
        let factors = match policy {
            TrimPolicy::None => return Ok(coefs.clone()),
            TrimPolicy::Truncate { snr_min } => self.snr.map(|snr| if snr < snr_min { 0.0 } else { 1.0 }),
            TrimPolicy::Hall => self.snr.map(|snr| if snr.is_infinite() { 1.0 } else { snr / (1.0 + snr) }),
        };
        let data = coefs.matrix().zip_map(&factors, |c, f| c * f);
        let mut out = coefs.clone();
        out.set_matrix(data)?;
        Ok(out)
    }
}
