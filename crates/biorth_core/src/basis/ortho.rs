//! Numerical biorthogonality check of a tabulated basis.

use nalgebra::DMatrix;

use super::Field;
use crate::config::Geometry;
use crate::error::{Error, Result};
use crate::interp::Interpolator;
use crate::special::gauss_legendre;

/// `∫ Φ_n ρ_p w(r) dr` over the tabulated radial range for every harmonic,
/// using Gauss-Legendre quadrature in the mapped coordinate. The weight is
/// `r²` for spheres and `R` (on the midplane) for disks. A healthy basis
/// gives `-I` for each harmonic.
pub fn ortho_check(interp: &Interpolator, knots: usize) -> Result<Vec<DMatrix<f64>>> {
    if knots < 2 {
        return Err(Error::InvalidConfig(format!("knots must be at least 2, got {knots}")));
    }
    let table = interp.table();
    let grid = &table.radial;
    let (nodes, weights) = gauss_legendre(knots);
    let mid = 0.5 * (grid.xmax + grid.xmin);
    let half = 0.5 * (grid.xmax - grid.xmin);

    let mut result = vec![DMatrix::zeros(table.nmax, table.nmax); table.lmax + 1];
    let mut potential = DMatrix::zeros(0, 0);
    let mut density = DMatrix::zeros(0, 0);

    for (t, w) in nodes.iter().zip(&weights) {
        let xi = mid + half * t;
        let r = grid.mapping.inverse(xi, grid.scale).clamp(grid.lo, grid.hi);
        let measure = match table.geometry {
            Geometry::Sphere => r * r,
            Geometry::Cylinder => r,
        };
        let factor = half * w * grid.mapping.jacobian(xi, grid.scale) * measure;

        interp.evaluate_all(Field::Potential, r, 0.0, &mut potential)?;
        interp.evaluate_all(Field::Density, r, 0.0, &mut density)?;
        for (h, block) in result.iter_mut().enumerate() {
            for n in 0..table.nmax {
                for p in 0..table.nmax {
                    block[(n, p)] += factor * potential[(h, n)] * density[(h, p)];
                }
            }
        }
    }
    Ok(result)
}

/// Worst deviations of a set of check matrices from `-I`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrthoSummary {
    /// Largest `| |d| - 1 |` over diagonal entries.
    pub diagonal_error: f64,
    /// Largest off-diagonal magnitude relative to the smallest diagonal
    /// magnitude of the same harmonic.
    pub off_diagonal: f64,
}

impl OrthoSummary {
    pub fn from_matrices(matrices: &[DMatrix<f64>]) -> Self {
        let mut diagonal_error: f64 = 0.0;
        let mut off_diagonal: f64 = 0.0;
        for m in matrices {
            let smallest = (0..m.nrows()).map(|i| m[(i, i)].abs()).fold(f64::INFINITY, f64::min);
            for i in 0..m.nrows() {
                diagonal_error = diagonal_error.max((m[(i, i)].abs() - 1.0).abs());
                for j in 0..m.ncols() {
                    if i != j {
                        off_diagonal = off_diagonal.max(m[(i, j)].abs() / smallest);
                    }
                }
            }
        }
        Self {
            diagonal_error,
            off_diagonal,
        }
    }
}
