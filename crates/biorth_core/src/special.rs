//! Special functions used to build the radial and angular parts of the bases.
//!
//! Cylindrical Bessel functions are evaluated for all orders at once with
//! Miller's backward recurrence normalized by the Neumann sum
//! `J_0 + 2 Σ J_{2k} = 1`, which stays accurate for large arguments.
//! Spherical Bessel functions use upward recurrence above the turning point
//! and backward recurrence below it.

use std::f64::consts::PI;

/// Arguments below this are treated as zero.
const TINY_ARG: f64 = 1.0e-12;

/// Recurrence values are rescaled once they exceed this magnitude.
const BIG: f64 = 1.0e200;
const BIG_INV: f64 = 1.0e-200;

/// Cylindrical Bessel functions `J_0(x) ..= J_mmax(x)`.
pub fn bessel_j(mmax: usize, x: f64) -> Vec<f64> {
    let mut out = vec![0.0; mmax + 1];
    if x.abs() < TINY_ARG {
        out[0] = 1.0;
        return out;
    }

    let top = mmax.max(x.abs() as usize);
    let mut start = top + 16 + (40.0 * top as f64).sqrt() as usize;
    start += start % 2;

    let mut fkp1 = 0.0;
    let mut fk = 1.0e-30;
    let mut sum = 2.0 * fk;

    for k in (1..=start).rev() {
        let fkm1 = 2.0 * k as f64 / x * fk - fkp1;
        fkp1 = fk;
        fk = fkm1;

        let idx = k - 1;
        if idx <= mmax {
            out[idx] = fk;
        }
        if idx == 0 {
            sum += fk;
        } else if idx % 2 == 0 {
            sum += 2.0 * fk;
        }

        if fk.abs() > BIG {
            fk *= BIG_INV;
            fkp1 *= BIG_INV;
            sum *= BIG_INV;
            for v in out.iter_mut() {
                *v *= BIG_INV;
            }
        }
    }

    for v in out.iter_mut() {
        *v /= sum;
    }
    out
}

/// `J_m(x)` for a single order.
pub fn bessel_j_order(m: usize, x: f64) -> f64 {
    bessel_j(m, x)[m]
}

/// Derivative `J_m'(x)` from a table holding at least orders `0..=m+1`.
pub fn bessel_jp(m: usize, j: &[f64]) -> f64 {
    if m == 0 {
        -j[1]
    } else {
        0.5 * (j[m - 1] - j[m + 1])
    }
}

/// Spherical Bessel functions `j_0(x) ..= j_lmax(x)`.
pub fn spherical_bessel_j(lmax: usize, x: f64) -> Vec<f64> {
    let mut out = vec![0.0; lmax + 1];
    if x.abs() < TINY_ARG {
        out[0] = 1.0;
        return out;
    }

    let (s, c) = x.sin_cos();
    let j0 = s / x;
    let j1 = if x.abs() < 0.1 {
        let x2 = x * x;
        x / 3.0 * (1.0 - x2 / 10.0 * (1.0 - x2 / 28.0))
    } else {
        s / (x * x) - c / x
    };

    out[0] = j0;
    if lmax == 0 {
        return out;
    }
    out[1] = j1;
    if lmax == 1 {
        return out;
    }

    if x > lmax as f64 {
        for l in 1..lmax {
            out[l + 1] = (2 * l + 1) as f64 / x * out[l] - out[l - 1];
        }
        return out;
    }

    let start = lmax + 16 + (40.0 * lmax as f64).sqrt() as usize;
    let mut fkp1 = 0.0;
    let mut fk = 1.0e-30;
    for k in (1..=start).rev() {
        let fkm1 = (2 * k + 1) as f64 / x * fk - fkp1;
        fkp1 = fk;
        fk = fkm1;
        if k - 1 <= lmax {
            out[k - 1] = fk;
        }
        if fk.abs() > BIG {
            fk *= BIG_INV;
            fkp1 *= BIG_INV;
            for v in out.iter_mut() {
                *v *= BIG_INV;
            }
        }
    }

    let scale = if j0.abs() >= j1.abs() {
        j0 / out[0]
    } else {
        j1 / out[1]
    };
    for v in out.iter_mut() {
        *v *= scale;
    }
    out
}

/// `j_nu(x)` for `nu >= -1`, where `j_{-1}(x) = cos(x)/x`.
pub fn spherical_bessel_order(nu: i32, x: f64) -> f64 {
    if nu < 0 {
        return x.cos() / x;
    }
    let l = nu as usize;
    spherical_bessel_j(l, x)[l]
}

/// Derivative `j_l'(x)` from a table holding at least orders `0..=l+1`.
pub fn spherical_bessel_jp(l: usize, j: &[f64]) -> f64 {
    if l == 0 {
        -j[1]
    } else {
        (l as f64 * j[l - 1] - (l + 1) as f64 * j[l + 1]) / (2 * l + 1) as f64
    }
}

/// Associated Legendre functions `P_l^m(cos θ)` without the Condon-Shortley
/// phase, together with `dP_l^m/dθ`.
#[derive(Debug, Clone)]
pub struct LegendreTable {
    lmax: usize,
    p: Vec<f64>,
    dp: Vec<f64>,
}

impl LegendreTable {
    pub fn new(lmax: usize) -> Self {
        let size = (lmax + 1) * (lmax + 1);
        Self {
            lmax,
            p: vec![0.0; size],
            dp: vec![0.0; size],
        }
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Recompute the table at `x = cos θ`. The poles are nudged inward so
    /// the θ-derivative stays finite.
    pub fn fill(&mut self, x: f64) {
        let x = x.clamp(-1.0 + 1.0e-12, 1.0 - 1.0e-12);
        let somx2 = ((1.0 - x) * (1.0 + x)).sqrt();
        let stride = self.lmax + 1;

        let mut pmm = 1.0;
        for m in 0..=self.lmax {
            if m > 0 {
                pmm *= (2 * m - 1) as f64 * somx2;
            }
            self.p[m * stride + m] = pmm;
            if m < self.lmax {
                self.p[(m + 1) * stride + m] = x * (2 * m + 1) as f64 * pmm;
            }
            for l in (m + 2)..=self.lmax {
                let a = (2 * l - 1) as f64 * x * self.p[(l - 1) * stride + m];
                let b = (l + m - 1) as f64 * self.p[(l - 2) * stride + m];
                self.p[l * stride + m] = (a - b) / (l - m) as f64;
            }
        }

        for l in 0..=self.lmax {
            for m in 0..=l {
                let plm = self.p[l * stride + m];
                let plm1 = if l > m {
                    self.p[(l - 1) * stride + m]
                } else {
                    0.0
                };
                self.dp[l * stride + m] =
                    (l as f64 * x * plm - (l + m) as f64 * plm1) / somx2;
            }
        }
    }

    pub fn p(&self, l: usize, m: usize) -> f64 {
        self.p[l * (self.lmax + 1) + m]
    }

    pub fn dp_dtheta(&self, l: usize, m: usize) -> f64 {
        self.dp[l * (self.lmax + 1) + m]
    }
}

/// Spherical harmonic normalization `sqrt((2l+1)/(4π) (l-m)!/(l+m)!)`.
pub fn ylm_norm(l: usize, m: usize) -> f64 {
    let mut ratio = 1.0;
    for k in (l - m + 1)..=(l + m) {
        ratio /= k as f64;
    }
    ((2 * l + 1) as f64 / (4.0 * PI) * ratio).sqrt()
}

/// Gauss-Legendre nodes and weights on `[-1, 1]`.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let half = (n + 1) / 2;

    for i in 0..half {
        let mut z = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut pp = 0.0;
        for _ in 0..100 {
            let mut p1 = 1.0;
            let mut p2 = 0.0;
            for j in 0..n {
                let p3 = p2;
                p2 = p1;
                p1 = ((2 * j + 1) as f64 * z * p2 - j as f64 * p3) / (j + 1) as f64;
            }
            pp = n as f64 * (z * p1 - p2) / (z * z - 1.0);
            let z1 = z;
            z = z1 - p1 / pp;
            if (z - z1).abs() < 1.0e-15 {
                break;
            }
        }
        nodes[i] = -z;
        nodes[n - 1 - i] = z;
        let w = 2.0 / ((1.0 - z * z) * pp * pp);
        weights[i] = w;
        weights[n - 1 - i] = w;
    }

    (nodes, weights)
}
