//! Zeros of the eigenfunction families that generate the radial bases.
//!
//! A [`RootTable`] holds the first `count` positive zeros of one member of a
//! family. Tables are memoized per `(family, order, count)` in a
//! [`RootCache`], which is owned by the simulation context.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::special::{bessel_j_order, spherical_bessel_order};

/// Bracketing step used when scanning for sign changes. Consecutive zeros
/// of both families are separated by roughly `π`.
const SCAN_STEP: f64 = 0.1;

/// Bisection stops once the bracket is narrower than this (relative).
const ROOT_TOL: f64 = 4.0 * f64::EPSILON;

const MAX_BISECTIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootFamily {
    /// `j_ν(x)` for `ν >= -1`, with `j_{-1}(x) = cos(x)/x`.
    SphericalBessel,
    /// `J_m(x)` for `m >= 0`.
    CylindricalBessel,
}

impl RootFamily {
    fn eval(self, order: i32, x: f64) -> f64 {
        match self {
            RootFamily::SphericalBessel => spherical_bessel_order(order, x),
            RootFamily::CylindricalBessel => bessel_j_order(order as usize, x),
        }
    }

    fn min_order(self) -> i32 {
        match self {
            RootFamily::SphericalBessel => -1,
            RootFamily::CylindricalBessel => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RootTable {
    pub family: RootFamily,
    pub order: i32,
    pub zeros: Vec<f64>,
}

impl RootTable {
    /// First `count` strictly positive zeros in increasing order.
    pub fn compute(family: RootFamily, order: i32, count: usize) -> Result<RootTable> {
        if order < family.min_order() {
            return Err(Error::InvalidConfig(format!(
                "{family:?} order {order} is below {}",
                family.min_order()
            )));
        }

        // The n-th zero lies below (n + |order|/2 + 1) π for both families;
        // doubling that leaves ample headroom before giving up.
        let scan_limit = 2.0 * PI * (count as f64 + order.unsigned_abs() as f64 + 2.0);

        let mut zeros = Vec::with_capacity(count);
        let mut lo = SCAN_STEP;
        let mut f_lo = family.eval(order, lo);

        while zeros.len() < count {
            let hi = lo + SCAN_STEP;
            if hi > scan_limit {
                return Err(Error::RootSearchDivergence {
                    family,
                    order,
                    index: zeros.len(),
                    detail: format!("no sign change found below x = {scan_limit:.3}"),
                });
            }
            let f_hi = family.eval(order, hi);

            if f_hi == 0.0 {
                zeros.push(hi);
                lo = hi + SCAN_STEP;
                f_lo = family.eval(order, lo);
                continue;
            }
            if f_lo.signum() != f_hi.signum() {
                let root = bisect(family, order, lo, hi, f_lo, zeros.len())?;
                zeros.push(root);
            }
            lo = hi;
            f_lo = f_hi;
        }

        Ok(RootTable {
            family,
            order,
            zeros,
        })
    }

    pub fn len(&self) -> usize {
        self.zeros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zeros.is_empty()
    }
}

fn bisect(
    family: RootFamily,
    order: i32,
    mut lo: f64,
    mut hi: f64,
    mut f_lo: f64,
    index: usize,
) -> Result<f64> {
    for _ in 0..MAX_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        if hi - lo <= ROOT_TOL * mid {
            return Ok(mid);
        }
        let f_mid = family.eval(order, mid);
        if !f_mid.is_finite() {
            break;
        }
        if f_mid == 0.0 {
            return Ok(mid);
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }
    Err(Error::RootSearchDivergence {
        family,
        order,
        index,
        detail: format!("bisection did not converge in [{lo}, {hi}]"),
    })
}

type RootKey = (RootFamily, i32, usize);

/// Memo of root tables. Each distinct request is computed once; later
/// requests share the same allocation.
#[derive(Debug, Default)]
pub struct RootCache {
    tables: Mutex<HashMap<RootKey, Arc<RootTable>>>,
}

impl RootCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, family: RootFamily, order: i32, count: usize) -> Result<Arc<RootTable>> {
        let key = (family, order, count);
        if let Some(table) = self.lock().get(&key) {
            return Ok(Arc::clone(table));
        }

        // Computed outside the lock; a concurrent duplicate is discarded.
        let table = Arc::new(RootTable::compute(family, order, count)?);
        let mut tables = self.lock();
        Ok(Arc::clone(tables.entry(key).or_insert(table)))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RootKey, Arc<RootTable>>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
