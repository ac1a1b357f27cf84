//! Monotone maps between physical coordinates and the nondimensional grid
//! coordinate used for tabulation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mapping {
    /// `ξ = r/s`
    Identity,
    /// `ξ = (r/s - 1)/(r/s + 1)`; compresses `[0, ∞)` into `[-1, 1)`.
    Rational,
    /// `ξ = ln(r/s)`; only defined for `r > 0`.
    Log,
    /// `ξ = asinh(r/s)`; linear near the origin, logarithmic far away.
    Asinh,
}

impl Mapping {
    pub fn tag(self) -> &'static str {
        match self {
            Mapping::Identity => "identity",
            Mapping::Rational => "rational",
            Mapping::Log => "log",
            Mapping::Asinh => "asinh",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "identity" => Some(Mapping::Identity),
            "rational" => Some(Mapping::Rational),
            "log" => Some(Mapping::Log),
            "asinh" => Some(Mapping::Asinh),
            _ => None,
        }
    }

    pub fn forward(self, r: f64, scale: f64) -> f64 {
        let u = r / scale;
        match self {
            Mapping::Identity => u,
            Mapping::Rational => (u - 1.0) / (u + 1.0),
            Mapping::Log => u.ln(),
            Mapping::Asinh => u.asinh(),
        }
    }

    pub fn inverse(self, xi: f64, scale: f64) -> f64 {
        match self {
            Mapping::Identity => scale * xi,
            Mapping::Rational => scale * (1.0 + xi) / (1.0 - xi),
            Mapping::Log => scale * xi.exp(),
            Mapping::Asinh => scale * xi.sinh(),
        }
    }

    /// `d(physical)/dξ` at mapped coordinate `xi`.
    pub fn jacobian(self, xi: f64, scale: f64) -> f64 {
        match self {
            Mapping::Identity => scale,
            Mapping::Rational => 2.0 * scale / ((1.0 - xi) * (1.0 - xi)),
            Mapping::Log => scale * xi.exp(),
            Mapping::Asinh => scale * xi.cosh(),
        }
    }

    /// Check that `[lo, hi]` lies inside the map's physical domain.
    pub fn check_domain(self, lo: f64, hi: f64) -> Result<()> {
        if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
            return Err(Error::InvalidConfig(format!(
                "empty or non-finite interval [{lo}, {hi}]"
            )));
        }
        match self {
            Mapping::Log if lo <= 0.0 => Err(Error::InvalidConfig(format!(
                "logarithmic mapping needs a positive lower bound, got {lo}"
            ))),
            Mapping::Rational if lo < 0.0 => Err(Error::InvalidConfig(format!(
                "rational mapping needs a non-negative lower bound, got {lo}"
            ))),
            _ => Ok(()),
        }
    }
}

/// A uniform grid in mapped coordinate covering a physical interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisGrid {
    pub mapping: Mapping,
    pub scale: f64,
    pub lo: f64,
    pub hi: f64,
    pub xmin: f64,
    pub xmax: f64,
    pub dx: f64,
    pub num: usize,
}

impl AxisGrid {
    pub fn new(mapping: Mapping, scale: f64, lo: f64, hi: f64, num: usize) -> Result<Self> {
        mapping.check_domain(lo, hi)?;
        if num < 2 {
            return Err(Error::InvalidConfig(format!(
                "an axis needs at least two nodes, got {num}"
            )));
        }
        let xmin = mapping.forward(lo, scale);
        let xmax = mapping.forward(hi, scale);
        Ok(Self {
            mapping,
            scale,
            lo,
            hi,
            xmin,
            xmax,
            dx: (xmax - xmin) / (num - 1) as f64,
            num,
        })
    }

    /// A degenerate single-node axis for one-dimensional tables.
    pub fn single() -> Self {
        Self {
            mapping: Mapping::Identity,
            scale: 1.0,
            lo: 0.0,
            hi: 0.0,
            xmin: 0.0,
            xmax: 0.0,
            dx: 0.0,
            num: 1,
        }
    }

    pub fn is_single(&self) -> bool {
        self.num == 1
    }

    pub fn xi(&self, i: usize) -> f64 {
        self.xmin + self.dx * i as f64
    }

    /// Physical coordinate of node `i`. The end nodes return the exact
    /// interval bounds.
    pub fn node(&self, i: usize) -> f64 {
        if i == 0 {
            self.lo
        } else if i + 1 == self.num {
            self.hi
        } else {
            self.mapping.inverse(self.xi(i), self.scale)
        }
    }
}
