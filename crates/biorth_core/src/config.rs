//! Structured configuration consumed by the tabulator, interpolator,
//! accumulator and evaluator.
//!
//! Every struct derives serde so the outer driver can hand over a JSON
//! stanza; parsing the driver's own command line is not done here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    /// Spherical Bessel functions in a sphere; one-dimensional radial tables.
    Sphere,
    /// Bessel modes of a thin disk; two-dimensional `(R, z)` tables.
    Cylinder,
}

impl Geometry {
    pub fn tag(self) -> &'static str {
        match self {
            Geometry::Sphere => "sphere",
            Geometry::Cylinder => "cylinder",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "sphere" => Some(Geometry::Sphere),
            "cylinder" => Some(Geometry::Cylinder),
            _ => None,
        }
    }
}

/// What to do with a query outside the tabulated domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    #[default]
    Clamp,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasisConfig {
    pub geometry: Geometry,
    /// Maximum harmonic index: `l` for spheres, `m` for cylinders.
    #[serde(alias = "mmax")]
    pub lmax: usize,
    /// Number of radial orders per harmonic.
    pub nmax: usize,
    pub numr: usize,
    /// Vertical grid resolution (cylinders only).
    pub numz: usize,
    pub rmin: f64,
    pub rmax: f64,
    /// Vertical extent of the table (cylinders only).
    pub zmax: f64,
    pub scale: f64,
    pub rmap: Mapping,
    pub zmap: Mapping,
    /// Quadrature knots for the orthogonality self-check.
    pub knots: usize,
    pub range_policy: RangePolicy,
    pub cache_file: Option<PathBuf>,
}

impl Default for BasisConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::Sphere,
            lmax: 4,
            nmax: 10,
            numr: 2000,
            numz: 200,
            rmin: 0.0,
            rmax: 1.0,
            zmax: 1.0,
            scale: 1.0,
            rmap: Mapping::Rational,
            zmap: Mapping::Asinh,
            knots: 40,
            range_policy: RangePolicy::Clamp,
            cache_file: None,
        }
    }
}

impl BasisConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: BasisConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nmax == 0 {
            return Err(Error::InvalidConfig("nmax must be at least 1".into()));
        }
        if self.numr < 2 {
            return Err(Error::InvalidConfig(format!(
                "numr must be at least 2, got {}",
                self.numr
            )));
        }
        if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "scale must be positive, got {}",
                self.scale
            )));
        }
        if !(self.rmin >= 0.0 && self.rmax > self.rmin && self.rmax.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "radial domain [{}, {}] is invalid",
                self.rmin, self.rmax
            )));
        }
        self.rmap.check_domain(self.rmin, self.rmax)?;
        if self.knots < 2 {
            return Err(Error::InvalidConfig(format!(
                "knots must be at least 2, got {}",
                self.knots
            )));
        }
        if self.geometry == Geometry::Cylinder {
            if self.numz < 2 {
                return Err(Error::InvalidConfig(format!(
                    "numz must be at least 2, got {}",
                    self.numz
                )));
            }
            self.zmap.check_domain(0.0, self.zmax)?;
        }
        Ok(())
    }
}

/// Harmonic restrictions applied while summing the expansion. The
/// coefficients themselves are never touched.
///
/// Every flag acts on the harmonic index of the tables: `m` for cylinders
/// and `l` for spheres, where all azimuthal terms of a dropped `l` go with
/// it. The `m` in the flag names follows the cylinder convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonicFilter {
    /// Keep only harmonic 0 (the monopole for spheres).
    #[serde(alias = "M0_only")]
    pub m0_only: bool,
    /// Keep only even harmonics.
    #[serde(alias = "EVEN_M")]
    pub even_m: bool,
    /// Drop harmonic 0.
    #[serde(alias = "NO_M0")]
    pub no_m0: bool,
    /// Drop harmonic 1 (the dipole).
    #[serde(alias = "NO_M1")]
    pub no_m1: bool,
}

impl HarmonicFilter {
    pub fn monopole_only() -> Self {
        Self {
            m0_only: true,
            ..Self::default()
        }
    }

    pub fn keeps(&self, harmonic: usize) -> bool {
        if self.m0_only && harmonic != 0 {
            return false;
        }
        if self.even_m && harmonic % 2 == 1 {
            return false;
        }
        if self.no_m0 && harmonic == 0 {
            return false;
        }
        !(self.no_m1 && harmonic == 1)
    }
}

/// Signal-to-noise treatment of accumulated coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TrimPolicy {
    #[default]
    None,
    /// Zero every coefficient whose signal-to-noise ratio is below `snr_min`.
    Truncate { snr_min: f64 },
    /// Scale each coefficient by `1/(1 + 1/snr)`.
    Hall,
}

/// Compute backend for projection and batched evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Rayon workers over the particle slice.
    #[default]
    Host,
    /// Device-style staging: structure-of-arrays upload, flat per-block
    /// output buffers, one download and an ordered reduction.
    Staged,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationConfig {
    /// Fraction of particles used per pass; masses are scaled up to match.
    #[serde(alias = "ssfrac")]
    pub subsample_fraction: f64,
    /// Number of statistical sub-groups; fewer than two disables them.
    #[serde(alias = "sampT")]
    pub sample_groups: usize,
    /// Fixed partition size. Results do not depend on the thread count.
    pub chunk_size: usize,
    pub seed: u64,
    pub trim: TrimPolicy,
    pub backend: BackendKind,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            subsample_fraction: 1.0,
            sample_groups: 0,
            chunk_size: 4096,
            seed: 11,
            trim: TrimPolicy::None,
            backend: BackendKind::Host,
        }
    }
}

impl AccumulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.subsample_fraction > 0.0 && self.subsample_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "subsample_fraction must lie in (0, 1], got {}",
                self.subsample_fraction
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if let TrimPolicy::Truncate { snr_min } = self.trim {
            if !(snr_min >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "snr_min must be non-negative, got {snr_min}"
                )));
            }
        }
        Ok(())
    }

    pub fn uses_groups(&self) -> bool {
        self.sample_groups >= 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Worker threads; zero lets rayon pick from the available cores.
    pub threads: usize,
    pub verbose: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            verbose: false,
        }
    }
}
