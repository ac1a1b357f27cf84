//! Biorthogonal basis tables: construction, caching and the numerical
//! self-check.
//!
//! A [`Basis`] is built once per configuration, either by tabulating the
//! analytic modes or by loading a cache file written by an earlier run,
//! and is read-only afterwards.

pub mod disk;
pub mod ortho;
pub mod sphere;
mod table;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use nalgebra::DMatrix;

pub use self::disk::DiskMode;
pub use self::ortho::{ortho_check, OrthoSummary};
pub use self::sphere::SphereMode;
pub use self::table::{BasisTable, Field, FieldTable};

use crate::cache::{self, CacheHeader};
use crate::coefs::CoefLayout;
use crate::config::{BasisConfig, Geometry};
use crate::context::SimContext;
use crate::error::{Error, Result};
use crate::interp::Interpolator;

/// Values of one analytic mode at one point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModeValues {
    pub potential: f64,
    pub density: f64,
    /// `-∂Φ/∂r`.
    pub radial_force: f64,
    /// `-∂Φ/∂z`; zero for spherical modes.
    pub vertical_force: f64,
}

#[derive(Debug, Clone)]
pub struct Basis {
    config: BasisConfig,
    header: CacheHeader,
    table: Arc<BasisTable>,
    interp: Interpolator,
    layout: CoefLayout,
}

impl Basis {
    /// Tabulate from scratch without touching any cache file.
    pub fn build(ctx: &SimContext, config: &BasisConfig) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();
        let table = match config.geometry {
            Geometry::Sphere => sphere::tabulate(ctx, config)?,
            Geometry::Cylinder => disk::tabulate(ctx, config)?,
        };
        ctx.note(format_args!(
            "tabulated {} basis: lmax {} nmax {} on {} points in {:.3}s",
            config.geometry.tag(),
            config.lmax,
            config.nmax,
            table.grid_len(),
            started.elapsed().as_secs_f64()
        ));
        Self::from_table(config, table)
    }

    /// Wrap an existing table, which must agree with `config`.
    pub fn from_table(config: &BasisConfig, table: BasisTable) -> Result<Self> {
        let header = CacheHeader::from_config(config);
        let (radial, vertical) = header.grids()?;
        if table.geometry != config.geometry
            || table.lmax != config.lmax
            || table.nmax != config.nmax
            || table.radial != radial
            || table.vertical != vertical
        {
            return Err(Error::InvalidState(
                "basis table does not match its configuration".into(),
            ));
        }
        let table = Arc::new(table);
        Ok(Self {
            config: config.clone(),
            header,
            interp: Interpolator::new(Arc::clone(&table), config.range_policy),
            layout: CoefLayout::new(config.geometry, config.lmax, config.nmax),
            table,
        })
    }

    /// Load the configured cache file if it matches; otherwise tabulate and
    /// write a fresh cache from the coordinator.
    pub fn load_or_build(ctx: &SimContext, config: &BasisConfig) -> Result<Self> {
        config.validate()?;
        let Some(path) = config.cache_file.as_deref() else {
            return Self::build(ctx, config);
        };

        let header = CacheHeader::from_config(config);
        match cache::load(path, &header) {
            Ok(table) => {
                ctx.note(format_args!("loaded basis cache {}", path.display()));
                return Self::from_table(config, table);
            }
            Err(err @ Error::CacheCorrupt { .. }) => {
                ctx.warn(format_args!("{err}; rebuilding"));
            }
            Err(err) if err.is_recoverable() => {
                ctx.note(format_args!("{err}; rebuilding"));
            }
            Err(err) => return Err(err),
        }

        let basis = Self::build(ctx, config)?;
        if let Err(err) = basis.save_cache(ctx, path) {
            ctx.warn(format_args!("could not write basis cache {}: {err}", path.display()));
        }
        Ok(basis)
    }

    /// Write the table to `path`. Only the coordinator writes; other
    /// processes return immediately.
    pub fn save_cache(&self, ctx: &SimContext, path: &Path) -> Result<()> {
        if !ctx.is_coordinator() {
            return Ok(());
        }
        cache::save(path, &self.header, &self.table)?;
        ctx.note(format_args!("wrote basis cache {}", path.display()));
        Ok(())
    }

    pub fn ortho_check(&self) -> Result<Vec<DMatrix<f64>>> {
        ortho_check(&self.interp, self.config.knots)
    }

    pub fn config(&self) -> &BasisConfig {
        &self.config
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn geometry(&self) -> Geometry {
        self.config.geometry
    }

    pub fn table(&self) -> &BasisTable {
        &self.table
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.interp
    }

    pub fn layout(&self) -> CoefLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    fn ctx() -> SimContext {
        SimContext::new(ContextConfig {
            threads: 2,
            verbose: false,
        })
        .unwrap()
    }

    #[test]
    fn tabulated_nodes_match_analytic_modes() {
        let ctx = ctx();
        let config = BasisConfig {
            lmax: 2,
            nmax: 3,
            numr: 50,
            ..BasisConfig::default()
        };
        let basis = Basis::build(&ctx, &config).unwrap();
        let table = basis.table();
        let roots = ctx
            .roots()
            .get(crate::roots::RootFamily::SphericalBessel, 1, 3)
            .unwrap();
        let mode = SphereMode::new(2, roots.zeros[1], 1.0);
        for i in [0, 7, 49] {
            let expected = mode.eval(table.radial.node(i));
            assert_eq!(table.potential.slice(2, 1)[i], expected.potential);
            assert_eq!(table.rforce.slice(2, 1)[i], expected.radial_force);
        }
    }

    #[test]
    fn disk_tables_are_two_dimensional() {
        let config = BasisConfig {
            geometry: Geometry::Cylinder,
            lmax: 1,
            nmax: 2,
            numr: 20,
            numz: 10,
            rmap: crate::mapping::Mapping::Identity,
            ..BasisConfig::default()
        };
        let basis = Basis::build(&ctx(), &config).unwrap();
        assert!(basis.table().is_two_dimensional());
        assert_eq!(basis.table().grid_len(), 200);
        assert!(basis.table().zforce.is_some());
        assert_eq!(basis.layout().rows(), 2);
    }

    #[test]
    fn mismatched_table_is_rejected() {
        let ctx = ctx();
        let config = BasisConfig {
            lmax: 1,
            nmax: 2,
            numr: 10,
            ..BasisConfig::default()
        };
        let table = Basis::build(&ctx, &config).unwrap().table().clone();
        let other = BasisConfig { nmax: 3, ..config };
        assert!(Basis::from_table(&other, table).is_err());
    }
}
