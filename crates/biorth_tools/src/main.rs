//! Command-line bridge to `biorth_core`: inspect cache headers, build or
//! refresh basis caches, and run the orthogonality self-check.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use biorth_core::basis::OrthoSummary;
use biorth_core::{cache, Basis, BasisConfig, ContextConfig, SimContext};

const USAGE: &str = "usage:
  biorth-tools inspect <cache>
  biorth-tools build <config.json>
  biorth-tools ortho <config.json> [knots]";

#[derive(Serialize)]
struct BuildReport<'a> {
    cache: Option<&'a Path>,
    geometry: &'static str,
    lmax: usize,
    nmax: usize,
    grid_points: usize,
}

#[derive(Serialize)]
struct OrthoReport {
    harmonic: usize,
    diagonal_error: f64,
    off_diagonal: f64,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["inspect", path] => inspect(Path::new(path)),
        ["build", config] => build(Path::new(config)),
        ["ortho", config] => ortho(Path::new(config), None),
        ["ortho", config, knots] => {
            let knots = knots
                .parse()
                .with_context(|| format!("knots must be a positive integer, got '{knots}'"))?;
            ortho(Path::new(config), Some(knots))
        }
        _ => bail!("{USAGE}"),
    }
}

fn load_config(path: &Path) -> Result<BasisConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config =
        BasisConfig::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    // A relative cache path is taken relative to the config file.
    if let Some(cache) = config.cache_file.take() {
        let resolved: PathBuf = match path.parent() {
            Some(dir) if cache.is_relative() => dir.join(cache),
            _ => cache,
        };
        config.cache_file = Some(resolved);
    }
    Ok(config)
}

fn context() -> Result<SimContext> {
    SimContext::new(ContextConfig {
        threads: 0,
        verbose: true,
    })
    .context("starting the worker pool")
}

fn inspect(path: &Path) -> Result<()> {
    let header = cache::inspect(path).with_context(|| format!("inspecting {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

fn build(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    if config.cache_file.is_none() {
        bail!("{} does not name a cache_file", config_path.display());
    }
    let ctx = context()?;
    let basis = Basis::load_or_build(&ctx, &config).context("building the basis")?;
    let report = BuildReport {
        cache: config.cache_file.as_deref(),
        geometry: basis.geometry().tag(),
        lmax: config.lmax,
        nmax: config.nmax,
        grid_points: basis.table().grid_len(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn ortho(config_path: &Path, knots: Option<usize>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(knots) = knots {
        config.knots = knots;
    }
    let ctx = context()?;
    let basis = Basis::load_or_build(&ctx, &config).context("building the basis")?;
    let matrices = basis.ortho_check().context("orthogonality check")?;

    let reports: Vec<OrthoReport> = matrices
        .iter()
        .enumerate()
        .map(|(harmonic, m)| {
            let summary = OrthoSummary::from_matrices(std::slice::from_ref(m));
            OrthoReport {
                harmonic,
                diagonal_error: summary.diagonal_error,
                off_diagonal: summary.off_diagonal,
            }
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
