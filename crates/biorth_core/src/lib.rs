//! The `biorth_core` crate computes gravitational fields of particle
//! systems through biorthogonal basis-function expansions.
//!
//! Key components:
//! - **Basis**: tabulated potential-density pairs for spheres and thin disks,
//!   with a binary cache and a numerical orthogonality check.
//! - **Interpolation**: bilinear lookup in mapped coordinates with clamp or
//!   strict range handling.
//! - **Accumulation**: particle projection onto the basis on a worker pool,
//!   with subsampling, statistical sub-groups and per-level buffers for
//!   multistep integration.
//! - **Evaluation**: density, potential and forces from a coefficient set,
//!   optionally restricted by harmonic filters.
//! - **Playback**: recorded coefficient histories replayed over time.

pub mod accumulate;
pub mod backend;
pub mod basis;
pub mod cache;
pub mod codec;
pub mod coefs;
pub mod config;
pub mod context;
pub mod error;
pub mod force;
pub mod interp;
pub mod mapping;
pub mod multistep;
pub mod noise;
pub mod roots;
pub mod special;

pub use accumulate::{CoefficientAccumulator, Draw, LevelBuffer, Particle, PassResult};
pub use backend::{HostBackend, ProjectionBackend, StagedBackend};
pub use basis::{Basis, BasisTable, Field};
pub use coefs::{CoefFrame, CoefHistory, CoefLayout, CoefficientSet, Playback};
pub use config::{
    AccumulationConfig, BackendKind, BasisConfig, ContextConfig, Geometry, HarmonicFilter, RangePolicy,
    TrimPolicy,
};
pub use context::{Collective, SimContext, SingleProcess};
pub use error::{Error, Result};
pub use force::{FieldValues, ForceEvaluator};
pub use interp::Interpolator;
pub use multistep::{LevelStatus, MultistepReconciler};
pub use noise::NoiseEstimate;
