//! Explicit simulation context passed by reference to every component.
//!
//! The context owns the worker pool, the root-table memo and the process
//! role. It is created once at start-up and torn down by dropping it.

use std::fmt;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::roots::RootCache;

/// Cross-process reduction used before reconciliation when particles are
/// split over several processes.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Elementwise sum of `buf` over all processes, result on every process.
    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()>;

    /// Only the coordinator writes shared files such as basis caches.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// The trivial collective for a run with a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

pub struct SimContext {
    pool: ThreadPool,
    roots: RootCache,
    collective: Box<dyn Collective>,
    verbose: bool,
}

impl SimContext {
    pub fn new(config: ContextConfig) -> Result<Self> {
        Self::with_collective(config, Box::new(SingleProcess))
    }

    pub fn with_collective(config: ContextConfig, collective: Box<dyn Collective>) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("biorth-worker-{i}"))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("could not start worker pool: {e}")))?;

        let ctx = Self {
            pool,
            roots: RootCache::new(),
            collective,
            verbose: config.verbose,
        };
        ctx.note(format_args!(
            "context ready: {} worker threads, rank {} of {}",
            ctx.threads(),
            ctx.collective.rank(),
            ctx.collective.size()
        ));
        Ok(ctx)
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn roots(&self) -> &RootCache {
        &self.roots
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn is_coordinator(&self) -> bool {
        self.collective.is_coordinator()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Diagnostic line on stderr, printed only in verbose mode.
    pub fn note(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            eprintln!("[biorth rank {}] {}", self.collective.rank(), args);
        }
    }

    /// Warnings are always printed.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        eprintln!("[biorth rank {}] warning: {}", self.collective.rank(), args);
    }
}

impl fmt::Debug for SimContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimContext")
            .field("threads", &self.threads())
            .field("rank", &self.collective.rank())
            .field("size", &self.collective.size())
            .field("root_tables", &self.roots.len())
            .field("verbose", &self.verbose)
            .finish()
    }
}
