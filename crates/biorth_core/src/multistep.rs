//! Per-level coefficient buffers for multistep integration.
//!
//! Particles on fine time-step levels are re-projected more often than
//! those on coarse levels. Each level keeps the buffer of its most recent
//! accumulation, and the current coefficient set is the sum over all
//! non-retired levels. A level that has not been recomputed this cycle
//! contributes its previous buffer unchanged, which is the zeroth-order
//! extrapolation of its coefficients.
//!
//! Particles that change level between accumulations are reconciled
//! exactly: [`MultistepReconciler::note_level_change`] records the
//! particle's contribution, and the next reconcile moves it between the two
//! level buffers unless a level has been recomputed since the change (in
//! which case the fresh buffer already reflects the move).

use crate::accumulate::LevelBuffer;
use crate::coefs::{CoefLayout, CoefficientSet};
use crate::context::Collective;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelStatus {
    /// A cycle has begun and the level has not been committed since.
    Stale,
    /// The level holds a committed buffer for the current cycle.
    Accumulated,
    /// The level is excluded from the current set.
    Retired,
}

#[derive(Debug, Clone)]
struct LevelSlot {
    status: LevelStatus,
    /// Partials folded in during the current cycle.
    working: LevelBuffer,
    /// Contribution used by reconcile.
    committed: LevelBuffer,
    /// Sequence number of the last commit.
    committed_seq: u64,
    needs_rebuild: bool,
}

#[derive(Debug, Clone)]
struct PendingTransfer {
    seq: u64,
    from: usize,
    to: usize,
    contribution: LevelBuffer,
}

#[derive(Debug, Clone)]
pub struct MultistepReconciler {
    layout: CoefLayout,
    levels: Vec<LevelSlot>,
    pending: Vec<PendingTransfer>,
    seq: u64,
    current: LevelBuffer,
    current_time: Option<f64>,
    dirty: bool,
}

impl MultistepReconciler {
    pub fn new(layout: CoefLayout, levels: usize) -> Result<Self> {
        if levels == 0 {
            return Err(Error::InvalidConfig("at least one multistep level is required".into()));
        }
        let slot = LevelSlot {
            status: LevelStatus::Stale,
            working: LevelBuffer::zeros(layout),
            committed: LevelBuffer::zeros(layout),
            committed_seq: 0,
            needs_rebuild: true,
        };
        Ok(Self {
            layout,
            levels: vec![slot; levels],
            pending: Vec::new(),
            seq: 0,
            current: LevelBuffer::zeros(layout),
            current_time: None,
            dirty: true,
        })
    }

    pub fn layout(&self) -> CoefLayout {
        self.layout
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn status(&self, level: usize) -> Result<LevelStatus> {
        Ok(self.slot(level)?.status)
    }

    pub fn committed(&self, level: usize) -> Result<&LevelBuffer> {
        Ok(&self.slot(level)?.committed)
    }

    pub fn needs_rebuild(&self, level: usize) -> Result<bool> {
        Ok(self.slot(level)?.needs_rebuild)
    }

    /// Levels touched by a level change and not recomputed since.
    pub fn levels_needing_rebuild(&self) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, s)| s.needs_rebuild && s.status != LevelStatus::Retired)
            .map(|(i, _)| i)
            .collect()
    }

    /// Start recomputing `level`. Its working buffer is cleared; the
    /// previously committed buffer keeps contributing until the next commit.
    pub fn begin_cycle(&mut self, level: usize) -> Result<()> {
        let slot = self.slot_mut(level)?;
        if slot.status == LevelStatus::Retired {
            return Err(Error::InvalidState(format!("level {level} is retired")));
        }
        slot.working.clear();
        slot.status = LevelStatus::Stale;
        Ok(())
    }

    /// Fold one reduced partial into the working buffer of `level`.
    pub fn fold(&mut self, level: usize, partial: &LevelBuffer) -> Result<()> {
        let slot = self.slot_mut(level)?;
        if slot.status != LevelStatus::Stale {
            return Err(Error::InvalidState(format!(
                "level {level} is not in an open cycle"
            )));
        }
        slot.working.add(partial)
    }

    /// Close the cycle of `level` with `buffer` added to whatever was
    /// folded in, and make the result the level's contribution.
    pub fn commit(&mut self, level: usize, buffer: LevelBuffer) -> Result<()> {
        if buffer.layout() != self.layout {
            return Err(Error::SizeMismatch {
                what: "level buffer",
                expected: self.layout.len(),
                found: buffer.layout().len(),
            });
        }
        match self.slot(level)?.status {
            LevelStatus::Stale => {}
            LevelStatus::Accumulated => {
                return Err(Error::InvalidState(format!(
                    "level {level} was already committed this cycle"
                )))
            }
            LevelStatus::Retired => {
                return Err(Error::InvalidState(format!("level {level} is retired")))
            }
        }
        self.seq += 1;
        let seq = self.seq;
        let slot = &mut self.levels[level];
        slot.working.add(&buffer)?;
        slot.committed = slot.working.clone();
        slot.committed_seq = seq;
        slot.needs_rebuild = false;
        slot.status = LevelStatus::Accumulated;
        self.dirty = true;
        Ok(())
    }

    /// Record that a particle with the given contribution moved from level
    /// `from` to level `to`.
    pub fn note_level_change(&mut self, from: usize, to: usize, contribution: LevelBuffer) -> Result<()> {
        self.slot(from)?;
        self.slot(to)?;
        if contribution.layout() != self.layout {
            return Err(Error::SizeMismatch {
                what: "level change contribution",
                expected: self.layout.len(),
                found: contribution.layout().len(),
            });
        }
        if from == to {
            return Ok(());
        }
        self.seq += 1;
        self.pending.push(PendingTransfer {
            seq: self.seq,
            from,
            to,
            contribution,
        });
        self.levels[from].needs_rebuild = true;
        self.levels[to].needs_rebuild = true;
        self.dirty = true;
        Ok(())
    }

    pub fn retire(&mut self, level: usize) -> Result<()> {
        self.slot_mut(level)?.status = LevelStatus::Retired;
        self.dirty = true;
        Ok(())
    }

    /// Bring a retired level back; it contributes its last committed buffer
    /// until recomputed.
    pub fn activate(&mut self, level: usize) -> Result<()> {
        let slot = self.slot_mut(level)?;
        if slot.status == LevelStatus::Retired {
            slot.status = LevelStatus::Stale;
            self.dirty = true;
        }
        Ok(())
    }

    /// The current coefficient set: pending level changes applied, then the
    /// committed buffers of all non-retired levels summed.
    pub fn reconcile(&mut self, time: f64) -> Result<&CoefficientSet> {
        let deltas = self.pending_deltas()?;
        self.apply(deltas, time)
    }

    /// As [`reconcile`](Self::reconcile), with the level-change deltas summed
    /// across processes first. Every process must call this together.
    pub fn reconcile_collective(&mut self, time: f64, collective: &dyn Collective) -> Result<&CoefficientSet> {
        let mut deltas = self.pending_deltas()?;
        if collective.size() > 1 {
            for (gain, loss) in deltas.iter_mut() {
                for delta in [gain, loss] {
                    let mut reals = delta.to_reals();
                    collective.all_reduce_sum(&mut reals)?;
                    delta.set_reals(&reals)?;
                }
            }
        }
        self.apply(deltas, time)
    }

    /// The last reconciled set, without applying pending changes.
    pub fn current(&self) -> &CoefficientSet {
        &self.current.coefs
    }

    pub fn current_mass(&self) -> f64 {
        self.current.mass
    }

    pub fn current_time(&self) -> Option<f64> {
        self.current_time
    }

    /// Net signed change per level from the pending transfers, skipping
    /// the side of a transfer whose level was committed after it.
    fn pending_deltas(&self) -> Result<Vec<(LevelBuffer, LevelBuffer)>> {
        let mut deltas = vec![(LevelBuffer::zeros(self.layout), LevelBuffer::zeros(self.layout)); self.levels.len()];
        for t in &self.pending {
            if self.levels[t.from].committed_seq < t.seq {
                deltas[t.from].1.add(&t.contribution)?;
            }
            if self.levels[t.to].committed_seq < t.seq {
                deltas[t.to].0.add(&t.contribution)?;
            }
        }
        Ok(deltas)
    }

    fn apply(&mut self, deltas: Vec<(LevelBuffer, LevelBuffer)>, time: f64) -> Result<&CoefficientSet> {
        for (slot, (gain, loss)) in self.levels.iter_mut().zip(deltas) {
            slot.committed.add(&gain)?;
            slot.committed.subtract(&loss)?;
        }
        self.pending.clear();

        if self.dirty || self.current_time != Some(time) {
            let mut total = LevelBuffer::zeros(self.layout);
            for slot in self.levels.iter().filter(|s| s.status != LevelStatus::Retired) {
                total.add(&slot.committed)?;
            }
            self.current = total;
            self.current_time = Some(time);
            self.dirty = false;
        }
        Ok(&self.current.coefs)
    }

    fn slot(&self, level: usize) -> Result<&LevelSlot> {
        let limit = self.levels.len() - 1;
        self.levels.get(level).ok_or(Error::LevelIndexOutOfRange {
            what: "level",
            index: level,
            limit,
        })
    }

    fn slot_mut(&mut self, level: usize) -> Result<&mut LevelSlot> {
        let limit = self.levels.len() - 1;
        self.levels.get_mut(level).ok_or(Error::LevelIndexOutOfRange {
            what: "level",
            index: level,
            limit,
        })
    }
}
