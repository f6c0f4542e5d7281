//! Per-context render targets and the version bookkeeping that drives lazy
//! re-evaluation.
//!
//! Each slot remembers the stage epoch it last rendered and the output
//! version of every input at that time. Comparing those against the current
//! values answers "is this stale?" without ever walking downstream.

use std::time::Duration;

use slotmap::{SecondaryMap, SlotMap};

use super::{MAX_INPUTS, StageId, stage::Stage};
use crate::backend::{RenderBackend, TargetExtent, TargetInfo};

#[derive(Debug)]
pub struct StageOutput<T> {
    pub(crate) target: Option<T>,
    /// Zero until the first successful render.
    pub(crate) version: u64,
    pub(crate) seen_epoch: Option<u64>,
    pub(crate) seen_inputs: [Option<(StageId, u64)>; MAX_INPUTS],
    pub(crate) forced_dirty: bool,
    pub(crate) last_error: Option<String>,
    /// What the stage looked like when its last draw failed.
    pub(crate) failed: Option<FailedDraw>,
    pub(crate) last_duration: Option<Duration>,
    /// (source revision, frame index, uploaded texture)
    pub(crate) source: Option<(u64, usize, T)>,
}

impl<T> StageOutput<T> {
    pub fn target(&self) -> Option<&T> {
        self.target.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_duration(&self) -> Option<Duration> {
        self.last_duration
    }
}

impl<T> Default for StageOutput<T> {
    fn default() -> Self {
        Self {
            target: None,
            version: 0,
            seen_epoch: None,
            seen_inputs: [None; MAX_INPUTS],
            forced_dirty: false,
            last_error: None,
            failed: None,
            last_duration: None,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailedDraw {
    pub(crate) epoch: u64,
    pub(crate) inputs: [Option<(StageId, u64)>; MAX_INPUTS],
    pub(crate) extent: TargetExtent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankSizing {
    /// Stage sizes apply, clamped to this bound.
    Bounded { max: (u32, u32) },
    /// Every target gets exactly this size.
    Fixed((u32, u32)),
}

impl BankSizing {
    /// Target extent for `stage` under this sizing. Cube maps take the
    /// smaller side.
    pub fn resolve_extent(self, stage: &Stage, default_size: (u32, u32)) -> TargetExtent {
        let (width, height) = match self {
            BankSizing::Fixed(size) => size,
            BankSizing::Bounded { max } => {
                let (w, h) = stage.size.unwrap_or(default_size);
                (w.clamp(1, max.0.max(1)), h.clamp(1, max.1.max(1)))
            }
        };
        let extent = if stage.cubemap {
            TargetExtent::cube(width.min(height))
        } else {
            TargetExtent::flat(width, height)
        };
        TargetExtent {
            depth: stage.has_depth,
            ..extent
        }
    }
}

#[derive(Debug)]
pub struct TargetBank<T> {
    outputs: SecondaryMap<StageId, StageOutput<T>>,
    sizing: BankSizing,
    next_version: u64,
}

impl<T: TargetInfo> TargetBank<T> {
    pub fn new(sizing: BankSizing) -> Self {
        Self {
            outputs: SecondaryMap::new(),
            sizing,
            next_version: 0,
        }
    }

    pub fn sizing(&self) -> BankSizing {
        self.sizing
    }

    pub fn set_sizing(&mut self, sizing: BankSizing) {
        self.sizing = sizing;
    }

    pub(crate) fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    pub fn get(&self, id: StageId) -> Option<&StageOutput<T>> {
        self.outputs.get(id)
    }

    pub(crate) fn slot(&mut self, id: StageId) -> &mut StageOutput<T> {
        if !self.outputs.contains_key(id) {
            self.outputs.insert(id, StageOutput::default());
        }
        &mut self.outputs[id]
    }

    pub fn target(&self, id: StageId) -> Option<&T> {
        self.outputs.get(id)?.target.as_ref()
    }

    pub fn version(&self, id: StageId) -> u64 {
        self.outputs.get(id).map_or(0, |o| o.version)
    }

    pub fn resolve_extent(&self, stage: &Stage, default_size: (u32, u32)) -> TargetExtent {
        self.sizing.resolve_extent(stage, default_size)
    }

    pub(crate) fn current_inputs(&self, stage: &Stage) -> [Option<(StageId, u64)>; MAX_INPUTS] {
        stage
            .inputs
            .map(|input| input.map(|producer| (producer, self.version(producer))))
    }

    /// Whether `stage` would be redrawn by a non-forced run of this bank.
    pub fn needs_evaluation(&self, id: StageId, stage: &Stage, default_size: (u32, u32)) -> bool {
        let Some(output) = self.outputs.get(id) else {
            return true;
        };
        output.forced_dirty
            || output.version == 0
            || output.seen_epoch != Some(stage.epoch)
            || output.seen_inputs != self.current_inputs(stage)
            || output.target.as_ref().map(|t| t.extent())
                != Some(self.resolve_extent(stage, default_size))
    }

    pub(crate) fn failed_draw(&self, stage: &Stage, default_size: (u32, u32)) -> FailedDraw {
        FailedDraw {
            epoch: stage.epoch,
            inputs: self.current_inputs(stage),
            extent: self.resolve_extent(stage, default_size),
        }
    }

    /// Error of a stage whose draw failed and that has not changed since.
    /// Such a stage is reported stuck without another attempt.
    pub fn held_failure(&self, id: StageId, stage: &Stage, default_size: (u32, u32)) -> Option<&str> {
        let output = self.outputs.get(id)?;
        if output.forced_dirty || output.failed? != self.failed_draw(stage, default_size) {
            return None;
        }
        output.last_error.as_deref()
    }

    pub(crate) fn remove<B>(&mut self, backend: &mut B, id: StageId)
    where
        B: RenderBackend<Target = T>,
    {
        if let Some(mut output) = self.outputs.remove(id) {
            if let Some(target) = output.target.as_mut() {
                backend.destroy_target(target);
            }
            if let Some((_, _, source)) = output.source.as_mut() {
                backend.destroy_target(source);
            }
        }
    }

    /// Drops slots whose stage no longer exists.
    pub(crate) fn purge<B>(&mut self, backend: &mut B, stages: &SlotMap<StageId, Stage>)
    where
        B: RenderBackend<Target = T>,
    {
        let gone: Vec<StageId> = self
            .outputs
            .keys()
            .filter(|id| !stages.contains_key(*id))
            .collect();
        for id in gone {
            self.remove(backend, id);
        }
    }

    pub(crate) fn release<B>(&mut self, backend: &mut B)
    where
        B: RenderBackend<Target = T>,
    {
        let ids: Vec<StageId> = self.outputs.keys().collect();
        for id in ids {
            self.remove(backend, id);
        }
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
