use anyhow::{Result, anyhow, bail};
use image::RgbaImage;

use super::{
    BankSizing, EvaluationGraph, EvaluationInfo, StageId, StageReport, StageState, TargetBank,
    graph::BankRef,
};
use crate::backend::{RenderBackend, TargetInfo};

enum Mode<T> {
    /// Drives the graph's primary targets, bounded to `max`.
    Interactive { max: (u32, u32) },
    /// Owns temporary targets at a fixed resolution.
    Batch { bank: TargetBank<T> },
}

/// A driver over an [`EvaluationGraph`].
///
/// The interactive context renders into the targets the editor displays.
/// A batch context renders the same stages into its own targets, so a bake
/// or an offline animation run never disturbs what is on screen.
pub struct EvaluationContext<T> {
    mode: Mode<T>,
    reports: Vec<StageReport>,
}

impl<T: TargetInfo> EvaluationContext<T> {
    pub fn interactive(max_width: u32, max_height: u32) -> Self {
        Self {
            mode: Mode::Interactive {
                max: (max_width.max(1), max_height.max(1)),
            },
            reports: Vec::new(),
        }
    }

    pub fn batch(width: u32, height: u32) -> Self {
        Self {
            mode: Mode::Batch {
                bank: TargetBank::new(BankSizing::Fixed((width.max(1), height.max(1)))),
            },
            reports: Vec::new(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.mode, Mode::Batch { .. })
    }

    fn bank_ref<B>(&mut self, graph: &mut EvaluationGraph<B>) -> BankRef<'_, T>
    where
        B: RenderBackend<Target = T>,
    {
        match &mut self.mode {
            Mode::Interactive { max } => {
                let sizing = BankSizing::Bounded { max: *max };
                if graph.primary().sizing() != sizing {
                    graph.primary_mut().set_sizing(sizing);
                }
                BankRef::Primary
            }
            Mode::Batch { bank } => BankRef::External(bank),
        }
    }

    fn bank<'a, B>(&'a self, graph: &'a EvaluationGraph<B>) -> &'a TargetBank<T>
    where
        B: RenderBackend<Target = T>,
    {
        match &self.mode {
            Mode::Interactive { .. } => graph.primary(),
            Mode::Batch { bank } => bank,
        }
    }

    /// Redraws every stale stage in evaluation order.
    pub fn run_all<B>(&mut self, graph: &mut EvaluationGraph<B>) -> &[StageReport]
    where
        B: RenderBackend<Target = T>,
    {
        self.run(graph, EvaluationInfo::default(), None)
    }

    /// Brings `id` and whatever it reads from up to date. `info` applies to
    /// `id` only; upstream stages redraw just when stale.
    pub fn run_single<B>(
        &mut self,
        graph: &mut EvaluationGraph<B>,
        id: StageId,
        info: EvaluationInfo,
    ) -> &[StageReport]
    where
        B: RenderBackend<Target = T>,
    {
        self.run(graph, info, Some(id))
    }

    fn run<B>(
        &mut self,
        graph: &mut EvaluationGraph<B>,
        info: EvaluationInfo,
        focus: Option<StageId>,
    ) -> &[StageReport]
    where
        B: RenderBackend<Target = T>,
    {
        let bank = self.bank_ref(graph);
        let reports = graph.evaluate(bank, info, focus);
        let evaluated = reports
            .iter()
            .filter(|r| r.state == StageState::Evaluated)
            .count();
        let stuck = reports
            .iter()
            .filter(|r| r.state == StageState::Stuck)
            .count();
        if evaluated > 0 || stuck > 0 {
            log::debug!(
                "{} run: {evaluated} evaluated, {stuck} stuck",
                if self.is_batch() { "batch" } else { "interactive" }
            );
        }
        self.reports = reports;
        &self.reports
    }

    pub fn last_reports(&self) -> &[StageReport] {
        &self.reports
    }

    /// State of `id` in the most recent run, if it took part.
    pub fn stage_state(&self, id: StageId) -> Option<StageState> {
        self.reports.iter().find(|r| r.stage == id).map(|r| r.state)
    }

    /// Forces `id` to redraw on this context's next run.
    pub fn set_target_dirty<B>(&mut self, graph: &mut EvaluationGraph<B>, id: StageId) -> Result<()>
    where
        B: RenderBackend<Target = T>,
    {
        match &mut self.mode {
            Mode::Interactive { .. } => graph.set_target_dirty(id),
            Mode::Batch { bank } => {
                if graph.stage(id).is_none() {
                    bail!("unknown stage {id:?}");
                }
                bank.slot(id).forced_dirty = true;
                Ok(())
            }
        }
    }

    pub fn render_target<'a, B>(&'a self, graph: &'a EvaluationGraph<B>, id: StageId) -> Option<&'a T>
    where
        B: RenderBackend<Target = T>,
    {
        self.bank(graph).target(id)
    }

    /// Size `id` renders at in this context.
    pub fn evaluation_size<B>(&self, graph: &EvaluationGraph<B>, id: StageId) -> Option<(u32, u32)>
    where
        B: RenderBackend<Target = T>,
    {
        let stage = graph.stage(id)?;
        let extent = match &self.mode {
            Mode::Interactive { max } => {
                BankSizing::Bounded { max: *max }.resolve_extent(stage, graph.default_size())
            }
            Mode::Batch { bank } => bank.resolve_extent(stage, graph.default_size()),
        };
        Some((extent.width, extent.height))
    }

    pub fn read_pixels<B>(
        &mut self,
        graph: &mut EvaluationGraph<B>,
        id: StageId,
        face: u32,
    ) -> Result<RgbaImage>
    where
        B: RenderBackend<Target = T>,
    {
        if graph.stage(id).is_none() {
            return Err(anyhow!("unknown stage {id:?}"));
        }
        let bank = self.bank_ref(graph);
        graph.read_pixels_in(bank, id, face)
    }

    /// Frees the targets a batch context allocated. A no-op for the
    /// interactive context, whose targets belong to the graph.
    pub fn release<B>(&mut self, graph: &mut EvaluationGraph<B>)
    where
        B: RenderBackend<Target = T>,
    {
        if let Mode::Batch { bank } = &mut self.mode {
            graph.release_bank(bank);
        }
        self.reports.clear();
    }
}
