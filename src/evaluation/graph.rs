use std::{path::Path, time::Instant};

use anyhow::{Context, Result, anyhow, bail};
use image::{Rgba32FImage, RgbaImage};
use slotmap::SlotMap;

use super::{
    BankSizing, EvaluationInfo, InputSampler, MAX_INPUTS, StageId, StageReport, StageState,
    TargetBank, order,
    stage::{SourceImage, Stage},
};
use crate::{
    backend::{DrawCall, EvaluationUniforms, RenderBackend, SampledInput, TargetInfo},
    shader::{CompileSummary, ShaderRegistry},
};

/// Which bank an evaluation reads and writes.
pub(crate) enum BankRef<'a, T> {
    Primary,
    External(&'a mut TargetBank<T>),
}

/// The stages of one document, their wiring, and the primary set of
/// targets the editor displays.
///
/// Stages are addressed by [`StageId`]; the positional view (creation
/// order, compacted on delete) is derived from `positions` so callers that
/// think in indices never renumber anything themselves.
pub struct EvaluationGraph<B: RenderBackend> {
    backend: B,
    shaders: ShaderRegistry<B::Program>,
    stages: SlotMap<StageId, Stage>,
    positions: Vec<StageId>,
    order: Vec<StageId>,
    primary: TargetBank<B::Target>,
    default_size: (u32, u32),
    next_epoch: u64,
}

fn producers(stages: &SlotMap<StageId, Stage>, id: StageId) -> Vec<StageId> {
    stages
        .get(id)
        .map(|stage| stage.connected_inputs().collect())
        .unwrap_or_default()
}

impl<B: RenderBackend> EvaluationGraph<B> {
    pub fn new(
        backend: B,
        shaders: ShaderRegistry<B::Program>,
        default_size: (u32, u32),
        interactive_max: (u32, u32),
    ) -> Self {
        Self {
            backend,
            shaders,
            stages: SlotMap::with_key(),
            positions: Vec::new(),
            order: Vec::new(),
            primary: TargetBank::new(BankSizing::Bounded {
                max: interactive_max,
            }),
            default_size,
            next_epoch: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn shaders(&self) -> &ShaderRegistry<B::Program> {
        &self.shaders
    }

    pub fn primary(&self) -> &TargetBank<B::Target> {
        &self.primary
    }

    pub(crate) fn primary_mut(&mut self) -> &mut TargetBank<B::Target> {
        &mut self.primary
    }

    pub fn default_size(&self) -> (u32, u32) {
        self.default_size
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Stage ids in positional order.
    pub fn stage_ids(&self) -> &[StageId] {
        &self.positions
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut Stage> {
        self.stages
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown stage {id:?}"))
    }

    /// Applies `f` to the stage and bumps its epoch if `f` reports a change.
    fn mutate(&mut self, id: StageId, f: impl FnOnce(&mut Stage) -> bool) -> Result<()> {
        let epoch = self.next_epoch + 1;
        let stage = self.stage_mut(id)?;
        if f(stage) {
            stage.epoch = epoch;
            self.next_epoch = epoch;
        }
        Ok(())
    }

    fn recompute_order(&mut self) {
        let stages = &self.stages;
        match order::topo_sort(&self.positions, |id| producers(stages, id)) {
            Ok(sorted) => self.order = sorted,
            Err(err) => {
                log::error!("{err}; falling back to creation order");
                self.order = self.positions.clone();
            }
        }
    }

    // ----- topology -----

    /// Creates a stage and its primary target at the default size.
    pub fn add_evaluation_target(&mut self) -> Result<StageId> {
        let epoch = self.bump_epoch();
        let stage = Stage::new(epoch);
        let extent = self.primary.resolve_extent(&stage, self.default_size);
        let target = self
            .backend
            .create_target(extent)
            .context("failed to create stage target")?;
        let id = self.stages.insert(stage);
        self.primary.slot(id).target = Some(target);
        self.positions.push(id);
        self.recompute_order();
        log::debug!("added stage {id:?} at position {}", self.positions.len() - 1);
        Ok(id)
    }

    /// Removes a stage. Later positions shift down by one and every input
    /// that read from it becomes unconnected.
    pub fn del_evaluation_target(&mut self, id: StageId) -> Result<()> {
        if self.stages.remove(id).is_none() {
            bail!("unknown stage {id:?}");
        }
        self.positions.retain(|s| *s != id);
        for stage in self.stages.values_mut() {
            let mut touched = false;
            for input in stage.inputs.iter_mut() {
                if *input == Some(id) {
                    *input = None;
                    touched = true;
                }
            }
            if touched {
                self.next_epoch += 1;
                stage.epoch = self.next_epoch;
            }
        }
        self.primary.remove(&mut self.backend, id);
        self.recompute_order();
        Ok(())
    }

    pub fn set_evaluation_call(&mut self, id: StageId, shader: &str) -> Result<()> {
        self.mutate(id, |stage| {
            if stage.shader.as_deref() == Some(shader) {
                return false;
            }
            stage.shader = Some(shader.to_string());
            true
        })
    }

    /// Wires `source`'s output into `slot` of `id`. Rejects bad slots,
    /// unknown stages and edges that would form a cycle, leaving the graph
    /// unchanged.
    pub fn add_evaluation_input(&mut self, id: StageId, slot: usize, source: StageId) -> Result<()> {
        if slot >= MAX_INPUTS {
            bail!("input slot {slot} out of range (max {})", MAX_INPUTS - 1);
        }
        if !self.stages.contains_key(id) {
            bail!("unknown stage {id:?}");
        }
        if !self.stages.contains_key(source) {
            bail!("unknown source stage {source:?}");
        }
        let stages = &self.stages;
        if order::would_create_cycle(id, source, |k| producers(stages, k)) {
            bail!("connecting {source:?} into {id:?} would create a cycle");
        }
        self.mutate(id, |stage| {
            if stage.inputs[slot] == Some(source) {
                return false;
            }
            stage.inputs[slot] = Some(source);
            true
        })?;
        self.recompute_order();
        Ok(())
    }

    pub fn del_evaluation_input(&mut self, id: StageId, slot: usize) -> Result<()> {
        if slot >= MAX_INPUTS {
            bail!("input slot {slot} out of range (max {})", MAX_INPUTS - 1);
        }
        self.mutate(id, |stage| stage.inputs[slot].take().is_some())?;
        self.recompute_order();
        Ok(())
    }

    /// Replaces the evaluation order verbatim. The order is trusted: an
    /// order that runs a consumer before its producer yields stale reads
    /// until the next topology change recomputes it.
    pub fn set_evaluation_order(&mut self, order: Vec<StageId>) {
        self.order = order;
    }

    pub fn evaluation_order(&self) -> &[StageId] {
        &self.order
    }

    /// Whether the current order respects every input edge.
    pub fn order_is_topological(&self) -> bool {
        let stages = &self.stages;
        order::is_topological(&self.order, |k| producers(stages, k))
    }

    // ----- positional view -----

    pub fn stage_at(&self, position: usize) -> Option<StageId> {
        self.positions.get(position).copied()
    }

    pub fn index_of(&self, id: StageId) -> Option<usize> {
        self.positions.iter().position(|s| *s == id)
    }

    pub fn input_indices(&self, id: StageId) -> Result<[Option<usize>; MAX_INPUTS]> {
        let stage = self
            .stages
            .get(id)
            .ok_or_else(|| anyhow!("unknown stage {id:?}"))?;
        Ok(stage.inputs.map(|input| input.and_then(|s| self.index_of(s))))
    }

    pub fn evaluation_order_indices(&self) -> Vec<usize> {
        self.order.iter().filter_map(|id| self.index_of(*id)).collect()
    }

    // ----- stage state -----

    /// Copies `bytes` into the stage. Unchanged bytes do not dirty it.
    pub fn set_evaluation_parameters(&mut self, id: StageId, bytes: &[u8]) -> Result<()> {
        self.mutate(id, |stage| {
            if stage.params == bytes {
                return false;
            }
            stage.params.clear();
            stage.params.extend_from_slice(bytes);
            true
        })
    }

    pub fn set_evaluation_sampler(
        &mut self,
        id: StageId,
        slot: usize,
        sampler: InputSampler,
    ) -> Result<()> {
        if slot >= MAX_INPUTS {
            bail!("input slot {slot} out of range (max {})", MAX_INPUTS - 1);
        }
        self.mutate(id, |stage| {
            if stage.samplers[slot] == sampler {
                return false;
            }
            stage.samplers[slot] = sampler;
            true
        })
    }

    pub fn set_time_dependent(&mut self, id: StageId, time_dependent: bool) -> Result<()> {
        self.mutate(id, |stage| {
            let changed = stage.time_dependent != time_dependent;
            stage.time_dependent = time_dependent;
            changed
        })
    }

    /// Moves the stage to `time` (in frames, relative to its time slot).
    /// Only stages that read time, or whose source frame changes, go stale.
    pub fn set_stage_local_time(&mut self, id: StageId, time: i32) -> Result<()> {
        self.mutate(id, |stage| {
            if stage.local_time == time {
                return false;
            }
            let frame_changed = stage
                .source
                .as_ref()
                .is_some_and(|s| s.frame_index(stage.local_time) != s.frame_index(time));
            stage.local_time = time;
            stage.time_dependent || frame_changed
        })
    }

    pub fn local_time(&self, id: StageId) -> Option<i32> {
        self.stages.get(id).map(|s| s.local_time)
    }

    /// Number of frames in the stage's source image, 0 without one.
    pub fn image_duration(&self, id: StageId) -> i32 {
        self.stages
            .get(id)
            .and_then(|s| s.source.as_ref())
            .map_or(0, SourceImage::duration)
    }

    /// Assigns decoded frames; an empty list clears the source.
    pub fn set_source_image(&mut self, id: StageId, frames: Vec<RgbaImage>) -> Result<()> {
        let revision = self.next_epoch + 1;
        self.mutate(id, |stage| {
            stage.source = (!frames.is_empty()).then_some(SourceImage { frames, revision });
            true
        })
    }

    /// Decodes `path` (every frame for animated GIFs) into the stage's
    /// source and returns the image duration in frames.
    pub fn load_source_image(&mut self, id: StageId, path: impl AsRef<Path>) -> Result<i32> {
        let frames = SourceImage::decode(path.as_ref())?;
        self.set_source_image(id, frames)?;
        Ok(self.image_duration(id))
    }

    pub fn set_environment(&mut self, image: Option<&Rgba32FImage>) -> Result<()> {
        self.backend.set_environment(image)?;
        self.next_epoch += 1;
        for stage in self.stages.values_mut() {
            stage.epoch = self.next_epoch;
        }
        Ok(())
    }

    /// Loads an equirectangular HDR image as the lighting environment.
    pub fn load_equirect_environment(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("failed to load environment {}", path.display()))?
            .to_rgba32f();
        log::info!(
            "environment {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        self.set_environment(Some(&image))
    }

    /// Requested output size; `None` restores the default.
    pub fn set_evaluation_size(&mut self, id: StageId, size: Option<(u32, u32)>) -> Result<()> {
        if let Some((0, _) | (_, 0)) = size {
            bail!("evaluation size must be non-zero");
        }
        self.mutate(id, |stage| {
            let changed = stage.size != size;
            stage.size = size;
            changed
        })
    }

    pub fn set_cubemap(&mut self, id: StageId, cubemap: bool) -> Result<()> {
        self.mutate(id, |stage| {
            let changed = stage.cubemap != cubemap;
            stage.cubemap = cubemap;
            changed
        })
    }

    pub fn set_depth_buffer(&mut self, id: StageId, has_depth: bool) -> Result<()> {
        self.mutate(id, |stage| {
            let changed = stage.has_depth != has_depth;
            stage.has_depth = has_depth;
            changed
        })
    }

    pub fn set_mouse(&mut self, id: StageId, mouse: [f32; 4]) -> Result<()> {
        self.mutate(id, |stage| {
            let changed = stage.mouse != mouse;
            stage.mouse = mouse;
            changed
        })
    }

    // ----- shaders -----

    /// Compiles every shader without an outcome and re-dirties the stages
    /// that use a freshly compiled one.
    pub fn compile_shaders(&mut self) -> CompileSummary {
        let summary = self.shaders.compile_all(&mut self.backend);
        for id in &summary.compiled {
            self.touch_shader_users(id);
        }
        summary
    }

    /// Replaces one node source and recompiles it.
    pub fn set_shader_source(&mut self, shader: &str, source: &str) -> Result<()> {
        self.shaders.set_source(shader, source);
        let result = self.shaders.compile(&mut self.backend, shader);
        self.touch_shader_users(shader);
        result
    }

    /// Replaces the shared prelude and recompiles everything.
    pub fn set_base_shader(&mut self, source: &str) -> CompileSummary {
        self.shaders.set_base_shader(source);
        self.compile_shaders()
    }

    fn touch_shader_users(&mut self, shader: &str) {
        for stage in self.stages.values_mut() {
            if stage.shader.as_deref() == Some(shader) {
                self.next_epoch += 1;
                stage.epoch = self.next_epoch;
            }
        }
    }

    // ----- primary bank queries -----

    /// Forces the stage to redraw on the next run. Consumers notice through
    /// its output version.
    pub fn set_target_dirty(&mut self, id: StageId) -> Result<()> {
        if !self.stages.contains_key(id) {
            bail!("unknown stage {id:?}");
        }
        self.primary.slot(id).forced_dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self, id: StageId) -> bool {
        self.stages
            .get(id)
            .is_some_and(|stage| self.primary.needs_evaluation(id, stage, self.default_size))
    }

    /// Stages, in evaluation order, that the next interactive run would draw.
    /// Stuck stages that have not changed since their failure are left out.
    pub fn pending_stages(&self) -> Vec<StageId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.is_dirty(*id)
                    && self.stages.get(*id).is_some_and(|stage| {
                        self.primary
                            .held_failure(*id, stage, self.default_size)
                            .is_none()
                    })
            })
            .collect()
    }

    pub fn render_target(&self, id: StageId) -> Option<&B::Target> {
        self.primary.target(id)
    }

    /// Size the stage renders at in the interactive bank.
    pub fn evaluation_size(&self, id: StageId) -> Option<(u32, u32)> {
        let stage = self.stages.get(id)?;
        let extent = self.primary.resolve_extent(stage, self.default_size);
        Some((extent.width, extent.height))
    }

    pub fn last_error(&self, id: StageId) -> Option<&str> {
        self.primary.get(id)?.last_error.as_deref()
    }

    pub fn read_pixels(&mut self, id: StageId, face: u32) -> Result<RgbaImage> {
        self.read_pixels_in(BankRef::Primary, id, face)
    }

    /// Runs every stale stage of the primary bank in order.
    pub fn run_evaluation(&mut self) -> Vec<StageReport> {
        self.evaluate(BankRef::Primary, EvaluationInfo::default(), None)
    }

    // ----- evaluation core -----

    pub(crate) fn read_pixels_in(
        &mut self,
        bank: BankRef<'_, B::Target>,
        id: StageId,
        face: u32,
    ) -> Result<RgbaImage> {
        let Self {
            backend, primary, ..
        } = self;
        let bank: &TargetBank<B::Target> = match bank {
            BankRef::Primary => primary,
            BankRef::External(bank) => bank,
        };
        let target = bank
            .target(id)
            .ok_or_else(|| anyhow!("stage {id:?} has no target in this context"))?;
        backend.read_pixels(target, face)
    }

    pub(crate) fn release_bank(&mut self, bank: &mut TargetBank<B::Target>) {
        bank.release(&mut self.backend);
    }

    /// Walks the order and redraws stale stages. With `focus`, only the
    /// focused stage and its upstream run, and `info` applies to the focused
    /// stage alone.
    pub(crate) fn evaluate(
        &mut self,
        bank: BankRef<'_, B::Target>,
        info: EvaluationInfo,
        focus: Option<StageId>,
    ) -> Vec<StageReport> {
        let Self {
            backend,
            shaders,
            stages,
            order,
            primary,
            default_size,
            ..
        } = self;
        let bank: &mut TargetBank<B::Target> = match bank {
            BankRef::Primary => primary,
            BankRef::External(bank) => bank,
        };
        let stages = &*stages;
        bank.purge(backend, stages);

        let subset = focus.map(|id| order::upstream_reachable(id, |k| producers(stages, k)));
        let mut reports = Vec::new();
        for &id in order.iter() {
            if subset.as_ref().is_some_and(|s| !s.contains(&id)) {
                continue;
            }
            let Some(stage) = stages.get(id) else {
                continue;
            };
            let stage_info = match focus {
                Some(focused) if focused != id => EvaluationInfo::default(),
                _ => info,
            };
            reports.push(evaluate_stage(
                backend,
                shaders,
                bank,
                id,
                stage,
                stage_info,
                *default_size,
            ));
        }
        reports
    }
}

fn evaluate_stage<B: RenderBackend>(
    backend: &mut B,
    shaders: &ShaderRegistry<B::Program>,
    bank: &mut TargetBank<B::Target>,
    id: StageId,
    stage: &Stage,
    info: EvaluationInfo,
    default_size: (u32, u32),
) -> StageReport {
    let mut report = StageReport {
        stage: id,
        state: StageState::Clean,
        duration: None,
        forced: info.forced_dirty,
        ui_pass: info.ui_pass,
        error: None,
    };
    if !info.forced_dirty {
        if !bank.needs_evaluation(id, stage, default_size) {
            return report;
        }
        if let Some(error) = bank.held_failure(id, stage, default_size) {
            report.state = StageState::Stuck;
            report.error = Some(error.to_string());
            return report;
        }
    }

    let started = Instant::now();
    match draw_stage(backend, shaders, bank, id, stage, info, default_size) {
        Ok(()) => {
            let duration = started.elapsed();
            let seen_inputs = bank.current_inputs(stage);
            let version = bank.bump_version();
            let slot = bank.slot(id);
            slot.version = version;
            slot.seen_epoch = Some(stage.epoch);
            slot.seen_inputs = seen_inputs;
            slot.forced_dirty = false;
            slot.last_error = None;
            slot.failed = None;
            slot.last_duration = Some(duration);
            log::debug!(
                "evaluated {id:?} ({}) in {:.2?}",
                stage.shader.as_deref().unwrap_or("-"),
                duration
            );
            report.state = StageState::Evaluated;
            report.duration = Some(duration);
        }
        Err(err) => {
            let message = format!("{err:#}");
            log::warn!("stage {id:?} is stuck: {message}");
            let failed = bank.failed_draw(stage, default_size);
            let slot = bank.slot(id);
            slot.last_error = Some(message.clone());
            slot.failed = Some(failed);
            slot.forced_dirty = false;
            report.state = StageState::Stuck;
            report.error = Some(message);
        }
    }
    report
}

fn draw_stage<B: RenderBackend>(
    backend: &mut B,
    shaders: &ShaderRegistry<B::Program>,
    bank: &mut TargetBank<B::Target>,
    id: StageId,
    stage: &Stage,
    info: EvaluationInfo,
    default_size: (u32, u32),
) -> Result<()> {
    let shader = stage
        .shader
        .as_deref()
        .ok_or_else(|| anyhow!("no shader assigned"))?;
    let program = match shaders.program(shader) {
        Some(program) => program,
        None => match shaders.compile_error(shader) {
            Some(err) => bail!("shader '{shader}' failed to compile: {err}"),
            None if shaders.contains(shader) => bail!("shader '{shader}' is not compiled"),
            None => bail!("no shader named '{shader}'"),
        },
    };

    let extent = bank.resolve_extent(stage, default_size);
    let slot = bank.slot(id);
    match slot.target.as_ref().map(TargetInfo::extent) {
        Some(current) if current == extent => {}
        Some(current) if current.faces == extent.faces && current.depth == extent.depth => {
            if let Some(target) = slot.target.as_mut() {
                backend.resize_target(target, extent.width, extent.height)?;
                backend.clear_target(target)?;
            }
        }
        _ => {
            if let Some(mut old) = slot.target.take() {
                backend.destroy_target(&mut old);
            }
            let target = backend.create_target(extent)?;
            backend.clear_target(&target)?;
            slot.target = Some(target);
        }
    }

    match &stage.source {
        Some(source) => {
            let frame = source.frame_index(stage.local_time);
            let fresh = matches!(&slot.source, Some((rev, f, _)) if *rev == source.revision && *f == frame);
            if !fresh {
                if let Some((_, _, mut old)) = slot.source.take() {
                    backend.destroy_target(&mut old);
                }
                let image = source
                    .frames
                    .get(frame)
                    .ok_or_else(|| anyhow!("source image has no frames"))?;
                let uploaded = backend.upload_image("source image", image)?;
                slot.source = Some((source.revision, frame, uploaded));
            }
        }
        None => {
            if let Some((_, _, mut old)) = slot.source.take() {
                backend.destroy_target(&mut old);
            }
        }
    }

    let bank = &*bank;
    let target = bank
        .target(id)
        .ok_or_else(|| anyhow!("stage target missing after allocation"))?;
    let mut inputs: [Option<SampledInput<'_, B::Target>>; MAX_INPUTS] =
        std::array::from_fn(|_| None);
    let mut input_mask = 0u32;
    for (slot, producer) in stage.inputs.iter().enumerate() {
        if let Some(input) = producer.and_then(|p| bank.target(p)) {
            inputs[slot] = Some(SampledInput {
                target: input,
                sampler: stage.samplers[slot],
            });
            input_mask |= 1 << slot;
        }
    }
    let source = bank
        .get(id)
        .and_then(|o| o.source.as_ref())
        .map(|(_, _, t)| t);

    backend.draw(&DrawCall {
        label: shader,
        target,
        program,
        inputs,
        source,
        uniforms: EvaluationUniforms {
            target_size: [extent.width as f32, extent.height as f32],
            time: stage.local_time as f32,
            face: 0,
            mouse: stage.mouse,
            input_mask,
            forced: info.forced_dirty as u32,
            ui_pass: info.ui_pass as u32,
            _pad: 0,
        },
        parameters: &stage.params,
    })
}
