//! Editor-facing facade.
//!
//! A [`Session`] owns one graph, its interactive context, and the node
//! instances the editor works with. Instances are kept in positional order,
//! parallel to the graph's positional view, so an editor that addresses
//! nodes by index never has to renumber anything after a delete.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use image::RgbaImage;

use crate::{
    backend::RenderBackend,
    config::EngineConfig,
    evaluation::{
        EvaluationContext, EvaluationGraph, EvaluationInfo, InputSampler, MAX_INPUTS, StageId,
        StageReport, StageState, save_image,
    },
    params::{MouseInput, ParameterBlock},
    schema::{NodeCatalog, NodeTypeDef, ParamKind},
    shader::ShaderRegistry,
};

#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub stage: StageId,
    pub type_index: usize,
    /// Unique for the lifetime of the session, never reused.
    pub runtime_id: u64,
    pub parameters: ParameterBlock,
    pub samplers: [InputSampler; MAX_INPUTS],
    /// First and last frame of the node's time slot, inclusive.
    pub start_frame: i32,
    pub end_frame: i32,
    /// File the stage's source image was last loaded from.
    pub source_path: String,
}

pub struct Session<B: RenderBackend> {
    catalog: NodeCatalog,
    graph: EvaluationGraph<B>,
    interactive: EvaluationContext<B::Target>,
    nodes: Vec<NodeInstance>,
    selected: Option<usize>,
    time: i32,
    batch_resolution: (u32, u32),
    next_runtime_id: u64,
}

/// `out.png` -> `out_0007.png`
fn frame_path(path: &Path, frame: i32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{frame:04}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{frame:04}"),
    };
    path.with_file_name(name)
}

impl<B: RenderBackend> Session<B> {
    /// Builds a session from configuration: catalog and shader overrides,
    /// sizes, and the optional environment map. Shaders are compiled here;
    /// failures are logged and leave the affected nodes stuck.
    pub fn with_backend(backend: B, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let catalog = match &config.node_types {
            Some(path) => NodeCatalog::load(path)?,
            None => NodeCatalog::builtin()?,
        };
        let mut shaders = ShaderRegistry::with_builtin();
        if let Some(dir) = &config.shader_dir {
            shaders.load_dir(dir)?;
        }
        let [w, h] = config.initial_target_size();
        let [max_w, max_h] = config.interactive_resolution;
        let mut graph = EvaluationGraph::new(backend, shaders, (w, h), (max_w, max_h));
        graph.compile_shaders();
        if let Some(path) = &config.environment_map {
            graph.load_equirect_environment(path)?;
        }
        let [bw, bh] = config.batch_resolution;
        Ok(Self::new(catalog, graph, (max_w, max_h), (bw, bh)))
    }

    pub fn new(
        catalog: NodeCatalog,
        graph: EvaluationGraph<B>,
        interactive_resolution: (u32, u32),
        batch_resolution: (u32, u32),
    ) -> Self {
        Self {
            catalog,
            graph,
            interactive: EvaluationContext::interactive(
                interactive_resolution.0,
                interactive_resolution.1,
            ),
            nodes: Vec::new(),
            selected: None,
            time: 0,
            batch_resolution,
            next_runtime_id: 1,
        }
    }

    pub fn catalog(&self) -> &NodeCatalog {
        &self.catalog
    }

    pub fn graph(&self) -> &EvaluationGraph<B> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EvaluationGraph<B> {
        &mut self.graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, position: usize) -> Option<&NodeInstance> {
        self.nodes.get(position)
    }

    pub fn nodes(&self) -> &[NodeInstance] {
        &self.nodes
    }

    pub fn node_type(&self, position: usize) -> Option<&NodeTypeDef> {
        self.catalog.get(self.nodes.get(position)?.type_index)
    }

    fn node_at(&self, position: usize) -> Result<&NodeInstance> {
        self.nodes
            .get(position)
            .ok_or_else(|| anyhow!("no node at position {position}"))
    }

    fn node_at_mut(&mut self, position: usize) -> Result<&mut NodeInstance> {
        self.nodes
            .get_mut(position)
            .ok_or_else(|| anyhow!("no node at position {position}"))
    }

    // ----- graph editing -----

    /// Instantiates a node type and returns its position.
    pub fn add_node(&mut self, type_name: &str) -> Result<usize> {
        let type_index = self
            .catalog
            .index_of(type_name)
            .ok_or_else(|| anyhow!("unknown node type '{type_name}'"))?;
        let layout = self
            .catalog
            .layout(type_index)
            .cloned()
            .ok_or_else(|| anyhow!("node type '{type_name}' has no layout"))?;
        let mut parameters = ParameterBlock::with_defaults(layout)?;
        parameters.seed_curves();
        let (shader, cubemap, has_depth, animated) = {
            let def = self
                .catalog
                .get(type_index)
                .ok_or_else(|| anyhow!("unknown node type '{type_name}'"))?;
            (def.shader_id().to_string(), def.cubemap, def.has_depth, def.animated)
        };

        let stage = self.graph.add_evaluation_target()?;
        self.graph.set_evaluation_call(stage, &shader)?;
        self.graph.set_cubemap(stage, cubemap)?;
        self.graph.set_depth_buffer(stage, has_depth)?;
        self.graph.set_time_dependent(stage, animated)?;
        self.graph
            .set_evaluation_parameters(stage, parameters.as_bytes())?;

        let runtime_id = self.next_runtime_id;
        self.next_runtime_id += 1;
        self.nodes.push(NodeInstance {
            stage,
            type_index,
            runtime_id,
            parameters,
            samplers: [InputSampler::default(); MAX_INPUTS],
            start_frame: 0,
            end_frame: 0,
            source_path: String::new(),
        });
        let position = self.nodes.len() - 1;
        self.reload_source(position);
        log::debug!("added {type_name} #{runtime_id} at position {position}");
        Ok(position)
    }

    /// Removes a node. Later positions shift down, links into it are cut,
    /// and the interactive context runs so every consumer reflects the
    /// missing input.
    pub fn delete_node(&mut self, position: usize) -> Result<Vec<StageReport>> {
        let stage = self.node_at(position)?.stage;
        self.graph.del_evaluation_target(stage)?;
        self.nodes.remove(position);
        self.selected = match self.selected {
            Some(s) if s == position => None,
            Some(s) if s > position => Some(s - 1),
            other => other,
        };
        Ok(self.run())
    }

    fn check_slot(&self, position: usize, slot: usize) -> Result<()> {
        let def = self
            .node_type(position)
            .ok_or_else(|| anyhow!("no node at position {position}"))?;
        if slot >= def.inputs.len() {
            bail!(
                "{} has {} input(s), slot {slot} does not exist",
                def.name,
                def.inputs.len()
            );
        }
        Ok(())
    }

    pub fn connect(&mut self, consumer: usize, slot: usize, producer: usize) -> Result<()> {
        self.check_slot(consumer, slot)?;
        let target = self.node_at(consumer)?.stage;
        let source = self.node_at(producer)?.stage;
        self.graph.add_evaluation_input(target, slot, source)
    }

    pub fn disconnect(&mut self, consumer: usize, slot: usize) -> Result<()> {
        self.check_slot(consumer, slot)?;
        let target = self.node_at(consumer)?.stage;
        self.graph.del_evaluation_input(target, slot)
    }

    /// Positions feeding each input slot of the node.
    pub fn inputs(&self, position: usize) -> Result<[Option<usize>; MAX_INPUTS]> {
        self.graph.input_indices(self.node_at(position)?.stage)
    }

    // ----- parameters -----

    pub fn parameters(&self, position: usize) -> Option<&ParameterBlock> {
        self.nodes.get(position).map(|n| &n.parameters)
    }

    /// Replaces the node's block and pushes it to its stage.
    pub fn set_parameters(&mut self, position: usize, mut block: ParameterBlock) -> Result<()> {
        let node = self.node_at_mut(position)?;
        if block.len() != node.parameters.len() {
            bail!(
                "parameter block is {} bytes, node expects {}",
                block.len(),
                node.parameters.len()
            );
        }
        block.seed_curves();
        node.parameters = block;
        self.push_parameters(position)
    }

    /// Edits the node's block in place and pushes the result.
    pub fn edit_parameters(
        &mut self,
        position: usize,
        edit: impl FnOnce(&mut ParameterBlock) -> Result<()>,
    ) -> Result<()> {
        let node = self.node_at_mut(position)?;
        edit(&mut node.parameters)?;
        self.push_parameters(position)
    }

    fn push_parameters(&mut self, position: usize) -> Result<()> {
        let node = self
            .nodes
            .get(position)
            .ok_or_else(|| anyhow!("no node at position {position}"))?;
        self.graph
            .set_evaluation_parameters(node.stage, node.parameters.as_bytes())?;
        self.reload_source(position);
        Ok(())
    }

    /// Loads the source image named by the node's `filename_read` field when
    /// it differs from the one already loaded. A file that fails to load is
    /// logged and leaves the stage without a source.
    fn reload_source(&mut self, position: usize) {
        let Some(node) = self.nodes.get_mut(position) else {
            return;
        };
        let Some(field) = node.parameters.first_of_kind(ParamKind::FilenameRead) else {
            return;
        };
        let path = node.parameters.filename(&field.def.name).unwrap_or_default();
        if path == node.source_path {
            return;
        }
        node.source_path = path.clone();
        let stage = node.stage;
        let loaded = if path.is_empty() {
            self.graph.set_source_image(stage, Vec::new()).map(|_| 0)
        } else {
            self.graph.load_source_image(stage, &path)
        };
        match loaded {
            Ok(frames) if frames > 0 => log::debug!("{path}: {frames} frame(s)"),
            Ok(_) => {}
            Err(err) => {
                log::warn!("node {position}: {err:#}");
                if let Err(err) = self.graph.set_source_image(stage, Vec::new()) {
                    log::warn!("node {position}: failed to drop source image: {err:#}");
                }
            }
        }
    }

    pub fn set_sampler(&mut self, position: usize, slot: usize, sampler: InputSampler) -> Result<()> {
        if slot >= MAX_INPUTS {
            bail!("input slot {slot} out of range");
        }
        let node = self.node_at_mut(position)?;
        node.samplers[slot] = sampler;
        let stage = node.stage;
        self.graph.set_evaluation_sampler(stage, slot, sampler)
    }

    pub fn select(&mut self, position: Option<usize>) -> Result<()> {
        if let Some(p) = position {
            self.node_at(p)?;
        }
        self.selected = position;
        Ok(())
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Routes a mouse event to the selected node. Returns whether the node
    /// reacts to the mouse.
    pub fn set_mouse(&mut self, mouse: MouseInput) -> Result<bool> {
        let Some(position) = self.selected else {
            return Ok(false);
        };
        let has_ui = self.node_type(position).is_some_and(|d| d.has_ui);
        let node = self.node_at_mut(position)?;
        let uses_mouse = node.parameters.apply_mouse(&mouse);
        let stage = node.stage;
        if has_ui || uses_mouse {
            self.push_parameters(position)?;
            self.graph.set_mouse(stage, mouse.as_uniform())?;
        }
        Ok(uses_mouse)
    }

    // ----- time -----

    /// Places the node on the timeline. Both `start` and `end` are frames the
    /// node is active on, so a one-frame slot has `start == end`.
    pub fn set_time_slot(&mut self, position: usize, start: i32, end: i32) -> Result<()> {
        if end < start {
            bail!("time slot ends ({end}) before it starts ({start})");
        }
        let node = self.node_at_mut(position)?;
        node.start_frame = start;
        node.end_frame = end;
        self.apply_time(position)
    }

    /// Resizes the slot to `duration` frames, keeping its start. The last
    /// active frame becomes `start + duration - 1`, not `start + duration`.
    pub fn set_time_duration(&mut self, position: usize, duration: i32) -> Result<()> {
        let node = self.node_at(position)?;
        let start = node.start_frame;
        self.set_time_slot(position, start, start + duration.max(1) - 1)
    }

    pub fn time(&self) -> i32 {
        self.time
    }

    /// Moves the global time. Each node sees `time - start` clamped to its
    /// slot.
    pub fn set_time(&mut self, time: i32) -> Result<()> {
        self.time = time;
        for position in 0..self.nodes.len() {
            self.apply_time(position)?;
        }
        Ok(())
    }

    fn apply_time(&mut self, position: usize) -> Result<()> {
        let node = self.node_at(position)?;
        let local = (self.time - node.start_frame).clamp(0, node.end_frame - node.start_frame);
        let stage = node.stage;
        self.graph.set_stage_local_time(stage, local)
    }

    pub fn local_time(&self, position: usize) -> Option<i32> {
        self.graph.local_time(self.nodes.get(position)?.stage)
    }

    /// Frames needed to play every node: one past the furthest inclusive
    /// slot end, or the end of the longest source image.
    pub fn timeline_length(&self) -> i32 {
        self.nodes
            .iter()
            .map(|node| {
                let image_end = node.start_frame + self.graph.image_duration(node.stage);
                (node.end_frame + 1).max(image_end)
            })
            .max()
            .unwrap_or(0)
    }

    // ----- evaluation -----

    /// Runs the interactive context.
    pub fn run(&mut self) -> Vec<StageReport> {
        self.interactive.run_all(&mut self.graph).to_vec()
    }

    /// Runs the selected node and its upstream with the UI overlay enabled.
    pub fn run_selected_ui(&mut self) -> Result<Vec<StageReport>> {
        let position = self.selected.ok_or_else(|| anyhow!("no node selected"))?;
        let stage = self.node_at(position)?.stage;
        let info = EvaluationInfo {
            forced_dirty: false,
            ui_pass: true,
        };
        Ok(self
            .interactive
            .run_single(&mut self.graph, stage, info)
            .to_vec())
    }

    pub fn render_target(&self, position: usize) -> Option<&B::Target> {
        self.graph.render_target(self.nodes.get(position)?.stage)
    }

    pub fn read_pixels(&mut self, position: usize, face: u32) -> Result<RgbaImage> {
        let stage = self.node_at(position)?.stage;
        self.interactive.read_pixels(&mut self.graph, stage, face)
    }

    pub fn is_cubemap(&self, position: usize) -> bool {
        self.nodes
            .get(position)
            .and_then(|n| self.graph.stage(n.stage))
            .is_some_and(|s| s.cubemap)
    }

    pub fn evaluation_size(&self, position: usize) -> Option<(u32, u32)> {
        self.graph.evaluation_size(self.nodes.get(position)?.stage)
    }

    pub fn set_evaluation_size(&mut self, position: usize, size: Option<(u32, u32)>) -> Result<()> {
        let stage = self.node_at(position)?.stage;
        self.graph.set_evaluation_size(stage, size)
    }

    pub fn bake(&mut self, position: usize, path: impl AsRef<Path>, width: u32, height: u32) -> Result<()> {
        let stage = self.node_at(position)?.stage;
        self.graph.bake(path, stage, width, height)
    }

    /// Positions of nodes whose type carries a `force_evaluate` trigger.
    fn forced_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|p| self.node_type(*p).is_some_and(NodeTypeDef::has_force_evaluate))
            .collect()
    }

    /// Evaluates every frame of every triggerable node in a batch context
    /// and writes the results to their output files. Slots spanning several
    /// frames get a frame suffix. Time and parameters are restored afterwards.
    pub fn force_evaluate(&mut self) -> Result<Vec<PathBuf>> {
        let saved_time = self.time;
        let (w, h) = self.batch_resolution;
        let mut context = EvaluationContext::batch(w, h);
        let result = self.force_evaluate_with(&mut context);
        context.release(&mut self.graph);

        self.set_time(saved_time)?;
        for position in 0..self.nodes.len() {
            let node = &self.nodes[position];
            self.graph
                .set_evaluation_parameters(node.stage, node.parameters.as_bytes())?;
        }
        let written = result?;
        log::info!("forced evaluation wrote {} file(s)", written.len());
        Ok(written)
    }

    fn force_evaluate_with(
        &mut self,
        context: &mut EvaluationContext<B::Target>,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for position in self.forced_nodes() {
            let node = self.node_at(position)?;
            let (start, end) = (node.start_frame, node.end_frame);
            let Some(output) = self.output_path(position)? else {
                log::warn!("node {position} has no output file, skipping");
                continue;
            };
            for frame in start..=end {
                self.set_time(frame)?;
                let path = if end > start {
                    frame_path(&output, frame)
                } else {
                    output.clone()
                };
                self.write_forced(context, position, &path)?;
                written.push(path);
            }
        }
        Ok(written)
    }

    fn output_path(&self, position: usize) -> Result<Option<PathBuf>> {
        let node = self.node_at(position)?;
        let Some(field) = node.parameters.first_of_kind(ParamKind::FilenameWrite) else {
            return Ok(None);
        };
        let path = node.parameters.filename(&field.def.name)?;
        Ok((!path.is_empty()).then(|| PathBuf::from(path)))
    }

    fn write_forced(
        &mut self,
        context: &mut EvaluationContext<B::Target>,
        position: usize,
        path: &Path,
    ) -> Result<()> {
        let stage = self.node_at(position)?.stage;
        let reports = context.run_single(&mut self.graph, stage, EvaluationInfo::forced());
        if let Some(stuck) = reports.iter().find(|r| r.state == StageState::Stuck) {
            bail!(
                "node {position} could not be evaluated: {}",
                stuck.error.as_deref().unwrap_or("unknown error")
            );
        }
        let image = context.read_pixels(&mut self.graph, stage, 0)?;
        save_image(&image, path).with_context(|| format!("node {position}"))
    }

    /// Handles a trigger parameter: one forced evaluation of the node at the
    /// current time. Nodes with an output file are rendered at batch size and
    /// written; others are redrawn in the interactive context.
    pub fn trigger_node(&mut self, position: usize) -> Result<Option<PathBuf>> {
        let stage = self.node_at(position)?.stage;
        let Some(path) = self.output_path(position)? else {
            self.interactive
                .run_single(&mut self.graph, stage, EvaluationInfo::forced());
            return Ok(None);
        };
        let (w, h) = self.batch_resolution;
        let mut context = EvaluationContext::batch(w, h);
        let result = self.write_forced(&mut context, position, &path);
        context.release(&mut self.graph);
        result.map(|_| Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_suffix_keeps_extension() {
        assert_eq!(
            frame_path(Path::new("out/render.png"), 7),
            PathBuf::from("out/render_0007.png")
        );
        assert_eq!(frame_path(Path::new("render"), 12), PathBuf::from("render_0012"));
    }
}
