#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::{Result, bail};
use image::{Rgba, Rgba32FImage, RgbaImage};
use texture_forge::{
    EngineConfig, EvaluationGraph, Session, StageId, StageState,
    backend::{DrawCall, RenderBackend, TargetExtent, TargetInfo},
    evaluation::StageReport,
    shader::ShaderRegistry,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTarget {
    pub id: u64,
    pub extent: TargetExtent,
    pub destroyed: bool,
}

impl TargetInfo for FakeTarget {
    fn extent(&self) -> TargetExtent {
        self.extent
    }
}

#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub label: String,
    pub target: u64,
    pub extent: TargetExtent,
    pub inputs: Vec<Option<u64>>,
    pub source: Option<u64>,
    pub time: f32,
    pub mouse: [f32; 4],
    pub forced: bool,
    pub ui_pass: bool,
    pub parameters: Vec<u8>,
}

/// Backend that hands out numbered fake targets and records every draw.
/// `read_pixels` fills the image with the target id in red and the face in
/// green.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_id: u64,
    pub draws: Vec<DrawRecord>,
    pub created: usize,
    pub destroyed: usize,
    pub uploads: usize,
    /// Ids of targets passed to `clear_target`, in call order.
    pub cleared: Vec<u64>,
    pub has_environment: bool,
    /// Draws with this label fail; each attempt is counted.
    pub fail_label: Option<String>,
    pub failed_draws: usize,
}

impl RecordingBackend {
    pub fn take_draws(&mut self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.draws)
    }

    pub fn live_targets(&self) -> usize {
        self.created - self.destroyed
    }

    fn allocate(&mut self, extent: TargetExtent) -> FakeTarget {
        self.next_id += 1;
        self.created += 1;
        FakeTarget {
            id: self.next_id,
            extent,
            destroyed: false,
        }
    }
}

impl RenderBackend for RecordingBackend {
    type Target = FakeTarget;
    type Program = String;

    fn create_target(&mut self, extent: TargetExtent) -> Result<FakeTarget> {
        if extent.width == 0 || extent.height == 0 {
            bail!("zero-sized target");
        }
        Ok(self.allocate(extent))
    }

    fn resize_target(&mut self, target: &mut FakeTarget, width: u32, height: u32) -> Result<()> {
        target.extent.width = width;
        target.extent.height = height;
        Ok(())
    }

    fn destroy_target(&mut self, target: &mut FakeTarget) {
        if !target.destroyed {
            target.destroyed = true;
            self.destroyed += 1;
        }
    }

    fn clear_target(&mut self, target: &FakeTarget) -> Result<()> {
        self.cleared.push(target.id);
        Ok(())
    }

    fn upload_image(&mut self, _label: &str, image: &RgbaImage) -> Result<FakeTarget> {
        self.uploads += 1;
        Ok(self.allocate(TargetExtent::flat(image.width(), image.height())))
    }

    fn compile_program(&mut self, label: &str, _source: &str) -> Result<String> {
        Ok(label.to_string())
    }

    fn draw(&mut self, call: &DrawCall<'_, FakeTarget, String>) -> Result<()> {
        if call.target.destroyed {
            bail!("draw into destroyed target {}", call.target.id);
        }
        if self.fail_label.as_deref() == Some(call.label) {
            self.failed_draws += 1;
            bail!("device lost while drawing {}", call.label);
        }
        self.draws.push(DrawRecord {
            label: call.label.to_string(),
            target: call.target.id,
            extent: call.target.extent,
            inputs: call
                .inputs
                .iter()
                .map(|i| i.as_ref().map(|i| i.target.id))
                .collect(),
            source: call.source.map(|s| s.id),
            time: call.uniforms.time,
            mouse: call.uniforms.mouse,
            forced: call.uniforms.forced != 0,
            ui_pass: call.uniforms.ui_pass != 0,
            parameters: call.parameters.to_vec(),
        });
        Ok(())
    }

    fn read_pixels(&mut self, target: &FakeTarget, face: u32) -> Result<RgbaImage> {
        if face >= target.extent.faces {
            bail!("face {face} out of range");
        }
        Ok(RgbaImage::from_pixel(
            target.extent.width,
            target.extent.height,
            Rgba([target.id as u8, face as u8, 0, 255]),
        ))
    }

    fn set_environment(&mut self, image: Option<&Rgba32FImage>) -> Result<()> {
        self.has_environment = image.is_some();
        Ok(())
    }
}

pub fn graph_with(shaders: ShaderRegistry<String>) -> EvaluationGraph<RecordingBackend> {
    let mut graph = EvaluationGraph::new(RecordingBackend::default(), shaders, (256, 256), (1024, 1024));
    graph.compile_shaders();
    graph
}

pub fn graph() -> EvaluationGraph<RecordingBackend> {
    graph_with(ShaderRegistry::with_builtin())
}

pub fn stage(graph: &mut EvaluationGraph<RecordingBackend>, shader: &str) -> StageId {
    let id = graph.add_evaluation_target().unwrap();
    graph.set_evaluation_call(id, shader).unwrap();
    id
}

pub fn evaluated(reports: &[StageReport]) -> Vec<StageId> {
    reports
        .iter()
        .filter(|r| r.state == StageState::Evaluated)
        .map(|r| r.stage)
        .collect()
}

pub fn session_with(config: EngineConfig) -> Session<RecordingBackend> {
    Session::with_backend(RecordingBackend::default(), &config).unwrap()
}

pub fn session() -> Session<RecordingBackend> {
    session_with(EngineConfig {
        batch_resolution: [64, 64],
        ..EngineConfig::default()
    })
}

/// Fresh directory under the system temp dir, unique per test name.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("texture-forge-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
