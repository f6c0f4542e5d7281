//! The seam between the evaluation graph and whatever executes draws.
//!
//! [`crate::gpu::WgpuBackend`] is the real implementation. Keeping the graph
//! generic over [`RenderBackend`] lets its scheduling be tested without an
//! adapter.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use image::{Rgba32FImage, RgbaImage};

use crate::evaluation::{InputSampler, MAX_INPUTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetExtent {
    pub width: u32,
    pub height: u32,
    /// 1 for a 2D target, 6 for a cube map.
    pub faces: u32,
    pub depth: bool,
}

impl TargetExtent {
    pub fn flat(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            faces: 1,
            depth: false,
        }
    }

    pub fn cube(size: u32) -> Self {
        Self {
            width: size,
            height: size,
            faces: 6,
            depth: false,
        }
    }
}

pub trait TargetInfo {
    fn extent(&self) -> TargetExtent;

    fn size(&self) -> (u32, u32) {
        let extent = self.extent();
        (extent.width, extent.height)
    }
}

/// Per-draw uniform block, mirrored by `EvaluationInfo` in `base.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct EvaluationUniforms {
    pub target_size: [f32; 2],
    pub time: f32,
    pub face: u32,
    pub mouse: [f32; 4],
    pub input_mask: u32,
    pub forced: u32,
    pub ui_pass: u32,
    pub _pad: u32,
}

pub struct SampledInput<'a, T> {
    pub target: &'a T,
    pub sampler: InputSampler,
}

pub struct DrawCall<'a, T, P> {
    pub label: &'a str,
    pub target: &'a T,
    pub program: &'a P,
    pub inputs: [Option<SampledInput<'a, T>>; MAX_INPUTS],
    pub source: Option<&'a T>,
    pub uniforms: EvaluationUniforms,
    pub parameters: &'a [u8],
}

pub trait RenderBackend {
    type Target: TargetInfo;
    type Program;

    fn create_target(&mut self, extent: TargetExtent) -> Result<Self::Target>;

    /// Reallocates at a new size, keeping face count and depth presence.
    fn resize_target(&mut self, target: &mut Self::Target, width: u32, height: u32) -> Result<()>;

    /// Releases GPU objects. Calling it twice is harmless.
    fn destroy_target(&mut self, target: &mut Self::Target);

    /// Transparent black on every face. Fresh and resized targets are
    /// cleared before their first draw.
    fn clear_target(&mut self, target: &Self::Target) -> Result<()>;

    fn upload_image(&mut self, label: &str, image: &RgbaImage) -> Result<Self::Target>;

    fn compile_program(&mut self, label: &str, source: &str) -> Result<Self::Program>;

    /// Renders every face of `call.target` with `call.program`.
    fn draw(&mut self, call: &DrawCall<'_, Self::Target, Self::Program>) -> Result<()>;

    fn read_pixels(&mut self, target: &Self::Target, face: u32) -> Result<RgbaImage>;

    /// Equirectangular lighting environment shared by every draw.
    fn set_environment(&mut self, image: Option<&Rgba32FImage>) -> Result<()>;
}
