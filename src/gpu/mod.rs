//! wgpu implementation of the render backend.

mod backend;
mod context;
mod readback;
pub mod render_target;

pub use backend::{GpuProgram, WgpuBackend};
pub use context::GpuContext;
pub use render_target::{RenderTarget, TargetBinding};
