//! Offscreen render targets.
//!
//! A target is an `Rgba8Unorm` color texture with one layer (2D) or six
//! layers (cube map), plus an optional `Depth32Float` buffer shared by all
//! faces. Allocation is checked against device limits and format support,
//! and validation errors raised while creating the textures are reported as
//! an incomplete framebuffer instead of surfacing later as a device error.

use anyhow::{Context, Result, anyhow, bail};
use image::RgbaImage;

use super::{GpuContext, context::effective_texture_format_features, readback};
use crate::backend::{TargetExtent, TargetInfo};

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

struct Allocation {
    color: wgpu::Texture,
    face_views: Vec<wgpu::TextureView>,
    sample_view: wgpu::TextureView,
    depth: Option<(wgpu::Texture, wgpu::TextureView)>,
}

/// Attachments for one render pass.
pub struct TargetBinding<'a> {
    pub color: &'a wgpu::TextureView,
    pub depth: Option<&'a wgpu::TextureView>,
}

pub struct RenderTarget {
    label: String,
    extent: TargetExtent,
    allocation: Option<Allocation>,
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("label", &self.label)
            .field("extent", &self.extent)
            .field("allocated", &self.allocation.is_some())
            .finish()
    }
}

fn check_extent(gpu: &GpuContext, extent: TargetExtent) -> Result<()> {
    if extent.width == 0 || extent.height == 0 {
        bail!("render target size must be non-zero, got {}x{}", extent.width, extent.height);
    }
    let max = gpu.max_texture_size();
    if extent.width > max || extent.height > max {
        bail!(
            "render target {}x{} exceeds the device limit of {max}",
            extent.width,
            extent.height
        );
    }
    let color = effective_texture_format_features(gpu, COLOR_FORMAT);
    if !color
        .allowed_usages
        .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    {
        bail!("{COLOR_FORMAT:?} is not renderable on this adapter");
    }
    if extent.depth {
        let depth = effective_texture_format_features(gpu, DEPTH_FORMAT);
        if !depth
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
        {
            bail!("{DEPTH_FORMAT:?} is not renderable on this adapter");
        }
    }
    Ok(())
}

fn allocate(gpu: &GpuContext, label: &str, extent: TargetExtent) -> Result<Allocation> {
    check_extent(gpu, extent)?;
    gpu.scoped("incomplete framebuffer", || {
        let color = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: extent.faces,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let face_views = (0..extent.faces)
            .map(|face| {
                color.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(label),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: face,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect::<Vec<_>>();
        // Cube faces are sampled downstream through face 0.
        let sample_view = face_views[0].clone();
        let depth = extent.depth.then(|| {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: extent.width,
                    height: extent.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            (texture, view)
        });
        Allocation {
            color,
            face_views,
            sample_view,
            depth,
        }
    })
    .with_context(|| format!("failed to allocate render target '{label}'"))
}

impl RenderTarget {
    pub fn init_buffer(
        gpu: &GpuContext,
        label: &str,
        width: u32,
        height: u32,
        has_zbuffer: bool,
    ) -> Result<Self> {
        Self::with_extent(
            gpu,
            label,
            TargetExtent {
                width,
                height,
                faces: 1,
                depth: has_zbuffer,
            },
        )
    }

    pub fn init_cube(gpu: &GpuContext, label: &str, size: u32, has_zbuffer: bool) -> Result<Self> {
        Self::with_extent(
            gpu,
            label,
            TargetExtent {
                width: size,
                height: size,
                faces: 6,
                depth: has_zbuffer,
            },
        )
    }

    pub fn with_extent(gpu: &GpuContext, label: &str, extent: TargetExtent) -> Result<Self> {
        if extent.faces != 1 && extent.faces != 6 {
            bail!("render targets have 1 or 6 faces, got {}", extent.faces);
        }
        if extent.faces == 6 && extent.width != extent.height {
            bail!("cube targets must be square, got {}x{}", extent.width, extent.height);
        }
        let allocation = allocate(gpu, label, extent)?;
        Ok(Self {
            label: label.to_string(),
            extent,
            allocation: Some(allocation),
        })
    }

    /// A 2D target holding `image`, used for decoded source files.
    pub fn from_image(gpu: &GpuContext, label: &str, image: &RgbaImage) -> Result<Self> {
        let target = Self::init_buffer(gpu, label, image.width(), image.height(), false)?;
        let texture = target.texture()?;
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.width() * 4),
                rows_per_image: Some(image.height()),
            },
            wgpu::Extent3d {
                width: image.width(),
                height: image.height(),
                depth_or_array_layers: 1,
            },
        );
        Ok(target)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_destroyed(&self) -> bool {
        self.allocation.is_none()
    }

    fn allocation(&self) -> Result<&Allocation> {
        self.allocation
            .as_ref()
            .ok_or_else(|| anyhow!("render target '{}' was destroyed", self.label))
    }

    pub fn texture(&self) -> Result<&wgpu::Texture> {
        Ok(&self.allocation()?.color)
    }

    pub fn sample_view(&self) -> Result<&wgpu::TextureView> {
        Ok(&self.allocation()?.sample_view)
    }

    /// Attachments that make the next pass write into `face`.
    pub fn bind_as_target(&self, face: u32) -> Result<TargetBinding<'_>> {
        let allocation = self.allocation()?;
        let color = allocation
            .face_views
            .get(face as usize)
            .ok_or_else(|| anyhow!("face {face} out of range for '{}'", self.label))?;
        Ok(TargetBinding {
            color,
            depth: allocation.depth.as_ref().map(|(_, view)| view),
        })
    }

    /// Transparent black on every face, depth 1.
    pub fn clear(&self, gpu: &GpuContext) -> Result<()> {
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("clear target"),
            });
        for face in 0..self.extent.faces {
            let binding = self.bind_as_target(face)?;
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear target"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: binding.color,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: binding.depth.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(1.0),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        gpu.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    pub fn resize(&mut self, gpu: &GpuContext, width: u32, height: u32) -> Result<()> {
        if self.extent.width == width && self.extent.height == height && !self.is_destroyed() {
            return Ok(());
        }
        let extent = TargetExtent {
            width,
            height,
            ..self.extent
        };
        let allocation = allocate(gpu, &self.label, extent)?;
        self.destroy();
        self.allocation = Some(allocation);
        self.extent = extent;
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            allocation.color.destroy();
            if let Some((depth, _)) = allocation.depth {
                depth.destroy();
            }
        }
    }

    pub fn read_rgba8(&self, gpu: &GpuContext, face: u32) -> Result<RgbaImage> {
        if face >= self.extent.faces {
            bail!("face {face} out of range for '{}'", self.label);
        }
        readback::read_layer_rgba8(gpu, self.texture()?, face)
            .with_context(|| format!("failed to read back '{}'", self.label))
    }
}

impl TargetInfo for RenderTarget {
    fn extent(&self) -> TargetExtent {
        self.extent
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.destroy();
    }
}
