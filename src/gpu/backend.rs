use std::{borrow::Cow, collections::HashMap};

use anyhow::{Context, Result, anyhow};
use half::f16;
use image::{Rgba32FImage, RgbaImage};

use super::{
    GpuContext,
    render_target::{COLOR_FORMAT, DEPTH_FORMAT, RenderTarget},
};
use crate::{
    backend::{DrawCall, EvaluationUniforms, RenderBackend, TargetExtent, TargetInfo},
    evaluation::{FilterMode, InputSampler, MAX_INPUTS, WrapMode},
};

pub struct GpuProgram {
    pipeline: wgpu::RenderPipeline,
    depth_pipeline: wgpu::RenderPipeline,
}

/// [`RenderBackend`] over a real wgpu device.
pub struct WgpuBackend {
    gpu: GpuContext,
    frame_layout: wgpu::BindGroupLayout,
    inputs_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniforms: wgpu::Buffer,
    parameters: wgpu::Buffer,
    samplers: HashMap<InputSampler, wgpu::Sampler>,
    linear_sampler: wgpu::Sampler,
    placeholder: RenderTarget,
    environment: wgpu::TextureView,
    target_count: usize,
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

fn parameters_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("node parameters"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Rgba16Float texel data as raw half-precision bits.
fn half_bits(values: &[f32]) -> Vec<u16> {
    values.iter().map(|v| f16::from_f32(*v).to_bits()).collect()
}

fn environment_texture(gpu: &GpuContext, image: &Rgba32FImage) -> wgpu::TextureView {
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("environment"),
        size: wgpu::Extent3d {
            width: image.width(),
            height: image.height(),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let halves = half_bits(image.as_raw());
    gpu.queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&halves),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(image.width() * 8),
            rows_per_image: Some(image.height()),
        },
        wgpu::Extent3d {
            width: image.width(),
            height: image.height(),
            depth_or_array_layers: 1,
        },
    );
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn address_mode(mode: WrapMode, border: bool) -> wgpu::AddressMode {
    match mode {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::ClampToBorder if border => wgpu::AddressMode::ClampToBorder,
        WrapMode::ClampToBorder => wgpu::AddressMode::ClampToEdge,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Linear => wgpu::FilterMode::Linear,
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
    }
}

impl WgpuBackend {
    pub fn new(gpu: GpuContext) -> Result<Self> {
        let device = &gpu.device;
        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(2),
                sampler_entry(3),
                texture_entry(4),
            ],
        });
        let input_entries: Vec<_> = (0..MAX_INPUTS as u32)
            .flat_map(|slot| [texture_entry(slot * 2), sampler_entry(slot * 2 + 1)])
            .collect();
        let inputs_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("inputs"),
            entries: &input_entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("node"),
            bind_group_layouts: &[&frame_layout, &inputs_layout],
            push_constant_ranges: &[],
        });
        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("evaluation info"),
            size: std::mem::size_of::<EvaluationUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let parameters = parameters_buffer(device, 256);
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("linear"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let placeholder = RenderTarget::from_image(
            &gpu,
            "unconnected input",
            &RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 0])),
        )?;
        let environment = environment_texture(&gpu, &Rgba32FImage::new(1, 1));

        Ok(Self {
            gpu,
            frame_layout,
            inputs_layout,
            pipeline_layout,
            uniforms,
            parameters,
            samplers: HashMap::new(),
            linear_sampler,
            placeholder,
            environment,
            target_count: 0,
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    fn sampler(&mut self, key: InputSampler) -> &wgpu::Sampler {
        let border = self.gpu.supports(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let device = &self.gpu.device;
        self.samplers.entry(key).or_insert_with(|| {
            let uses_border = border
                && (key.wrap_u == WrapMode::ClampToBorder || key.wrap_v == WrapMode::ClampToBorder);
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("input"),
                address_mode_u: address_mode(key.wrap_u, border),
                address_mode_v: address_mode(key.wrap_v, border),
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter_mode(key.filter_mag),
                min_filter: filter_mode(key.filter_min),
                border_color: uses_border.then_some(wgpu::SamplerBorderColor::TransparentBlack),
                ..Default::default()
            })
        })
    }

    fn upload_parameters(&mut self, bytes: &[u8]) {
        // Storage bindings cannot be empty and must be a multiple of 4.
        let len = bytes.len().max(16).next_multiple_of(4) as u64;
        if len > self.parameters.size() {
            self.parameters = parameters_buffer(&self.gpu.device, len.next_power_of_two());
        }
        let mut padded = bytes.to_vec();
        padded.resize(len as usize, 0);
        self.gpu.queue.write_buffer(&self.parameters, 0, &padded);
    }

    fn build_pipeline(
        &self,
        label: &str,
        module: &wgpu::ShaderModule,
        depth: bool,
    ) -> wgpu::RenderPipeline {
        self.gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: depth.then(|| wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
    }
}

impl RenderBackend for WgpuBackend {
    type Target = RenderTarget;
    type Program = GpuProgram;

    fn create_target(&mut self, extent: TargetExtent) -> Result<RenderTarget> {
        self.target_count += 1;
        let label = format!("stage target {}", self.target_count);
        RenderTarget::with_extent(&self.gpu, &label, extent)
    }

    fn resize_target(&mut self, target: &mut RenderTarget, width: u32, height: u32) -> Result<()> {
        target.resize(&self.gpu, width, height)
    }

    fn destroy_target(&mut self, target: &mut RenderTarget) {
        target.destroy();
    }

    fn clear_target(&mut self, target: &RenderTarget) -> Result<()> {
        target.clear(&self.gpu)
    }

    fn upload_image(&mut self, label: &str, image: &RgbaImage) -> Result<RenderTarget> {
        RenderTarget::from_image(&self.gpu, label, image)
    }

    fn compile_program(&mut self, label: &str, source: &str) -> Result<GpuProgram> {
        let module = self.gpu.scoped("shader module rejected", || {
            self.gpu
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
                })
        })?;
        let (pipeline, depth_pipeline) = self
            .gpu
            .scoped("pipeline creation failed", || {
                (
                    self.build_pipeline(label, &module, false),
                    self.build_pipeline(label, &module, true),
                )
            })
            .with_context(|| format!("program '{label}'"))?;
        Ok(GpuProgram {
            pipeline,
            depth_pipeline,
        })
    }

    fn draw(&mut self, call: &DrawCall<'_, RenderTarget, GpuProgram>) -> Result<()> {
        self.upload_parameters(call.parameters);

        let mut input_views = Vec::with_capacity(MAX_INPUTS);
        let mut input_samplers = Vec::with_capacity(MAX_INPUTS);
        for input in &call.inputs {
            match input {
                Some(input) => {
                    input_views.push(input.target.sample_view()?.clone());
                    input_samplers.push(self.sampler(input.sampler).clone());
                }
                None => {
                    input_views.push(self.placeholder.sample_view()?.clone());
                    input_samplers.push(self.sampler(InputSampler::clamped()).clone());
                }
            }
        }
        let source_view = match call.source {
            Some(source) => source.sample_view()?,
            None => self.placeholder.sample_view()?,
        };

        let device = &self.gpu.device;
        let frame_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(call.label),
            layout: &self.frame_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.parameters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&self.environment),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(source_view),
                },
            ],
        });
        let input_entries: Vec<_> = input_views
            .iter()
            .zip(&input_samplers)
            .enumerate()
            .flat_map(|(slot, (view, sampler))| {
                [
                    wgpu::BindGroupEntry {
                        binding: slot as u32 * 2,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: slot as u32 * 2 + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();
        let inputs_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(call.label),
            layout: &self.inputs_layout,
            entries: &input_entries,
        });

        let extent = call.target.extent();
        self.gpu
            .scoped("draw failed", || -> Result<()> {
                for face in 0..extent.faces {
                    let uniforms = EvaluationUniforms {
                        face,
                        ..call.uniforms
                    };
                    self.gpu
                        .queue
                        .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));

                    let binding = call.target.bind_as_target(face)?;
                    let mut encoder =
                        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some(call.label),
                        });
                    {
                        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                            label: Some(call.label),
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
                        let pipeline = if binding.depth.is_some() {
                            &call.program.depth_pipeline
                        } else {
                            &call.program.pipeline
                        };
                        pass.set_pipeline(pipeline);
                        pass.set_bind_group(0, &frame_group, &[]);
                        pass.set_bind_group(1, &inputs_group, &[]);
                        pass.draw(0..3, 0..1);
                    }
                    self.gpu.queue.submit(Some(encoder.finish()));
                }
                Ok(())
            })
            .and_then(|r| r)
            .with_context(|| format!("stage '{}'", call.label))
    }

    fn read_pixels(&mut self, target: &RenderTarget, face: u32) -> Result<RgbaImage> {
        target.read_rgba8(&self.gpu, face)
    }

    fn set_environment(&mut self, image: Option<&Rgba32FImage>) -> Result<()> {
        let fallback = Rgba32FImage::new(1, 1);
        let image = image.unwrap_or(&fallback);
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("environment image is empty"));
        }
        self.environment = environment_texture(&self.gpu, image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_texels_are_half_floats() {
        let bits = half_bits(&[0.0, 1.0, -2.0, 65504.0]);
        assert_eq!(bits, vec![0x0000, 0x3c00, 0xc000, 0x7bff]);
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&bits).len(), 8);
    }
}
