use anyhow::{Context, Result, anyhow};

use crate::config::PowerPreference;

/// Device, queue and the adapter they came from.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn headless(power_preference: PowerPreference) -> Result<Self> {
        pollster::block_on(Self::headless_async(power_preference))
    }

    async fn headless_async(power_preference: PowerPreference) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power_preference.to_wgpu(),
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|e| anyhow!("no GPU adapter available: {e}"))?;

        let info = adapter.get_info();
        log::info!("using adapter \"{}\" ({:?})", info.name, info.backend);

        // ClampToBorder is optional; samplers fall back to ClampToEdge without it.
        let optional = wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
            | wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("texture-forge device"),
                required_features: adapter.features() & optional,
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .context("failed to create logical device")?;

        device.on_uncaptured_error(Box::new(|e| {
            log::error!("uncaptured wgpu error: {e}");
        }));

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    pub fn supports(&self, feature: wgpu::Features) -> bool {
        self.device.features().contains(feature)
    }

    pub fn max_texture_size(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Runs `f` inside a validation error scope and turns a captured error
    /// into `Err`.
    pub fn scoped<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(anyhow!("{what}: {err}")),
            None => Ok(value),
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| anyhow!("device poll failed: {e}"))?;
        Ok(())
    }
}

/// Format features as the adapter reports them when the device allows it,
/// otherwise the guaranteed set.
pub(crate) fn effective_texture_format_features(
    gpu: &GpuContext,
    format: wgpu::TextureFormat,
) -> wgpu::TextureFormatFeatures {
    let features = gpu.device.features();
    if features.contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES) {
        return gpu.adapter.get_texture_format_features(format);
    }
    format.guaranteed_format_features(features)
}
