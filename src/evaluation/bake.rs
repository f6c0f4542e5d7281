use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use image::{DynamicImage, RgbaImage, imageops};

use super::{EvaluationContext, EvaluationGraph, EvaluationInfo, StageId, StageState};
use crate::backend::{RenderBackend, TargetInfo};

/// Writes `image` with the format implied by the extension. JPEG drops
/// alpha; EXR and HDR are written as float.
pub fn save_image(image: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| anyhow!("{} has no file extension", path.display()))?;
    let dynamic = DynamicImage::ImageRgba8(image.clone());
    let result = match extension.as_str() {
        "png" | "bmp" | "tga" | "gif" => dynamic.save(path),
        "jpg" | "jpeg" => DynamicImage::ImageRgb8(dynamic.to_rgb8()).save(path),
        "exr" => DynamicImage::ImageRgba32F(dynamic.to_rgba32f()).save(path),
        "hdr" => DynamicImage::ImageRgb32F(dynamic.to_rgb32f()).save(path),
        other => bail!("unsupported output format '.{other}'"),
    };
    result.with_context(|| format!("failed to write {}", path.display()))
}

/// Lays the six faces of a cube target side by side.
fn cube_strip(faces: &[RgbaImage]) -> RgbaImage {
    let (w, h) = faces.first().map_or((0, 0), |f| f.dimensions());
    let mut strip = RgbaImage::new(w * faces.len() as u32, h);
    for (i, face) in faces.iter().enumerate() {
        imageops::replace(&mut strip, face, i as i64 * w as i64, 0);
    }
    strip
}

impl<B: RenderBackend> EvaluationGraph<B> {
    /// Renders `id` at `width` x `height` into temporary targets and writes
    /// it to `path`. The interactive targets and their dirty state are not
    /// touched. Cube maps are written as a horizontal strip of faces.
    pub fn bake(&mut self, path: impl AsRef<Path>, id: StageId, width: u32, height: u32) -> Result<()> {
        let path = path.as_ref();
        if self.stage(id).is_none() {
            bail!("unknown stage {id:?}");
        }
        if width == 0 || height == 0 {
            bail!("bake size must be non-zero, got {width}x{height}");
        }

        let mut context = EvaluationContext::batch(width, height);
        let result = self.bake_with(&mut context, path, id);
        context.release(self);
        result?;
        log::info!("baked {id:?} to {} ({width}x{height})", path.display());
        Ok(())
    }

    fn bake_with(
        &mut self,
        context: &mut EvaluationContext<B::Target>,
        path: &Path,
        id: StageId,
    ) -> Result<()> {
        let reports = context.run_single(self, id, EvaluationInfo::forced());
        if let Some(report) = reports.iter().find(|r| r.state == StageState::Stuck) {
            bail!(
                "stage {:?} could not be evaluated: {}",
                report.stage,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        let faces = context
            .render_target(self, id)
            .map(|t| t.extent().faces)
            .ok_or_else(|| anyhow!("stage {id:?} produced no target"))?;
        let image = if faces == 1 {
            context.read_pixels(self, id, 0)?
        } else {
            let images = (0..faces)
                .map(|face| context.read_pixels(self, id, face))
                .collect::<Result<Vec<_>>>()?;
            cube_strip(&images)
        };
        save_image(&image, path)
    }
}
