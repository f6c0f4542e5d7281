use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use image::{AnimationDecoder, RgbaImage, codecs::gif::GifDecoder};

use super::{InputSampler, MAX_INPUTS, StageId};

/// Decoded frames of a stage's source file.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub frames: Vec<RgbaImage>,
    /// Epoch at which the frames were assigned; uploads made for an older
    /// revision are stale.
    pub revision: u64,
}

impl SourceImage {
    pub fn duration(&self) -> i32 {
        self.frames.len() as i32
    }

    pub fn frame_index(&self, local_time: i32) -> usize {
        let last = self.frames.len().saturating_sub(1) as i32;
        local_time.clamp(0, last) as usize
    }

    /// Decodes a file into frames. Animated GIFs yield every frame, other
    /// formats a single one.
    pub fn decode(path: &Path) -> Result<Vec<RgbaImage>> {
        let is_gif = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gif"));
        if is_gif {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let decoder = GifDecoder::new(BufReader::new(file))
                .with_context(|| format!("failed to decode {}", path.display()))?;
            let frames = decoder
                .into_frames()
                .collect_frames()
                .with_context(|| format!("failed to decode frames of {}", path.display()))?;
            return Ok(frames.into_iter().map(|f| f.into_buffer()).collect());
        }
        let image = image::open(path)
            .with_context(|| format!("failed to load {}", path.display()))?
            .to_rgba8();
        Ok(vec![image])
    }
}

/// One node's runtime state. Targets live in the banks, not here.
#[derive(Debug, Clone)]
pub struct Stage {
    pub shader: Option<String>,
    pub params: Vec<u8>,
    pub inputs: [Option<StageId>; MAX_INPUTS],
    pub samplers: [InputSampler; MAX_INPUTS],
    /// Bumped on every mutation that changes what the stage would render.
    pub epoch: u64,
    pub local_time: i32,
    /// Local time changes only dirty stages that read it.
    pub time_dependent: bool,
    pub size: Option<(u32, u32)>,
    pub cubemap: bool,
    pub has_depth: bool,
    pub source: Option<SourceImage>,
    pub mouse: [f32; 4],
}

impl Stage {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            shader: None,
            params: Vec::new(),
            inputs: [None; MAX_INPUTS],
            samplers: [InputSampler::default(); MAX_INPUTS],
            epoch,
            local_time: 0,
            time_dependent: true,
            size: None,
            cubemap: false,
            has_depth: false,
            source: None,
            mouse: [0.0; 4],
        }
    }

    pub fn connected_inputs(&self) -> impl Iterator<Item = StageId> + '_ {
        self.inputs.iter().flatten().copied()
    }

    pub fn input_mask(&self) -> u32 {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.is_some())
            .fold(0, |mask, (slot, _)| mask | 1 << slot)
    }
}
