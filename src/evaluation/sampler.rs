#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    ClampToEdge,
    /// Transparent black outside [0, 1].
    ClampToBorder,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Linear,
    Nearest,
}

/// How a stage samples one of its inputs. Owned by the consuming slot, not
/// by the producing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InputSampler {
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub filter_min: FilterMode,
    pub filter_mag: FilterMode,
}

impl InputSampler {
    pub fn clamped() -> Self {
        Self {
            wrap_u: WrapMode::ClampToEdge,
            wrap_v: WrapMode::ClampToEdge,
            ..Self::default()
        }
    }
}
