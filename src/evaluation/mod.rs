//! Dependency-ordered, dirty-tracked evaluation of node stages.

mod bake;
mod bank;
mod context;
mod graph;
pub mod order;
mod sampler;
mod stage;

pub use bake::save_image;
pub use bank::{BankSizing, TargetBank};
pub use context::EvaluationContext;
pub use graph::EvaluationGraph;
pub use sampler::{FilterMode, InputSampler, WrapMode};
pub use stage::{SourceImage, Stage};

use std::time::Duration;

/// Input slots per stage.
pub const MAX_INPUTS: usize = 8;

slotmap::new_key_type! {
    /// Generation-counted stage handle; stays valid across deletions of other
    /// stages and never aliases a deleted one.
    pub struct StageId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvaluationInfo {
    /// Render even if nothing changed.
    pub forced_dirty: bool,
    /// The stage is drawn for an on-canvas overlay.
    pub ui_pass: bool,
}

impl EvaluationInfo {
    pub fn forced() -> Self {
        Self {
            forced_dirty: true,
            ui_pass: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Up to date; nothing drawn.
    Clean,
    Evaluated,
    /// Could not be drawn; stays dirty until the cause is fixed.
    Stuck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: StageId,
    pub state: StageState,
    pub duration: Option<Duration>,
    pub forced: bool,
    pub ui_pass: bool,
    pub error: Option<String>,
}
