pub mod backend;
pub mod config;
pub mod evaluation;
pub mod gpu;
pub mod params;
pub mod schema;
pub mod session;
pub mod shader;

pub use backend::{RenderBackend, TargetExtent, TargetInfo};
pub use config::EngineConfig;
pub use evaluation::{EvaluationContext, EvaluationGraph, EvaluationInfo, StageId, StageState};
pub use params::{ParamValue, ParameterBlock};
pub use schema::NodeCatalog;
pub use session::Session;
