//! Shader sources and the programs compiled from them.
//!
//! Every program is the shared base prelude followed by one node source that
//! defines `node_main`. Sources are validated with naga before the backend
//! sees them, so a broken node reports numbered WGSL instead of a device
//! error. Failures are kept per identifier; the rest of the batch compiles.

pub mod validation;

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use anyhow::{Context, Result, anyhow};

use crate::backend::RenderBackend;

pub use validation::{validate_wgsl, validate_wgsl_with_context};

pub const BASE_SHADER: &str = include_str!("../../assets/shaders/base.wgsl");

const BUILTIN_SHADERS: &[(&str, &str)] = &[
    ("Blend", include_str!("../../assets/shaders/Blend.wgsl")),
    ("Blur", include_str!("../../assets/shaders/Blur.wgsl")),
    ("Checker", include_str!("../../assets/shaders/Checker.wgsl")),
    ("Circle", include_str!("../../assets/shaders/Circle.wgsl")),
    ("Color", include_str!("../../assets/shaders/Color.wgsl")),
    ("Crop", include_str!("../../assets/shaders/Crop.wgsl")),
    ("CurveRemap", include_str!("../../assets/shaders/CurveRemap.wgsl")),
    ("EnvironmentView", include_str!("../../assets/shaders/EnvironmentView.wgsl")),
    ("EquirectToCubemap", include_str!("../../assets/shaders/EquirectToCubemap.wgsl")),
    ("GradientMap", include_str!("../../assets/shaders/GradientMap.wgsl")),
    ("ImageRead", include_str!("../../assets/shaders/ImageRead.wgsl")),
    ("ImageWrite", include_str!("../../assets/shaders/ImageWrite.wgsl")),
    ("Noise", include_str!("../../assets/shaders/Noise.wgsl")),
    ("Transform", include_str!("../../assets/shaders/Transform.wgsl")),
];

enum ProgramState<P> {
    Ready(P),
    Failed(String),
}

#[derive(Debug, Default, Clone)]
pub struct CompileSummary {
    pub compiled: Vec<String>,
    /// (identifier, error) pairs.
    pub failed: Vec<(String, String)>,
}

impl CompileSummary {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ShaderRegistry<P> {
    base: String,
    sources: BTreeMap<String, String>,
    programs: HashMap<String, ProgramState<P>>,
}

impl<P> Default for ShaderRegistry<P> {
    fn default() -> Self {
        Self {
            base: String::new(),
            sources: BTreeMap::new(),
            programs: HashMap::new(),
        }
    }
}

impl<P> ShaderRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base prelude plus every node shader shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.set_base_shader(BASE_SHADER);
        registry.set_sources(
            BUILTIN_SHADERS
                .iter()
                .map(|(id, src)| (id.to_string(), src.to_string())),
        );
        registry
    }

    /// Replaces the prelude. Every program must be compiled again.
    pub fn set_base_shader(&mut self, source: impl Into<String>) {
        self.base = source.into();
        self.programs.clear();
    }

    pub fn base_shader(&self) -> &str {
        &self.base
    }

    pub fn set_source(&mut self, id: impl Into<String>, source: impl Into<String>) {
        let id = id.into();
        self.programs.remove(&id);
        self.sources.insert(id, source.into());
    }

    pub fn set_sources(&mut self, sources: impl IntoIterator<Item = (String, String)>) {
        for (id, source) in sources {
            self.set_source(id, source);
        }
    }

    /// Loads every `*.wgsl` in `dir`; `base.wgsl` becomes the prelude and
    /// the rest are keyed by file stem. Returns the number of node sources.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read shader directory {}", dir.display()))?;
        let mut count = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wgsl") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("non-utf8 shader file name {}", path.display()))?
                .to_string();
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if stem == "base" {
                self.set_base_shader(source);
            } else {
                self.set_source(stem, source);
                count += 1;
            }
        }
        log::info!("loaded {count} shader sources from {}", dir.display());
        Ok(count)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    /// The node source as written, for display.
    pub fn source(&self, id: &str) -> Option<&str> {
        self.sources.get(id).map(String::as_str)
    }

    /// Prelude and node source as handed to the compiler.
    pub fn full_source(&self, id: &str) -> Option<String> {
        let node = self.sources.get(id)?;
        Some(format!("{}\n{}", self.base, node))
    }

    pub fn program(&self, id: &str) -> Option<&P> {
        match self.programs.get(id)? {
            ProgramState::Ready(program) => Some(program),
            ProgramState::Failed(_) => None,
        }
    }

    pub fn compile_error(&self, id: &str) -> Option<&str> {
        match self.programs.get(id)? {
            ProgramState::Failed(err) => Some(err),
            ProgramState::Ready(_) => None,
        }
    }

    pub fn is_compiled(&self, id: &str) -> bool {
        self.programs.contains_key(id)
    }

    /// Validates and compiles one identifier, recording the outcome.
    pub fn compile<B>(&mut self, backend: &mut B, id: &str) -> Result<()>
    where
        B: RenderBackend<Program = P>,
    {
        let result = self
            .full_source(id)
            .ok_or_else(|| anyhow!("no shader source named '{id}'"))
            .and_then(|source| {
                validate_wgsl_with_context(&source, &format!("shader '{id}'"))?;
                backend.compile_program(id, &source)
            });
        match result {
            Ok(program) => {
                self.programs
                    .insert(id.to_string(), ProgramState::Ready(program));
                Ok(())
            }
            Err(err) => {
                let message = format!("{err:#}");
                log::warn!("shader '{id}' failed to compile: {message}");
                self.programs
                    .insert(id.to_string(), ProgramState::Failed(message));
                Err(err)
            }
        }
    }

    /// Compiles every identifier that has no recorded outcome yet.
    pub fn compile_all<B>(&mut self, backend: &mut B) -> CompileSummary
    where
        B: RenderBackend<Program = P>,
    {
        let pending: Vec<String> = self
            .sources
            .keys()
            .filter(|id| !self.programs.contains_key(*id))
            .cloned()
            .collect();
        let mut summary = CompileSummary::default();
        for id in pending {
            match self.compile(backend, &id) {
                Ok(()) => summary.compiled.push(id),
                Err(err) => summary.failed.push((id, format!("{err:#}"))),
            }
        }
        log::info!(
            "compiled {} shader(s), {} failed",
            summary.compiled.len(),
            summary.failed.len()
        );
        summary
    }

    /// Validates every source with naga without touching a device.
    pub fn check_all(&self) -> Vec<(String, Result<()>)> {
        self.sources
            .keys()
            .map(|id| {
                let result = self
                    .full_source(id)
                    .ok_or_else(|| anyhow!("missing source"))
                    .and_then(|src| {
                        validate_wgsl_with_context(&src, &format!("shader '{id}'")).map(|_| ())
                    });
                (id.clone(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_shaders_validate() {
        let registry: ShaderRegistry<()> = ShaderRegistry::with_builtin();
        let results = registry.check_all();
        assert_eq!(results.len(), BUILTIN_SHADERS.len());
        for (id, result) in results {
            if let Err(err) = result {
                panic!("{id}: {err:#}");
            }
        }
    }

    #[test]
    fn full_source_prepends_base() {
        let mut registry: ShaderRegistry<()> = ShaderRegistry::new();
        registry.set_base_shader("// base");
        registry.set_source("Node", "// node");
        assert_eq!(registry.full_source("Node").unwrap(), "// base\n// node");
        assert_eq!(registry.source("Node"), Some("// node"));
        assert!(registry.full_source("Missing").is_none());
    }

    #[test]
    fn load_dir_picks_up_base_and_nodes() {
        let dir = std::env::temp_dir().join(format!(
            "texture-forge-shaders-{}-{}",
            std::process::id(),
            line!()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("base.wgsl"), "// base").unwrap();
        std::fs::write(dir.join("Glow.wgsl"), "// glow").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut registry: ShaderRegistry<()> = ShaderRegistry::new();
        assert_eq!(registry.load_dir(&dir).unwrap(), 1);
        assert_eq!(registry.base_shader(), "// base");
        assert_eq!(registry.source("Glow"), Some("// glow"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
