use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::evaluation::MAX_INPUTS;
use crate::params::{ParamLayout, ParameterBlock};

const DEFAULT_NODE_TYPES_JSON: &str = include_str!("../assets/node-types.json");

/// Size in bytes of a filename field, including the NUL terminator.
pub const FILENAME_BYTES: usize = 1024;
/// Number of control points a ramp or gradient field can hold.
pub const RAMP_POINTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Float,
    Float2,
    Float3,
    Float4,
    Color4,
    Int,
    Int2,
    Ramp,
    Gradient,
    Angle,
    Angle2,
    Angle3,
    Angle4,
    Enum,
    Bool,
    FilenameRead,
    FilenameWrite,
    ForceEvaluate,
    Camera,
}

impl ParamKind {
    /// Fixed byte size of the field inside a parameter block.
    pub fn size(self) -> usize {
        match self {
            ParamKind::Float | ParamKind::Int | ParamKind::Angle => 4,
            ParamKind::Enum | ParamKind::Bool => 4,
            ParamKind::Float2 | ParamKind::Int2 | ParamKind::Angle2 => 8,
            ParamKind::Float3 | ParamKind::Angle3 => 12,
            ParamKind::Float4 | ParamKind::Color4 | ParamKind::Angle4 => 16,
            ParamKind::Ramp => RAMP_POINTS * 8,
            ParamKind::Gradient => RAMP_POINTS * 16,
            ParamKind::FilenameRead | ParamKind::FilenameWrite => FILENAME_BYTES,
            ParamKind::ForceEvaluate => 0,
            ParamKind::Camera => 64,
        }
    }

    pub fn angle_components(self) -> Option<usize> {
        match self {
            ParamKind::Angle => Some(1),
            ParamKind::Angle2 => Some(2),
            ParamKind::Angle3 => Some(3),
            ParamKind::Angle4 => Some(4),
            _ => None,
        }
    }

    pub fn is_filename(self) -> bool {
        matches!(self, ParamKind::FilenameRead | ParamKind::FilenameWrite)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default, rename = "enum")]
    pub enum_values: Vec<String>,
    /// Cursor x in [0, 1] maps into this range while the left button is held.
    #[serde(default)]
    pub range_x: Option<[f32; 2]>,
    #[serde(default)]
    pub range_y: Option<[f32; 2]>,
    /// Accumulate cursor deltas instead of mapping the absolute position.
    #[serde(default)]
    pub relative: bool,
    /// A float4 that tracks a dragged rectangle.
    #[serde(default)]
    pub quad_select: bool,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            enum_values: Vec::new(),
            range_x: None,
            range_y: None,
            relative: false,
            quad_select: false,
        }
    }

    pub fn is_mouse_driven(&self) -> bool {
        self.quad_select || self.range_x.is_some() || self.range_y.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeDef {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Shader identifier; defaults to the node name.
    #[serde(default)]
    pub shader: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    #[serde(default)]
    pub has_ui: bool,
    #[serde(default)]
    pub cubemap: bool,
    /// Renders with a depth buffer attached.
    #[serde(default)]
    pub has_depth: bool,
    /// Output depends on the stage's local time.
    #[serde(default)]
    pub animated: bool,
}

impl NodeTypeDef {
    pub fn shader_id(&self) -> &str {
        self.shader.as_deref().unwrap_or(&self.name)
    }

    pub fn has_force_evaluate(&self) -> bool {
        self.params.iter().any(|p| p.kind == ParamKind::ForceEvaluate)
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }
}

/// Catalog format this build reads.
pub const CATALOG_VERSION: &str = "1";

#[derive(Debug, Deserialize)]
struct RawCatalog {
    version: String,
    nodes: Vec<NodeTypeDef>,
}

/// The set of node types the editor can instantiate.
#[derive(Debug, Clone)]
pub struct NodeCatalog {
    nodes: Vec<NodeTypeDef>,
    layouts: Vec<Arc<ParamLayout>>,
    by_name: HashMap<String, usize>,
}

impl NodeCatalog {
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(DEFAULT_NODE_TYPES_JSON)
            .context("failed to parse assets/node-types.json")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node catalog {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: RawCatalog =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid node catalog json: {e}"))?;
        if raw.version != CATALOG_VERSION {
            bail!(
                "unsupported node catalog version '{}' (expected '{CATALOG_VERSION}')",
                raw.version
            );
        }
        Self::from_defs(raw.nodes)
    }

    pub fn from_defs(nodes: Vec<NodeTypeDef>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(nodes.len());
        let mut layouts = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            if by_name.insert(node.name.clone(), index).is_some() {
                bail!("duplicate node type '{}'", node.name);
            }
            if node.inputs.len() > MAX_INPUTS {
                bail!(
                    "node type '{}' declares {} inputs (max {MAX_INPUTS})",
                    node.name,
                    node.inputs.len()
                );
            }
            let layout = Arc::new(ParamLayout::new(&node.params)?);
            // Surface bad defaults at load time rather than on first AddNode.
            ParameterBlock::with_defaults(layout.clone())
                .with_context(|| format!("node type '{}'", node.name))?;
            layouts.push(layout);
        }
        Ok(Self {
            nodes,
            layouts,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeTypeDef> {
        self.nodes.iter()
    }

    pub fn get(&self, type_index: usize) -> Option<&NodeTypeDef> {
        self.nodes.get(type_index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn layout(&self, type_index: usize) -> Option<&Arc<ParamLayout>> {
        self.layouts.get(type_index)
    }

    /// Sum of the fixed sizes of every parameter of the node type.
    pub fn compute_node_parameters_size(&self, type_index: usize) -> usize {
        self.layouts
            .get(type_index)
            .map(|layout| layout.size())
            .unwrap_or(0)
    }

    pub fn shader_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|n| n.shader_id().to_string()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let catalog = NodeCatalog::builtin().unwrap();
        assert!(catalog.index_of("Circle").is_some());
        assert!(catalog.index_of("ImageWrite").is_some());
        let write = catalog.get(catalog.index_of("ImageWrite").unwrap()).unwrap();
        assert!(write.has_force_evaluate());
        let cube = catalog.get(catalog.index_of("EquirectToCubemap").unwrap()).unwrap();
        assert!(cube.cubemap);
    }

    #[test]
    fn parameters_size_is_sum_of_field_sizes() {
        let catalog = NodeCatalog::builtin().unwrap();
        // center(8) + radius(4) + softness(4) + color(16)
        let circle = catalog.index_of("Circle").unwrap();
        assert_eq!(catalog.compute_node_parameters_size(circle), 32);
        // filename(1024) + trigger(0)
        let write = catalog.index_of("ImageWrite").unwrap();
        assert_eq!(catalog.compute_node_parameters_size(write), 1024);
        let gradient = catalog.index_of("GradientMap").unwrap();
        assert_eq!(catalog.compute_node_parameters_size(gradient), 128);
        assert_eq!(catalog.compute_node_parameters_size(999), 0);
    }

    #[test]
    fn unknown_catalog_version_is_rejected() {
        let json = r#"{ "version": "2", "nodes": [ { "name": "A" } ] }"#;
        let err = NodeCatalog::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("version '2'"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let json = r#"{ "version": "1", "nodes": [ { "name": "A" }, { "name": "A" } ] }"#;
        let err = NodeCatalog::from_json_str(json).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate"));
    }

    #[test]
    fn too_many_inputs_are_rejected() {
        let json = r#"{ "version": "1", "nodes": [
            { "name": "Wide", "inputs": ["a","b","c","d","e","f","g","h","i"] } ] }"#;
        assert!(NodeCatalog::from_json_str(json).is_err());
    }

    #[test]
    fn mistyped_default_is_rejected_at_load() {
        let json = r#"{ "version": "1", "nodes": [
            { "name": "Bad", "params": [ { "name": "v", "type": "float2", "default": 3 } ] } ] }"#;
        let err = NodeCatalog::from_json_str(json).unwrap_err();
        assert!(format!("{err:#}").contains("Bad"));
    }

    #[test]
    fn shader_defaults_to_node_name() {
        let catalog = NodeCatalog::builtin().unwrap();
        let blend = catalog.get(catalog.index_of("Blend").unwrap()).unwrap();
        assert_eq!(blend.shader_id(), "Blend");
    }
}
