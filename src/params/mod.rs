//! Schema-driven parameter blocks.
//!
//! A block is the packed byte image a node program reads as `array<f32>`.
//! Offsets come from the node type and never move; every typed accessor goes
//! through [`ParamValue`] and touches only its own field.

pub mod codec;
pub mod mouse;
pub mod ramp;

use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use bytemuck::{Pod, Zeroable};

use crate::schema::{ParamDef, ParamKind};

pub use mouse::MouseInput;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Camera {
    pub position: [f32; 4],
    pub direction: [f32; 4],
    pub up: [f32; 4],
    /// Vertical field of view in radians, near, far, aspect.
    pub lens: [f32; 4],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0, 1.0],
            direction: [0.0, 0.0, 1.0, 0.0],
            up: [0.0, 1.0, 0.0, 0.0],
            lens: [60f32.to_radians(), 0.1, 100.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Float2([f32; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Color4([f32; 4]),
    Int(i32),
    Int2([i32; 2]),
    Ramp(Vec<[f32; 2]>),
    /// (r, g, b, position)
    Gradient(Vec<[f32; 4]>),
    /// Radians, one entry per component.
    Angle(Vec<f32>),
    Enum(u32),
    Bool(bool),
    Filename(String),
    Trigger,
    Camera(Camera),
}

impl ParamValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Float(_) => "Float",
            ParamValue::Float2(_) => "Float2",
            ParamValue::Float3(_) => "Float3",
            ParamValue::Float4(_) => "Float4",
            ParamValue::Color4(_) => "Color4",
            ParamValue::Int(_) => "Int",
            ParamValue::Int2(_) => "Int2",
            ParamValue::Ramp(_) => "Ramp",
            ParamValue::Gradient(_) => "Gradient",
            ParamValue::Angle(_) => "Angle",
            ParamValue::Enum(_) => "Enum",
            ParamValue::Bool(_) => "Bool",
            ParamValue::Filename(_) => "Filename",
            ParamValue::Trigger => "Trigger",
            ParamValue::Camera(_) => "Camera",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSlot {
    pub def: ParamDef,
    pub offset: usize,
    pub size: usize,
}

impl FieldSlot {
    pub fn kind(&self) -> ParamKind {
        self.def.kind
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Byte layout of one node type's parameters.
#[derive(Debug, Clone)]
pub struct ParamLayout {
    fields: Vec<FieldSlot>,
    size: usize,
}

impl ParamLayout {
    pub fn new(defs: &[ParamDef]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(defs.len());
        let mut offset = 0;
        for def in defs {
            if !seen.insert(def.name.as_str()) {
                bail!("duplicate parameter '{}'", def.name);
            }
            if def.quad_select && def.kind != ParamKind::Float4 {
                bail!("parameter '{}' uses quadSelect but is not float4", def.name);
            }
            match def.kind {
                ParamKind::Float2 => {}
                ParamKind::Float if def.range_y.is_none() => {}
                _ if def.range_x.is_some() || def.range_y.is_some() => {
                    bail!(
                        "parameter '{}' has a mouse range but is {:?}",
                        def.name,
                        def.kind
                    );
                }
                _ => {}
            }
            let size = def.kind.size();
            fields.push(FieldSlot {
                def: def.clone(),
                offset,
                size,
            });
            offset += size;
        }
        Ok(Self {
            fields,
            size: offset,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> &[FieldSlot] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSlot> {
        self.fields.iter().find(|f| f.def.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ParameterBlock {
    layout: Arc<ParamLayout>,
    bytes: Vec<u8>,
}

impl ParameterBlock {
    pub fn zeroed(layout: Arc<ParamLayout>) -> Self {
        let bytes = vec![0; layout.size()];
        Self { layout, bytes }
    }

    /// Block filled from the catalog defaults. Cameras without a default get
    /// [`Camera::default`]; ramps and gradients stay zero until first access.
    pub fn with_defaults(layout: Arc<ParamLayout>) -> Result<Self> {
        let mut block = Self::zeroed(layout.clone());
        for field in layout.fields() {
            let value = match (&field.def.default, field.kind()) {
                (Some(json), _) => codec::value_from_json(&field.def, json)
                    .with_context(|| format!("default for parameter '{}'", field.def.name))?,
                (None, ParamKind::Camera) => ParamValue::Camera(Camera::default()),
                (None, _) => continue,
            };
            codec::encode(field.kind(), &value, &mut block.bytes[field.range()])
                .with_context(|| format!("default for parameter '{}'", field.def.name))?;
        }
        Ok(block)
    }

    pub fn from_bytes(layout: Arc<ParamLayout>, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != layout.size() {
            bail!(
                "parameter block is {} bytes, layout expects {}",
                bytes.len(),
                layout.size()
            );
        }
        Ok(Self { layout, bytes })
    }

    pub fn layout(&self) -> &Arc<ParamLayout> {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn slot(&self, name: &str) -> Result<FieldSlot> {
        self.layout
            .field(name)
            .cloned()
            .ok_or_else(|| anyhow!("no parameter named '{name}'"))
    }

    pub fn get(&self, name: &str) -> Result<ParamValue> {
        let slot = self.slot(name)?;
        Ok(codec::decode(slot.kind(), &self.bytes[slot.range()]))
    }

    pub fn set(&mut self, name: &str, value: ParamValue) -> Result<()> {
        let slot = self.slot(name)?;
        codec::encode(slot.kind(), &value, &mut self.bytes[slot.range()])
            .with_context(|| format!("parameter '{name}'"))
    }

    /// Ramp points, seeding an untouched field with the identity ramp.
    pub fn ramp(&mut self, name: &str) -> Result<Vec<[f32; 2]>> {
        let slot = self.slot(name)?;
        if slot.kind() != ParamKind::Ramp {
            bail!("parameter '{name}' is {:?}, not a ramp", slot.kind());
        }
        let bytes = &mut self.bytes[slot.range()];
        match ramp::decode_ramp(bytes) {
            Some(points) => Ok(points),
            None => {
                let points = ramp::identity_ramp();
                ramp::encode_ramp(&points, bytes);
                Ok(points)
            }
        }
    }

    pub fn set_ramp(&mut self, name: &str, points: &[[f32; 2]]) -> Result<()> {
        self.set(name, ParamValue::Ramp(points.to_vec()))
    }

    pub fn gradient(&mut self, name: &str) -> Result<Vec<[f32; 4]>> {
        let slot = self.slot(name)?;
        if slot.kind() != ParamKind::Gradient {
            bail!("parameter '{name}' is {:?}, not a gradient", slot.kind());
        }
        let bytes = &mut self.bytes[slot.range()];
        match ramp::decode_gradient(bytes) {
            Some(points) => Ok(points),
            None => {
                let points = ramp::identity_gradient();
                ramp::encode_gradient(&points, bytes);
                Ok(points)
            }
        }
    }

    pub fn set_gradient(&mut self, name: &str, points: &[[f32; 4]]) -> Result<()> {
        self.set(name, ParamValue::Gradient(points.to_vec()))
    }

    /// Seeds every untouched ramp and gradient so the GPU never sees the
    /// all-zero placeholder.
    pub fn seed_curves(&mut self) {
        let layout = self.layout.clone();
        for field in layout.fields() {
            let bytes = &mut self.bytes[field.range()];
            match field.kind() {
                ParamKind::Ramp if ramp::decode_ramp(bytes).is_none() => {
                    ramp::encode_ramp(&ramp::identity_ramp(), bytes)
                }
                ParamKind::Gradient if ramp::decode_gradient(bytes).is_none() => {
                    ramp::encode_gradient(&ramp::identity_gradient(), bytes)
                }
                _ => {}
            }
        }
    }

    pub fn angle_degrees(&self, name: &str) -> Result<Vec<f32>> {
        match self.get(name)? {
            ParamValue::Angle(radians) => Ok(radians.into_iter().map(f32::to_degrees).collect()),
            other => bail!("parameter '{name}' is {}, not an angle", other.kind_name()),
        }
    }

    pub fn set_angle_degrees(&mut self, name: &str, degrees: &[f32]) -> Result<()> {
        let radians = degrees.iter().map(|d| d.to_radians()).collect();
        self.set(name, ParamValue::Angle(radians))
    }

    pub fn filename(&self, name: &str) -> Result<String> {
        match self.get(name)? {
            ParamValue::Filename(path) => Ok(path),
            other => bail!("parameter '{name}' is {}, not a filename", other.kind_name()),
        }
    }

    pub fn set_filename(&mut self, name: &str, path: &str) -> Result<()> {
        self.set(name, ParamValue::Filename(path.to_string()))
    }

    /// First field of the given kind, e.g. the write target of an output node.
    pub fn first_of_kind(&self, kind: ParamKind) -> Option<&FieldSlot> {
        self.layout.fields().iter().find(|f| f.kind() == kind)
    }

    pub(crate) fn field_bytes_mut(&mut self, slot: &FieldSlot) -> &mut [u8] {
        &mut self.bytes[slot.range()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout(defs: Vec<ParamDef>) -> Arc<ParamLayout> {
        Arc::new(ParamLayout::new(&defs).unwrap())
    }

    #[test]
    fn field_sizes_match_the_table() {
        let cases = [
            (ParamKind::Float, 4),
            (ParamKind::Int, 4),
            (ParamKind::Enum, 4),
            (ParamKind::Bool, 4),
            (ParamKind::Angle, 4),
            (ParamKind::Float2, 8),
            (ParamKind::Int2, 8),
            (ParamKind::Angle2, 8),
            (ParamKind::Float3, 12),
            (ParamKind::Angle3, 12),
            (ParamKind::Float4, 16),
            (ParamKind::Color4, 16),
            (ParamKind::Angle4, 16),
            (ParamKind::Ramp, 64),
            (ParamKind::Gradient, 128),
            (ParamKind::FilenameRead, 1024),
            (ParamKind::FilenameWrite, 1024),
            (ParamKind::ForceEvaluate, 0),
            (ParamKind::Camera, 64),
        ];
        for (kind, size) in cases {
            assert_eq!(kind.size(), size, "{kind:?}");
        }
    }

    #[test]
    fn writing_one_field_leaves_neighbours_alone() {
        let layout = layout(vec![
            ParamDef::new("a", ParamKind::Float),
            ParamDef::new("b", ParamKind::Float2),
            ParamDef::new("c", ParamKind::Int),
        ]);
        let mut block = ParameterBlock::zeroed(layout);
        block.set("a", ParamValue::Float(1.0)).unwrap();
        block.set("c", ParamValue::Int(-7)).unwrap();
        let before = block.as_bytes().to_vec();
        block.set("b", ParamValue::Float2([3.0, 4.0])).unwrap();
        assert_eq!(block.as_bytes()[..4], before[..4]);
        assert_eq!(block.as_bytes()[12..], before[12..]);
        assert_eq!(block.get("c").unwrap(), ParamValue::Int(-7));
    }

    #[test]
    fn untouched_ramp_is_seeded_on_first_access() {
        let mut block = ParameterBlock::zeroed(layout(vec![ParamDef::new("curve", ParamKind::Ramp)]));
        assert!(block.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(block.ramp("curve").unwrap(), vec![[0.0, 0.0], [1.0, 1.0]]);
        let x2: f32 = bytemuck::pod_read_unaligned(&block.as_bytes()[16..20]);
        assert_eq!(x2, -1.0);
    }

    #[test]
    fn untouched_gradient_is_black_to_white() {
        let mut block =
            ParameterBlock::zeroed(layout(vec![ParamDef::new("g", ParamKind::Gradient)]));
        block.seed_curves();
        assert_eq!(
            block.gradient("g").unwrap(),
            vec![[0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0]]
        );
    }

    #[test]
    fn ramp_edit_is_truncated_not_rejected() {
        let mut block = ParameterBlock::zeroed(layout(vec![ParamDef::new("curve", ParamKind::Ramp)]));
        block
            .set_ramp("curve", &[[0.1, 0.0], [0.5, 0.5], [0.2, 0.9], [0.9, 1.0]])
            .unwrap();
        assert_eq!(block.ramp("curve").unwrap(), vec![[0.0, 0.0], [1.0, 0.5]]);
    }

    #[test]
    fn angles_are_radians_in_the_block() {
        let mut block = ParameterBlock::zeroed(layout(vec![ParamDef::new("r", ParamKind::Angle)]));
        block.set_angle_degrees("r", &[180.0]).unwrap();
        let stored: f32 = bytemuck::pod_read_unaligned(&block.as_bytes()[..4]);
        assert!((stored - std::f32::consts::PI).abs() < 1e-6);
        assert!(block.set_angle_degrees("r", &[1.0, 2.0]).is_err());
    }

    #[test]
    fn defaults_are_applied() {
        let mut radius = ParamDef::new("radius", ParamKind::Float);
        radius.default = Some(serde_json::json!(0.25));
        let mut tilt = ParamDef::new("tilt", ParamKind::Angle);
        tilt.default = Some(serde_json::json!(90.0));
        let block = ParameterBlock::with_defaults(layout(vec![
            radius,
            tilt,
            ParamDef::new("camera", ParamKind::Camera),
        ]))
        .unwrap();
        assert_eq!(block.get("radius").unwrap(), ParamValue::Float(0.25));
        let tilt = block.angle_degrees("tilt").unwrap();
        assert!((tilt[0] - 90.0).abs() < 1e-4);
        assert_eq!(block.get("camera").unwrap(), ParamValue::Camera(Camera::default()));
    }

    #[test]
    fn from_bytes_checks_length() {
        let layout = layout(vec![ParamDef::new("a", ParamKind::Float4)]);
        assert!(ParameterBlock::from_bytes(layout.clone(), vec![0; 16]).is_ok());
        assert!(ParameterBlock::from_bytes(layout, vec![0; 12]).is_err());
    }

    #[test]
    fn mouse_ranges_need_a_float_field() {
        let mut tint = ParamDef::new("tint", ParamKind::Color4);
        tint.range_x = Some([0.0, 1.0]);
        assert!(ParamLayout::new(&[tint]).is_err());

        let mut radius = ParamDef::new("radius", ParamKind::Float);
        radius.range_y = Some([0.0, 1.0]);
        assert!(ParamLayout::new(&[radius.clone()]).is_err());

        radius.range_y = None;
        radius.range_x = Some([0.0, 1.0]);
        assert!(ParamLayout::new(&[radius]).is_ok());
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let mut block = ParameterBlock::zeroed(layout(vec![]));
        assert!(block.set("nope", ParamValue::Float(1.0)).is_err());
    }

    proptest! {
        #[test]
        fn angle_degrees_round_trip(degrees in proptest::array::uniform3(-720.0f32..720.0)) {
            let mut block = ParameterBlock::zeroed(layout(vec![ParamDef::new("a", ParamKind::Angle3)]));
            block.set_angle_degrees("a", &degrees).unwrap();
            let back = block.angle_degrees("a").unwrap();
            for (want, got) in degrees.iter().zip(back) {
                prop_assert!((want - got).abs() <= 1e-3 * want.abs().max(1.0));
            }
        }
    }
}
