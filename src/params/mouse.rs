use bytemuck::pod_read_unaligned;

use super::{Camera, ParameterBlock};
use crate::schema::{ParamDef, ParamKind};

/// Cursor state in target-relative coordinates (0..1, origin top-left).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MouseInput {
    pub x: f32,
    pub y: f32,
    /// Movement since the previous event, same units as `x`/`y`.
    pub dx: f32,
    pub dy: f32,
    pub left: bool,
    /// The left button went down with this event.
    pub pressed: bool,
    pub right: bool,
    pub wheel: f32,
}

impl MouseInput {
    pub fn as_uniform(&self) -> [f32; 4] {
        let buttons = self.left as u32 | (self.right as u32) << 1;
        [self.x, self.y, buttons as f32, self.wheel]
    }
}

fn map_axis(def: &ParamDef, value: f32, range: [f32; 2], cursor: f32, delta: f32) -> f32 {
    let [lo, hi] = range;
    let span = hi - lo;
    if def.relative {
        if span == 0.0 {
            return lo;
        }
        let floor = lo.min(hi);
        let moved = value + span * delta;
        floor + (moved - floor).rem_euclid(span.abs())
    } else {
        lo + span * cursor
    }
}

fn read_floats<const N: usize>(bytes: &[u8]) -> [f32; N] {
    let mut out = [0.0; N];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = pod_read_unaligned(chunk);
    }
    out
}

fn write_floats(bytes: &mut [u8], values: &[f32]) {
    bytes[..values.len() * 4].copy_from_slice(bytemuck::cast_slice(values));
}

fn dolly(camera: &mut Camera, wheel: f32) {
    let [x, y, z, _] = camera.direction;
    let len = (x * x + y * y + z * z).sqrt();
    let dir = if len > f32::EPSILON {
        [x / len, y / len, z / len]
    } else {
        camera.direction = [0.0, 0.0, 1.0, 0.0];
        [0.0, 0.0, 1.0]
    };
    for (p, d) in camera.position.iter_mut().zip(dir) {
        *p += d * wheel;
    }
}

impl ParameterBlock {
    /// Applies a mouse event to every mouse-driven field and reports whether
    /// the node type reacts to the mouse at all.
    pub fn apply_mouse(&mut self, mouse: &MouseInput) -> bool {
        let layout = self.layout().clone();
        let mut uses_mouse = false;
        for field in layout.fields() {
            let def = &field.def;
            match def.kind {
                ParamKind::Camera => {
                    uses_mouse = true;
                    if mouse.wheel != 0.0 {
                        let bytes = self.field_bytes_mut(field);
                        let mut camera: Camera = pod_read_unaligned(&bytes[..64]);
                        dolly(&mut camera, mouse.wheel);
                        bytes.copy_from_slice(bytemuck::bytes_of(&camera));
                    }
                }
                ParamKind::Float4 if def.quad_select => {
                    uses_mouse = true;
                    if !mouse.left {
                        continue;
                    }
                    let bytes = self.field_bytes_mut(field);
                    let mut quad: [f32; 4] = read_floats(bytes);
                    if mouse.pressed {
                        quad = [mouse.x, 1.0 - mouse.y, mouse.x, 1.0 - mouse.y];
                    } else {
                        quad[2] = mouse.x;
                        quad[3] = 1.0 - mouse.y;
                    }
                    write_floats(bytes, &quad);
                }
                ParamKind::Float | ParamKind::Float2 if def.is_mouse_driven() => {
                    uses_mouse = true;
                    if !mouse.left {
                        continue;
                    }
                    let bytes = self.field_bytes_mut(field);
                    let mut values: [f32; 2] = read_floats(bytes);
                    if let Some(range) = def.range_x {
                        values[0] = map_axis(def, values[0], range, mouse.x, mouse.dx);
                    }
                    if def.kind == ParamKind::Float2 {
                        if let Some(range) = def.range_y {
                            values[1] = map_axis(def, values[1], range, mouse.y, mouse.dy);
                        }
                    }
                    let n = if def.kind == ParamKind::Float2 { 2 } else { 1 };
                    write_floats(bytes, &values[..n]);
                }
                _ => {}
            }
        }
        uses_mouse
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::params::{ParamLayout, ParamValue};

    fn block(defs: Vec<ParamDef>) -> ParameterBlock {
        ParameterBlock::with_defaults(Arc::new(ParamLayout::new(&defs).unwrap())).unwrap()
    }

    #[test]
    fn wheel_dollies_camera_along_direction() {
        let mut block = block(vec![ParamDef::new("camera", ParamKind::Camera)]);
        let mouse = MouseInput {
            wheel: 2.0,
            ..Default::default()
        };
        assert!(block.apply_mouse(&mouse));
        let ParamValue::Camera(camera) = block.get("camera").unwrap() else {
            panic!("not a camera");
        };
        assert_eq!(camera.position[2], 2.0);
    }

    #[test]
    fn zero_direction_is_reset_to_forward() {
        let mut block = block(vec![ParamDef::new("camera", ParamKind::Camera)]);
        let mut camera = Camera::default();
        camera.direction = [0.0; 4];
        block.set("camera", ParamValue::Camera(camera)).unwrap();
        block.apply_mouse(&MouseInput {
            wheel: 1.0,
            ..Default::default()
        });
        let ParamValue::Camera(camera) = block.get("camera").unwrap() else {
            panic!("not a camera");
        };
        assert_eq!(camera.direction, [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(camera.position[2], 1.0);
    }

    #[test]
    fn quad_select_tracks_drag() {
        let mut quad = ParamDef::new("quad", ParamKind::Float4);
        quad.quad_select = true;
        let mut block = block(vec![quad]);
        block.apply_mouse(&MouseInput {
            x: 0.25,
            y: 0.25,
            left: true,
            pressed: true,
            ..Default::default()
        });
        block.apply_mouse(&MouseInput {
            x: 0.75,
            y: 0.5,
            left: true,
            ..Default::default()
        });
        assert_eq!(block.get("quad").unwrap(), ParamValue::Float4([0.25, 0.75, 0.75, 0.5]));
    }

    #[test]
    fn absolute_range_maps_cursor() {
        let mut center = ParamDef::new("center", ParamKind::Float2);
        center.range_x = Some([-1.0, 1.0]);
        center.range_y = Some([0.0, 10.0]);
        let mut block = block(vec![center]);
        let mouse = MouseInput {
            x: 0.75,
            y: 0.5,
            left: true,
            ..Default::default()
        };
        assert!(block.apply_mouse(&mouse));
        assert_eq!(block.get("center").unwrap(), ParamValue::Float2([0.5, 5.0]));
    }

    #[test]
    fn relative_range_wraps() {
        let mut offset = ParamDef::new("offset", ParamKind::Float);
        offset.range_x = Some([0.0, 1.0]);
        offset.relative = true;
        let mut block = block(vec![offset]);
        block.set("offset", ParamValue::Float(0.9)).unwrap();
        block.apply_mouse(&MouseInput {
            dx: 0.3,
            left: true,
            ..Default::default()
        });
        let ParamValue::Float(v) = block.get("offset").unwrap() else {
            panic!("not a float");
        };
        assert!((v - 0.2).abs() < 1e-5);
    }

    #[test]
    fn reversed_relative_range_stays_in_bounds() {
        let mut offset = ParamDef::new("offset", ParamKind::Float);
        offset.range_x = Some([1.0, 0.0]);
        offset.relative = true;
        let mut block = block(vec![offset]);
        block.set("offset", ParamValue::Float(0.15)).unwrap();
        for _ in 0..3 {
            block.apply_mouse(&MouseInput {
                dx: 0.1,
                left: true,
                ..Default::default()
            });
            let ParamValue::Float(v) = block.get("offset").unwrap() else {
                panic!("not a float");
            };
            assert!((0.0..=1.0).contains(&v), "{v}");
        }
        let ParamValue::Float(v) = block.get("offset").unwrap() else {
            panic!("not a float");
        };
        // Three steps of -0.1 from 0.15 wrap past zero.
        assert!((v - 0.85).abs() < 1e-4, "{v}");
    }

    #[test]
    fn plain_fields_ignore_the_mouse() {
        let mut block = block(vec![ParamDef::new("radius", ParamKind::Float)]);
        let mouse = MouseInput {
            x: 0.5,
            left: true,
            ..Default::default()
        };
        assert!(!block.apply_mouse(&mouse));
    }
}
