//! Per-kind encoding between `ParamValue` and the packed native-endian bytes.

use anyhow::{Result, anyhow, bail};
use bytemuck::pod_read_unaligned;
use serde_json::Value;

use super::{Camera, ParamValue, ramp};
use crate::schema::{FILENAME_BYTES, ParamDef, ParamKind};

fn read_f32s<const N: usize>(bytes: &[u8]) -> [f32; N] {
    let mut out = [0.0; N];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = pod_read_unaligned(chunk);
    }
    out
}

fn read_i32s<const N: usize>(bytes: &[u8]) -> [i32; N] {
    let mut out = [0; N];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = pod_read_unaligned(chunk);
    }
    out
}

fn write_words<T: bytemuck::Pod>(out: &mut [u8], values: &[T]) {
    let src: &[u8] = bytemuck::cast_slice(values);
    out[..src.len()].copy_from_slice(src);
}

pub(crate) fn decode_filename(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes a field. Ramps and gradients that were never written decode as
/// the identity curve without touching the bytes.
pub fn decode(kind: ParamKind, bytes: &[u8]) -> ParamValue {
    match kind {
        ParamKind::Float => ParamValue::Float(read_f32s::<1>(bytes)[0]),
        ParamKind::Float2 => ParamValue::Float2(read_f32s(bytes)),
        ParamKind::Float3 => ParamValue::Float3(read_f32s(bytes)),
        ParamKind::Float4 => ParamValue::Float4(read_f32s(bytes)),
        ParamKind::Color4 => ParamValue::Color4(read_f32s(bytes)),
        ParamKind::Int => ParamValue::Int(read_i32s::<1>(bytes)[0]),
        ParamKind::Int2 => ParamValue::Int2(read_i32s(bytes)),
        ParamKind::Enum => ParamValue::Enum(read_i32s::<1>(bytes)[0] as u32),
        ParamKind::Bool => ParamValue::Bool(read_i32s::<1>(bytes)[0] != 0),
        ParamKind::Angle | ParamKind::Angle2 | ParamKind::Angle3 | ParamKind::Angle4 => {
            ParamValue::Angle(
                bytes
                    .chunks_exact(4)
                    .map(pod_read_unaligned::<f32>)
                    .collect(),
            )
        }
        ParamKind::Ramp => {
            ParamValue::Ramp(ramp::decode_ramp(bytes).unwrap_or_else(ramp::identity_ramp))
        }
        ParamKind::Gradient => ParamValue::Gradient(
            ramp::decode_gradient(bytes).unwrap_or_else(ramp::identity_gradient),
        ),
        ParamKind::FilenameRead | ParamKind::FilenameWrite => {
            ParamValue::Filename(decode_filename(bytes))
        }
        ParamKind::ForceEvaluate => ParamValue::Trigger,
        ParamKind::Camera => ParamValue::Camera(pod_read_unaligned(&bytes[..64])),
    }
}

/// Encodes `value` into `out`, which is exactly the field's slice.
pub fn encode(kind: ParamKind, value: &ParamValue, out: &mut [u8]) -> Result<()> {
    match (kind, value) {
        (ParamKind::Float, ParamValue::Float(v)) => write_words(out, &[*v]),
        (ParamKind::Float2, ParamValue::Float2(v)) => write_words(out, v),
        (ParamKind::Float3, ParamValue::Float3(v)) => write_words(out, v),
        (ParamKind::Float4, ParamValue::Float4(v)) => write_words(out, v),
        (ParamKind::Color4, ParamValue::Color4(v)) => write_words(out, v),
        (ParamKind::Int, ParamValue::Int(v)) => write_words(out, &[*v]),
        (ParamKind::Int2, ParamValue::Int2(v)) => write_words(out, v),
        (ParamKind::Enum, ParamValue::Enum(v)) => write_words(out, &[*v]),
        (ParamKind::Bool, ParamValue::Bool(v)) => write_words(out, &[*v as i32]),
        (kind, ParamValue::Angle(radians)) if kind.angle_components().is_some() => {
            let expected = kind.angle_components().unwrap_or(1);
            if radians.len() != expected {
                bail!(
                    "{kind:?} expects {expected} components, got {}",
                    radians.len()
                );
            }
            write_words(out, radians);
        }
        (ParamKind::Ramp, ParamValue::Ramp(points)) => {
            ramp::encode_ramp(&ramp::normalize_ramp(points), out)
        }
        (ParamKind::Gradient, ParamValue::Gradient(points)) => {
            ramp::encode_gradient(&ramp::normalize_gradient(points), out)
        }
        (kind, ParamValue::Filename(name)) if kind.is_filename() => {
            let bytes = name.as_bytes();
            if bytes.len() >= FILENAME_BYTES {
                bail!(
                    "filename is {} bytes, limit is {}",
                    bytes.len(),
                    FILENAME_BYTES - 1
                );
            }
            if bytes.contains(&0) {
                bail!("filename contains a NUL byte");
            }
            out.fill(0);
            out[..bytes.len()].copy_from_slice(bytes);
        }
        (ParamKind::ForceEvaluate, ParamValue::Trigger) => {}
        (ParamKind::Camera, ParamValue::Camera(camera)) => {
            out.copy_from_slice(bytemuck::bytes_of(camera))
        }
        (kind, value) => bail!("{} cannot be stored in a {kind:?} field", value.kind_name()),
    }
    Ok(())
}

fn json_floats<const N: usize>(json: &Value) -> Result<[f32; N]> {
    if N == 1 {
        if let Some(v) = json.as_f64() {
            return Ok([v as f32; N]);
        }
    }
    let items = json
        .as_array()
        .ok_or_else(|| anyhow!("expected an array of {N} numbers, got {json}"))?;
    if items.len() != N {
        bail!("expected {N} numbers, got {}", items.len());
    }
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_f64()
            .ok_or_else(|| anyhow!("expected a number, got {item}"))? as f32;
    }
    Ok(out)
}

fn json_ints<const N: usize>(json: &Value) -> Result<[i32; N]> {
    let floats = json_floats::<N>(json)?;
    Ok(floats.map(|v| v as i32))
}

/// Parses a catalog default. Angles are given in degrees.
pub fn value_from_json(def: &ParamDef, json: &Value) -> Result<ParamValue> {
    let value = match def.kind {
        ParamKind::Float => ParamValue::Float(json_floats::<1>(json)?[0]),
        ParamKind::Float2 => ParamValue::Float2(json_floats(json)?),
        ParamKind::Float3 => ParamValue::Float3(json_floats(json)?),
        ParamKind::Float4 => ParamValue::Float4(json_floats(json)?),
        ParamKind::Color4 => ParamValue::Color4(json_floats(json)?),
        ParamKind::Int => ParamValue::Int(json_ints::<1>(json)?[0]),
        ParamKind::Int2 => ParamValue::Int2(json_ints(json)?),
        ParamKind::Bool => ParamValue::Bool(
            json.as_bool()
                .ok_or_else(|| anyhow!("expected a bool, got {json}"))?,
        ),
        ParamKind::Enum => {
            let index = match json {
                Value::String(name) => def
                    .enum_values
                    .iter()
                    .position(|v| v == name)
                    .ok_or_else(|| anyhow!("'{name}' is not one of {:?}", def.enum_values))?,
                other => other
                    .as_u64()
                    .ok_or_else(|| anyhow!("expected an enum index or name, got {other}"))?
                    as usize,
            };
            if !def.enum_values.is_empty() && index >= def.enum_values.len() {
                bail!("enum index {index} out of range");
            }
            ParamValue::Enum(index as u32)
        }
        ParamKind::Angle => ParamValue::Angle(json_floats::<1>(json)?.map(f32::to_radians).to_vec()),
        ParamKind::Angle2 => ParamValue::Angle(json_floats::<2>(json)?.map(f32::to_radians).to_vec()),
        ParamKind::Angle3 => ParamValue::Angle(json_floats::<3>(json)?.map(f32::to_radians).to_vec()),
        ParamKind::Angle4 => ParamValue::Angle(json_floats::<4>(json)?.map(f32::to_radians).to_vec()),
        ParamKind::Ramp => {
            let items = json.as_array().ok_or_else(|| anyhow!("expected ramp points"))?;
            let points = items.iter().map(json_floats::<2>).collect::<Result<Vec<_>>>()?;
            ParamValue::Ramp(points)
        }
        ParamKind::Gradient => {
            let items = json.as_array().ok_or_else(|| anyhow!("expected gradient points"))?;
            let points = items.iter().map(json_floats::<4>).collect::<Result<Vec<_>>>()?;
            ParamValue::Gradient(points)
        }
        ParamKind::FilenameRead | ParamKind::FilenameWrite => ParamValue::Filename(
            json.as_str()
                .ok_or_else(|| anyhow!("expected a path string, got {json}"))?
                .to_string(),
        ),
        ParamKind::ForceEvaluate => ParamValue::Trigger,
        ParamKind::Camera => {
            let object = json
                .as_object()
                .ok_or_else(|| anyhow!("expected a camera object, got {json}"))?;
            let mut camera = Camera::default();
            for (key, field) in object {
                let v = json_floats::<4>(field)?;
                match key.as_str() {
                    "position" => camera.position = v,
                    "direction" => camera.direction = v,
                    "up" => camera.up = v,
                    "lens" => camera.lens = v,
                    other => bail!("unknown camera key '{other}'"),
                }
            }
            ParamValue::Camera(camera)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float2_writes_only_its_slice() {
        let mut bytes = [0xAAu8; 8];
        encode(ParamKind::Float2, &ParamValue::Float2([1.5, -2.0]), &mut bytes).unwrap();
        assert_eq!(decode(ParamKind::Float2, &bytes), ParamValue::Float2([1.5, -2.0]));
    }

    #[test]
    fn bool_is_stored_as_i32() {
        let mut bytes = [0u8; 4];
        encode(ParamKind::Bool, &ParamValue::Bool(true), &mut bytes).unwrap();
        assert_eq!(i32::from_ne_bytes(bytes), 1);
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let mut bytes = [0u8; 4];
        let err = encode(ParamKind::Float, &ParamValue::Int(3), &mut bytes).unwrap_err();
        assert!(err.to_string().contains("Float"));
    }

    #[test]
    fn filename_is_nul_terminated() {
        let mut bytes = vec![0xFFu8; FILENAME_BYTES];
        encode(
            ParamKind::FilenameWrite,
            &ParamValue::Filename("out.png".into()),
            &mut bytes,
        )
        .unwrap();
        assert_eq!(bytes[7], 0);
        assert_eq!(decode_filename(&bytes), "out.png");

        let long = "x".repeat(FILENAME_BYTES);
        assert!(
            encode(ParamKind::FilenameRead, &ParamValue::Filename(long), &mut bytes).is_err()
        );
    }

    #[test]
    fn enum_default_accepts_names() {
        let mut def = ParamDef::new("mode", ParamKind::Enum);
        def.enum_values = vec!["Mix".into(), "Add".into()];
        let value = value_from_json(&def, &serde_json::json!("Add")).unwrap();
        assert_eq!(value, ParamValue::Enum(1));
        assert!(value_from_json(&def, &serde_json::json!("Nope")).is_err());
    }
}
