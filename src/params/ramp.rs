//! Ramp and gradient control points.
//!
//! Both are stored as eight fixed slots. A field that is entirely zero has
//! never been initialised. Unused trailing slots carry a key of -1 so the
//! shader-side walk stops at the first key that goes backwards.

use bytemuck::pod_read_unaligned;

use crate::schema::RAMP_POINTS;

/// Key written into slots past the last control point.
pub const UNUSED_KEY: f32 = -1.0;

pub fn identity_ramp() -> Vec<[f32; 2]> {
    vec![[0.0, 0.0], [1.0, 1.0]]
}

pub fn identity_gradient() -> Vec<[f32; 4]> {
    vec![[0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0]]
}

/// Truncates at the first point that moves backwards, keeps at most eight
/// points and pins the ends to 0 and 1.
fn normalize<T: Copy>(
    points: &[T],
    key: impl Fn(&T) -> f32,
    set_key: impl Fn(&mut T, f32),
    fallback: Vec<T>,
) -> Vec<T> {
    let mut accepted: Vec<T> = Vec::with_capacity(RAMP_POINTS);
    for point in points {
        if accepted.len() == RAMP_POINTS {
            break;
        }
        if let Some(prev) = accepted.last() {
            if !(key(point) >= key(prev)) {
                break;
            }
        }
        accepted.push(*point);
    }

    match accepted.len() {
        0 => return fallback,
        1 => {
            let only = accepted[0];
            accepted.push(only);
        }
        _ => {}
    }

    let last = accepted.len() - 1;
    set_key(&mut accepted[0], 0.0);
    set_key(&mut accepted[last], 1.0);
    accepted
}

pub fn normalize_ramp(points: &[[f32; 2]]) -> Vec<[f32; 2]> {
    normalize(points, |p| p[0], |p, k| p[0] = k, identity_ramp())
}

pub fn normalize_gradient(points: &[[f32; 4]]) -> Vec<[f32; 4]> {
    normalize(points, |p| p[3], |p, k| p[3] = k, identity_gradient())
}

fn floats(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes.chunks_exact(4).map(pod_read_unaligned::<f32>)
}

/// `None` when the field is still all zero.
pub fn decode_ramp(bytes: &[u8]) -> Option<Vec<[f32; 2]>> {
    if bytes.iter().all(|b| *b == 0) {
        return None;
    }
    let values: Vec<f32> = floats(bytes).collect();
    let mut points: Vec<[f32; 2]> = Vec::with_capacity(RAMP_POINTS);
    for pair in values.chunks_exact(2) {
        let point = [pair[0], pair[1]];
        if let Some(prev) = points.last() {
            if point[0] < prev[0] {
                break;
            }
        } else if point[0] < 0.0 {
            break;
        }
        points.push(point);
    }
    Some(points)
}

pub fn decode_gradient(bytes: &[u8]) -> Option<Vec<[f32; 4]>> {
    if bytes.iter().all(|b| *b == 0) {
        return None;
    }
    let values: Vec<f32> = floats(bytes).collect();
    let mut points: Vec<[f32; 4]> = Vec::with_capacity(RAMP_POINTS);
    for quad in values.chunks_exact(4) {
        let point = [quad[0], quad[1], quad[2], quad[3]];
        if let Some(prev) = points.last() {
            if point[3] < prev[3] {
                break;
            }
        } else if point[3] < 0.0 {
            break;
        }
        points.push(point);
    }
    Some(points)
}

fn write_floats(out: &mut [u8], values: impl IntoIterator<Item = f32>) {
    for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Writes already-normalised points; remaining slots get the unused key.
pub fn encode_ramp(points: &[[f32; 2]], out: &mut [u8]) {
    let values = (0..RAMP_POINTS).flat_map(|i| match points.get(i) {
        Some(p) => [p[0], p[1]],
        None => [UNUSED_KEY, 0.0],
    });
    write_floats(out, values);
}

pub fn encode_gradient(points: &[[f32; 4]], out: &mut [u8]) {
    let values = (0..RAMP_POINTS).flat_map(|i| match points.get(i) {
        Some(p) => *p,
        None => [0.0, 0.0, 0.0, UNUSED_KEY],
    });
    write_floats(out, values);
}
