//! Single-value reads and writes over raw element bytes, used by casts

use bytemuck::pod_read_unaligned;

use crate::depth::{Depth, ElementType};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
}

/// Read one element. `None` for types without a real scalar value.
pub(crate) fn read(bytes: &[u8], element_type: ElementType) -> Option<Scalar> {
    let value = match element_type {
        ElementType::Bool => Scalar::UInt(u64::from(bytes[0] != 0)),
        ElementType::Int8 => Scalar::Int(i64::from(pod_read_unaligned::<i8>(&bytes[..1]))),
        ElementType::UInt8 => Scalar::UInt(u64::from(bytes[0])),
        ElementType::Int16 => Scalar::Int(i64::from(pod_read_unaligned::<i16>(&bytes[..2]))),
        ElementType::UInt16 => Scalar::UInt(u64::from(pod_read_unaligned::<u16>(&bytes[..2]))),
        ElementType::Int32 => Scalar::Int(i64::from(pod_read_unaligned::<i32>(&bytes[..4]))),
        ElementType::UInt32 => Scalar::UInt(u64::from(pod_read_unaligned::<u32>(&bytes[..4]))),
        ElementType::Int64 => Scalar::Int(pod_read_unaligned::<i64>(&bytes[..8])),
        ElementType::UInt64 => Scalar::UInt(pod_read_unaligned::<u64>(&bytes[..8])),
        ElementType::Float32 => Scalar::Float(f64::from(pod_read_unaligned::<f32>(&bytes[..4]))),
        ElementType::Float64 => Scalar::Float(pod_read_unaligned::<f64>(&bytes[..8])),
        ElementType::Float16 | ElementType::Complex64 | ElementType::Complex128 => return None,
    };
    Some(value)
}

macro_rules! store_as {
    ($out:expr, $value:expr, $ty:ty) => {{
        let v: $ty = match $value {
            Scalar::Int(v) => v as $ty,
            Scalar::UInt(v) => v as $ty,
            Scalar::Float(v) => v as $ty,
        };
        $out.copy_from_slice(bytemuck::bytes_of(&v));
    }};
}

/// Write with plain narrowing conversion semantics: integers wrap, floats
/// truncate toward zero. Returns false for targets without a scalar value.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_precision_loss)]
pub(crate) fn write_cast(value: Scalar, element_type: ElementType, out: &mut [u8]) -> bool {
    match element_type {
        ElementType::Bool => {
            out[0] = u8::from(match value {
                Scalar::Int(v) => v != 0,
                Scalar::UInt(v) => v != 0,
                Scalar::Float(v) => v != 0.0,
            });
        }
        ElementType::Int8 => store_as!(out, value, i8),
        ElementType::UInt8 => store_as!(out, value, u8),
        ElementType::Int16 => store_as!(out, value, i16),
        ElementType::UInt16 => store_as!(out, value, u16),
        ElementType::Int32 => store_as!(out, value, i32),
        ElementType::UInt32 => store_as!(out, value, u32),
        ElementType::Int64 => store_as!(out, value, i64),
        ElementType::UInt64 => store_as!(out, value, u64),
        ElementType::Float32 => store_as!(out, value, f32),
        ElementType::Float64 => store_as!(out, value, f64),
        ElementType::Float16 | ElementType::Complex64 | ElementType::Complex128 => return false,
    }
    true
}

macro_rules! store_saturating {
    ($out:expr, $value:expr, $ty:ty) => {{
        let v: $ty = match $value {
            Scalar::Int(v) => v.clamp(i64::from(<$ty>::MIN), i64::from(<$ty>::MAX)) as $ty,
            Scalar::UInt(v) => v.min(<$ty>::MAX as u64) as $ty,
            // float to int `as` already saturates and maps NaN to zero
            Scalar::Float(v) => v.round_ties_even() as $ty,
        };
        $out.copy_from_slice(bytemuck::bytes_of(&v));
    }};
}

/// Write with saturating semantics: out-of-range values clamp to the target
/// range and floats round half to even.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_precision_loss)]
pub(crate) fn write_saturating(value: Scalar, depth: Depth, out: &mut [u8]) {
    match depth {
        Depth::U8 => store_saturating!(out, value, u8),
        Depth::S8 => store_saturating!(out, value, i8),
        Depth::U16 => store_saturating!(out, value, u16),
        Depth::S16 => store_saturating!(out, value, i16),
        Depth::S32 => store_saturating!(out, value, i32),
        Depth::F32 => {
            let v = match value {
                Scalar::Int(v) => v as f32,
                Scalar::UInt(v) => v as f32,
                Scalar::Float(v) => v as f32,
            };
            out.copy_from_slice(bytemuck::bytes_of(&v));
        }
        Depth::F64 => {
            let v = match value {
                Scalar::Int(v) => v as f64,
                Scalar::UInt(v) => v as f64,
                Scalar::Float(v) => v,
            };
            out.copy_from_slice(bytemuck::bytes_of(&v));
        }
    }
}
