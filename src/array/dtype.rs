use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Element type of an array.
///
/// All buffers and stores use little-endian byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn itemsize(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Decode one element from `bytes` as `f64`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`itemsize`](Self::itemsize).
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        match self {
            DType::U8 => bytes[0] as f64,
            DType::I8 => bytes[0] as i8 as f64,
            DType::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            DType::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            DType::U32 => u32::from_le_bytes(le4(bytes)) as f64,
            DType::I32 => i32::from_le_bytes(le4(bytes)) as f64,
            DType::F32 => f32::from_le_bytes(le4(bytes)) as f64,
            DType::U64 => u64::from_le_bytes(le8(bytes)) as f64,
            DType::I64 => i64::from_le_bytes(le8(bytes)) as f64,
            DType::F64 => f64::from_le_bytes(le8(bytes)),
        }
    }

    /// Encode `value` into `out`, saturating for integer types.
    pub fn write_f64(self, value: f64, out: &mut [u8]) {
        match self {
            DType::U8 => out[0] = value as u8,
            DType::I8 => out[0] = value as i8 as u8,
            DType::U16 => out[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            DType::I16 => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            DType::U32 => out[..4].copy_from_slice(&(value as u32).to_le_bytes()),
            DType::I32 => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
            DType::F32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            DType::U64 => out[..8].copy_from_slice(&(value as u64).to_le_bytes()),
            DType::I64 => out[..8].copy_from_slice(&(value as i64).to_le_bytes()),
            DType::F64 => out[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    [
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "uint8" => Ok(DType::U8),
            "u16" | "uint16" => Ok(DType::U16),
            "u32" | "uint32" => Ok(DType::U32),
            "u64" | "uint64" => Ok(DType::U64),
            "i8" | "int8" => Ok(DType::I8),
            "i16" | "int16" => Ok(DType::I16),
            "i32" | "int32" => Ok(DType::I32),
            "i64" | "int64" => Ok(DType::I64),
            "f32" | "float32" => Ok(DType::F32),
            "f64" | "float64" => Ok(DType::F64),
            other => Err(format!("unknown dtype '{}'", other)),
        }
    }
}

// =============================================================================
// Element
// =============================================================================

/// A Rust scalar type that can live in an [`ArrayBuffer`](super::ArrayBuffer).
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);
