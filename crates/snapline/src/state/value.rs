use glam::{Quat, Vec2, Vec3, Vec4};

/// The closed set of value shapes a state block can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    I32,
    U32,
    I64,
    U64,
    /// Stored as a 32-bit integer, zero meaning `false`.
    Bool,
    F32,
    F64,
    Vec2,
    Vec3,
    Vec4,
    /// Four `f32` components (x, y, z, w); interpolated spherically.
    Quat,
}

impl FieldKind {
    pub const fn width(self) -> usize {
        match self {
            Self::I32 | Self::U32 | Self::Bool | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 | Self::Quat => 16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::Bool => "bool",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Vec2 => "Vec2",
            Self::Vec3 => "Vec3",
            Self::Vec4 => "Vec4",
            Self::Quat => "Quat",
        }
    }

    /// Resolves a declared type tag. Path prefixes (`glam::Vec3`) and the
    /// spacing `stringify!` inserts are ignored.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.rsplit("::").next().unwrap_or(tag).trim();
        let kind = match tag {
            "i32" | "int" => Self::I32,
            "u32" | "uint" => Self::U32,
            "i64" | "long" => Self::I64,
            "u64" | "ulong" => Self::U64,
            "bool" => Self::Bool,
            "f32" | "float" => Self::F32,
            "f64" | "double" => Self::F64,
            "Vec2" | "Vector2" => Self::Vec2,
            "Vec3" | "Vector3" => Self::Vec3,
            "Vec4" | "Vector4" => Self::Vec4,
            "Quat" | "Quaternion" => Self::Quat,
            _ => return None,
        };
        Some(kind)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A Rust type that maps onto one [`FieldKind`].
///
/// `read` and `write` receive a slice exactly `KIND.width()` bytes long.
/// Encoding is little-endian, matching [`crate::NetBuffer`].
pub trait FieldValue: Copy + sealed::Sealed {
    const KIND: FieldKind;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut [u8]);
}

macro_rules! scalar_field {
    ($ty:ty, $kind:ident) => {
        impl sealed::Sealed for $ty {}

        impl FieldValue for $ty {
            const KIND: FieldKind = FieldKind::$kind;

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

scalar_field!(i32, I32);
scalar_field!(u32, U32);
scalar_field!(i64, I64);
scalar_field!(u64, U64);
scalar_field!(f32, F32);
scalar_field!(f64, F64);

impl sealed::Sealed for bool {}

impl FieldValue for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn read(bytes: &[u8]) -> Self {
        u32::read(bytes) != 0
    }

    fn write(self, out: &mut [u8]) {
        (self as u32).write(out);
    }
}

fn read_floats<const N: usize>(bytes: &[u8]) -> [f32; N] {
    let mut out = [0.0; N];
    for (i, chunk) in bytes.chunks_exact(4).enumerate().take(N) {
        out[i] = f32::read(chunk);
    }
    out
}

fn write_floats(values: &[f32], out: &mut [u8]) {
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(4)) {
        value.write(chunk);
    }
}

macro_rules! vector_field {
    ($ty:ty, $kind:ident, $n:literal, $from:expr) => {
        impl sealed::Sealed for $ty {}

        impl FieldValue for $ty {
            const KIND: FieldKind = FieldKind::$kind;

            fn read(bytes: &[u8]) -> Self {
                $from(read_floats::<$n>(bytes))
            }

            fn write(self, out: &mut [u8]) {
                write_floats(&self.to_array(), out);
            }
        }
    };
}

vector_field!(Vec2, Vec2, 2, Vec2::from_array);
vector_field!(Vec3, Vec3, 3, Vec3::from_array);
vector_field!(Vec4, Vec4, 4, Vec4::from_array);
vector_field!(Quat, Quat, 4, Quat::from_array);
