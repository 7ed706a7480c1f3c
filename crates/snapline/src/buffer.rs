//! Growable byte buffer with independent read and write cursors.
//!
//! Every multi-byte value is little-endian. Floats travel as their IEEE-754
//! bit patterns, so both peers see bit-identical values. `bool` occupies one
//! byte here; state blocks store it as 32 bits (see [`crate::state`]).
//! Vectors are consecutive `f32` components in x, y, z, w order.

use glam::{Quat, Vec2, Vec3, Vec4};

use crate::error::BufferError;

const MIN_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetBuffer {
    data: Vec<u8>,
    write: usize,
    read: usize,
}

macro_rules! scalar_io {
    ($add:ident, $get:ident, $ty:ty) => {
        pub fn $add(&mut self, value: $ty) {
            self.add_bytes(&value.to_le_bytes());
        }

        pub fn $get(&mut self) -> Result<$ty, BufferError> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_le_bytes(raw))
        }
    };
}

impl NetBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            write: 0,
            read: 0,
        }
    }

    /// Wraps received bytes; the write cursor sits at the end.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            write: bytes.len(),
            read: 0,
        }
    }

    /// A zero-filled buffer whose write cursor already covers `len` bytes,
    /// used as a reassembly target.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0; len],
            write: len,
            read: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.write
    }

    pub fn is_empty(&self) -> bool {
        self.write == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn read_position(&self) -> usize {
        self.read
    }

    pub fn remaining(&self) -> usize {
        self.write - self.read
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.write]
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.write);
        self.data
    }

    pub fn reset_read(&mut self) {
        self.read = 0;
    }

    /// Rewinds both cursors. Capacity is kept for the next tick.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    fn reserve_for(&mut self, additional: usize) {
        let needed = self.write + additional;
        if needed > self.data.len() {
            let mut target = self.data.len().max(MIN_CAPACITY);
            while target < needed {
                target *= 2;
            }
            self.data.resize(target, 0);
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.reserve_for(bytes.len());
        self.data[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
    }

    /// Overwrites already-written bytes, e.g. to patch a count after the fact.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        let end = offset + bytes.len();
        if end > self.write {
            return Err(BufferError::OutOfRange {
                offset,
                end,
                len: self.write,
            });
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let available = self.remaining();
        if len > available {
            return Err(BufferError::Underflow {
                needed: len,
                available,
            });
        }
        let start = self.read;
        self.read += len;
        Ok(&self.data[start..start + len])
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        self.take(len)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        self.take(len).map(|_| ())
    }

    /// Copies `length` unread bytes into `target` starting at `offset` in
    /// the target's own coordinates, advancing this buffer's read cursor.
    pub fn copy_to(
        &mut self,
        target: &mut NetBuffer,
        offset: usize,
        length: usize,
    ) -> Result<(), BufferError> {
        let bytes = self.take(length)?;
        let end = offset + length;
        if end > target.data.len() {
            target.data.resize(end, 0);
        }
        target.data[offset..end].copy_from_slice(bytes);
        target.write = target.write.max(end);
        Ok(())
    }

    scalar_io!(add_u8, get_u8, u8);
    scalar_io!(add_u16, get_u16, u16);
    scalar_io!(add_u32, get_u32, u32);
    scalar_io!(add_u64, get_u64, u64);
    scalar_io!(add_i32, get_i32, i32);
    scalar_io!(add_i64, get_i64, i64);
    scalar_io!(add_f32, get_f32, f32);
    scalar_io!(add_f64, get_f64, f64);

    pub fn add_bool(&mut self, value: bool) {
        self.add_u8(value as u8);
    }

    pub fn get_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn add_vec2(&mut self, v: Vec2) {
        self.add_f32(v.x);
        self.add_f32(v.y);
    }

    pub fn get_vec2(&mut self) -> Result<Vec2, BufferError> {
        Ok(Vec2::new(self.get_f32()?, self.get_f32()?))
    }

    pub fn add_vec3(&mut self, v: Vec3) {
        self.add_f32(v.x);
        self.add_f32(v.y);
        self.add_f32(v.z);
    }

    pub fn get_vec3(&mut self) -> Result<Vec3, BufferError> {
        Ok(Vec3::new(self.get_f32()?, self.get_f32()?, self.get_f32()?))
    }

    pub fn add_vec4(&mut self, v: Vec4) {
        for c in v.to_array() {
            self.add_f32(c);
        }
    }

    pub fn get_vec4(&mut self) -> Result<Vec4, BufferError> {
        Ok(Vec4::new(
            self.get_f32()?,
            self.get_f32()?,
            self.get_f32()?,
            self.get_f32()?,
        ))
    }

    pub fn add_quat(&mut self, q: Quat) {
        for c in q.to_array() {
            self.add_f32(c);
        }
    }

    pub fn get_quat(&mut self) -> Result<Quat, BufferError> {
        Ok(Quat::from_xyzw(
            self.get_f32()?,
            self.get_f32()?,
            self.get_f32()?,
            self.get_f32()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_roundtrip_bit_exact() {
        let mut buf = NetBuffer::new();
        buf.add_i32(-7);
        buf.add_u64(u64::MAX - 3);
        buf.add_f32(f32::from_bits(0x7fc0_0001));
        buf.add_f64(-0.0);
        buf.add_bool(true);
        buf.add_u8(200);

        assert_eq!(buf.get_i32().unwrap(), -7);
        assert_eq!(buf.get_u64().unwrap(), u64::MAX - 3);
        assert_eq!(buf.get_f32().unwrap().to_bits(), 0x7fc0_0001);
        assert_eq!(buf.get_f64().unwrap().to_bits(), (-0.0f64).to_bits());
        assert!(buf.get_bool().unwrap());
        assert_eq!(buf.get_u8().unwrap(), 200);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn layout_is_little_endian() {
        let mut buf = NetBuffer::new();
        buf.add_u32(0x0403_0201);
        buf.add_u16(0x0605);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn vectors_roundtrip() {
        let mut buf = NetBuffer::new();
        let q = Quat::from_rotation_y(1.25);
        buf.add_vec2(Vec2::new(1.0, -2.0));
        buf.add_vec3(Vec3::new(0.5, 1.5, -9.0));
        buf.add_quat(q);
        assert_eq!(buf.len(), 8 + 12 + 16);

        assert_eq!(buf.get_vec2().unwrap(), Vec2::new(1.0, -2.0));
        assert_eq!(buf.get_vec3().unwrap(), Vec3::new(0.5, 1.5, -9.0));
        assert_eq!(buf.get_quat().unwrap(), q);
    }

    #[test]
    fn read_past_write_cursor_fails() {
        let mut buf = NetBuffer::new();
        buf.add_u16(1);
        assert_eq!(
            buf.get_u32(),
            Err(BufferError::Underflow {
                needed: 4,
                available: 2
            })
        );
        // a failed read does not consume anything
        assert_eq!(buf.get_u16().unwrap(), 1);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut buf = NetBuffer::new();
        for i in 0..1000u32 {
            buf.add_u32(i);
        }
        let capacity = buf.capacity();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
        assert!(buf.get_u8().is_err());
    }

    #[test]
    fn reset_read_rewinds_only_reader() {
        let mut buf = NetBuffer::new();
        buf.add_u32(9);
        assert_eq!(buf.get_u32().unwrap(), 9);
        buf.reset_read();
        assert_eq!(buf.get_u32().unwrap(), 9);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn copy_to_places_bytes_in_target_coordinates() {
        let mut target = NetBuffer::zeroed(8);
        let mut fragment = NetBuffer::from_bytes(&[9, 8, 7]);
        fragment.copy_to(&mut target, 4, 3).unwrap();
        assert_eq!(target.as_slice(), &[0, 0, 0, 0, 9, 8, 7, 0]);

        let mut tail = NetBuffer::from_bytes(&[1, 2]);
        tail.copy_to(&mut target, 8, 2).unwrap();
        assert_eq!(target.len(), 10);
    }

    #[test]
    fn write_at_patches_in_place() {
        let mut buf = NetBuffer::new();
        buf.add_u16(0);
        buf.add_u8(5);
        buf.write_at(0, &3u16.to_le_bytes()).unwrap();
        assert_eq!(buf.get_u16().unwrap(), 3);
        assert!(buf.write_at(2, &[0, 0]).is_err());
    }
}
