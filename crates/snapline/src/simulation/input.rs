use std::collections::BTreeMap;

use bitflags::bitflags;
use glam::{Vec2, Vec3};

use crate::buffer::NetBuffer;
use crate::error::BufferError;
use crate::world::ClientId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u32 {
        const FIRE = 1 << 0;
        const JUMP = 1 << 1;
        const SPRINT = 1 << 2;
        const CROUCH = 1 << 3;
        const USE = 1 << 4;
    }
}

/// One client's input for one tick.
///
/// `remote_from_tick` and `alpha` describe where the client was rendering
/// remote entities when it sampled this input: `alpha` of the way from
/// `remote_from_tick` to the tick after it. Lag compensation rewinds to
/// exactly that point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimulationInput {
    pub tick: u32,
    pub remote_from_tick: u32,
    pub alpha: f32,
    pub buttons: Buttons,
    pub movement: Vec2,
    pub yaw: f32,
    pub pitch: f32,
}

impl SimulationInput {
    pub const ENCODED_SIZE: usize = 32;

    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn pressed(&self, buttons: Buttons) -> bool {
        self.buttons.contains(buttons)
    }

    /// Unit view direction, yaw around +Y and pitch up from the XZ plane.
    pub fn look_direction(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(-sin_yaw * cos_pitch, sin_pitch, -cos_yaw * cos_pitch)
    }

    /// Movement rotated into world space on the XZ plane; `movement.y` is
    /// forward.
    pub fn world_movement(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let forward = Vec3::new(-sin_yaw, 0.0, -cos_yaw);
        let right = Vec3::new(cos_yaw, 0.0, -sin_yaw);
        let wish = forward * self.movement.y + right * self.movement.x;
        wish.clamp_length_max(1.0)
    }

    pub fn write(&self, buffer: &mut NetBuffer) {
        buffer.add_u32(self.tick);
        buffer.add_u32(self.remote_from_tick);
        buffer.add_f32(self.alpha);
        buffer.add_u32(self.buttons.bits());
        buffer.add_vec2(self.movement);
        buffer.add_f32(self.yaw);
        buffer.add_f32(self.pitch);
    }

    pub fn read(buffer: &mut NetBuffer) -> Result<Self, BufferError> {
        Ok(Self {
            tick: buffer.get_u32()?,
            remote_from_tick: buffer.get_u32()?,
            alpha: buffer.get_f32()?,
            buttons: Buttons::from_bits_retain(buffer.get_u32()?),
            movement: buffer.get_vec2()?,
            yaw: buffer.get_f32()?,
            pitch: buffer.get_f32()?,
        })
    }

    /// Packs the newest input plus up to `redundancy` earlier ones so a
    /// single lost datagram costs nothing.
    pub fn encode_batch(inputs: &[SimulationInput]) -> Vec<u8> {
        let count = inputs.len().min(u8::MAX as usize);
        let mut buffer = NetBuffer::with_capacity(1 + count * Self::ENCODED_SIZE);
        buffer.add_u8(count as u8);
        for input in &inputs[inputs.len() - count..] {
            input.write(&mut buffer);
        }
        buffer.into_vec()
    }

    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<SimulationInput>, BufferError> {
        let mut buffer = NetBuffer::from_bytes(bytes);
        let count = buffer.get_u8()? as usize;
        (0..count).map(|_| Self::read(&mut buffer)).collect()
    }
}

/// Inputs bound for one tick, keyed by client. Ordered so that iteration is
/// the same on every peer.
pub type TickInputs = BTreeMap<ClientId, SimulationInput>;

/// Server-side buffer of one client's inputs waiting for their tick.
///
/// A tick with no input from the client reuses the last one consumed, so a
/// late or lost packet degrades to "keep doing the same thing".
#[derive(Debug, Clone)]
pub struct InputQueue {
    pending: BTreeMap<u32, SimulationInput>,
    last: Option<SimulationInput>,
    consumed_tick: u32,
    capacity: usize,
}

impl InputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            last: None,
            consumed_tick: 0,
            capacity: capacity.max(1),
        }
    }

    /// Returns false for inputs that arrived too late to matter or
    /// duplicate one already queued.
    pub fn push(&mut self, input: SimulationInput) -> bool {
        if input.tick <= self.consumed_tick || self.pending.contains_key(&input.tick) {
            return false;
        }
        self.pending.insert(input.tick, input);
        while self.pending.len() > self.capacity {
            self.pending.pop_last();
        }
        true
    }

    pub fn take(&mut self, tick: u32) -> Option<SimulationInput> {
        self.consumed_tick = self.consumed_tick.max(tick);
        let mut exact = None;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > tick {
                break;
            }
            let input = entry.remove();
            if input.tick == tick {
                exact = Some(input);
            }
        }

        match exact {
            Some(input) => {
                self.last = Some(input);
                Some(input)
            }
            None => self.last.map(|held| SimulationInput { tick, ..held }),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.last = None;
    }
}
