//! Read-only blends between two history entries, for rendering remote
//! entities between the ticks that were actually received.

use glam::{Quat, Vec2, Vec3, Vec4};

use crate::snapshot::{Snapshot, WorldHistory};
use crate::state::{Field, FieldValue, TypeRegistry};
use crate::world::NetworkId;

pub const DEFAULT_TIME_CORRECTION_RATE: f64 = 0.1;

/// How a networked value blends between two ticks.
pub trait Interpolate: FieldValue {
    fn interpolate(from: Self, to: Self, alpha: f32) -> Self;
}

macro_rules! float_lerp {
    ($($ty:ty),*) => {$(
        impl Interpolate for $ty {
            fn interpolate(from: Self, to: Self, alpha: f32) -> Self {
                from + (to - from) * alpha as $ty
            }
        }
    )*};
}

float_lerp!(f32, f64);

macro_rules! integer_lerp {
    ($($ty:ty),*) => {$(
        impl Interpolate for $ty {
            fn interpolate(from: Self, to: Self, alpha: f32) -> Self {
                let from_f = from as f64;
                (from_f + (to as f64 - from_f) * alpha as f64).round() as $ty
            }
        }
    )*};
}

integer_lerp!(i32, u32, i64, u64);

impl Interpolate for bool {
    fn interpolate(from: Self, to: Self, alpha: f32) -> Self {
        if alpha < 0.5 { from } else { to }
    }
}

macro_rules! vector_lerp {
    ($($ty:ty),*) => {$(
        impl Interpolate for $ty {
            fn interpolate(from: Self, to: Self, alpha: f32) -> Self {
                from.lerp(to, alpha)
            }
        }
    )*};
}

vector_lerp!(Vec2, Vec3, Vec4);

impl Interpolate for Quat {
    fn interpolate(from: Self, to: Self, alpha: f32) -> Self {
        let from = from.normalize();
        let to = to.normalize();
        if from.dot(to) < 0.0 {
            from.slerp(-to, alpha)
        } else {
            from.slerp(to, alpha)
        }
    }
}

/// Blends `field` of `id` between two snapshots.
///
/// `None` when the from-snapshot does not hold `id`: the entity did not exist
/// yet, or its slot belonged to someone else. When only the to-snapshot has
/// lost it, the from value is returned unblended.
pub fn interpolate_field<T: Interpolate>(
    from: &Snapshot,
    to: &Snapshot,
    registry: &TypeRegistry,
    id: NetworkId,
    field: Field<T>,
    alpha: f32,
) -> Option<T> {
    let start = from.view(registry, id)?.try_get(field).ok()?;
    let end = to
        .view(registry, id)
        .and_then(|view| view.try_get(field).ok());
    Some(match end {
        Some(end) => T::interpolate(start, end, alpha.clamp(0.0, 1.0)),
        None => start,
    })
}

/// A bracketing pair of history entries plus the blend factor, ready to
/// answer per-field queries.
#[derive(Debug, Clone, Copy)]
pub struct InterpolatedView<'a> {
    pub from: &'a Snapshot,
    pub to: &'a Snapshot,
    pub alpha: f32,
    registry: &'a TypeRegistry,
}

impl<'a> InterpolatedView<'a> {
    pub fn new(from: &'a Snapshot, to: &'a Snapshot, alpha: f32, registry: &'a TypeRegistry) -> Self {
        Self {
            from,
            to,
            alpha,
            registry,
        }
    }

    /// Locates the pair around fractional `tick` in `history`.
    pub fn at(history: &'a WorldHistory, registry: &'a TypeRegistry, tick: f64) -> Option<Self> {
        let (from, to, alpha) = history.pair_around(tick)?;
        Some(Self::new(from, to, alpha, registry))
    }

    pub fn get<T: Interpolate>(&self, id: NetworkId, field: Field<T>) -> Option<T> {
        interpolate_field(self.from, self.to, self.registry, id, field, self.alpha)
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + 'a {
        self.from.ids()
    }
}

/// Keeps a fractional render tick trailing the newest received tick by a
/// fixed delay, correcting drift gently instead of jumping.
#[derive(Debug, Clone)]
pub struct RenderClock {
    tick_rate: f64,
    delay_ticks: f64,
    time_correction_rate: f64,
    render_tick: f64,
    latest_tick: Option<u32>,
}

impl RenderClock {
    pub fn new(tick_rate: u32, delay_ticks: f32) -> Self {
        Self {
            tick_rate: tick_rate as f64,
            delay_ticks: delay_ticks as f64,
            time_correction_rate: DEFAULT_TIME_CORRECTION_RATE,
            render_tick: 0.0,
            latest_tick: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.latest_tick.is_some()
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.latest_tick
    }

    pub fn render_tick(&self) -> f64 {
        self.render_tick
    }

    pub fn target_tick(&self) -> Option<f64> {
        self.latest_tick
            .map(|tick| (tick as f64 - self.delay_ticks).max(0.0))
    }

    pub fn on_tick_received(&mut self, tick: u32) {
        match self.latest_tick {
            None => {
                self.latest_tick = Some(tick);
                self.render_tick = (tick as f64 - self.delay_ticks).max(0.0);
            }
            Some(latest) if tick > latest => self.latest_tick = Some(tick),
            Some(_) => {}
        }
    }

    pub fn update(&mut self, delta: f32) {
        let Some(target) = self.target_tick() else {
            return;
        };
        let advance = delta as f64 * self.tick_rate;
        let drift = target - (self.render_tick + advance);
        if drift.abs() > self.delay_ticks.max(1.0) * 4.0 {
            self.render_tick = target;
            return;
        }
        let max_correction = advance * 1.5;
        let correction = drift.clamp(-max_correction, max_correction);
        self.render_tick += advance + correction * self.time_correction_rate;
        self.render_tick = self.render_tick.min(target + self.delay_ticks);
    }

    pub fn view<'a>(
        &self,
        history: &'a WorldHistory,
        registry: &'a TypeRegistry,
    ) -> Option<InterpolatedView<'a>> {
        InterpolatedView::at(history, registry, self.render_tick)
    }

    /// `(remote_from_tick, alpha)` for stamping inputs: the tick the render
    /// time sits in and how far through it.
    pub fn stamp(&self) -> (u32, f32) {
        let floor = self.render_tick.floor();
        (floor as u32, (self.render_tick - floor) as f32)
    }

    pub fn reset(&mut self) {
        self.render_tick = 0.0;
        self.latest_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeConfig;
    use crate::world::World;

    crate::networked! {
        struct Buoy {
            position: Vec3,
            rotation: Quat,
            charges: i32,
            lit: bool,
        }
    }

    fn setup() -> (World, Buoy) {
        let registry = TypeRegistry::builder()
            .register::<Buoy>(TypeConfig::with_capacity(2))
            .unwrap()
            .build();
        let buoy = registry.bind::<Buoy>().unwrap();
        (World::new(registry), buoy)
    }

    #[test]
    fn blends_each_kind() {
        let (mut world, buoy) = setup();
        let id = world.spawn_as::<Buoy>(None).unwrap();
        {
            let mut view = world.view_mut(id).unwrap();
            view.set(buoy.rotation, Quat::IDENTITY);
            view.set(buoy.charges, 0);
        }
        let from = Snapshot::capture(1, &world);
        {
            let mut view = world.view_mut(id).unwrap();
            view.set(buoy.position, Vec3::new(10.0, 20.0, 30.0));
            view.set(buoy.rotation, Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
            view.set(buoy.charges, 3);
            view.set(buoy.lit, true);
        }
        let to = Snapshot::capture(2, &world);
        let registry = world.registry().clone();
        let blend = InterpolatedView::new(&from, &to, 0.5, &registry);

        let position = blend.get(id, buoy.position).unwrap();
        assert!((position - Vec3::new(5.0, 10.0, 15.0)).length() < 1e-4);
        assert_eq!(blend.get(id, buoy.charges), Some(2));
        assert_eq!(blend.get(id, buoy.lit), Some(true));

        let rotation = blend.get(id, buoy.rotation).unwrap();
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(rotation.angle_between(expected) < 1e-3);
    }

    #[test]
    fn no_data_unless_from_holds_entity() {
        let (mut world, buoy) = setup();
        let registry = world.registry().clone();
        let before = Snapshot::capture(1, &world);
        let id = world.spawn_as::<Buoy>(None).unwrap();
        world.view_mut(id).unwrap().set(buoy.charges, 5);
        let spawned = Snapshot::capture(2, &world);
        world.despawn(id);
        let gone = Snapshot::capture(3, &world);

        assert_eq!(interpolate_field(&before, &spawned, &registry, id, buoy.charges, 0.5), None);
        assert_eq!(
            interpolate_field(&spawned, &gone, &registry, id, buoy.charges, 0.5),
            Some(5)
        );
    }

    #[test]
    fn render_clock_trails_latest_tick() {
        let mut clock = RenderClock::new(60, 2.0);
        assert!(!clock.is_ready());

        clock.on_tick_received(10);
        assert_eq!(clock.render_tick(), 8.0);
        clock.on_tick_received(9);
        assert_eq!(clock.latest_tick(), Some(10));

        clock.on_tick_received(11);
        clock.update(1.0 / 60.0);
        assert!((clock.render_tick() - 9.0).abs() < 1e-3);

        let (tick, alpha) = clock.stamp();
        assert!(tick == 8 || tick == 9);
        assert!((0.0..1.0).contains(&alpha));

        clock.on_tick_received(500);
        clock.update(1.0 / 60.0);
        assert_eq!(clock.render_tick(), 498.0);
    }
}
