//! Server-side hit validation against the world as the shooter saw it.

mod scene;

use std::ops::Deref;

use glam::{Quat, Vec3};

use crate::error::LagCompError;
use crate::interpolation::interpolate_field;
use crate::simulation::SimulationInput;
use crate::snapshot::WorldHistory;
use crate::state::{Field, TypeRegistry};
use crate::world::NetworkId;

pub use scene::{HitScene, Ray, RayHit, SphereCollider, SphereScene, Transform};

/// Scoped rewind of scene transforms.
///
/// Every transform rewritten through the guard is put back when the guard
/// drops, whether the query returned, errored or panicked.
pub struct Rewind<'s, S: HitScene + ?Sized> {
    scene: &'s mut S,
    saved: Vec<(NetworkId, Transform)>,
}

impl<'s, S: HitScene + ?Sized> Rewind<'s, S> {
    pub fn new(scene: &'s mut S) -> Self {
        Self {
            scene,
            saved: Vec::new(),
        }
    }

    /// Moves `id` to `transform` for the lifetime of the guard. Unknown ids
    /// are ignored.
    pub fn rewrite(&mut self, id: NetworkId, transform: Transform) {
        let Some(live) = self.scene.transform(id) else {
            return;
        };
        self.saved.push((id, live));
        self.scene.set_transform(id, transform);
    }

    pub fn rewound(&self) -> usize {
        self.saved.len()
    }
}

impl<S: HitScene + ?Sized> Deref for Rewind<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.scene
    }
}

impl<S: HitScene + ?Sized> Drop for Rewind<'_, S> {
    fn drop(&mut self) {
        for (id, live) in self.saved.drain(..).rev() {
            self.scene.set_transform(id, live);
        }
    }
}

/// A hitscan request as carried by one client's input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shot {
    pub shooter: Option<NetworkId>,
    pub ray: Ray,
    pub remote_from_tick: u32,
    pub alpha: f32,
}

impl Shot {
    pub fn from_input(shooter: NetworkId, origin: Vec3, input: &SimulationInput, range: f32) -> Self {
        Self {
            shooter: Some(shooter),
            ray: Ray::new(origin, input.look_direction(), range),
            remote_from_tick: input.remote_from_tick,
            alpha: input.alpha,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RewindFields {
    position: Field<Vec3>,
    rotation: Option<Field<Quat>>,
}

/// Rewinds hit candidates to their interpolated historical transforms.
///
/// Types are rewindable when they network a `Vec3` field under the
/// configured position name; a `Quat` rotation field is optional.
#[derive(Debug, Clone)]
pub struct LagCompensator {
    fields: Vec<Option<RewindFields>>,
}

impl LagCompensator {
    pub fn new(registry: &TypeRegistry, position: &str, rotation: &str) -> Self {
        let fields = registry
            .iter()
            .map(|registered| {
                let table = &registered.table;
                table.try_field::<Vec3>(position).map(|position| RewindFields {
                    position,
                    rotation: table.try_field::<Quat>(rotation),
                })
            })
            .collect();
        Self { fields }
    }

    /// Runs `query` against `scene` with every broad-phase candidate except
    /// the shooter moved to where it was `alpha` of the way from
    /// `remote_from_tick` to the tick after.
    ///
    /// Candidates with no history at that time keep their live transform.
    pub fn rewound<S, R>(
        &self,
        scene: &mut S,
        history: &WorldHistory,
        registry: &TypeRegistry,
        shot: &Shot,
        query: impl FnOnce(&S) -> R,
    ) -> Result<R, LagCompError>
    where
        S: HitScene + ?Sized,
    {
        if !(0.0..=1.0).contains(&shot.alpha) {
            return Err(LagCompError::InvalidAlpha(shot.alpha));
        }
        let from = history.by_tick(shot.remote_from_tick)?;
        let to = history
            .by_tick(shot.remote_from_tick.wrapping_add(1))
            .unwrap_or(from);

        let candidates = scene.candidates(&shot.ray);
        let mut guard = Rewind::new(scene);
        for id in candidates {
            if Some(id) == shot.shooter {
                continue;
            }
            let Some(fields) = from
                .world_object_meta(id.index())
                .filter(|meta| meta.holds(id))
                .and_then(|meta| self.fields.get(meta.type_id.index()).copied().flatten())
            else {
                continue;
            };
            let Some(position) =
                interpolate_field(from, to, registry, id, fields.position, shot.alpha)
            else {
                continue;
            };
            let rotation = fields
                .rotation
                .and_then(|field| interpolate_field(from, to, registry, id, field, shot.alpha))
                .or_else(|| guard.transform(id).map(|t| t.rotation))
                .unwrap_or(Quat::IDENTITY);
            guard.rewrite(id, Transform { position, rotation });
        }

        log::trace!(
            "rewound {} candidates to tick {} + {:.2}",
            guard.rewound(),
            shot.remote_from_tick,
            shot.alpha
        );
        Ok(query(&*guard))
    }

    pub fn raycast<S>(
        &self,
        scene: &mut S,
        history: &WorldHistory,
        registry: &TypeRegistry,
        shot: &Shot,
    ) -> Result<Option<RayHit>, LagCompError>
    where
        S: HitScene + ?Sized,
    {
        self.rewound(scene, history, registry, shot, |scene| {
            scene.raycast(&shot.ray, shot.shooter)
        })
    }
}
