use std::collections::BTreeMap;

use glam::{Quat, Vec3};

use crate::world::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::from_position(Vec3::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Always unit length.
    pub direction: Vec3,
    pub max_distance: f32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3, max_distance: f32) -> Self {
        Self {
            origin,
            direction: direction.normalize_or(Vec3::NEG_Z),
            max_distance,
        }
    }

    pub fn at(&self, distance: f32) -> Vec3 {
        self.origin + self.direction * distance
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub id: NetworkId,
    pub distance: f32,
    pub point: Vec3,
}

/// The physics side of hit-testing, as lag compensation needs it.
pub trait HitScene {
    /// Broad phase: everything the ray might plausibly touch, generous
    /// enough to include targets whose past position differs from now.
    fn candidates(&self, ray: &Ray) -> Vec<NetworkId>;

    fn transform(&self, id: NetworkId) -> Option<Transform>;

    fn set_transform(&mut self, id: NetworkId, transform: Transform);

    /// Nearest hit along `ray`, ignoring `exclude`.
    fn raycast(&self, ray: &Ray, exclude: Option<NetworkId>) -> Option<RayHit>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereCollider {
    pub transform: Transform,
    pub radius: f32,
}

/// Minimal sphere-only scene. Enough for hitscan against round targets.
#[derive(Debug, Clone, Default)]
pub struct SphereScene {
    colliders: BTreeMap<NetworkId, SphereCollider>,
    broad_phase_margin: f32,
}

impl SphereScene {
    pub fn new(broad_phase_margin: f32) -> Self {
        Self {
            colliders: BTreeMap::new(),
            broad_phase_margin,
        }
    }

    pub fn insert(&mut self, id: NetworkId, transform: Transform, radius: f32) {
        self.colliders.insert(id, SphereCollider { transform, radius });
    }

    pub fn remove(&mut self, id: NetworkId) -> Option<SphereCollider> {
        self.colliders.remove(&id)
    }

    pub fn get(&self, id: NetworkId) -> Option<&SphereCollider> {
        self.colliders.get(&id)
    }

    pub fn len(&self) -> usize {
        self.colliders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colliders.is_empty()
    }

    /// Replaces every collider with `entries`, all sharing `radius`.
    pub fn sync<I>(&mut self, entries: I, radius: f32)
    where
        I: IntoIterator<Item = (NetworkId, Transform)>,
    {
        self.colliders.clear();
        for (id, transform) in entries {
            self.insert(id, transform, radius);
        }
    }

    fn intersect(ray: &Ray, collider: &SphereCollider) -> Option<f32> {
        let oc = ray.origin - collider.transform.position;
        let b = oc.dot(ray.direction);
        let c = oc.length_squared() - collider.radius * collider.radius;
        if c > 0.0 && b > 0.0 {
            return None;
        }
        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return None;
        }
        let distance = (-b - discriminant.sqrt()).max(0.0);
        (distance <= ray.max_distance).then_some(distance)
    }
}

impl HitScene for SphereScene {
    fn candidates(&self, ray: &Ray) -> Vec<NetworkId> {
        let reach = ray.max_distance + self.broad_phase_margin;
        self.colliders
            .iter()
            .filter(|(_, collider)| {
                let limit = reach + collider.radius;
                collider.transform.position.distance_squared(ray.origin) <= limit * limit
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn transform(&self, id: NetworkId) -> Option<Transform> {
        self.colliders.get(&id).map(|c| c.transform)
    }

    fn set_transform(&mut self, id: NetworkId, transform: Transform) {
        if let Some(collider) = self.colliders.get_mut(&id) {
            collider.transform = transform;
        }
    }

    fn raycast(&self, ray: &Ray, exclude: Option<NetworkId>) -> Option<RayHit> {
        self.colliders
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter_map(|(id, collider)| {
                Self::intersect(ray, collider).map(|distance| RayHit {
                    id: *id,
                    distance,
                    point: ray.at(distance),
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }
}
