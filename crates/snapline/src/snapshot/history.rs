use crate::error::HistoryError;
use crate::world::World;

use super::Snapshot;

/// Fixed ring of captured snapshots, addressed by entries-ago from the most
/// recent capture. Slots keep their allocations when overwritten.
#[derive(Debug, Clone)]
pub struct WorldHistory {
    slots: Vec<Snapshot>,
    head: usize,
    /// Captures since creation or the last clear, minus dropped entries.
    captured: u64,
    /// Valid entries behind `head`; never more than the depth.
    held: usize,
}

impl WorldHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth.max(1)).map(|_| Snapshot::default()).collect(),
            head: 0,
            captured: 0,
            held: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.held
    }

    pub fn is_empty(&self) -> bool {
        self.held == 0
    }

    pub fn capture(&mut self, tick: u32, world: &World) -> &Snapshot {
        if self.held > 0 {
            self.head = (self.head + 1) % self.slots.len();
        }
        self.captured += 1;
        self.held = (self.held + 1).min(self.slots.len());
        let slot = &mut self.slots[self.head];
        slot.capture_into(tick, world);
        slot
    }

    /// `get(0)` is the latest capture. Anything at or beyond the ring depth,
    /// older than the first capture, or dropped by
    /// [`discard_after`](Self::discard_after) is unavailable.
    pub fn get(&self, ticks_ago: usize) -> Result<&Snapshot, HistoryError> {
        let depth = self.slots.len();
        if ticks_ago >= self.held {
            return Err(HistoryError::Unavailable {
                ticks_ago,
                depth,
                captured: self.captured,
            });
        }
        Ok(&self.slots[(self.head + depth - ticks_ago) % depth])
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.get(0).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        (0..self.len()).filter_map(|ago| self.get(ago).ok())
    }

    pub fn by_tick(&self, tick: u32) -> Result<&Snapshot, HistoryError> {
        self.iter()
            .find(|snapshot| snapshot.tick() == tick)
            .ok_or(HistoryError::TickNotFound(tick))
    }

    /// The two held entries bracketing fractional `tick`, with the blend
    /// factor between them. Returns the newest pair clamped at `alpha = 1`
    /// when `tick` is past everything held, and the oldest entry on its own
    /// when `tick` precedes it.
    pub fn pair_around(&self, tick: f64) -> Option<(&Snapshot, &Snapshot, f32)> {
        let newest = self.latest()?;
        if tick >= newest.tick() as f64 {
            let previous = self.get(1).unwrap_or(newest);
            return Some((previous, newest, 1.0));
        }

        let mut later = newest;
        for snapshot in self.iter().skip(1) {
            let from = snapshot.tick() as f64;
            if from <= tick {
                let span = later.tick() as f64 - from;
                let alpha = if span > 0.0 {
                    ((tick - from) / span) as f32
                } else {
                    0.0
                };
                return Some((snapshot, later, alpha.clamp(0.0, 1.0)));
            }
            later = snapshot;
        }
        Some((later, later, 0.0))
    }

    /// Drops every entry newer than `tick` so that replayed ticks take the
    /// slots of their stale predictions.
    pub fn discard_after(&mut self, tick: u32) {
        while self.latest().is_some_and(|s| s.tick() > tick) {
            self.drop_latest();
        }
    }

    pub(crate) fn drop_latest(&mut self) {
        if self.held == 0 {
            return;
        }
        self.captured = self.captured.saturating_sub(1);
        self.held -= 1;
        if self.held > 0 {
            let depth = self.slots.len();
            self.head = (self.head + depth - 1) % depth;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.captured = 0;
        self.held = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeConfig;
    use crate::state::TypeRegistry;

    crate::networked! {
        struct Dot {
            x: f32,
        }
    }

    fn world() -> World {
        let registry = TypeRegistry::builder()
            .register::<Dot>(TypeConfig::with_capacity(1))
            .unwrap()
            .build();
        World::new(registry)
    }

    #[test]
    fn newest_is_zero_ticks_ago() {
        let world = world();
        let mut history = WorldHistory::new(4);
        for tick in 1..=6 {
            history.capture(tick, &world);
        }
        assert_eq!(history.get(0).unwrap().tick(), 6);
        assert_eq!(history.get(3).unwrap().tick(), 3);
        assert_eq!(history.by_tick(4).unwrap().tick(), 4);
        assert_eq!(history.by_tick(2), Err(HistoryError::TickNotFound(2)));
    }

    #[test]
    fn out_of_range_is_unavailable() {
        let world = world();
        let mut history = WorldHistory::new(4);
        assert!(history.get(0).is_err());

        history.capture(1, &world);
        history.capture(2, &world);
        assert!(matches!(
            history.get(2),
            Err(HistoryError::Unavailable { captured: 2, .. })
        ));

        for tick in 3..10 {
            history.capture(tick, &world);
        }
        assert!(history.get(3).is_ok());
        assert!(matches!(
            history.get(4),
            Err(HistoryError::Unavailable { depth: 4, .. })
        ));
        assert!(history.get(1000).is_err());
    }

    #[test]
    fn discard_after_rewinds_head() {
        let world = world();
        let mut history = WorldHistory::new(8);
        for tick in 10..=15 {
            history.capture(tick, &world);
        }
        history.discard_after(12);
        assert_eq!(history.latest().unwrap().tick(), 12);
        assert_eq!(history.len(), 3);

        history.capture(13, &world);
        assert_eq!(history.get(1).unwrap().tick(), 12);
    }

    #[test]
    fn discard_on_a_wrapped_ring_forgets_dropped_entries() {
        let world = world();
        let mut history = WorldHistory::new(4);
        for tick in 1..=6 {
            history.capture(tick, &world);
        }
        history.discard_after(4);

        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().tick(), 4);
        assert_eq!(history.get(1).unwrap().tick(), 3);
        assert!(matches!(
            history.get(2),
            Err(HistoryError::Unavailable { ticks_ago: 2, .. })
        ));
        assert_eq!(history.by_tick(6), Err(HistoryError::TickNotFound(6)));
        assert_eq!(history.by_tick(5), Err(HistoryError::TickNotFound(5)));
        assert_eq!(history.iter().map(|s| s.tick()).collect::<Vec<_>>(), vec![4, 3]);

        // Replayed ticks refill the ring without resurrecting stale slots.
        history.capture(5, &world);
        history.capture(6, &world);
        history.capture(7, &world);
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().map(|s| s.tick()).collect::<Vec<_>>(), vec![7, 6, 5, 4]);
        assert!(history.get(4).is_err());
    }

    #[test]
    fn pair_around_brackets_fractional_tick() {
        let world = world();
        let mut history = WorldHistory::new(8);
        for tick in [2, 3, 5] {
            history.capture(tick, &world);
        }

        let (from, to, alpha) = history.pair_around(4.0).unwrap();
        assert_eq!((from.tick(), to.tick()), (3, 5));
        assert!((alpha - 0.5).abs() < 1e-6);

        let (from, to, alpha) = history.pair_around(9.0).unwrap();
        assert_eq!((from.tick(), to.tick(), alpha), (3, 5, 1.0));

        let (from, to, alpha) = history.pair_around(1.0).unwrap();
        assert_eq!((from.tick(), to.tick(), alpha), (2, 2, 0.0));
    }
}
