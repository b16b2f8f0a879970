//! Priority-reserved admission slots.
//!
//! Every priority level owns a reserved share of the slot pool; the rest is
//! a shared global pool. A request is admitted when a free global slot
//! exists or its priority still has reserved capacity. Raising the floor at
//! runtime sheds everything below it without touching in-flight work.

use crate::config::PriorityConfig;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Request priority. Higher levels shed last. Deliberately not `Ord`:
/// declaration order runs opposite to urgency, so compare via `level()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Bulk,
}

impl Priority {
    /// Numeric level: Critical 100, High 75, Normal 50, Low 25, Bulk 0.
    pub fn level(&self) -> u8 {
        match self {
            Self::Critical => 100,
            Self::High => 75,
            Self::Normal => 50,
            Self::Low => 25,
            Self::Bulk => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Bulk => "bulk",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Bulk => 4,
        }
    }

}

/// Token for one occupied slot; hand it back via [`PrioritySlots::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotToken {
    priority: Priority,
    from_reserve: bool,
}

#[derive(Debug, Default)]
struct Counts {
    global_in_use: u32,
    reserved_in_use: [u32; 5],
}

/// Slot pool with per-priority reservations and a runtime-raisable floor.
#[derive(Debug)]
pub struct PrioritySlots {
    config: PriorityConfig,
    counts: Mutex<Counts>,
    /// Minimum admitted level; requests below it are shed.
    floor_level: AtomicU8,
}

impl PrioritySlots {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config, counts: Mutex::new(Counts::default()), floor_level: AtomicU8::new(0) }
    }

    fn reserved_for(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.config.reserved_critical,
            Priority::High => self.config.reserved_high,
            Priority::Normal => self.config.reserved_normal,
            Priority::Low => self.config.reserved_low,
            Priority::Bulk => self.config.reserved_bulk,
        }
    }

    fn global_capacity(&self) -> u32 {
        self.config.total_slots - self.config.reserved_total()
    }

    /// Raise (or lower) the admission floor to shed load below `priority`.
    pub fn set_floor(&self, priority: Priority) {
        self.floor_level.store(priority.level(), Ordering::Release);
        tracing::info!(floor = priority.as_str(), "priority floor set");
    }

    /// Lowest priority currently admitted.
    pub fn floor(&self) -> Priority {
        let level = self.floor_level.load(Ordering::Acquire);
        [Priority::Bulk, Priority::Low, Priority::Normal, Priority::High, Priority::Critical]
            .into_iter()
            .find(|p| p.level() >= level)
            .unwrap_or(Priority::Critical)
    }

    /// Try to occupy a slot. `None` means shed or exhausted.
    pub fn try_acquire(&self, priority: Priority) -> Option<SlotToken> {
        if priority.level() < self.floor_level.load(Ordering::Acquire) {
            return None;
        }
        let mut counts = self.counts.lock().expect("PrioritySlots poisoned");
        if counts.global_in_use < self.global_capacity() {
            counts.global_in_use += 1;
            return Some(SlotToken { priority, from_reserve: false });
        }
        let idx = priority.index();
        if counts.reserved_in_use[idx] < self.reserved_for(priority) {
            counts.reserved_in_use[idx] += 1;
            return Some(SlotToken { priority, from_reserve: true });
        }
        None
    }

    pub fn release(&self, token: SlotToken) {
        let mut counts = self.counts.lock().expect("PrioritySlots poisoned");
        if token.from_reserve {
            let idx = token.priority.index();
            counts.reserved_in_use[idx] = counts.reserved_in_use[idx].saturating_sub(1);
        } else {
            counts.global_in_use = counts.global_in_use.saturating_sub(1);
        }
    }

    /// Slots currently in use across every pool.
    pub fn in_use(&self) -> u32 {
        let counts = self.counts.lock().expect("PrioritySlots poisoned");
        counts.global_in_use + counts.reserved_in_use.iter().sum::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(total: u32, reserved_each: u32) -> PrioritySlots {
        PrioritySlots::new(PriorityConfig {
            total_slots: total,
            reserved_critical: reserved_each,
            reserved_high: reserved_each,
            reserved_normal: reserved_each,
            reserved_low: reserved_each,
            reserved_bulk: 0,
        })
    }

    #[test]
    fn levels_are_ordered() {
        assert_eq!(Priority::Critical.level(), 100);
        assert_eq!(Priority::High.level(), 75);
        assert_eq!(Priority::Normal.level(), 50);
        assert_eq!(Priority::Low.level(), 25);
        assert_eq!(Priority::Bulk.level(), 0);
    }

    #[test]
    fn global_pool_admits_anyone() {
        let slots = slots(10, 1);
        // 10 − 4 reserved = 6 global
        for _ in 0..6 {
            assert!(slots.try_acquire(Priority::Bulk).is_some());
        }
        assert!(slots.try_acquire(Priority::Bulk).is_none(), "bulk has no reserve");
    }

    #[test]
    fn reserved_slots_survive_global_exhaustion() {
        let slots = slots(10, 1);
        for _ in 0..6 {
            slots.try_acquire(Priority::Normal);
        }
        // Global gone; each priority still has its one reserved slot.
        assert!(slots.try_acquire(Priority::Critical).is_some());
        assert!(slots.try_acquire(Priority::Critical).is_none());
        assert!(slots.try_acquire(Priority::High).is_some());
    }

    #[test]
    fn release_returns_capacity_to_the_right_pool() {
        let slots = slots(10, 1);
        let mut tokens = Vec::new();
        for _ in 0..6 {
            tokens.push(slots.try_acquire(Priority::Normal).unwrap());
        }
        let reserved = slots.try_acquire(Priority::Critical).unwrap();
        assert!(slots.try_acquire(Priority::Critical).is_none());

        slots.release(reserved);
        assert!(slots.try_acquire(Priority::Critical).is_some());

        slots.release(tokens.pop().unwrap());
        assert!(slots.try_acquire(Priority::Bulk).is_some(), "global slot freed");
    }

    #[test]
    fn floor_sheds_lower_priorities() {
        let slots = slots(10, 1);
        slots.set_floor(Priority::High);
        assert!(slots.try_acquire(Priority::Normal).is_none());
        assert!(slots.try_acquire(Priority::Bulk).is_none());
        assert!(slots.try_acquire(Priority::High).is_some());
        assert!(slots.try_acquire(Priority::Critical).is_some());

        slots.set_floor(Priority::Bulk);
        assert!(slots.try_acquire(Priority::Normal).is_some());
    }

    #[test]
    fn in_use_counts_both_pools() {
        let slots = slots(10, 1);
        for _ in 0..6 {
            slots.try_acquire(Priority::Normal);
        }
        slots.try_acquire(Priority::Critical);
        assert_eq!(slots.in_use(), 7);
    }
}
