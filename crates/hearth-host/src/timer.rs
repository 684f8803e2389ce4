use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timers never fire sooner than this after being armed
pub const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Type of timer
#[derive(Debug, Clone)]
enum TimerType {
    /// One-shot timer that fires once and is removed
    OneShot { fire_at: Instant },
    /// Recurring timer that fires repeatedly at an interval
    Recurring {
        interval: Duration,
        next_fire: Instant,
    },
}

impl TimerType {
    fn deadline(&self) -> Instant {
        match self {
            TimerType::OneShot { fire_at } => *fire_at,
            TimerType::Recurring { next_fire, .. } => *next_fire,
        }
    }
}

/// Manages the timers of one event loop
///
/// Active timers keep the loop alive. Ids are handed out in increasing order
/// and timers due at the same instant fire in id order.
pub struct TimerManager {
    timers: BTreeMap<TimerId, TimerType>,
    next_id: u64,
}

impl TimerManager {
    /// Create a new timer manager
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Schedule a one-shot timer that fires after a delay
    pub fn schedule_timer(&mut self, delay: Duration) -> TimerId {
        let id = self.allocate();
        self.timers.insert(
            id,
            TimerType::OneShot {
                fire_at: Instant::now() + delay.max(MIN_TIMER_DELAY),
            },
        );
        id
    }

    /// Schedule a recurring timer that fires repeatedly at an interval
    pub fn schedule_recurring(&mut self, interval: Duration) -> TimerId {
        let id = self.allocate();
        let interval = interval.max(MIN_TIMER_DELAY);
        self.timers.insert(
            id,
            TimerType::Recurring {
                interval,
                next_fire: Instant::now() + interval,
            },
        );
        id
    }

    /// Cancel a timer
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Earliest instant at which any timer is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(TimerType::deadline).min()
    }

    /// Process timers and return the ids that fired, earliest deadline first
    pub fn tick(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        let mut to_remove = Vec::new();

        for (id, timer) in self.timers.iter_mut() {
            match timer {
                TimerType::OneShot { fire_at } => {
                    if now >= *fire_at {
                        fired.push((*fire_at, *id));
                        to_remove.push(*id);
                    }
                }
                TimerType::Recurring {
                    interval,
                    next_fire,
                } => {
                    if now >= *next_fire {
                        fired.push((*next_fire, *id));
                        *next_fire = now + *interval;
                    }
                }
            }
        }

        // Remove one-shot timers that have fired
        for id in to_remove {
            self.timers.remove(&id);
        }

        fired.sort();
        fired.into_iter().map(|(_, id)| id).collect()
    }

    /// Get the number of active timers
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_timer() {
        let mut manager = TimerManager::new();
        let id = manager.schedule_timer(Duration::from_millis(50));

        // Should not fire immediately
        let fired = manager.tick(Instant::now());
        assert!(fired.is_empty());

        let fired = manager.tick(Instant::now() + Duration::from_millis(60));
        assert_eq!(fired, vec![id]);

        // Should be removed after firing
        assert_eq!(manager.active_count(), 0);
        assert!(manager.next_deadline().is_none());
    }

    #[test]
    fn test_recurring_timer() {
        let mut manager = TimerManager::new();
        let id = manager.schedule_recurring(Duration::from_millis(50));

        let later = Instant::now() + Duration::from_millis(60);
        assert_eq!(manager.tick(later), vec![id]);

        // Should still be active, rearmed relative to the tick
        assert_eq!(manager.active_count(), 1);
        assert!(manager.tick(later).is_empty());
        assert_eq!(manager.tick(later + Duration::from_millis(50)), vec![id]);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut manager = TimerManager::new();
        let slow = manager.schedule_timer(Duration::from_millis(30));
        let fast = manager.schedule_timer(Duration::from_millis(10));

        let fired = manager.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(fired, vec![fast, slow]);
    }

    #[test]
    fn test_zero_delay_is_clamped() {
        let mut manager = TimerManager::new();
        let before = Instant::now();
        manager.schedule_timer(Duration::ZERO);
        let deadline = manager.next_deadline().unwrap();
        assert!(deadline >= before + MIN_TIMER_DELAY);
    }

    #[test]
    fn test_cancel_timer() {
        let mut manager = TimerManager::new();
        let id = manager.schedule_timer(Duration::from_secs(10));

        assert!(manager.cancel_timer(id));
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.cancel_timer(id)); // Already removed
    }
}
