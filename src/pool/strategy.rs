//! Server selection strategies.
//!
//! Selection is a pure function over a name-ordered slice of [`Slot`]s so
//! the placement rules can be tested without a pool or a runtime.

use std::cmp::Ordering;

use crate::config::AllocationConfig;

/// Load view of one server as seen by the selector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot<'a> {
    pub name: &'a str,
    pub current: usize,
    pub max: usize,
    pub reachable: bool,
}

impl Slot<'_> {
    fn has_room(&self) -> bool {
        self.reachable && self.current < self.max
    }

    /// Compares `current / max` exactly by cross-multiplying.
    fn cmp_load(&self, other: &Slot<'_>) -> Ordering {
        (self.current * other.max)
            .cmp(&(other.current * self.max))
            .then_with(|| self.name.cmp(other.name))
    }
}

/// `sum(current) / sum(max)` over reachable servers, 0 when none.
pub(crate) fn cluster_load(slots: &[Slot<'_>]) -> f64 {
    let (current, max) = slots
        .iter()
        .filter(|s| s.reachable)
        .fold((0usize, 0usize), |(c, m), s| (c + s.current, m + s.max));
    if max == 0 {
        0.0
    } else {
        current as f64 / max as f64
    }
}

/// Slots held back on a server for high-priority work.
pub(crate) fn reserved_slots(max: usize, reserved_fraction: f64) -> usize {
    (max as f64 * reserved_fraction).floor() as usize
}

/// Picks the index of the server a task with `priority` should run on.
///
/// `cursor` is the round-robin position; it is only advanced by the
/// round-robin strategy.
pub(crate) fn select(
    strategy: &AllocationConfig,
    slots: &[Slot<'_>],
    cursor: &mut usize,
    priority: i32,
) -> Option<usize> {
    match strategy {
        AllocationConfig::RoundRobin => {
            let n = slots.len();
            let picked = (0..n)
                .map(|offset| (*cursor + offset) % n)
                .find(|&idx| slots[idx].has_room())?;
            *cursor = (picked + 1) % n;
            Some(picked)
        }
        AllocationConfig::LeastLoaded => least_loaded(slots, |s| s.has_room()),
        AllocationConfig::PriorityBased {
            reserved_fraction,
            priority_threshold,
        } => {
            if priority > *priority_threshold {
                return least_loaded(slots, |s| s.has_room());
            }
            if cluster_load(slots) >= 1.0 - reserved_fraction {
                return None;
            }
            least_loaded(slots, |s| {
                s.reachable && s.current + reserved_slots(s.max, *reserved_fraction) < s.max
            })
        }
    }
}

fn least_loaded(slots: &[Slot<'_>], eligible: impl Fn(&Slot<'_>) -> bool) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| eligible(s))
        .min_by(|(_, a), (_, b)| a.cmp_load(b))
        .map(|(idx, _)| idx)
}
