//! Timers as plain data plus a string-keyed handler table.
//!
//! A timer names its handler by string (`"RemovePlayer"`, `"WorldSave"`)
//! so a queue of pending timers can be saved and restored. The world only
//! schedules, cancels and drains due timers; dispatch goes through the
//! registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::types::{Serial, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub deadline: Tick,
    pub kind: String,
    pub subject: Serial,
    #[serde(default)]
    pub param: String,
}

/// Pending timers ordered by deadline, then by scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    pending: BTreeMap<(Tick, TimerId), Timer>,
    deadlines: HashMap<TimerId, Tick>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn schedule(
        &mut self,
        now: Tick,
        delay: Tick,
        kind: &str,
        subject: Serial,
        param: &str,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = now.saturating_add(delay);
        self.pending.insert(
            (deadline, id),
            Timer {
                id,
                deadline,
                kind: kind.to_string(),
                subject,
                param: param.to_string(),
            },
        );
        self.deadlines.insert(id, deadline);
        id
    }

    /// Returns false when the timer already fired or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.pending.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Cancels every pending timer of `kind` for `subject`.
    pub fn cancel_matching(&mut self, kind: &str, subject: Serial) -> usize {
        let ids: Vec<TimerId> = self
            .pending
            .values()
            .filter(|t| t.kind == kind && t.subject == subject)
            .map(|t| t.id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Removes and returns every timer with `deadline <= now`, earliest first.
    pub fn take_due(&mut self, now: Tick) -> Vec<Timer> {
        let later = self.pending.split_off(&(now.saturating_add(1), TimerId(0)));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_values()
            .inspect(|t| {
                self.deadlines.remove(&t.id);
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Timer> {
        self.pending.values().cloned().collect()
    }

    pub fn restore(timers: Vec<Timer>) -> Self {
        let mut queue = Self::new();
        for t in timers {
            queue.next_id = queue.next_id.max(t.id.0);
            queue.deadlines.insert(t.id, t.deadline);
            queue.pending.insert((t.deadline, t.id), t);
        }
        queue
    }
}

/// Handler invoked with the owning context when a timer of its kind fires.
pub type TimerHandler<C> = fn(&mut C, &Timer);

pub struct TimerRegistry<C> {
    handlers: HashMap<&'static str, TimerHandler<C>>,
}

impl<C> TimerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, handler: TimerHandler<C>) {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!("[timers] [register] kind={} replaced an existing handler", kind);
        }
    }

    pub fn get(&self, kind: &str) -> Option<TimerHandler<C>> {
        self.handlers.get(kind).copied()
    }
}

impl<C> Default for TimerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_due_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(0, 10, "B", Serial(2), "");
        q.schedule(0, 5, "A", Serial(1), "");
        q.schedule(0, 20, "C", Serial(3), "");

        assert!(q.take_due(4).is_empty());
        let due = q.take_due(10);
        let kinds: Vec<&str> = due.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(kinds, vec!["A", "B"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_same_deadline_keeps_schedule_order() {
        let mut q = TimerQueue::new();
        let first = q.schedule(3, 2, "X", Serial(1), "");
        let second = q.schedule(4, 1, "X", Serial(2), "");
        let due = q.take_due(5);
        assert_eq!(due[0].id, first);
        assert_eq!(due[1].id, second);
    }

    #[test]
    fn test_cancel() {
        let mut q = TimerQueue::new();
        let id = q.schedule(0, 5, "A", Serial(1), "");
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
        assert!(q.take_due(100).is_empty());
    }

    #[test]
    fn test_cancel_matching() {
        let mut q = TimerQueue::new();
        q.schedule(0, 5, "RemovePlayer", Serial(1), "");
        q.schedule(0, 6, "RemovePlayer", Serial(2), "");
        q.schedule(0, 7, "WorldSave", Serial(1), "");
        assert_eq!(q.cancel_matching("RemovePlayer", Serial(1)), 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_restore_continues_ids() {
        let mut q = TimerQueue::new();
        q.schedule(0, 5, "A", Serial(1), "p");
        q.schedule(0, 9, "B", Serial(1), "");
        let mut restored = TimerQueue::restore(q.snapshot());
        assert_eq!(restored.snapshot(), q.snapshot());
        let id = restored.schedule(0, 1, "C", Serial(1), "");
        assert_eq!(id, TimerId(3));
    }

    #[test]
    fn test_registry_dispatch() {
        fn bump(count: &mut u32, timer: &Timer) {
            *count += timer.subject.0;
        }
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        registry.register("Bump", bump);

        let mut q = TimerQueue::new();
        q.schedule(0, 1, "Bump", Serial(7), "");
        let mut count = 0u32;
        for t in q.take_due(1) {
            if let Some(handler) = registry.get(&t.kind) {
                handler(&mut count, &t);
            }
        }
        assert_eq!(count, 7);
        assert!(registry.get("Missing").is_none());
    }
}
