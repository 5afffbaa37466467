//! Registry of live sessions, used for broadcast and the staggered
//! per-tick health sweep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{NetState, SessionLimits};
use crate::core::Clock;
use crate::game::Tick;
use crate::protocol::ServerPacket;

pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<NetState>>,
    next_id: AtomicU64,
    /// Number of update groups, one per tick of a logical second
    groups: u64,
}

impl SessionRegistry {
    pub fn new(ticks_per_second: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            groups: ticks_per_second.max(1),
        }
    }

    /// Creates a session with a random update group and registers it.
    pub fn open(
        self: &Arc<Self>,
        peer: SocketAddr,
        clock: Clock,
        limits: SessionLimits,
    ) -> (Arc<NetState>, mpsc::Receiver<ServerPacket>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let group = rand::random_range(0..self.groups);
        let (session, rx) = NetState::new(id, peer, group, clock, limits, Arc::downgrade(self));
        self.sessions.insert(id, session.clone());
        tracing::debug!("[registry] [insert] id={} peer={} group={}", id, peer, group);
        (session, rx)
    }

    pub fn remove(&self, id: u64) -> Option<Arc<NetState>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn get(&self, id: u64) -> Option<Arc<NetState>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // Callers may disconnect (and so remove) sessions, which would deadlock
    // against a live shard guard.
    fn snapshot(&self) -> Vec<Arc<NetState>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Calls `f` for every session until it returns false.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<NetState>) -> bool,
    {
        for session in self.snapshot() {
            if !f(&session) {
                break;
            }
        }
    }

    /// Queues `packet` on every session. Returns how many accepted it.
    pub fn broadcast(&self, packet: &ServerPacket) -> usize {
        let mut sent = 0;
        self.range(|s| {
            if s.send(packet.clone()) {
                sent += 1;
            }
            true
        });
        sent
    }

    /// Runs the health sweep for the group due at `now`, so every session
    /// is checked once per logical second.
    pub fn update(&self, now: Tick) {
        let group = now % self.groups;
        let due: Vec<Arc<NetState>> = self
            .sessions
            .iter()
            .filter(|e| e.value().group() == group)
            .map(|e| e.value().clone())
            .collect();
        for session in due {
            session.update(now);
        }
    }

    pub fn disconnect_all(&self, reason: &str) {
        for session in self.snapshot() {
            session.disconnect(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SessionLimits {
        SessionLimits {
            login_idle: 5,
            game_idle: 50,
            target_timeout: 10,
            action_delay: 2,
            outbound_depth: 4,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_open_and_disconnect_removes() {
        let registry = Arc::new(SessionRegistry::new(10));
        let (a, _rx_a) = registry.open(peer(), Clock::new(), limits());
        let (b, _rx_b) = registry.open(peer(), Clock::new(), limits());
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        a.disconnect("test");
        assert_eq!(registry.len(), 1);
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get(b.id()).is_some());
    }

    #[test]
    fn test_range_stops_early() {
        let registry = Arc::new(SessionRegistry::new(10));
        let mut receivers = Vec::new();
        for _ in 0..5 {
            receivers.push(registry.open(peer(), Clock::new(), limits()).1);
        }
        let mut visited = 0;
        registry.range(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let registry = Arc::new(SessionRegistry::new(10));
        let (_a, mut rx_a) = registry.open(peer(), Clock::new(), limits());
        let (_b, mut rx_b) = registry.open(peer(), Clock::new(), limits());

        assert_eq!(registry.broadcast(&ServerPacket::Light { level: 0 }), 2);
        assert_eq!(rx_a.try_recv().unwrap(), ServerPacket::Light { level: 0 });
        assert_eq!(rx_b.try_recv().unwrap(), ServerPacket::Light { level: 0 });
    }

    #[test]
    fn test_update_visits_each_session_once_per_second() {
        let clock = Clock::new();
        let registry = Arc::new(SessionRegistry::new(10));
        let mut sessions = Vec::new();
        for _ in 0..30 {
            sessions.push(registry.open(peer(), clock.clone(), limits()));
        }

        // Nothing refreshed the deadlines (login idle = 5), so every
        // session idles out the first time its group comes up after tick 5.
        for now in 6..16 {
            clock.set(now);
            registry.update(now);
        }
        assert!(registry.is_empty());
        assert!(sessions.iter().all(|(s, _)| s.is_disconnected()));
    }

    #[test]
    fn test_update_only_touches_due_group() {
        let clock = Clock::new();
        let registry = Arc::new(SessionRegistry::new(10));
        let mut sessions = Vec::new();
        for _ in 0..20 {
            sessions.push(registry.open(peer(), clock.clone(), limits()));
        }

        clock.set(100);
        registry.update(100);
        for (s, _) in &sessions {
            assert_eq!(s.is_disconnected(), s.group() == 0);
        }
    }
}
