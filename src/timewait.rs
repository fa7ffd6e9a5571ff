//! Component F: the Time-Wait List interface. After a connection is torn
//! down, its connection ID is kept around just long enough to answer late
//! packets with a canned reply instead of silently dropping them or, worse,
//! routing them into a freshly allocated session.
//!
//! Only the narrow contract the dispatcher needs is defined here — the full
//! `QuicTimeWaitListManager` (per-packet rate limiting, public-reset packet
//! construction details, etc.) is out of scope.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use cid::ConnectionId;

/// What the dispatcher should do with a packet addressed to a connection ID
/// that's in time-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWaitAction {
    /// Reply with a stateless reset (the connection ID was live recently
    /// enough that a reset token was issued for it).
    SendStatelessReset,
    /// Reply with a cached CONNECTION_CLOSE packet.
    SendConnectionClose,
    /// Drop the packet silently (e.g. it's itself a stateless reset, or the
    /// time-wait entry has no reply configured).
    Ignore,
}

/// The dispatcher-facing time-wait contract (spec.md §6).
pub trait TimeWaitList {
    fn is_in_time_wait(&self, id: &ConnectionId) -> bool;
    fn add_to_time_wait(&mut self, id: ConnectionId, action: TimeWaitAction, now: Instant);
    fn action_for(&self, id: &ConnectionId) -> Option<TimeWaitAction>;
    fn on_expiration_timeout(&mut self, now: Instant);
}

/// A bounded, LRU-evicting in-memory implementation, sufficient for a
/// single-process dispatcher.
pub struct InMemoryTimeWaitList {
    entries: FnvHashMap<ConnectionId, (TimeWaitAction, Instant)>,
    order: VecDeque<ConnectionId>,
    capacity: usize,
    ttl: Duration,
}

impl InMemoryTimeWaitList {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        InMemoryTimeWaitList {
            entries: FnvHashMap::default(),
            order: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.entries.remove(&oldest);
        }
    }
}

impl TimeWaitList for InMemoryTimeWaitList {
    fn is_in_time_wait(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    fn add_to_time_wait(&mut self, id: ConnectionId, action: TimeWaitAction, now: Instant) {
        if !self.entries.contains_key(&id) {
            if self.order.len() >= self.capacity {
                self.evict_lru();
            }
            self.order.push_back(id);
        }
        self.entries.insert(id, (action, now));
    }

    fn action_for(&self, id: &ConnectionId) -> Option<TimeWaitAction> {
        self.entries.get(id).map(|&(action, _)| action)
    }

    fn on_expiration_timeout(&mut self, now: Instant) {
        while let Some(&id) = self.order.front() {
            let expired = match self.entries.get(&id) {
                Some(&(_, added_at)) => added_at + self.ttl <= now,
                None => true,
            };
            if !expired {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_is_not_in_time_wait() {
        let list = InMemoryTimeWaitList::new(4, Duration::from_secs(1));
        let id = ConnectionId::new(&[1, 2, 3, 4]);
        assert!(!list.is_in_time_wait(&id));
    }

    #[test]
    fn added_id_reports_its_action() {
        let mut list = InMemoryTimeWaitList::new(4, Duration::from_secs(1));
        let id = ConnectionId::new(&[1, 2, 3, 4]);
        let now = Instant::now();
        list.add_to_time_wait(id, TimeWaitAction::SendStatelessReset, now);
        assert!(list.is_in_time_wait(&id));
        assert_eq!(list.action_for(&id), Some(TimeWaitAction::SendStatelessReset));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut list = InMemoryTimeWaitList::new(2, Duration::from_secs(100));
        let now = Instant::now();
        let a = ConnectionId::new(&[1; 4]);
        let b = ConnectionId::new(&[2; 4]);
        let c = ConnectionId::new(&[3; 4]);
        list.add_to_time_wait(a, TimeWaitAction::Ignore, now);
        list.add_to_time_wait(b, TimeWaitAction::Ignore, now);
        list.add_to_time_wait(c, TimeWaitAction::Ignore, now);
        assert!(!list.is_in_time_wait(&a));
        assert!(list.is_in_time_wait(&b));
        assert!(list.is_in_time_wait(&c));
    }

    #[test]
    fn expiration_sweep_drops_old_entries() {
        let mut list = InMemoryTimeWaitList::new(4, Duration::from_millis(50));
        let t0 = Instant::now();
        let id = ConnectionId::new(&[1; 4]);
        list.add_to_time_wait(id, TimeWaitAction::Ignore, t0);
        list.on_expiration_timeout(t0 + Duration::from_millis(60));
        assert!(!list.is_in_time_wait(&id));
    }
}
