//! Arena-indexed session storage (Design Note, answering spec.md §9's "how
//! should the dispatcher hold onto sessions" question): a `slab::Slab` plus
//! a newtype handle, the same shape as the teacher's
//! `Slab<Connection>`/`ConnectionHandle(usize)` pair, generalized so this
//! crate doesn't need to know what a session actually does.

use fnv::FnvHashMap;
use slab::Slab;

use cid::ConnectionId;

/// Opaque index into a `Dispatcher`'s session arena. Cheap to copy and pass
/// around instead of a reference, the way `ConnectionHandle` is in the
/// teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(usize);

impl SessionHandle {
    fn from_slab_key(key: usize) -> Self {
        SessionHandle(key)
    }

    fn slab_key(self) -> usize {
        self.0
    }
}

/// What a dispatcher needs from a session to manage its lifecycle. This
/// crate only implements the dispatch *front end* (spec.md §1); the actual
/// per-connection protocol state machine this trait stands in for — stream
/// multiplexing, flow control, loss recovery, the post-handshake TLS state —
/// is an external collaborator's responsibility.
pub trait Session {
    /// Connection ID this session is currently reachable under. May change
    /// over the session's lifetime (e.g. after `NEW_CONNECTION_ID`), which
    /// is why the dispatcher keeps its own id-to-handle map rather than
    /// trusting a session to be immutable.
    fn connection_id(&self) -> ConnectionId;

    /// Whether the session considers itself finished and safe to reap.
    fn is_closed(&self) -> bool;
}

/// A factory the dispatcher uses to create a `Session` once a connection has
/// a complete, admitted CHLO. Kept as a trait so this crate doesn't pull in
/// a concrete TLS/congestion-control implementation.
pub trait SessionFactory<S: Session> {
    fn create(&mut self, dst_cid: ConnectionId, src_cid: ConnectionId) -> S;
}

/// Arena of live sessions plus the connection-ID index the dispatcher routes
/// packets through, and a queue of handles pending asynchronous teardown
/// (spec.md §4.G's `closed_sessions_pending_delete`).
pub struct SessionArena<S: Session> {
    slab: Slab<S>,
    by_cid: FnvHashMap<ConnectionId, SessionHandle>,
    closed_pending_delete: Vec<SessionHandle>,
}

impl<S: Session> SessionArena<S> {
    pub fn new() -> Self {
        SessionArena {
            slab: Slab::new(),
            by_cid: FnvHashMap::default(),
            closed_pending_delete: Vec::new(),
        }
    }

    pub fn insert(&mut self, cid: ConnectionId, session: S) -> SessionHandle {
        let key = self.slab.insert(session);
        let handle = SessionHandle::from_slab_key(key);
        self.by_cid.insert(cid, handle);
        handle
    }

    /// Adds an additional connection ID that should route to an
    /// already-existing session (e.g. after a `NEW_CONNECTION_ID` frame).
    pub fn alias(&mut self, cid: ConnectionId, handle: SessionHandle) {
        self.by_cid.insert(cid, handle);
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<SessionHandle> {
        self.by_cid.get(cid).copied()
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&S> {
        self.slab.get(handle.slab_key())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut S> {
        self.slab.get_mut(handle.slab_key())
    }

    /// Marks `handle` for deletion on the next `reap` instead of removing it
    /// immediately, mirroring the teacher's deferred-cleanup pattern so
    /// in-flight iteration over the arena doesn't observe a hole mid-pass.
    pub fn queue_for_deletion(&mut self, handle: SessionHandle) {
        self.closed_pending_delete.push(handle);
    }

    /// Removes every session queued by `queue_for_deletion`, dropping their
    /// connection-ID aliases too.
    pub fn reap(&mut self) {
        for handle in self.closed_pending_delete.drain(..) {
            if self.slab.contains(handle.slab_key()) {
                self.slab.remove(handle.slab_key());
            }
            self.by_cid.retain(|_, v| *v != handle);
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

impl<S: Session> Default for SessionArena<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSession {
        id: ConnectionId,
        closed: bool,
    }

    impl Session for TestSession {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }
        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[test]
    fn insert_then_lookup() {
        let mut arena = SessionArena::new();
        let id = ConnectionId::new(&[1, 2, 3, 4]);
        let handle = arena.insert(id, TestSession { id, closed: false });
        assert_eq!(arena.lookup(&id), Some(handle));
        assert_eq!(arena.get(handle).unwrap().connection_id(), id);
    }

    #[test]
    fn queued_deletion_removes_on_reap_not_before() {
        let mut arena = SessionArena::new();
        let id = ConnectionId::new(&[9, 9, 9, 9]);
        let handle = arena.insert(id, TestSession { id, closed: true });
        arena.queue_for_deletion(handle);
        assert!(arena.get(handle).is_some());
        arena.reap();
        assert!(arena.get(handle).is_none());
        assert_eq!(arena.lookup(&id), None);
    }

    #[test]
    fn alias_routes_second_cid_to_same_handle() {
        let mut arena = SessionArena::new();
        let id = ConnectionId::new(&[1; 4]);
        let alt = ConnectionId::new(&[2; 4]);
        let handle = arena.insert(id, TestSession { id, closed: false });
        arena.alias(alt, handle);
        assert_eq!(arena.lookup(&alt), Some(handle));
    }
}
