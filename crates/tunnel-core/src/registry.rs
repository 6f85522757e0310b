use std::{
    collections::HashMap,
    net::TcpStream,
    sync::{
        Arc, Mutex,
        atomic::AtomicBool,
    },
};

/// One virtual connection's registry entry: the peer socket plus the flag
/// its [`crate::pipe::Pipe`] uses to guarantee at-most-once CLOSE emission.
/// The flag is shared with the `Pipe` so that whichever side learns of
/// teardown first — the pipe's own reader/writer loop, or an inbound CLOSE
/// frame handled by a session's frame-dispatch loop — can mark it before
/// the other side notices, suppressing the echo.
pub struct VcEntry {
    pub socket: TcpStream,
    pub closed: Arc<AtomicBool>,
}

/// id → peer-socket map for one session's virtual connections.
///
/// Guarded by a single mutex across insert/get/remove, per spec §4.4. The
/// registry owns a socket handle from insertion until removal; callers MUST
/// close the socket they get back from `remove`/`snapshot` outside the lock
/// (this type never calls into the network while the mutex is held).
#[derive(Default)]
pub struct VcRegistry {
    inner: Mutex<HashMap<u32, VcEntry>>,
}

impl VcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects (returns `false`) if `id` is already present. `closed` is the
    /// same flag the VC's `Pipe` was (or will be) spawned with.
    pub fn insert(&self, id: u32, socket: TcpStream, closed: Arc<AtomicBool>) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, VcEntry { socket, closed });
        true
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&id)
    }

    /// Returns an independent handle to the same underlying socket so the
    /// caller can write/shut it down without holding the registry lock.
    pub fn get_clone(&self, id: u32) -> Option<TcpStream> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&id).and_then(|entry| entry.socket.try_clone().ok())
    }

    pub fn remove(&self, id: u32) -> Option<VcEntry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    /// Drains the whole registry for teardown; sockets are returned to the
    /// caller to close outside the lock.
    pub fn snapshot_and_clear(&self) -> Vec<(u32, VcEntry)> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn insert_rejects_duplicate_id_and_remove_is_single_delivery() {
        let registry = VcRegistry::new();
        let (a, _a_peer) = socket_pair();
        let (b, _b_peer) = socket_pair();

        assert!(registry.insert(1, a, flag()));
        assert!(!registry.insert(1, b, flag()));
        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn snapshot_and_clear_drains_everything() {
        let registry = VcRegistry::new();
        let (a, _a_peer) = socket_pair();
        let (b, _b_peer) = socket_pair();
        registry.insert(1, a, flag());
        registry.insert(2, b, flag());

        let drained = registry.snapshot_and_clear();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_returns_the_same_closed_flag_the_entry_was_inserted_with() {
        let registry = VcRegistry::new();
        let (a, _a_peer) = socket_pair();
        let closed = flag();
        registry.insert(1, a, Arc::clone(&closed));

        let entry = registry.remove(1).unwrap();
        assert!(Arc::ptr_eq(&entry.closed, &closed));
    }
}
