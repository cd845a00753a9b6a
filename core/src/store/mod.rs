mod entry;
mod table;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::node_id::{NodeId, LOCAL_NAMESPACE, MULTIPLICATIVE_STEP};
use crossbeam_epoch as epoch;
use entry::Entry;
use std::sync::atomic::{AtomicU32, Ordering};
use table::Table;

/// A live reference to a node held out of the store. The entry behind a
/// handle cannot be freed while the handle exists - `release`ing it is the
/// caller's responsibility, mirroring the acquire/release node access
/// pattern of the concurrent store this design follows.
pub struct Handle<'s> {
    #[allow(dead_code)]
    store: &'s NodeStore,
    entry: *const Entry,
}

impl<'s> Handle<'s> {
    pub fn node(&self) -> &Node {
        unsafe { &(*self.entry).node }
    }

    pub fn node_id(&self) -> &NodeId {
        unsafe { &(*self.entry).key }
    }
}

impl<'s> Drop for Handle<'s> {
    fn drop(&mut self) {
        let entry = unsafe { &*self.entry };
        if entry.release() {
            // A concurrent `find` may have already loaded this same pointer
            // and not yet taken its own refcount on it; free it only once
            // the epoch guard pinned here says no such reader can still be
            // mid-traversal, exactly like `Table::remove`/`replace` do.
            let ptr = self.entry;
            let guard = epoch::pin();
            unsafe {
                guard.defer_unchecked(move || {
                    drop(Box::from_raw(ptr as *mut Entry));
                });
            }
        }
    }
}

/// Lock-free, concurrently readable and writable address-space node table.
///
/// Readers call [`NodeStore::get`] and receive a [`Handle`] that keeps the
/// underlying entry alive until dropped; writers call
/// [`NodeStore::insert`]/[`replace`](NodeStore::replace)/[`remove`] which
/// take effect immediately for subsequent `get`s but never block a reader
/// that is already mid-traversal. See the table and entry modules for the
/// reclamation protocol this relies on.
pub struct NodeStore {
    table: Table,
    next_numeric: AtomicU32,
}

impl NodeStore {
    pub fn new() -> NodeStore {
        NodeStore {
            table: Table::new(),
            next_numeric: AtomicU32::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Insert `node` under `node.node_id`, or - if that id is
    /// [`NodeId::is_null`] - synthesize a fresh numeric id in
    /// [`LOCAL_NAMESPACE`] and store under that instead. Fails with
    /// [`Error::NodeIdExists`] if a non-null id already names a live entry.
    ///
    /// Pass `want_handle = true` to get a pre-acquired [`Handle`] back -
    /// the only way to learn a synthesized id, since a null insert doesn't
    /// otherwise hand the assigned id back to the caller. `want_handle =
    /// false` returns `None` and never takes the extra refcount.
    pub fn insert(&self, node: Node, want_handle: bool) -> Result<Option<Handle<'_>>> {
        if node.node_id.is_null() {
            return self.insert_synthesized(node, want_handle);
        }

        let node_id = node.node_id.clone();
        let hash = node_id.bucket_hash();
        let boxed = Box::new(Entry::new(node_id.clone(), node, want_handle));
        let guard = epoch::pin();
        match self
            .table
            .insert(hash, boxed, |existing| existing.key == node_id, &guard)
        {
            Ok(entry) => Ok(want_handle.then(|| Handle { store: self, entry })),
            Err(_) => Err(Error::NodeIdExists),
        }
    }

    fn insert_synthesized(&self, mut node: Node, want_handle: bool) -> Result<Option<Handle<'_>>> {
        let guard = epoch::pin();
        // Start from a monotonically advancing counter and step by the
        // table's multiplicative constant on collision, exactly as the
        // reference null-id synthesis does: a plain increment would cluster
        // ids in one bucket far longer than the stepped sequence does.
        let mut candidate = self.next_numeric.fetch_add(1, Ordering::Relaxed);
        loop {
            if candidate == 0 {
                candidate = candidate.wrapping_add(MULTIPLICATIVE_STEP);
                continue;
            }
            let id = NodeId::numeric(LOCAL_NAMESPACE, candidate);
            node.node_id = id.clone();
            let hash = id.bucket_hash();
            let boxed = Box::new(Entry::new(id.clone(), node, want_handle));
            match self
                .table
                .insert(hash, boxed, |existing| existing.key == id, &guard)
            {
                Ok(entry) => return Ok(want_handle.then(|| Handle { store: self, entry })),
                Err(rejected) => {
                    node = rejected.node;
                    candidate = candidate.wrapping_add(MULTIPLICATIVE_STEP);
                }
            }
        }
    }

    /// Atomically swap the entry at `node.node_id` for `node`, as a single
    /// CAS on the chain slot rather than an unlink followed by an insert -
    /// a concurrent `get` never observes a gap where the id is unreachable,
    /// and two racing replacements can never both land. Fails with
    /// [`Error::NodeIdUnknown`] if no live entry exists for that id.
    ///
    /// Pass `want_handle = true` to get a pre-acquired [`Handle`] to the new
    /// entry back.
    pub fn replace(&self, node: Node, want_handle: bool) -> Result<Option<Handle<'_>>> {
        let node_id = node.node_id.clone();
        let hash = node_id.bucket_hash();
        let boxed = Box::new(Entry::new(node_id.clone(), node, want_handle));
        let guard = epoch::pin();
        match self
            .table
            .replace(hash, |existing| existing.key == node_id, boxed, &guard)
        {
            Ok(entry) => Ok(want_handle.then(|| Handle { store: self, entry })),
            Err(_) => Err(Error::NodeIdUnknown),
        }
    }

    /// Remove the entry at `node_id`. Fails with [`Error::NodeIdUnknown`] if
    /// no live entry exists for it.
    pub fn remove(&self, node_id: &NodeId) -> Result<()> {
        let guard = epoch::pin();
        if self.remove_inner(node_id, &guard) {
            Ok(())
        } else {
            Err(Error::NodeIdUnknown)
        }
    }

    fn remove_inner(&self, node_id: &NodeId, guard: &epoch::Guard) -> bool {
        let hash = node_id.bucket_hash();
        self.table
            .remove(hash, |existing| &existing.key == node_id, guard)
    }

    /// Acquire a reader handle for `node_id`. Returns `None` if no live
    /// entry exists.
    pub fn get(&self, node_id: &NodeId) -> Option<Handle<'_>> {
        let hash = node_id.bucket_hash();
        let guard = epoch::pin();
        let entry = self
            .table
            .find(hash, |existing| &existing.key == node_id, &guard)?;
        Some(Handle {
            store: self,
            entry: entry as *const Entry,
        })
    }

    /// Visit every live node. Weakly consistent: a concurrent insert,
    /// replace, or remove may or may not be reflected in a given call,
    /// depending on its timing relative to the walk.
    pub fn iterate(&self, mut f: impl FnMut(&NodeId, &Node)) {
        let guard = epoch::pin();
        self.table.for_each(&guard, |entry| f(&entry.key, &entry.node));
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        NodeStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeClass;
    use std::sync::Arc;
    use std::thread;

    fn node(id: NodeId, payload: &[u8]) -> Node {
        Node::new(id, NodeClass::Variable, payload.to_vec())
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let store = NodeStore::new();
        let id = NodeId::numeric(2, 7);
        store.insert(node(id.clone(), b"hello"), false).unwrap();

        let handle = store.get(&id).expect("entry should be present");
        assert_eq!(handle.node().payload, b"hello");
    }

    #[test]
    fn insert_duplicate_non_null_id_fails() {
        let store = NodeStore::new();
        let id = NodeId::numeric(2, 7);
        store.insert(node(id.clone(), b"a"), false).unwrap();
        let err = store.insert(node(id, b"b"), false).unwrap_err();
        assert!(matches!(err, Error::NodeIdExists));
    }

    #[test]
    fn null_id_is_synthesized_in_local_namespace() {
        let store = NodeStore::new();
        let handle = store
            .insert(node(NodeId::null(), b"x"), true)
            .unwrap()
            .expect("want_handle requested");
        let assigned = handle.node_id();
        assert_eq!(assigned.namespace_index, LOCAL_NAMESPACE);
        assert!(!assigned.is_null());
    }

    #[test]
    fn insert_without_want_handle_returns_none() {
        let store = NodeStore::new();
        let handle = store.insert(node(NodeId::numeric(2, 1), b"x"), false).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn remove_then_get_returns_none() {
        let store = NodeStore::new();
        let id = NodeId::numeric(1, 1);
        store.insert(node(id.clone(), b"x"), false).unwrap();
        store.remove(&id).unwrap();
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn remove_unknown_id_fails() {
        let store = NodeStore::new();
        let err = store.remove(&NodeId::numeric(9, 9)).unwrap_err();
        assert!(matches!(err, Error::NodeIdUnknown));
    }

    #[test]
    fn replace_swaps_payload_in_place() {
        let store = NodeStore::new();
        let id = NodeId::numeric(1, 1);
        store.insert(node(id.clone(), b"old"), false).unwrap();
        store.replace(node(id.clone(), b"new"), false).unwrap();
        let handle = store.get(&id).unwrap();
        assert_eq!(handle.node().payload, b"new");
    }

    #[test]
    fn replace_unknown_id_fails() {
        let store = NodeStore::new();
        let err = store
            .replace(node(NodeId::numeric(9, 9), b"new"), false)
            .unwrap_err();
        assert!(matches!(err, Error::NodeIdUnknown));
    }

    #[test]
    fn replace_can_hand_back_a_handle_to_the_new_entry() {
        let store = NodeStore::new();
        let id = NodeId::numeric(1, 1);
        store.insert(node(id.clone(), b"old"), false).unwrap();
        let handle = store
            .replace(node(id.clone(), b"new"), true)
            .unwrap()
            .expect("want_handle requested");
        assert_eq!(handle.node().payload, b"new");
    }

    #[test]
    fn handle_keeps_entry_alive_past_a_concurrent_remove() {
        let store = NodeStore::new();
        let id = NodeId::numeric(1, 1);
        store.insert(node(id.clone(), b"kept"), false).unwrap();

        let handle = store.get(&id).unwrap();
        store.remove(&id).unwrap();
        // The entry is unreachable from the table now, but this handle was
        // acquired before the remove and must still observe the old payload.
        assert_eq!(handle.node().payload, b"kept");
    }

    #[test]
    fn iterate_visits_every_inserted_entry() {
        let store = NodeStore::new();
        for i in 0..50u32 {
            store.insert(node(NodeId::numeric(3, i), b"v"), false).unwrap();
        }
        let mut seen = 0;
        store.iterate(|_, _| seen += 1);
        assert_eq!(seen, 50);
    }

    #[test]
    fn concurrent_inserts_across_threads_all_land() {
        let store = Arc::new(NodeStore::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..200u32 {
                    let id = NodeId::numeric(4, t * 1000 + i);
                    store.insert(node(id, b"v"), false).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8 * 200);
    }

    #[test]
    fn concurrent_insert_and_remove_leave_store_consistent() {
        let store = Arc::new(NodeStore::new());
        for i in 0..100u32 {
            store.insert(node(NodeId::numeric(5, i), b"v"), false).unwrap();
        }

        let remover = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100u32 {
                    let _ = store.remove(&NodeId::numeric(5, i));
                }
            })
        };
        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..1000 {
                    for i in 0..100u32 {
                        let _ = store.get(&NodeId::numeric(5, i));
                    }
                }
            })
        };

        remover.join().unwrap();
        reader.join().unwrap();
        assert_eq!(store.len(), 0);
    }
}
