use crate::node::Node;
use crate::node_id::NodeId;
use std::sync::atomic::{AtomicU16, Ordering};

/// High bit of the 16-bit control word: set while the entry is reachable
/// from the table, cleared exactly once by `markDead` and never set again.
pub(crate) const ALIVE_BIT: u16 = 1 << 15;
const REFCOUNT_MASK: u16 = !ALIVE_BIT;

/// Maximum concurrent outstanding reader handles per entry. Exceeding this
/// is a caller bug (not a concurrency bound across distinct entries).
pub const MAX_REFCOUNT: u16 = REFCOUNT_MASK;

/// The stable allocation a [`Handle`](super::Handle) points to. `Entry` never
/// moves once published: its address *is* its identity for as long as any
/// handle or table linkage keeps it alive.
///
/// `ctrl` packs the alive bit and the 15-bit reader count into one atomic
/// word, per the reclamation protocol in the node store's design notes: a
/// plain `fetch_add`/`fetch_sub` on the whole word correctly moves only the
/// low 15 bits as long as the count never reaches `MAX_REFCOUNT`, and
/// `mark_dead` clears the high bit without disturbing an in-flight count.
pub struct Entry {
    pub key: NodeId,
    pub node: Node,
    ctrl: AtomicU16,
}

impl Entry {
    pub(crate) fn new(key: NodeId, node: Node, initial_handle: bool) -> Entry {
        let ctrl = ALIVE_BIT | if initial_handle { 1 } else { 0 };
        Entry {
            key,
            node,
            ctrl: AtomicU16::new(ctrl),
        }
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.ctrl.load(Ordering::Acquire) & ALIVE_BIT != 0
    }

    /// Attempt to take out a reader handle. Fails (returns `false`) once the
    /// alive bit has been cleared, regardless of how the caller found this
    /// entry - a benign lock-free race can hand a reader a pointer to an
    /// entry that has just been unlinked but not yet had `mark_dead` run.
    #[inline]
    pub(crate) fn try_acquire(&self) -> bool {
        loop {
            let cur = self.ctrl.load(Ordering::Acquire);
            if cur & ALIVE_BIT == 0 {
                return false;
            }
            debug_assert!(
                cur & REFCOUNT_MASK < MAX_REFCOUNT,
                "refcount overflow on a single NodeStore entry"
            );
            let next = cur + 1;
            if self
                .ctrl
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a reader handle. Returns `true` if the entry is now freeable
    /// (alive bit clear and no remaining readers) and the caller - the last
    /// `release` to observe that state - must free it.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        loop {
            let cur = self.ctrl.load(Ordering::Acquire);
            debug_assert!(cur & REFCOUNT_MASK > 0, "release on a zero refcount entry");
            let next = cur - 1;
            if self
                .ctrl
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next == 0;
            }
        }
    }

    /// Clear the alive bit. Returns `true` if the entry is now freeable (no
    /// outstanding reader handles) and the caller must free it.
    #[inline]
    pub(crate) fn mark_dead(&self) -> bool {
        loop {
            let cur = self.ctrl.load(Ordering::Acquire);
            debug_assert!(cur & ALIVE_BIT != 0, "mark_dead run twice on one entry");
            let next = cur & REFCOUNT_MASK;
            if self
                .ctrl
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeClass;

    fn entry(initial_handle: bool) -> Entry {
        Entry::new(
            NodeId::numeric(1, 1),
            Node::new(NodeId::numeric(1, 1), NodeClass::Variable, vec![]),
            initial_handle,
        )
    }

    #[test]
    fn fresh_entry_without_handle_is_alive_and_unreferenced() {
        let e = entry(false);
        assert!(e.is_alive());
        assert_eq!(e.ctrl.load(Ordering::SeqCst), ALIVE_BIT);
    }

    #[test]
    fn acquire_then_release_frees_only_after_dead() {
        let e = entry(false);
        assert!(e.try_acquire());
        assert!(!e.release(), "still alive, must not report freeable");

        assert!(e.try_acquire());
        assert!(!e.mark_dead(), "one outstanding reader, not freeable yet");
        assert!(e.release(), "last reader gone, now freeable");
    }

    #[test]
    fn mark_dead_with_no_readers_is_immediately_freeable() {
        let e = entry(false);
        assert!(e.mark_dead());
    }

    #[test]
    fn acquire_fails_once_dead() {
        let e = entry(false);
        assert!(e.mark_dead());
        assert!(!e.try_acquire());
    }
}
