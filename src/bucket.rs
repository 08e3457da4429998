//! Wheel bucket: an intrusive doubly-linked list of timeout handles.
//!
//! The [`Timeout`] itself is the list node, so placing and removing handles
//! costs no allocation. Buckets are owned by the worker and touched by no
//! other thread, which is what lets every operation here run without locks.
//!
//! # Ownership
//!
//! Each linked node holds exactly one `Arc` strong count, consumed by
//! [`Bucket::add`] and returned by the unlink operations. A node's
//! `bucket` back-reference is `Some` iff the node is linked; the asserts
//! below keep that bijection honest.
//!
//! # Safety
//!
//! All raw-pointer traffic goes through [`Timeout::links`], whose contract
//! (worker thread only, one scoped borrow at a time) every method here
//! upholds: each `links()` borrow is confined to a single statement or
//! block, and nodes are alive for as long as the bucket holds their strong
//! count.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::timeout::Timeout;

pub(crate) struct Bucket {
    head: Option<NonNull<Timeout>>,
    tail: Option<NonNull<Timeout>>,
}

impl Bucket {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Append `timeout` to the tail. O(1).
    ///
    /// Takes ownership of one strong count and stamps the slot
    /// back-reference.
    ///
    /// # Panics
    ///
    /// If the handle is already linked into a bucket.
    pub(crate) fn add(&mut self, timeout: Arc<Timeout>, slot: u32) {
        let node = match NonNull::new(Arc::into_raw(timeout).cast_mut()) {
            Some(node) => node,
            None => unreachable!("Arc::into_raw never returns null"),
        };

        // SAFETY: worker thread; the node is alive (we hold its strong
        // count) and each links() borrow below is scoped to one block.
        unsafe {
            {
                let links = node.as_ref().links();
                assert!(links.bucket.is_none(), "timeout already linked into a bucket");
                assert!(links.prev.is_none());
                assert!(links.next.is_none());
                links.bucket = Some(slot);
            }

            match self.tail {
                None => {
                    assert!(self.head.is_none());
                    self.head = Some(node);
                    self.tail = Some(node);
                }
                Some(tail) => {
                    tail.as_ref().links().next = Some(node);
                    node.as_ref().links().prev = Some(tail);
                    self.tail = Some(node);
                }
            }
        }
    }

    /// Unlink `node` without touching the pending counter.
    ///
    /// Returns the owned handle and the successor link, so a caller walking
    /// the list is not invalidated by the removal. Used directly for
    /// CANCELLED handles, whose pending decrement is owed to the
    /// cancellation-queue drain; everything else goes through
    /// [`Bucket::remove`].
    pub(crate) fn unlink(
        &mut self,
        node: NonNull<Timeout>,
    ) -> (Arc<Timeout>, Option<NonNull<Timeout>>) {
        // SAFETY: worker thread; node is linked into this bucket, hence
        // alive via the strong count taken in `add`.
        unsafe {
            let (prev, next) = {
                let links = node.as_ref().links();
                assert!(links.bucket.is_some(), "unlinking a node that is not linked");
                (links.prev, links.next)
            };

            match prev {
                Some(prev) => prev.as_ref().links().next = next,
                None => {
                    assert_eq!(self.head, Some(node));
                    self.head = next;
                }
            }
            match next {
                Some(next) => next.as_ref().links().prev = prev,
                None => {
                    assert_eq!(self.tail, Some(node));
                    self.tail = prev;
                }
            }

            {
                let links = node.as_ref().links();
                links.prev = None;
                links.next = None;
                links.bucket = None;
            }

            (Arc::from_raw(node.as_ptr()), next)
        }
    }

    /// Unlink `node` and settle its pending-count debt. O(1).
    pub(crate) fn remove(
        &mut self,
        node: NonNull<Timeout>,
        pending: &AtomicU64,
    ) -> (Arc<Timeout>, Option<NonNull<Timeout>>) {
        let out = self.unlink(node);
        pending.fetch_sub(1, Ordering::Relaxed);
        out
    }

    /// Expire every due handle in this bucket for the given tick deadline.
    ///
    /// Walks the list once. Handles with rounds remaining are decremented
    /// and left in place; due handles are removed and fired; handles that
    /// lost a cancel race are unlinked (their decrement happens in the
    /// cancellation drain).
    pub(crate) fn expire(&mut self, deadline: i64, pending: &AtomicU64) {
        let mut cur = self.head;

        while let Some(node) = cur {
            // SAFETY: worker thread; node is linked, hence alive.
            let rounds = unsafe { node.as_ref().links().remaining_rounds };

            if rounds <= 0 {
                let (timeout, next) = self.remove(node, pending);
                assert!(
                    timeout.deadline <= deadline,
                    "wheel misprogrammed: handle deadline {} beyond tick deadline {}",
                    timeout.deadline,
                    deadline,
                );
                timeout.expire();
                cur = next;
            } else if unsafe { node.as_ref() }.is_cancelled() {
                let (_cancelled, next) = self.unlink(node);
                cur = next;
            } else {
                // SAFETY: as above; borrows are scoped per statement.
                unsafe {
                    node.as_ref().links().remaining_rounds -= 1;
                    cur = node.as_ref().links().next;
                }
            }
        }
    }

    /// Drain every node, collecting non-terminal handles into `sink`.
    ///
    /// Terminal (expired or cancelled) handles are dropped here; their
    /// pending accounting was, or will be, settled elsewhere.
    pub(crate) fn drain_into(&mut self, sink: &mut Vec<Arc<Timeout>>) {
        while let Some(node) = self.head {
            let (timeout, _) = self.unlink(node);
            if !timeout.is_expired() && !timeout.is_cancelled() {
                sink.push(timeout);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            n += 1;
            assert!(n <= 1 << 20, "cycle detected in bucket list");
            cur = unsafe { node.as_ref().links().next };
        }
        n
    }

    /// Panic if the doubly-linked structure is inconsistent. Test builds only.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self, slot: u32) {
        if self.head.is_none() {
            assert!(self.tail.is_none(), "head None but tail Some");
            return;
        }
        assert!(self.tail.is_some());

        let mut cur = self.head;
        let mut prev: Option<NonNull<Timeout>> = None;
        let mut visited = 0usize;

        while let Some(node) = cur {
            visited += 1;
            assert!(visited <= 1 << 20, "cycle detected in bucket list");

            // SAFETY: test runs single-threaded as "the worker".
            unsafe {
                let links = node.as_ref().links();
                assert_eq!(links.bucket, Some(slot), "stale bucket back-reference");
                assert_eq!(links.prev, prev, "broken prev link");
                prev = cur;
                cur = links.next;
            }
        }

        assert_eq!(prev, self.tail, "tail is not the last node");
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // Release the strong counts of anything still linked so a bucket
        // dropped mid-teardown cannot leak its handles.
        while let Some(node) = self.head {
            let _ = self.unlink(node);
        }
    }
}

// Property-based tests live in the sibling module bucket_tests.rs.
#[cfg(all(test, not(loom), feature = "timer-proptest"))]
#[path = "bucket_tests.rs"]
mod bucket_tests;
