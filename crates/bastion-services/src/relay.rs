//! Pending relay negotiations.
//!
//! A relay download is asynchronous: the server forwards the requester's
//! details to the file owner and the owner answers later, in its own time,
//! on its own connection. The owner's reply names no request, so replies
//! are matched to requests in FIFO order per owner — the oldest pending
//! request is the one being answered. Keyed per owner, several owners can
//! negotiate concurrently without touching each other's queues.

use std::collections::VecDeque;

use dashmap::DashMap;

/// One outstanding relay request awaiting the owner's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelay {
    pub requester: String,
    /// Wire name of the requested file, `<owner>_<seq>`.
    pub filename: String,
}

/// Outstanding relay requests, keyed by the owner who must answer them.
#[derive(Default)]
pub struct PendingRelays {
    by_owner: DashMap<String, VecDeque<PendingRelay>>,
}

impl PendingRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request forwarded to `owner`.
    pub fn push(&self, owner: &str, pending: PendingRelay) {
        self.by_owner
            .entry(owner.to_string())
            .or_default()
            .push_back(pending);
    }

    /// Take the oldest pending request for `owner` — the one its next
    /// reply answers. None if the owner has nothing outstanding.
    pub fn pop(&self, owner: &str) -> Option<PendingRelay> {
        let mut queue = self.by_owner.get_mut(owner)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            drop(queue);
            self.by_owner.remove_if(owner, |_, q| q.is_empty());
        }
        pending
    }

    /// Drop every request waiting on `owner`, returning them so the
    /// requesters can be told the negotiation died with the owner.
    pub fn drain_owner(&self, owner: &str) -> Vec<PendingRelay> {
        match self.by_owner.remove(owner) {
            Some((_, queue)) => queue.into(),
            None => Vec::new(),
        }
    }

    pub fn outstanding_for(&self, owner: &str) -> usize {
        self.by_owner.get(owner).map(|q| q.len()).unwrap_or(0)
    }
}
