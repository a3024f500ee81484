//! Single-partner lock and time-bounded blacklist
//!
//! Only the state machine mutates these. Time is passed in explicitly so the
//! expiry rules can be exercised without sleeping.

use crate::types::PeerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Recently abandoned peers, each with its insertion time
#[derive(Debug, Clone)]
pub struct Blacklist {
    ttl: Duration,
    entries: HashMap<PeerId, Instant>,
}

impl Blacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh an entry
    pub fn insert(&mut self, peer_id: &str, now: Instant) {
        self.entries.insert(peer_id.to_string(), now);
    }

    /// Whether the peer is still avoided; an expired entry is dropped on the way
    pub fn contains(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.entries.get(peer_id) {
            Some(inserted) if now.duration_since(*inserted) < self.ttl => true,
            Some(_) => {
                self.entries.remove(peer_id);
                false
            }
            None => false,
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, inserted| now.duration_since(*inserted) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holder of the one peer we are committed to, plus the blacklist
#[derive(Debug, Clone)]
pub struct LockManager {
    current: Option<PeerId>,
    blacklist: Blacklist,
}

impl LockManager {
    pub fn new(blacklist_ttl: Duration) -> Self {
        Self {
            current: None,
            blacklist: Blacklist::new(blacklist_ttl),
        }
    }

    /// Lock on `peer_id` if nothing is locked and the peer is not blacklisted
    pub fn try_lock(&mut self, peer_id: &str, now: Instant) -> bool {
        if self.current.is_some() || self.blacklist.contains(peer_id, now) {
            return false;
        }
        self.current = Some(peer_id.to_string());
        true
    }

    pub fn is_locked_on(&self, peer_id: &str) -> bool {
        self.current.as_deref() == Some(peer_id)
    }

    pub fn is_locked(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    /// Clear the lock unconditionally, returning the former partner
    pub fn release_lock(&mut self) -> Option<PeerId> {
        self.current.take()
    }

    pub fn blacklist(&mut self, peer_id: &str, now: Instant) {
        debug!("Blacklisting peer {}", peer_id);
        self.blacklist.insert(peer_id, now);
    }

    pub fn is_blacklisted(&mut self, peer_id: &str, now: Instant) -> bool {
        self.blacklist.contains(peer_id, now)
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        self.blacklist.sweep(now)
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}
