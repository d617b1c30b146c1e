//! Causality tags and version stamps.
//!
//! Every local transaction is stamped with a [`CausalityTag`]
//! `(replica_id, counter)`. Tags from one replica are totally ordered by
//! counter; tags from different replicas are only partially ordered.
//!
//! A [`VersionStamp`] extends the tag with the information needed to order
//! writes across replicas:
//!
//! - `timestamp`: a hybrid wall clock, strictly increasing per replica and
//!   never below any timestamp the replica has observed
//! - `observed`: the service cursor the writer had applied when it wrote
//! - `commit_seq`: the global sequence the service assigned on commit
//!
//! Concurrent writes are ordered by [`VersionStamp::priority`]:
//! `(timestamp, replica_id, counter)` compared lexicographically. Because
//! the hybrid clock only moves forward across observed writes, a stamp that
//! causally precedes another always has the lower priority.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of one replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Wraps a replica identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Causal relation between two writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// The left write happened before the right one.
    Before,
    /// The left write happened after the right one.
    After,
    /// Both sides are the same write.
    Equal,
    /// Neither write knew about the other.
    Concurrent,
}

impl Causality {
    /// Returns the relation seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            Causality::Before => Causality::After,
            Causality::After => Causality::Before,
            other => other,
        }
    }
}

/// `(replica_id, counter)` pair identifying one local transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CausalityTag {
    /// Replica that produced the write.
    pub replica_id: ReplicaId,
    /// Logical counter, strictly increasing per replica.
    pub counter: u64,
}

impl CausalityTag {
    /// Creates a tag.
    pub fn new(replica_id: impl Into<ReplicaId>, counter: u64) -> Self {
        Self {
            replica_id: replica_id.into(),
            counter,
        }
    }

    /// Compares two tags using only what the tags themselves know.
    ///
    /// Tags from the same replica are ordered by counter. Tags from
    /// different replicas are always [`Causality::Concurrent`].
    pub fn compare(&self, other: &CausalityTag) -> Causality {
        if self.replica_id != other.replica_id {
            return Causality::Concurrent;
        }
        match self.counter.cmp(&other.counter) {
            Ordering::Less => Causality::Before,
            Ordering::Greater => Causality::After,
            Ordering::Equal => Causality::Equal,
        }
    }
}

impl fmt::Display for CausalityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.replica_id, self.counter)
    }
}

/// Version metadata attached to every column write and tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Causality tag of the writing transaction.
    pub tag: CausalityTag,
    /// Hybrid wall clock in milliseconds.
    pub timestamp: u64,
    /// Service cursor the writer had applied when it wrote.
    pub observed: u64,
    /// Global sequence assigned by the service, once known.
    pub commit_seq: Option<u64>,
}

impl VersionStamp {
    /// Creates a stamp that has not been committed by the service yet.
    pub fn new(tag: CausalityTag, timestamp: u64, observed: u64) -> Self {
        Self {
            tag,
            timestamp,
            observed,
            commit_seq: None,
        }
    }

    /// Sets the service-assigned global sequence.
    pub fn with_commit_seq(mut self, commit_seq: u64) -> Self {
        self.commit_seq = Some(commit_seq);
        self
    }

    /// Compares two stamps, using the service's global sequence where the
    /// tags alone cannot decide.
    ///
    /// `a` is `Before` `b` when `b`'s writer had already applied `a`
    /// (`a.commit_seq <= b.observed`).
    pub fn causality(&self, other: &VersionStamp) -> Causality {
        let by_tag = self.tag.compare(&other.tag);
        if by_tag != Causality::Concurrent {
            return by_tag;
        }
        if let Some(seq) = self.commit_seq {
            if seq > 0 && seq <= other.observed {
                return Causality::Before;
            }
        }
        if let Some(seq) = other.commit_seq {
            if seq > 0 && seq <= self.observed {
                return Causality::After;
            }
        }
        Causality::Concurrent
    }

    /// Total merge priority: `(timestamp, replica_id, counter)`.
    pub fn priority(&self) -> (u64, &str, u64) {
        (self.timestamp, self.tag.replica_id.as_str(), self.tag.counter)
    }

    /// Returns true if this stamp wins a last-writer-wins contest
    /// against `other`.
    pub fn beats(&self, other: &VersionStamp) -> bool {
        self.priority() > other.priority()
    }
}
