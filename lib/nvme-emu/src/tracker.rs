// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking of in-flight Command Identifiers.

use std::collections::{BTreeMap, BTreeSet};

use crate::queue::QueueId;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    #[error("command {cid} is not in flight on SQ {sqid}")]
    NotInFlight { sqid: QueueId, cid: u16 },
}

/// Per Submission Queue sets of command identifiers which have been fetched
/// but not yet completed.
#[derive(Debug, Default)]
pub struct CidTracker {
    inflight: BTreeMap<QueueId, BTreeSet<u16>>,
}

impl CidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty set for a newly created Submission Queue.
    pub fn add_queue(&mut self, sqid: QueueId) {
        self.inflight.entry(sqid).or_default();
    }

    /// Forget everything in flight on a deleted Submission Queue.
    pub fn remove_queue(&mut self, sqid: QueueId) {
        self.inflight.remove(&sqid);
    }

    /// Mark `cid` as in flight on `sqid`.
    ///
    /// Returns false, leaving the existing entry alone, if another command
    /// with the same identifier is already in flight on that queue.
    pub fn track(&mut self, sqid: QueueId, cid: u16) -> bool {
        self.inflight.entry(sqid).or_default().insert(cid)
    }

    /// Remove `cid` from the in-flight set of `sqid`.
    pub fn untrack(
        &mut self,
        sqid: QueueId,
        cid: u16,
    ) -> Result<(), TrackerError> {
        match self.inflight.get_mut(&sqid).map(|set| set.remove(&cid)) {
            Some(true) => Ok(()),
            _ => Err(TrackerError::NotInFlight { sqid, cid }),
        }
    }

    pub fn is_tracked(&self, sqid: QueueId, cid: u16) -> bool {
        self.inflight.get(&sqid).is_some_and(|set| set.contains(&cid))
    }

    /// Number of commands in flight on `sqid`.
    pub fn inflight(&self, sqid: QueueId) -> usize {
        self.inflight.get(&sqid).map_or(0, BTreeSet::len)
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_cid_per_queue() {
        let mut tracker = CidTracker::new();
        tracker.add_queue(0);
        assert!(tracker.track(0, 5));
        assert!(!tracker.track(0, 5));

        // The same CID on another queue is unrelated
        assert!(tracker.track(1, 5));
        assert_eq!(tracker.inflight(0), 1);

        assert_eq!(tracker.untrack(0, 5), Ok(()));
        assert!(tracker.track(0, 5));
    }

    #[test]
    fn untracked_completion_rejected() {
        let mut tracker = CidTracker::new();
        assert_eq!(
            tracker.untrack(3, 1),
            Err(TrackerError::NotInFlight { sqid: 3, cid: 1 })
        );
        assert!(tracker.track(3, 1));
        tracker.remove_queue(3);
        assert!(!tracker.is_tracked(3, 1));
        assert!(tracker.untrack(3, 1).is_err());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut tracker = CidTracker::new();
        for cid in 0..16 {
            assert!(tracker.track(0, cid));
            assert!(tracker.track(2, cid));
        }
        tracker.clear();
        assert_eq!(tracker.inflight(0), 0);
        assert_eq!(tracker.inflight(2), 0);
    }
}
