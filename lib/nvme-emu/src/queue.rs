// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Submission and Completion Queue rings in host memory.
//!
//! Queues are owned exclusively by the controller engine, which is only ever
//! driven from the doorbell worker, so the ring state needs no locking of
//! its own.

use std::collections::BTreeSet;
use std::mem::size_of;

use crate::bits::{CompletionQueueEntry, SubmissionQueueEntry};
use crate::common::*;
use crate::mem::HostMem;

use thiserror::Error;

/// Each queue is identified by a 16-bit ID.
///
/// See NVMe 1.0e Section 4.1.4 Queue Identifier
pub type QueueId = u16;

/// The minimum number of entries in either a Completion or Submission Queue.
///
/// Note: One entry will always be unavailable for use due to the Head and Tail
///       entry pointer definitions.
/// See NVMe 1.0e Section 4.1.3 Queue Size
pub const MIN_QUEUE_SIZE: u32 = 2;

/// The maximum number of entries in either a Completion or Submission Queue.
///
/// See NVMe 1.0e Section 4.1.3 Queue Size
pub const MAX_QUEUE_SIZE: u32 = 1 << 16;

/// The maximum number of entries in the Admin Completion or Admin Submission
/// Queues.
pub const MAX_ADMIN_QUEUE_SIZE: u32 = 1 << 12;

/// The Admin Completion and Submission are defined to have ID 0.
///
/// See NVMe 1.0e Section 1.6.1 Admin Queue
pub const ADMIN_QUEUE_ID: QueueId = 0;

/// Completion Queue State
#[derive(Debug)]
struct CompQueueState {
    /// The Queue Tail entry pointer: the next slot the controller fills.
    tail: u16,

    /// The position last published through the CQ head doorbell.
    head: u16,

    /// The current phase tag.
    ///
    /// Identifies new entries to the host. Flips every time the Tail entry
    /// pointer wraps around.
    ///
    /// See NVMe 1.0e Section 4.5 Completion Queue Entry - Phase Tag (P)
    phase: bool,
}

/// Submission Queue State
#[derive(Debug)]
struct SubQueueState {
    /// The Queue Head entry pointer: the next entry the controller fetches.
    head: u16,

    /// The Queue Tail entry pointer, as last accepted from the doorbell.
    tail: u16,
}

/// Helper for manipulating Completion/Submission Queue ring pointers.
///
/// The type parameter `QS` constrains the set of methods exposed based on
/// whether the queue in question is a Completion or Submission queue.
#[derive(Debug)]
struct QueueState<QS> {
    /// The size of the queue in question.
    size: u32,

    inner: QS,
}

impl<QS> QueueState<QS> {
    /// A queue is empty when the Head entry pointer equals the Tail entry
    /// pointer.
    ///
    /// See: NVMe 1.0e Section 4.1.1 Empty Queue
    fn is_empty(&self, head: u16, tail: u16) -> bool {
        head == tail
    }

    /// Helper method to calculate a positive offset for a given index,
    /// wrapping at the size of the queue.
    fn wrap_add(&self, idx: u16, off: u16) -> u16 {
        debug_assert!((idx as u32) < self.size);
        debug_assert!((off as u32) < self.size);

        let res = idx as u32 + off as u32;
        if res >= self.size {
            (res - self.size) as u16
        } else {
            res as u16
        }
    }

    /// Helper method to calculate a negative offset for a given index,
    /// wrapping at the size of the queue.
    fn wrap_sub(&self, idx: u16, off: u16) -> u16 {
        debug_assert!((idx as u32) < self.size);
        debug_assert!((off as u32) < self.size);

        if off > idx {
            ((idx as u32 + self.size) - off as u32) as u16
        } else {
            idx - off
        }
    }
}

impl QueueState<CompQueueState> {
    fn new_completion_state(size: u32) -> Self {
        // As the device side, we start with our phase tag asserted (1) since
        // the host creates all Completion Queue entries with it zeroed.
        let inner = CompQueueState { tail: 0, head: 0, phase: true };
        Self { size, inner }
    }

    /// Return the Tail entry pointer and the phase to post with, then move
    /// the tail forward by 1, flipping the phase if it wraps.
    fn push_tail(&mut self) -> (u16, bool) {
        let old = (self.inner.tail, self.inner.phase);
        if self.inner.tail as u32 + 1 >= self.size {
            // We wrapped so flip phase
            self.inner.phase = !self.inner.phase;
        }
        self.inner.tail = self.wrap_add(self.inner.tail, 1);
        old
    }
}

impl QueueState<SubQueueState> {
    fn new_submission_state(size: u32) -> Self {
        Self { size, inner: SubQueueState { head: 0, tail: 0 } }
    }

    /// Return the Head entry pointer and then move it forward by 1, or
    /// [`None`] if the queue is empty.
    fn pop_head(&mut self) -> Option<u16> {
        if self.is_empty(self.inner.head, self.inner.tail) {
            return None;
        }
        let old_head = self.inner.head;
        self.inner.head = self.wrap_add(old_head, 1);
        Some(old_head)
    }

    /// How many slots are empty between the tail and the head i.e., how many
    /// entries the host can currently add.
    fn avail_empty(&self) -> u16 {
        let (head, tail) = (self.inner.head, self.inner.tail);
        self.wrap_sub(self.wrap_sub(head, 1), tail)
    }

    /// Attempt to move the Tail entry pointer forward to the given index.
    ///
    /// The index must be less than the size of the queue, and the queue must
    /// have enough empty slots for the entries it implies.
    fn push_tail_to(&mut self, idx: u16) -> Result<(), QueueUpdateError> {
        if idx as u32 >= self.size {
            return Err(QueueUpdateError::InvalidEntry);
        }
        let push_count = self.wrap_sub(idx, self.inner.tail);
        if push_count > self.avail_empty() {
            return Err(QueueUpdateError::TooManyEntries);
        }
        self.inner.tail = idx;
        Ok(())
    }
}

/// Errors that may be encountered during Queue creation.
#[derive(Error, Debug)]
pub enum QueueCreateErr {
    /// The specified base address is invalid.
    #[error("invalid base address")]
    InvalidBaseAddr,

    /// The specified length is invalid.
    #[error("invalid size")]
    InvalidSize,

    #[error("the queue ID {0} is already in use")]
    QueueIdAlreadyExists(QueueId),
}

/// Errors that may be encountered while adjusting Queue head/tail pointers.
#[derive(Error, Debug)]
pub enum QueueUpdateError {
    #[error("tried to move head or tail pointer to an invalid index")]
    InvalidEntry,

    #[error(
        "tried to push or pop too many entries given the current head/tail"
    )]
    TooManyEntries,
}

/// Validates whether the given parameters may be used to create a queue of
/// `size` entries of `entry_size` bytes.
fn validate(
    base: HostAddr,
    size: u32,
    max: u32,
    entry_size: usize,
    mem: &HostMem,
) -> Result<(), QueueCreateErr> {
    if (base.0 & PAGE_OFFSET as u64) != 0 {
        return Err(QueueCreateErr::InvalidBaseAddr);
    }
    if size < MIN_QUEUE_SIZE || size > max.min(MAX_QUEUE_SIZE) {
        return Err(QueueCreateErr::InvalidSize);
    }
    let queue_size = size as usize * entry_size;
    match mem.covers(&HostRegion(base, queue_size)) {
        true => Ok(()),
        false => Err(QueueCreateErr::InvalidBaseAddr),
    }
}

/// A Submission Queue.
#[derive(Debug)]
pub struct SubQueue {
    id: QueueId,

    /// The Completion Queue this queue posts to.
    cqid: QueueId,

    state: QueueState<SubQueueState>,

    /// The [`HostAddr`] at which the Queue is mapped.
    base: HostAddr,
}

impl SubQueue {
    /// Create a Submission Queue object backed by the host memory at the
    /// given base address, holding at most `max` entries.
    pub fn new(
        id: QueueId,
        cqid: QueueId,
        size: u32,
        max: u32,
        base: HostAddr,
        mem: &HostMem,
    ) -> Result<Self, QueueCreateErr> {
        validate(base, size, max, size_of::<SubmissionQueueEntry>(), mem)?;
        Ok(Self {
            id,
            cqid,
            state: QueueState::new_submission_state(size),
            base,
        })
    }

    /// Attempt to move the Tail entry pointer forward to the given index.
    pub fn notify_tail(&mut self, idx: u16) -> Result<(), QueueUpdateError> {
        self.state.push_tail_to(idx)
    }

    /// Returns the command at the head and advances the head, or [`None`]
    /// if there is nothing left to fetch.
    pub fn fetch_next(
        &mut self,
        mem: &HostMem,
    ) -> Option<SubmissionQueueEntry> {
        let idx = self.state.pop_head()?;
        mem.read(self.entry_addr(idx))
    }

    /// Returns the current Head entry pointer.
    pub fn current_head(&self) -> u16 {
        self.state.inner.head
    }

    /// Returns the current Tail entry pointer.
    pub fn current_tail(&self) -> u16 {
        self.state.inner.tail
    }

    /// Number of entries between the head and the tail.
    pub fn pending(&self) -> u16 {
        self.state.wrap_sub(self.state.inner.tail, self.state.inner.head)
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn cqid(&self) -> QueueId {
        self.cqid
    }

    pub fn size(&self) -> u32 {
        self.state.size
    }

    pub fn base(&self) -> HostAddr {
        self.base
    }

    fn entry_addr(&self, idx: u16) -> HostAddr {
        self.base.offset::<SubmissionQueueEntry>(idx as usize)
    }
}

/// A Completion Queue.
#[derive(Debug)]
pub struct CompQueue {
    id: QueueId,

    state: QueueState<CompQueueState>,

    /// The [`HostAddr`] at which the Queue is mapped.
    base: HostAddr,

    /// Submission Queues which post to this queue.
    sqs: BTreeSet<QueueId>,
}

impl CompQueue {
    /// Create a Completion Queue object backed by the host memory at the
    /// given base address, holding at most `max` entries.
    pub fn new(
        id: QueueId,
        size: u32,
        max: u32,
        base: HostAddr,
        mem: &HostMem,
    ) -> Result<Self, QueueCreateErr> {
        validate(base, size, max, size_of::<CompletionQueueEntry>(), mem)?;
        Ok(Self {
            id,
            state: QueueState::new_completion_state(size),
            base,
            sqs: BTreeSet::new(),
        })
    }

    /// Write `entry` at the tail with the current phase tag and advance the
    /// tail. Returns the new tail.
    pub fn post_entry(
        &mut self,
        mut entry: CompletionQueueEntry,
        mem: &HostMem,
    ) -> Option<u16> {
        let (idx, phase) = self.state.push_tail();
        entry.set_phase(phase);
        if !mem.write(self.entry_addr(idx), &entry) {
            return None;
        }
        Some(self.state.inner.tail)
    }

    /// Record the head position published to the host.
    pub fn publish_head(&mut self, head: u16) {
        self.state.inner.head = head;
    }

    /// Link a Submission Queue to this Completion Queue.
    pub fn add_sq(&mut self, sqid: QueueId) -> Result<(), QueueCreateErr> {
        match self.sqs.insert(sqid) {
            true => Ok(()),
            false => Err(QueueCreateErr::QueueIdAlreadyExists(sqid)),
        }
    }

    pub fn remove_sq(&mut self, sqid: QueueId) {
        self.sqs.remove(&sqid);
    }

    /// Returns the number of SQs associated with this Completion Queue.
    pub fn associated_sqs(&self) -> usize {
        self.sqs.len()
    }

    pub fn current_head(&self) -> u16 {
        self.state.inner.head
    }

    pub fn current_tail(&self) -> u16 {
        self.state.inner.tail
    }

    /// The phase tag the next posted entry will carry.
    pub fn phase(&self) -> bool {
        self.state.inner.phase
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.state.size
    }

    pub fn base(&self) -> HostAddr {
        self.base
    }

    fn entry_addr(&self, idx: u16) -> HostAddr {
        self.base.offset::<CompletionQueueEntry>(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::cmds::Completion;

    use std::io::Error;
    use std::thread::spawn;

    const SQ_BASE: HostAddr = HostAddr(0x10_0000);
    const CQ_BASE: HostAddr = HostAddr(0x20_0000);

    fn mem() -> HostMem {
        HostMem::new(4 * 1024 * 1024)
    }

    #[test]
    fn create_cqs() -> Result<(), Error> {
        let mem = mem();

        // Admin queues must be at most 4K entries
        let cq = CompQueue::new(
            ADMIN_QUEUE_ID,
            1024,
            MAX_ADMIN_QUEUE_SIZE,
            CQ_BASE,
            &mem,
        );
        assert!(matches!(cq, Ok(_)));
        let cq = CompQueue::new(
            ADMIN_QUEUE_ID,
            5 * 1024,
            MAX_ADMIN_QUEUE_SIZE,
            CQ_BASE,
            &mem,
        );
        assert!(matches!(cq, Err(QueueCreateErr::InvalidSize)));

        // I/O queues are bounded by the advertised maximum
        let cq = CompQueue::new(1, 1024, 1024, CQ_BASE, &mem);
        assert!(matches!(cq, Ok(_)));
        let cq = CompQueue::new(1, 1025, 1024, CQ_BASE, &mem);
        assert!(matches!(cq, Err(QueueCreateErr::InvalidSize)));

        // Neither may be less than 2
        let cq = CompQueue::new(1, 1, MAX_QUEUE_SIZE, CQ_BASE, &mem);
        assert!(matches!(cq, Err(QueueCreateErr::InvalidSize)));

        // Base must be page aligned and within host memory
        let cq = CompQueue::new(1, 2, MAX_QUEUE_SIZE, CQ_BASE + 8, &mem);
        assert!(matches!(cq, Err(QueueCreateErr::InvalidBaseAddr)));
        let cq =
            CompQueue::new(1, 2, MAX_QUEUE_SIZE, HostAddr(1 << 40), &mem);
        assert!(matches!(cq, Err(QueueCreateErr::InvalidBaseAddr)));

        Ok(())
    }

    #[test]
    fn create_sqs() -> Result<(), Error> {
        let mem = mem();

        let sq = SubQueue::new(1, 1, 4096, MAX_QUEUE_SIZE, SQ_BASE, &mem);
        assert!(matches!(sq, Ok(_)));

        // 64K entries of 64 bytes would overrun host memory
        let sq = SubQueue::new(
            1,
            1,
            MAX_QUEUE_SIZE,
            MAX_QUEUE_SIZE,
            SQ_BASE,
            &mem,
        );
        assert!(matches!(sq, Err(QueueCreateErr::InvalidBaseAddr)));

        let sq = SubQueue::new(1, 1, 1, MAX_QUEUE_SIZE, SQ_BASE, &mem);
        assert!(matches!(sq, Err(QueueCreateErr::InvalidSize)));

        Ok(())
    }

    #[test]
    fn sq_association() -> Result<(), Error> {
        let mem = mem();
        let mut cq = CompQueue::new(1, 4, 4, CQ_BASE, &mem).unwrap();
        assert!(cq.add_sq(1).is_ok());
        assert!(cq.add_sq(2).is_ok());
        assert!(matches!(
            cq.add_sq(2),
            Err(QueueCreateErr::QueueIdAlreadyExists(2))
        ));
        assert_eq!(cq.associated_sqs(), 2);
        cq.remove_sq(1);
        cq.remove_sq(2);
        assert_eq!(cq.associated_sqs(), 0);
        Ok(())
    }

    #[test]
    fn push_failures() -> Result<(), Error> {
        let mem = mem();
        let mut sq = SubQueue::new(1, 1, 4, 4, SQ_BASE, &mem).unwrap();

        // Replicate the host notifying us things were pushed to the SQ
        let mut sq_tail = 0;
        for _ in 0..sq.size() - 1 {
            sq_tail = sq.state.wrap_add(sq_tail, 1);
            // These should all succeed
            assert!(matches!(sq.notify_tail(sq_tail), Ok(_)));
        }
        assert_eq!(sq.pending(), 3);

        // But anything more should fail
        sq_tail = sq.state.wrap_add(sq_tail, 1);
        assert!(matches!(
            sq.notify_tail(sq_tail),
            Err(QueueUpdateError::TooManyEntries)
        ));

        // Also anything that falls outside the boundaries
        assert!(matches!(
            sq.notify_tail(sq.size() as u16),
            Err(QueueUpdateError::InvalidEntry)
        ));

        // Draining makes room again
        let mut fetched = 0;
        while sq.fetch_next(&mem).is_some() {
            fetched += 1;
        }
        assert_eq!(fetched, 3);
        assert_eq!(sq.current_head(), sq.current_tail());
        assert!(matches!(sq.notify_tail(0), Ok(_)));

        Ok(())
    }

    #[test]
    fn fetch_in_ring_order() -> Result<(), Error> {
        let mem = mem();
        let mut sq = SubQueue::new(1, 1, 4, 4, SQ_BASE, &mem).unwrap();
        for cid in 0..3u16 {
            let sqe = SubmissionQueueEntry::new(0x2, cid);
            let addr = SQ_BASE.offset::<SubmissionQueueEntry>(cid as usize);
            assert!(mem.write(addr, &sqe));
        }
        sq.notify_tail(3).unwrap();
        for cid in 0..3u16 {
            let sqe = sq.fetch_next(&mem).unwrap();
            assert_eq!(sqe.cid(), cid);
        }
        assert!(sq.fetch_next(&mem).is_none());
        Ok(())
    }

    #[test]
    fn cq_phase_wrap() -> Result<(), Error> {
        let mem = mem();
        let depth = 4u32;
        let mut cq = CompQueue::new(1, depth, depth, CQ_BASE, &mem).unwrap();
        let initial = cq.phase();
        assert!(initial);

        for i in 0..depth {
            let cqe =
                CompletionQueueEntry::new(Completion::success(), i as u16);
            let tail = cq.post_entry(cqe, &mem).unwrap();
            assert_eq!(tail as u32, (i + 1) % depth);

            // Entries from the first lap carry the initial phase
            let posted: CompletionQueueEntry = mem
                .read(CQ_BASE.offset::<CompletionQueueEntry>(i as usize))
                .unwrap();
            assert_eq!(posted.phase(), initial);
            assert_eq!({ posted.cid }, i as u16);
        }
        assert_eq!(cq.current_tail(), 0);
        assert_eq!(cq.phase(), !initial);

        // A second lap restores it
        for _ in 0..depth {
            cq.post_entry(CompletionQueueEntry::default(), &mem).unwrap();
        }
        assert_eq!(cq.current_tail(), 0);
        assert_eq!(cq.phase(), initial);

        Ok(())
    }

    #[test]
    fn push_pop() -> Result<(), Error> {
        // A host thread rings the doorbell with random batch sizes while the
        // controller side drains whatever becomes visible.
        let mut rng = rand::thread_rng();
        let size: u32 = rng.gen_range(16..256);
        let total: u32 = rng.gen_range(size..4 * size);

        let mem = std::sync::Arc::new(mem());
        let mut sq = SubQueue::new(1, 1, size, size, SQ_BASE, &mem).unwrap();

        let (doorbell_tx, doorbell_rx) = crossbeam_channel::bounded::<u16>(0);
        let (consumed_tx, consumed_rx) = crossbeam_channel::unbounded::<u16>();

        let host_mem = mem.clone();
        let host = spawn(move || {
            let mut tail = 0u16;
            let mut head = 0u16;
            let mut sent = 0u32;
            while sent < total {
                // Only ever fill up to one less than the queue size
                let used = (tail as u32 + size - head as u32) % size;
                let room = size - 1 - used;
                if room == 0 {
                    head = consumed_rx.recv().unwrap();
                    continue;
                }
                let batch = room.min(total - sent);
                for _ in 0..batch {
                    let sqe = SubmissionQueueEntry::new(0x2, sent as u16);
                    let addr =
                        SQ_BASE.offset::<SubmissionQueueEntry>(tail as usize);
                    assert!(host_mem.write(addr, &sqe));
                    tail = ((tail as u32 + 1) % size) as u16;
                    sent += 1;
                }
                doorbell_tx.send(tail).unwrap();
                if let Ok(h) = consumed_rx.try_recv() {
                    head = h;
                }
            }
        });

        let mut expected = 0u32;
        for tail in doorbell_rx.iter() {
            assert!(matches!(sq.notify_tail(tail), Ok(_)));
            while let Some(sqe) = sq.fetch_next(&mem) {
                assert_eq!(sqe.cid(), expected as u16);
                expected += 1;
            }
            // The host may already have finished and hung up
            let _ = consumed_tx.send(sq.current_head());
        }
        host.join().unwrap();
        assert_eq!(expected, total);

        Ok(())
    }
}
