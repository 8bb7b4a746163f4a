//! Pending-job queue
//!
//! In deferred mode, block loads, saves and syncs are not performed
//! inline. The block is queued with a job kind and an external loop
//! drains the queue in FIFO order, performs the I/O and reports each
//! completion to a [`CompletionSink`].
//!
//! A block carries at most one job. Queuing it again for the same kind
//! merges with the pending job; a different kind is a conflict.

use crate::arena::BlockId;
use crate::block::{BlockRef, JobState};
use std::collections::VecDeque;
use strata_common::{Error, JobKind, PhysicalAddress, Result};

/// Outcome of one executed job
#[derive(Debug)]
pub struct JobCompletion {
    pub block: BlockId,
    pub addr: PhysicalAddress,
    pub kind: JobKind,
    pub status: Result<()>,
}

/// Receiver of job completions
pub trait CompletionSink {
    fn notify(&mut self, completion: JobCompletion);
}

impl<F> CompletionSink for F
where
    F: FnMut(JobCompletion),
{
    fn notify(&mut self, completion: JobCompletion) {
        self(completion);
    }
}

/// FIFO of blocks with a queued job
#[derive(Debug, Default)]
pub struct PendingJobQueue {
    queue: VecDeque<BlockId>,
}

impl PendingJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `kind` on `block`; the queue takes a reference on it
    ///
    /// Returns false when an identical job is already queued.
    pub fn push(&mut self, id: BlockId, block: &mut BlockRef, kind: JobKind) -> Result<bool> {
        if block.slaved {
            return Err(Error::internal(format!(
                "block {} has a job in flight",
                block.addr
            )));
        }
        match block.job {
            JobState::Queued(queued) if queued == kind => Ok(false),
            JobState::Queued(queued) => Err(Error::JobConflict {
                lba: block.addr.lba,
                queued,
                requested: kind,
            }),
            JobState::Idle => {
                block.job = JobState::Queued(kind);
                block.refcnt += 1;
                self.queue.push_back(id);
                Ok(true)
            }
        }
    }

    /// Next block to execute
    pub fn pop(&mut self) -> Option<BlockId> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.queue.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let mut queue = PendingJobQueue::new();
        let mut a = BlockRef::new(PhysicalAddress::block(130));
        let mut b = BlockRef::new(PhysicalAddress::block(131));

        assert!(queue.push(BlockId::from(0), &mut a, JobKind::Write).unwrap());
        assert!(queue.push(BlockId::from(1), &mut b, JobKind::Read).unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(a.job, JobState::Queued(JobKind::Write));
        assert_eq!(a.refcnt, 1);

        assert_eq!(queue.pop(), Some(BlockId::from(0)));
        assert_eq!(queue.pop(), Some(BlockId::from(1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_requeue_same_kind_merges() {
        let mut queue = PendingJobQueue::new();
        let mut block = BlockRef::new(PhysicalAddress::block(130));
        let id = BlockId::from(0);

        assert!(queue.push(id, &mut block, JobKind::Write).unwrap());
        assert!(!queue.push(id, &mut block, JobKind::Write).unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(block.refcnt, 1);
    }

    #[test]
    fn test_requeue_different_kind_rejected() {
        let mut queue = PendingJobQueue::new();
        let mut block = BlockRef::new(PhysicalAddress::block(130));
        let id = BlockId::from(0);

        queue.push(id, &mut block, JobKind::Read).unwrap();
        let err = queue.push(id, &mut block, JobKind::Sync).unwrap_err();
        assert!(matches!(
            err,
            Error::JobConflict {
                lba: 130,
                queued: JobKind::Read,
                requested: JobKind::Sync
            }
        ));
        // State untouched
        assert_eq!(block.job, JobState::Queued(JobKind::Read));
        assert_eq!(block.refcnt, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_in_flight_block_rejected() {
        let mut queue = PendingJobQueue::new();
        let mut block = BlockRef::new(PhysicalAddress::block(130));
        block.slaved = true;
        assert!(queue.push(BlockId::from(0), &mut block, JobKind::Write).is_err());
        assert!(queue.is_empty());
        assert!(!queue.contains(BlockId::from(0)));
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        let mut sink = |c: JobCompletion| seen.push(c.kind);
        sink.notify(JobCompletion {
            block: BlockId::from(0),
            addr: PhysicalAddress::block(130),
            kind: JobKind::Sync,
            status: Ok(()),
        });
        assert_eq!(seen, vec![JobKind::Sync]);
    }
}
