//! The persistent run queue. Items live under `queue.run.<seq>` with
//! monotonic sequence numbers; `queue.head`/`queue.tail` bound the live
//! window. Sequence numbering starts high enough that promise-queue splices,
//! which insert *before* the current head, never underflow.

use std::collections::VecDeque;

use ocapd_common::message::RunQueueItem;
use ocapd_storage::{KernelTx, StoreError};

/// First sequence number of a fresh queue, leaving splice room below.
pub const QUEUE_BASE: u64 = 1 << 32;

#[derive(Debug)]
pub struct RunQueue {
    head: u64,
    tail: u64,
    items: VecDeque<(u64, RunQueueItem)>,
}

impl Default for RunQueue {
    fn default() -> Self {
        RunQueue::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue {
            head: QUEUE_BASE,
            tail: QUEUE_BASE,
            items: VecDeque::new(),
        }
    }

    /// Rebuilds the queue from recovered cursors and items. Items must fall
    /// inside `[head, tail)`; gaps from mid-queue removals are fine.
    pub fn from_parts(
        head: u64,
        tail: u64,
        mut items: Vec<(u64, RunQueueItem)>,
    ) -> Result<Self, StoreError> {
        items.sort_by_key(|(seq, _)| *seq);
        if let Some((seq, _)) = items.first()
            && *seq < head
        {
            return Err(StoreError::Custom(format!(
                "queue item {seq} lies before head {head}"
            )));
        }
        if let Some((seq, _)) = items.last()
            && *seq >= tail
        {
            return Err(StoreError::Custom(format!(
                "queue item {seq} lies at or past tail {tail}"
            )));
        }
        Ok(RunQueue {
            head,
            tail,
            items: items.into(),
        })
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&(u64, RunQueueItem)> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, RunQueueItem)> {
        self.items.iter()
    }

    pub fn push_back(&mut self, item: RunQueueItem, tx: &mut KernelTx) -> Result<(), StoreError> {
        let seq = self.tail;
        tx.put_queue_item(seq, &item)?;
        self.tail += 1;
        tx.set_queue_cursors(self.head, self.tail);
        self.items.push_back((seq, item));
        Ok(())
    }

    /// Inserts `spliced` in order *ahead* of every queued item, so the first
    /// spliced item pops next. Used when a promise resolves and its queued
    /// messages re-enter the run queue.
    pub fn splice_front(
        &mut self,
        spliced: Vec<RunQueueItem>,
        tx: &mut KernelTx,
    ) -> Result<(), StoreError> {
        let count = spliced.len() as u64;
        if count == 0 {
            return Ok(());
        }
        let first_seq = self.head - count;
        for (offset, item) in spliced.into_iter().enumerate().rev() {
            let seq = first_seq + offset as u64;
            tx.put_queue_item(seq, &item)?;
            self.items.push_front((seq, item));
        }
        self.head = first_seq;
        tx.set_queue_cursors(self.head, self.tail);
        Ok(())
    }

    /// Pops the head item, recording both the key deletion and the head
    /// advance in the transaction.
    pub fn pop_front(&mut self, tx: &mut KernelTx) -> Option<(u64, RunQueueItem)> {
        let (seq, item) = self.items.pop_front()?;
        tx.delete_queue_item(seq);
        self.head = self
            .items
            .front()
            .map(|(next, _)| *next)
            .unwrap_or(self.tail);
        tx.set_queue_cursors(self.head, self.tail);
        Some((seq, item))
    }

    /// Removes every item failing the predicate, returning the removed items
    /// in queue order. Leaves sequence gaps; the head only moves if the
    /// front was removed.
    pub fn retain(
        &mut self,
        mut keep: impl FnMut(&RunQueueItem) -> bool,
        tx: &mut KernelTx,
    ) -> Vec<RunQueueItem> {
        let mut removed = Vec::new();
        self.items.retain(|(seq, item)| {
            if keep(item) {
                true
            } else {
                tx.delete_queue_item(*seq);
                removed.push(item.clone());
                false
            }
        });
        self.head = self
            .items
            .front()
            .map(|(next, _)| *next)
            .unwrap_or(self.tail);
        tx.set_queue_cursors(self.head, self.tail);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapd_common::refs::EndpointId;

    fn boyd(n: u64) -> RunQueueItem {
        RunQueueItem::BringOutYourDead {
            endpoint: EndpointId::Vat(n),
        }
    }

    #[test]
    fn fifo_order() {
        let mut queue = RunQueue::new();
        let mut tx = KernelTx::new();
        for n in 0..3 {
            queue.push_back(boyd(n), &mut tx).expect("push");
        }
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(0)));
        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(1)));
        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(2)));
        assert!(queue.is_empty());
        assert_eq!(queue.head(), queue.tail());
    }

    #[test]
    fn splice_pops_before_existing_items() {
        let mut queue = RunQueue::new();
        let mut tx = KernelTx::new();
        queue.push_back(boyd(10), &mut tx).expect("push");
        queue
            .splice_front(vec![boyd(1), boyd(2)], &mut tx)
            .expect("splice");

        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(1)));
        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(2)));
        assert_eq!(queue.pop_front(&mut tx).map(|(_, i)| i), Some(boyd(10)));
    }

    #[test]
    fn retain_leaves_gaps_and_keeps_order() {
        let mut queue = RunQueue::new();
        let mut tx = KernelTx::new();
        for n in 0..4 {
            queue.push_back(boyd(n), &mut tx).expect("push");
        }
        let removed = queue.retain(
            |item| !matches!(item, RunQueueItem::BringOutYourDead { endpoint } if *endpoint == EndpointId::Vat(1)),
            &mut tx,
        );
        assert_eq!(removed, vec![boyd(1)]);
        let remaining: Vec<RunQueueItem> =
            queue.iter().map(|(_, item)| item.clone()).collect();
        assert_eq!(remaining, vec![boyd(0), boyd(2), boyd(3)]);
    }

    #[test]
    fn recovery_round_trip() {
        let mut queue = RunQueue::new();
        let mut tx = KernelTx::new();
        for n in 0..3 {
            queue.push_back(boyd(n), &mut tx).expect("push");
        }
        queue.pop_front(&mut tx);

        let items: Vec<(u64, RunQueueItem)> =
            queue.iter().cloned().collect();
        let recovered =
            RunQueue::from_parts(queue.head(), queue.tail(), items).expect("recover");
        assert_eq!(recovered.depth(), 2);
        assert_eq!(recovered.peek().map(|(_, i)| i.clone()), Some(boyd(1)));
    }

    #[test]
    fn recovery_rejects_out_of_window_items() {
        let result = RunQueue::from_parts(QUEUE_BASE, QUEUE_BASE + 1, vec![(QUEUE_BASE + 5, boyd(0))]);
        assert!(result.is_err());
    }
}
