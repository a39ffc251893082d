use std::collections::{HashMap, VecDeque};

use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

/// Token naming a timeout record owned by the loop. Tokens are never
/// reused; a stale token degrades to `NotPending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout(pub(crate) u64);

pub(crate) type TimeoutCb = Box<dyn FnMut(&mut EventLoop, Timeout) + 'static>;

struct TimeoutEntry {
    time: Timestamp,
    pending: bool,
    cb: Option<TimeoutCb>,
}

/// Pending timeouts ordered by ascending fire time, FIFO on ties.
/// Insertion walks the list; unlink and head access stay cheap for the
/// target workload of tens of entries.
#[derive(Default)]
pub(crate) struct TimeoutQueue {
    entries: HashMap<u64, TimeoutEntry>,
    order: VecDeque<u64>,
    next_id: u64,
}

pub(crate) enum DueState {
    /// No pending timeouts.
    Empty,
    /// Milliseconds until the head fires.
    Wait(i64),
    /// The head was due and has been unlinked; invoke its callback.
    Due(Timeout),
}

impl TimeoutQueue {
    pub(crate) fn create(&mut self, cb: TimeoutCb) -> Timeout {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TimeoutEntry {
                time: Timestamp::default(),
                pending: false,
                cb: Some(cb),
            },
        );
        Timeout(id)
    }

    pub(crate) fn is_pending(&self, t: Timeout) -> bool {
        self.entries.get(&t.0).is_some_and(|e| e.pending)
    }

    pub(crate) fn link(&mut self, t: Timeout, time: Timestamp) -> Result<()> {
        {
            let entry = self.entries.get_mut(&t.0).ok_or(Error::NotPending)?;
            if entry.pending {
                return Err(Error::AlreadyPending);
            }
            entry.time = time;
            entry.pending = true;
        }
        // Before the first entry strictly later than us; ties stay FIFO.
        let pos = self
            .order
            .iter()
            .position(|id| self.entries[id].time.diff_ms(time) > 0);
        match pos {
            Some(i) => self.order.insert(i, t.0),
            None => self.order.push_back(t.0),
        }
        Ok(())
    }

    pub(crate) fn unlink(&mut self, t: Timeout) -> Result<()> {
        let entry = self.entries.get_mut(&t.0).ok_or(Error::NotPending)?;
        if !entry.pending {
            return Err(Error::NotPending);
        }
        entry.pending = false;
        if let Some(i) = self.order.iter().position(|&id| id == t.0) {
            self.order.remove(i);
        }
        Ok(())
    }

    pub(crate) fn destroy(&mut self, t: Timeout) {
        let _ = self.unlink(t);
        self.entries.remove(&t.0);
    }

    pub(crate) fn remaining(&self, t: Timeout, now: Timestamp) -> i64 {
        match self.entries.get(&t.0) {
            Some(e) if e.pending => e.time.diff_ms(now),
            _ => -1,
        }
    }

    /// Pop the head if it is due at `now`, clearing its pending bit.
    pub(crate) fn pop_due(&mut self, now: Timestamp) -> DueState {
        loop {
            let Some(&head) = self.order.front() else {
                return DueState::Empty;
            };
            let Some(entry) = self.entries.get_mut(&head) else {
                self.order.pop_front();
                continue;
            };
            let delta = entry.time.diff_ms(now);
            if delta > 0 {
                return DueState::Wait(delta);
            }
            entry.pending = false;
            self.order.pop_front();
            return DueState::Due(Timeout(head));
        }
    }

    pub(crate) fn take_cb(&mut self, t: Timeout) -> Option<TimeoutCb> {
        self.entries.get_mut(&t.0).and_then(|e| e.cb.take())
    }

    pub(crate) fn put_cb(&mut self, t: Timeout, cb: TimeoutCb) {
        if let Some(e) = self.entries.get_mut(&t.0) {
            if e.cb.is_none() {
                e.cb = Some(cb);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    #[cfg(test)]
    fn pending_order(&self) -> Vec<u64> {
        self.order.iter().copied().collect()
    }
}
