use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

/// Token naming a tracked child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Process(pub(crate) u64);

pub(crate) type ProcessCb = Box<dyn FnMut(&mut EventLoop, Process, libc::c_int) + 'static>;

pub(crate) struct ProcessEntry {
    pub(crate) pid: libc::pid_t,
    pub(crate) cb: Option<ProcessCb>,
}

/// Tracked children ordered by ascending PID. Multiple entries for the
/// same PID are permitted and all fire on reap.
#[derive(Default)]
pub(crate) struct ProcessTable {
    entries: HashMap<u64, ProcessEntry>,
    order: VecDeque<u64>,
    next_id: u64,
}

impl ProcessTable {
    pub(crate) fn add(&mut self, pid: libc::pid_t, cb: ProcessCb) -> Process {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, ProcessEntry { pid, cb: Some(cb) });
        let pos = self.order.iter().position(|o| self.entries[o].pid > pid);
        match pos {
            Some(i) => self.order.insert(i, id),
            None => self.order.push_back(id),
        }
        Process(id)
    }

    pub(crate) fn remove(&mut self, p: Process) -> Option<ProcessEntry> {
        let entry = self.entries.remove(&p.0)?;
        if let Some(i) = self.order.iter().position(|&id| id == p.0) {
            self.order.remove(i);
        }
        Some(entry)
    }

    pub(crate) fn delete(&mut self, p: Process) -> Result<()> {
        self.remove(p).map(|_| ()).ok_or(Error::NotPending)
    }

    /// Entry ids matching `pid`, in list order. The list is PID-sorted, so
    /// the walk skips lower PIDs and stops at the first higher one.
    pub(crate) fn matching(&self, pid: libc::pid_t) -> Vec<u64> {
        let mut out = Vec::new();
        for id in &self.order {
            let entry_pid = self.entries[id].pid;
            if entry_pid < pid {
                continue;
            }
            if entry_pid > pid {
                break;
            }
            out.push(*id);
        }
        out
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    #[cfg(test)]
    fn pids(&self) -> Vec<libc::pid_t> {
        self.order.iter().map(|id| self.entries[id].pid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ProcessCb {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn kept_sorted_by_pid() {
        let mut t = ProcessTable::default();
        t.add(42, noop());
        t.add(7, noop());
        t.add(100, noop());
        assert_eq!(t.pids(), vec![7, 42, 100]);
    }

    #[test]
    fn duplicate_pids_all_match_in_insertion_order() {
        let mut t = ProcessTable::default();
        let a = t.add(9, noop());
        t.add(3, noop());
        let b = t.add(9, noop());
        assert_eq!(t.matching(9), vec![a.0, b.0]);
        assert_eq!(t.matching(3).len(), 1);
        assert!(t.matching(4).is_empty());
    }

    #[test]
    fn delete_unlinks_once() {
        let mut t = ProcessTable::default();
        let p = t.add(11, noop());
        t.delete(p).unwrap();
        assert!(matches!(t.delete(p), Err(Error::NotPending)));
        assert!(t.matching(11).is_empty());
    }
}
