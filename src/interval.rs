use std::collections::HashMap;

use crate::event_loop::EventLoop;

/// Token naming a recurring backend timer. The kernel-side timer keeps
/// ticking between fetches; the callback receives the number of elapsed
/// periods since it last ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval(pub(crate) u64);

pub(crate) type IntervalCb = Box<dyn FnMut(&mut EventLoop, Interval, u64) + 'static>;

struct IntervalEntry {
    active: bool,
    cb: Option<IntervalCb>,
}

#[derive(Default)]
pub(crate) struct IntervalTable {
    entries: HashMap<u64, IntervalEntry>,
    next_id: u64,
}

impl IntervalTable {
    pub(crate) fn create(&mut self, cb: IntervalCb) -> Interval {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            IntervalEntry {
                active: false,
                cb: Some(cb),
            },
        );
        Interval(id)
    }

    pub(crate) fn contains(&self, i: Interval) -> bool {
        self.entries.contains_key(&i.0)
    }

    pub(crate) fn is_active(&self, i: Interval) -> bool {
        self.entries.get(&i.0).is_some_and(|e| e.active)
    }

    pub(crate) fn set_active(&mut self, i: Interval, active: bool) {
        if let Some(e) = self.entries.get_mut(&i.0) {
            e.active = active;
        }
    }

    pub(crate) fn take_cb(&mut self, i: Interval) -> Option<IntervalCb> {
        self.entries.get_mut(&i.0).and_then(|e| e.cb.take())
    }

    pub(crate) fn put_cb(&mut self, i: Interval, cb: IntervalCb) {
        if let Some(e) = self.entries.get_mut(&i.0) {
            if e.cb.is_none() {
                e.cb = Some(cb);
            }
        }
    }

    pub(crate) fn remove(&mut self, i: Interval) {
        self.entries.remove(&i.0);
    }
}
