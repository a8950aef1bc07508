//! Wait entries, waiter queues and the `Waitable` contract.
//!
//! A `WaitEntry` is a single-use latch: readiness notifications accumulate
//! into it until the owning task consumes them in `wait`. Queues only hold
//! clones of entries, so an entry registered on several queues is woken by
//! whichever fires first.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::abi::EventMask;
use crate::async_rt::task::Wake;
use crate::error::SysResult;

struct EntryInner {
    ready: Mutex<Option<EventMask>>,
    condvar: Condvar,
}

#[derive(Clone)]
pub struct WaitEntry {
    inner: Arc<EntryInner>,
}

impl Default for WaitEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitEntry")
            .field("ready", &*self.inner.ready.lock().unwrap())
            .finish()
    }
}

impl WaitEntry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EntryInner {
                ready: Mutex::new(None),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn same(&self, other: &WaitEntry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Latches `ready` into the entry and wakes its owner.
    pub fn fire(&self, ready: EventMask) {
        let mut guard = self.inner.ready.lock().unwrap();
        *guard = Some(guard.unwrap_or(0) | ready);
        drop(guard);
        self.inner.condvar.notify_all();
    }

    /// Wakes the owner without latching readiness so it re-checks its
    /// cancellation state.
    pub fn kick(&self) {
        let _guard = self.inner.ready.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    /// Blocks until the entry fires, `cancelled` reports true or `deadline`
    /// passes. `cancelled` is evaluated with the entry lock held, so a
    /// `kick` issued after the cancellation flag is raised cannot be lost.
    pub fn wait(&self, deadline: Option<Instant>, cancelled: &dyn Fn() -> bool) -> Wake {
        let mut guard = self.inner.ready.lock().unwrap();
        loop {
            if let Some(ready) = guard.take() {
                return Wake::Ready(ready);
            }
            if cancelled() {
                return Wake::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }
                    let (next, _) = self
                        .inner
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = next;
                }
                None => {
                    guard = self.inner.condvar.wait(guard).unwrap();
                }
            }
        }
    }
}

/// Entries waiting on one object, each with the events it cares about.
#[derive(Default)]
pub struct WaiterQueue {
    entries: Mutex<Vec<(WaitEntry, EventMask)>>,
}

impl WaiterQueue {
    pub fn event_register(&self, entry: &WaitEntry, mask: EventMask) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.iter_mut().find(|(e, _)| e.same(entry)) {
            slot.1 |= mask;
            return;
        }
        entries.push((entry.clone(), mask));
    }

    pub fn event_unregister(&self, entry: &WaitEntry) {
        self.entries.lock().unwrap().retain(|(e, _)| !e.same(entry));
    }

    /// Union of the masks of every registered entry.
    pub fn events(&self) -> EventMask {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .fold(0, |acc, (_, mask)| acc | mask)
    }

    /// Fires every entry interested in any bit of `ready`. Entries stay
    /// registered; their owners unregister them.
    pub fn notify(&self, ready: EventMask) {
        let targets: Vec<(WaitEntry, EventMask)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, mask)| mask & ready != 0)
                .map(|(entry, mask)| (entry.clone(), mask & ready))
                .collect()
        };
        for (entry, mask) in targets {
            entry.fire(mask);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An object tasks can wait on for readiness.
pub trait Waitable {
    /// Returns the subset of `mask` that is ready right now.
    fn readiness(&self, mask: EventMask) -> EventMask;
    fn event_register(&self, entry: &WaitEntry, mask: EventMask);
    fn event_unregister(&self, entry: &WaitEntry);

    /// Fails when no readiness will ever be delivered, so callers return
    /// instead of parking on a registration nothing will fire.
    fn check_blocking(&self) -> SysResult<()> {
        Ok(())
    }
}
