//! The task abstraction blocking socket operations park on.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::abi::EventMask;
use crate::async_rt::waiter::WaitEntry;
use crate::config::{BackendKind, HostNetConfig};

/// Why a suspended task resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Ready(EventMask),
    TimedOut,
    Interrupted,
}

/// The guest thread on whose behalf a socket operation runs.
pub trait Task {
    /// Parks until `entry` fires, `deadline` passes or the task is
    /// interrupted.
    fn suspend(&self, entry: &WaitEntry, deadline: Option<Instant>) -> Wake;

    /// Network stack configured for this task, if any.
    fn network_backend(&self) -> Option<BackendKind>;
}

struct InterruptState {
    pending: AtomicBool,
    parked: Mutex<Option<WaitEntry>>,
}

/// A `Task` backed by the calling OS thread.
pub struct ThreadTask {
    backend: Option<BackendKind>,
    interrupt: Arc<InterruptState>,
}

/// Handle that interrupts a `ThreadTask` from another thread.
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl ThreadTask {
    pub fn new(backend: Option<BackendKind>) -> Self {
        Self {
            backend,
            interrupt: Arc::new(InterruptState {
                pending: AtomicBool::new(false),
                parked: Mutex::new(None),
            }),
        }
    }

    /// A task whose network backend is the one selected in `config`.
    pub fn for_config(config: &HostNetConfig) -> Self {
        Self::new(Some(config.backend))
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            state: Arc::clone(&self.interrupt),
        }
    }
}

impl Interrupter {
    /// Raises an interrupt. A parked task wakes with `Wake::Interrupted`;
    /// otherwise its next suspend returns immediately.
    pub fn interrupt(&self) {
        self.state.pending.store(true, AtomicOrdering::SeqCst);
        if let Some(entry) = self.state.parked.lock().unwrap().as_ref() {
            entry.kick();
        }
    }
}

impl Task for ThreadTask {
    fn suspend(&self, entry: &WaitEntry, deadline: Option<Instant>) -> Wake {
        *self.interrupt.parked.lock().unwrap() = Some(entry.clone());
        let pending = &self.interrupt.pending;
        let wake = entry.wait(deadline, &|| pending.load(AtomicOrdering::SeqCst));
        *self.interrupt.parked.lock().unwrap() = None;
        if wake == Wake::Interrupted {
            pending.store(false, AtomicOrdering::SeqCst);
        }
        wake
    }

    fn network_backend(&self) -> Option<BackendKind> {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn interrupt_wakes_parked_task() {
        let task = ThreadTask::new(Some(BackendKind::HostPassthrough));
        let interrupter = task.interrupter();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            interrupter.interrupt();
        });
        let entry = WaitEntry::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(task.suspend(&entry, Some(deadline)), Wake::Interrupted);
        handle.join().expect("join interrupter");
    }

    #[test]
    fn pending_interrupt_is_consumed_once() {
        let task = ThreadTask::new(None);
        task.interrupter().interrupt();
        let entry = WaitEntry::new();
        assert_eq!(task.suspend(&entry, None), Wake::Interrupted);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(task.suspend(&entry, Some(deadline)), Wake::TimedOut);
    }

    #[test]
    fn backend_comes_from_config() {
        let config = HostNetConfig {
            backend: BackendKind::Netstack,
            ..HostNetConfig::default()
        };
        let task = ThreadTask::for_config(&config);
        assert_eq!(task.network_backend(), Some(BackendKind::Netstack));
    }

    #[test]
    fn readiness_beats_timeout() {
        let task = ThreadTask::new(None);
        let entry = WaitEntry::new();
        entry.fire(crate::abi::EVENT_OUT);
        assert_eq!(
            task.suspend(&entry, Some(Instant::now())),
            Wake::Ready(crate::abi::EVENT_OUT)
        );
        assert_eq!(task.network_backend(), None);
    }
}
