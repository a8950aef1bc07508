//! Turns non-blocking host calls into blocking guest calls.

use std::time::Instant;

use crate::abi::EventMask;
use crate::async_rt::task::{Task, Wake};
use crate::async_rt::waiter::{WaitEntry, Waitable};
use crate::error::{SysError, SysResult};
use crate::state::metrics::{
    SUSPEND_COUNT, WAITER_REGISTER_COUNT, WAKE_COUNT, WOULD_BLOCK_COUNT, profile_hit,
};

/// Outcome of one non-blocking attempt: the result plus the number of
/// bytes it moved.
pub(crate) struct Attempt<T> {
    pub(crate) transferred: usize,
    pub(crate) result: SysResult<T>,
}

impl<T> Attempt<T> {
    pub(crate) fn new(transferred: usize, result: SysResult<T>) -> Self {
        Self {
            transferred,
            result,
        }
    }
}

impl Attempt<usize> {
    pub(crate) fn from_io(result: SysResult<usize>) -> Self {
        let transferred = *result.as_ref().unwrap_or(&0);
        Self::new(transferred, result)
    }
}

/// Keeps `entry` registered on a waitable until dropped.
pub(crate) struct Registration<'a, W: Waitable + ?Sized> {
    waitable: &'a W,
    entry: WaitEntry,
}

impl<'a, W: Waitable + ?Sized> Registration<'a, W> {
    pub(crate) fn new(waitable: &'a W, events: EventMask) -> Self {
        let entry = WaitEntry::new();
        waitable.event_register(&entry, events);
        profile_hit(&WAITER_REGISTER_COUNT);
        Self { waitable, entry }
    }

    pub(crate) fn entry(&self) -> &WaitEntry {
        &self.entry
    }
}

impl<W: Waitable + ?Sized> Drop for Registration<'_, W> {
    fn drop(&mut self) {
        self.waitable.event_unregister(&self.entry);
    }
}

/// Parks `task` on `entry`, mapping the wake reason to a result.
pub(crate) fn suspend(task: &dyn Task, entry: &WaitEntry, deadline: Option<Instant>) -> SysResult<()> {
    profile_hit(&SUSPEND_COUNT);
    match task.suspend(entry, deadline) {
        Wake::Ready(_) => {
            profile_hit(&WAKE_COUNT);
            Ok(())
        }
        Wake::TimedOut => Err(SysError::Timeout),
        Wake::Interrupted => Err(SysError::Interrupted),
    }
}

/// Retries `attempt` until it stops reporting would-block.
///
/// The first would-block registers a waiter and retries straight away, so
/// readiness that arrived before registration is not missed. Later
/// would-blocks suspend the task, unless the waitable reports it can no
/// longer deliver readiness. The waiter is unregistered on every return
/// path.
///
/// # Panics
///
/// Panics if an attempt reports would-block after moving bytes; the
/// attempt must either make progress or fail cleanly.
pub(crate) fn block_until_ready<W, T, F>(
    task: &dyn Task,
    waitable: &W,
    events: EventMask,
    deadline: Option<Instant>,
    mut attempt: F,
) -> SysResult<T>
where
    W: Waitable + ?Sized,
    F: FnMut() -> Attempt<T>,
{
    let mut registration: Option<Registration<'_, W>> = None;
    loop {
        let Attempt {
            transferred,
            result,
        } = attempt();
        match result {
            Err(SysError::WouldBlock) => {
                if transferred != 0 {
                    log::error!("non-blocking attempt moved {transferred} bytes and would block");
                    panic!("non-blocking attempt moved {transferred} bytes and reported would-block");
                }
                profile_hit(&WOULD_BLOCK_COUNT);
            }
            other => return other,
        }
        match &registration {
            None => registration = Some(Registration::new(waitable, events)),
            Some(registered) => {
                waitable.check_blocking()?;
                suspend(task, registered.entry(), deadline)?;
            }
        }
    }
}
