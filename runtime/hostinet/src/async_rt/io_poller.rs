//! Host readiness notifier.
//!
//! Host fds are registered edge-triggered with a mio `Poll`. A worker
//! thread drains readiness events and forwards them to the waiter queue
//! attached to each fd. Wakeups are hints: woken tasks always retry their
//! non-blocking host call.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::abi::{EVENT_ERR, EVENT_HUP, EVENT_IN, EVENT_OUT, EVENT_PRI, EventMask};
use crate::async_rt::waiter::WaiterQueue;
use crate::config::HostNetConfig;
use crate::error::{SysError, SysResult};
use crate::state::metrics::{POLLER_EVENT_COUNT, profile_hit};

const WAKER_TOKEN: Token = Token(0);

struct FdEntry {
    token: Token,
    queue: Arc<WaiterQueue>,
    interest: Option<Interest>,
}

#[derive(Default)]
struct PollerState {
    fds: HashMap<RawFd, FdEntry>,
    tokens: HashMap<Token, RawFd>,
}

pub struct ReadinessNotifier {
    poll: Mutex<Poll>,
    registry: Registry,
    events: Mutex<Events>,
    waker: Waker,
    running: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_token: AtomicUsize,
    state: Mutex<PollerState>,
    poll_interval: Duration,
    trace: bool,
}

impl ReadinessNotifier {
    /// Creates the notifier and starts its worker thread.
    pub fn new(config: &HostNetConfig) -> SysResult<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let notifier = Arc::new(Self {
            poll: Mutex::new(poll),
            registry,
            events: Mutex::new(Events::with_capacity(config.event_capacity)),
            waker,
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
            next_token: AtomicUsize::new(1),
            state: Mutex::new(PollerState::default()),
            poll_interval: config.poll_interval,
            trace: config.trace_poller,
        });
        let worker = Arc::clone(&notifier);
        let handle = thread::Builder::new()
            .name("hostinet-notifier".into())
            .spawn(move || io_worker(worker))?;
        *notifier.worker.lock().unwrap() = Some(handle);
        Ok(notifier)
    }

    /// Starts tracking `fd`. Interest follows the union mask of `queue`
    /// and is recomputed by `update`.
    pub fn add(&self, fd: RawFd, queue: Arc<WaiterQueue>) -> SysResult<()> {
        if !self.running.load(AtomicOrdering::Acquire) {
            return Err(SysError::Host(libc::ESHUTDOWN));
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.fds.contains_key(&fd) {
                return Err(SysError::Host(libc::EEXIST));
            }
            let token = Token(self.next_token.fetch_add(1, AtomicOrdering::Relaxed));
            state.tokens.insert(token, fd);
            state.fds.insert(
                fd,
                FdEntry {
                    token,
                    queue,
                    interest: None,
                },
            );
        }
        if let Err(err) = self.update(fd) {
            self.remove(fd);
            return Err(err);
        }
        Ok(())
    }

    /// Stops tracking `fd`. Must run before the fd is closed.
    pub fn remove(&self, fd: RawFd) {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.fds.remove(&fd) else {
            return;
        };
        state.tokens.remove(&entry.token);
        if entry.interest.is_some() {
            if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                log::debug!("hostinet notifier: deregister fd={fd} failed: {err}");
            }
        }
    }

    /// Re-derives the host interest of `fd` from its waiter queue. An empty
    /// mask removes the fd from the host poll set.
    pub fn update(&self, fd: RawFd) -> SysResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.fds.get_mut(&fd) else {
            return Ok(());
        };
        let wanted = interest_from_events(entry.queue.events());
        let mut source = SourceFd(&fd);
        match (entry.interest, wanted) {
            (None, None) => {}
            (None, Some(interest)) => {
                self.registry.register(&mut source, entry.token, interest)?;
            }
            (Some(current), Some(interest)) => {
                if current != interest {
                    self.registry.reregister(&mut source, entry.token, interest)?;
                }
            }
            (Some(_), None) => {
                self.registry.deregister(&mut source)?;
            }
        }
        if self.trace && entry.interest != wanted {
            log::debug!(
                "hostinet notifier: fd={fd} interest {:?} -> {:?}",
                entry.interest,
                wanted
            );
        }
        entry.interest = wanted;
        Ok(())
    }

    /// Non-blocking readiness query for `fd`.
    pub fn poll_now(&self, fd: RawFd, mask: EventMask) -> EventMask {
        poll_now(fd, mask)
    }

    /// Whether `fd` is currently in the host poll set.
    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.state
            .lock()
            .unwrap()
            .fds
            .get(&fd)
            .is_some_and(|entry| entry.interest.is_some())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn tracked_fds(&self) -> usize {
        self.state.lock().unwrap().fds.len()
    }

    /// Stops the worker thread. Tracked fds stay registered but no longer
    /// produce wakeups; every waiter parked at this point is woken so it
    /// can retry and observe the shutdown.
    pub fn shutdown(&self) {
        if !self.running.swap(false, AtomicOrdering::SeqCst) {
            return;
        }
        let _ = self.waker.wake();
        let handle = { self.worker.lock().unwrap().take() };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("hostinet notifier: worker panicked");
            }
        }
        let queues: Vec<Arc<WaiterQueue>> = {
            let state = self.state.lock().unwrap();
            state.fds.values().map(|entry| Arc::clone(&entry.queue)).collect()
        };
        for queue in queues {
            queue.notify(EVENT_IN | EVENT_PRI | EVENT_OUT | EVENT_ERR | EVENT_HUP);
        }
    }
}

/// Zero-timeout `poll(2)` on a single fd. Returns the ready subset of
/// `mask` plus any error or hangup condition, which the host reports
/// whether or not it was asked for. An invalid fd reads as an error.
pub fn poll_now(fd: RawFd, mask: EventMask) -> EventMask {
    let mut pfd = libc::pollfd {
        fd,
        events: mask as libc::c_short,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            log::debug!("hostinet poll fd={fd} failed: {err}");
            return 0;
        }
    }
    let mut revents = pfd.revents as u16 as EventMask;
    if revents & libc::POLLNVAL as EventMask != 0 {
        revents |= EVENT_ERR;
    }
    revents & (mask | EVENT_ERR | EVENT_HUP)
}

fn interest_from_events(events: EventMask) -> Option<Interest> {
    if events == 0 {
        return None;
    }
    let mut interest = None;
    if events & (EVENT_IN | EVENT_PRI) != 0 {
        interest = Some(Interest::READABLE);
    }
    if events & EVENT_OUT != 0 {
        interest = Some(match interest {
            Some(existing) => existing | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    // Errors and hangups are always reported; a readable registration is
    // the cheapest way to receive them.
    Some(interest.unwrap_or(Interest::READABLE))
}

fn mask_from_event(event: &Event) -> EventMask {
    let mut mask = 0;
    if event.is_readable() {
        mask |= EVENT_IN;
    }
    if event.is_priority() {
        mask |= EVENT_PRI;
    }
    if event.is_writable() {
        mask |= EVENT_OUT;
    }
    if event.is_read_closed() {
        mask |= EVENT_IN;
    }
    if event.is_write_closed() {
        mask |= EVENT_OUT | EVENT_HUP;
    }
    if event.is_error() {
        mask |= EVENT_ERR | EVENT_IN | EVENT_OUT;
    }
    mask
}

fn io_worker(notifier: Arc<ReadinessNotifier>) {
    loop {
        if !notifier.running.load(AtomicOrdering::Acquire) {
            break;
        }
        let mut events = notifier.events.lock().unwrap();
        if let Err(err) = notifier
            .poll
            .lock()
            .unwrap()
            .poll(&mut events, Some(notifier.poll_interval))
        {
            if err.kind() != std::io::ErrorKind::Interrupted {
                log::warn!("hostinet notifier: poll failed: {err}");
            }
            continue;
        }
        if !notifier.running.load(AtomicOrdering::Acquire) {
            break;
        }
        let mut ready: Vec<(Arc<WaiterQueue>, EventMask, RawFd)> = Vec::new();
        {
            let state = notifier.state.lock().unwrap();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let Some(fd) = state.tokens.get(&event.token()).copied() else {
                    continue;
                };
                let Some(entry) = state.fds.get(&fd) else {
                    continue;
                };
                let mask = mask_from_event(event);
                if mask == 0 {
                    continue;
                }
                ready.push((Arc::clone(&entry.queue), mask, fd));
            }
        }
        drop(events);
        for (queue, mask, fd) in ready {
            if notifier.trace {
                log::debug!(
                    "hostinet notifier: ready fd={fd} mask={mask:#x} waiters={}",
                    queue.len()
                );
            }
            profile_hit(&POLLER_EVENT_COUNT);
            queue.notify(mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_rt::task::Wake;
    use crate::async_rt::waiter::WaitEntry;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn test_config() -> HostNetConfig {
        HostNetConfig {
            poll_interval: Duration::from_millis(20),
            ..HostNetConfig::default()
        }
    }

    #[test]
    fn poll_now_reports_pending_data() {
        let (left, mut right) = UnixStream::pair().expect("socketpair");
        assert_eq!(poll_now(left.as_raw_fd(), EVENT_IN), 0);
        right.write_all(b"x").expect("write");
        assert_eq!(poll_now(left.as_raw_fd(), EVENT_IN), EVENT_IN);
        assert_eq!(poll_now(left.as_raw_fd(), EVENT_OUT), EVENT_OUT);
    }

    #[test]
    fn poll_now_always_reports_hangup() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        drop(right);
        let ready = poll_now(left.as_raw_fd(), EVENT_IN);
        assert_ne!(ready & EVENT_IN, 0);
        assert_ne!(ready & EVENT_HUP, 0);
        assert_eq!(ready & EVENT_OUT, 0);
    }

    #[test]
    fn interest_follows_mask() {
        assert_eq!(interest_from_events(0), None);
        assert_eq!(interest_from_events(EVENT_IN), Some(Interest::READABLE));
        assert_eq!(interest_from_events(EVENT_OUT), Some(Interest::WRITABLE));
        assert_eq!(
            interest_from_events(EVENT_IN | EVENT_OUT),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(interest_from_events(EVENT_HUP), Some(Interest::READABLE));
    }

    #[test]
    fn update_tracks_queue_mask() {
        let notifier = ReadinessNotifier::new(&test_config()).expect("notifier");
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let fd = left.as_raw_fd();
        let queue = Arc::new(WaiterQueue::default());
        notifier.add(fd, Arc::clone(&queue)).expect("add");
        assert!(!notifier.is_watching(fd));
        assert_eq!(notifier.add(fd, Arc::clone(&queue)), Err(SysError::Host(libc::EEXIST)));

        let entry = WaitEntry::new();
        queue.event_register(&entry, EVENT_IN);
        notifier.update(fd).expect("update");
        assert!(notifier.is_watching(fd));

        queue.event_unregister(&entry);
        notifier.update(fd).expect("update");
        assert!(!notifier.is_watching(fd));

        notifier.remove(fd);
        assert_eq!(notifier.tracked_fds(), 0);
        notifier.shutdown();
    }

    #[test]
    fn worker_delivers_readiness() {
        let notifier = ReadinessNotifier::new(&test_config()).expect("notifier");
        let (left, mut right) = UnixStream::pair().expect("socketpair");
        let fd = left.as_raw_fd();
        let queue = Arc::new(WaiterQueue::default());
        notifier.add(fd, Arc::clone(&queue)).expect("add");
        let entry = WaitEntry::new();
        queue.event_register(&entry, EVENT_IN);
        notifier.update(fd).expect("update");

        right.write_all(b"ping").expect("write");
        let deadline = Instant::now() + Duration::from_secs(5);
        match entry.wait(Some(deadline), &|| false) {
            Wake::Ready(mask) => assert_ne!(mask & EVENT_IN, 0),
            other => panic!("expected readiness, got {other:?}"),
        }
        queue.event_unregister(&entry);
        notifier.remove(fd);
        notifier.shutdown();
    }

    #[test]
    fn shutdown_wakes_registered_waiters() {
        let notifier = ReadinessNotifier::new(&test_config()).expect("notifier");
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let fd = left.as_raw_fd();
        let queue = Arc::new(WaiterQueue::default());
        notifier.add(fd, Arc::clone(&queue)).expect("add");
        let entry = WaitEntry::new();
        queue.event_register(&entry, EVENT_IN);
        notifier.update(fd).expect("update");
        assert!(notifier.is_running());

        notifier.shutdown();
        assert!(!notifier.is_running());
        match entry.wait(Some(Instant::now()), &|| false) {
            Wake::Ready(mask) => assert_ne!(mask & EVENT_IN, 0),
            other => panic!("expected shutdown wakeup, got {other:?}"),
        }
        queue.event_unregister(&entry);
        notifier.remove(fd);
    }

    #[test]
    fn add_after_shutdown_fails() {
        let notifier = ReadinessNotifier::new(&test_config()).expect("notifier");
        notifier.shutdown();
        notifier.shutdown();
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let queue = Arc::new(WaiterQueue::default());
        assert_eq!(
            notifier.add(left.as_raw_fd(), queue),
            Err(SysError::Host(libc::ESHUTDOWN))
        );
    }
}
