use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::config::flag_enabled;

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();

pub(crate) static SUSPEND_COUNT: AtomicU64 = AtomicU64::new(0);
pub(crate) static WAKE_COUNT: AtomicU64 = AtomicU64::new(0);
pub(crate) static WOULD_BLOCK_COUNT: AtomicU64 = AtomicU64::new(0);
pub(crate) static WAITER_REGISTER_COUNT: AtomicU64 = AtomicU64::new(0);
pub(crate) static POLLER_EVENT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Fixes the profiling switch. The first caller wins; later calls and the
/// `HOSTINET_PROFILE` fallback are ignored once the switch is set.
pub(crate) fn init_profiling(enabled: bool) {
    if PROFILE_ENABLED.set(enabled).is_err() && profile_enabled() != enabled {
        log::debug!("profiling already fixed to {}", profile_enabled());
    }
}

pub fn profile_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| {
        std::env::var("HOSTINET_PROFILE")
            .map(|val| flag_enabled(&val))
            .unwrap_or(false)
    })
}

pub(crate) fn profile_hit(counter: &AtomicU64) {
    count_if(profile_enabled(), counter);
}

fn count_if(enabled: bool, counter: &AtomicU64) {
    if enabled {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub suspends: u64,
    pub wakeups: u64,
    pub would_block: u64,
    pub waiter_registrations: u64,
    pub poller_events: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        suspends: SUSPEND_COUNT.load(AtomicOrdering::Relaxed),
        wakeups: WAKE_COUNT.load(AtomicOrdering::Relaxed),
        would_block: WOULD_BLOCK_COUNT.load(AtomicOrdering::Relaxed),
        waiter_registrations: WAITER_REGISTER_COUNT.load(AtomicOrdering::Relaxed),
        poller_events: POLLER_EVENT_COUNT.load(AtomicOrdering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_only_when_enabled() {
        let counter = AtomicU64::new(0);
        count_if(true, &counter);
        count_if(true, &counter);
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 2);
        count_if(false, &counter);
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn profile_hit_follows_the_switch() {
        let counter = AtomicU64::new(0);
        profile_hit(&counter);
        let expected = u64::from(profile_enabled());
        assert_eq!(counter.load(AtomicOrdering::Relaxed), expected);
    }

    #[test]
    fn snapshot_reads_global_counters() {
        let before = snapshot();
        WAKE_COUNT.fetch_add(1, AtomicOrdering::Relaxed);
        assert!(snapshot().wakeups > before.wakeups);
    }
}
