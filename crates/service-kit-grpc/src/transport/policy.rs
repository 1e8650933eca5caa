//! Per-connection policing state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EnforcementPolicy;
use crate::interceptor::body::BodyObserver;

/// Strikes tolerated before a connection is closed for pinging too often.
const MAX_PING_STRIKES: u32 = 2;

/// Minimum spacing between client PINGs while no call is active and the
/// policy does not permit pings without streams.
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Verdict for one inbound PING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingVerdict {
    Allowed,
    Strike(u32),
    TooManyPings,
}

/// Counts client PINGs that arrive too early.
#[derive(Debug)]
pub(crate) struct PingPolicy {
    min_time: Duration,
    permit_without_stream: bool,
    last_ping: Option<Instant>,
    strikes: u32,
}

impl PingPolicy {
    pub(crate) fn new(policy: &EnforcementPolicy) -> Self {
        Self {
            min_time: policy.min_time,
            permit_without_stream: policy.permit_without_stream,
            last_ping: None,
            strikes: 0,
        }
    }

    pub(crate) fn on_ping(&mut self, now: Instant, active_calls: usize) -> PingVerdict {
        let spacing = if active_calls == 0 && !self.permit_without_stream {
            IDLE_PING_INTERVAL
        } else {
            self.min_time
        };

        let too_early = self
            .last_ping
            .is_some_and(|last| now.duration_since(last) < spacing);
        self.last_ping = Some(now);

        if !too_early {
            return PingVerdict::Allowed;
        }

        self.strikes += 1;
        if self.strikes > MAX_PING_STRIKES {
            PingVerdict::TooManyPings
        } else {
            PingVerdict::Strike(self.strikes)
        }
    }

    /// Called when the server sends HEADERS or DATA.
    pub(crate) fn reset(&mut self) {
        self.strikes = 0;
        self.last_ping = None;
    }
}

/// Activity of one connection, shared between its I/O, its calls and the
/// task driving it.
#[derive(Debug)]
pub(crate) struct ConnectionActivity {
    active: AtomicUsize,
    idle_since: Mutex<Instant>,
    changed: Notify,
    ping_violation: CancellationToken,
}

impl ConnectionActivity {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
            changed: Notify::new(),
            ping_violation: CancellationToken::new(),
        }
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn call_started(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    fn call_finished(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.idle_since.lock() = Instant::now();
        }
        self.changed.notify_waiters();
    }

    /// When the connection becomes idle for longer than `max_idle`, or
    /// `None` while calls are active.
    fn idle_deadline(&self, max_idle: Duration) -> Option<Instant> {
        if self.active_calls() > 0 {
            return None;
        }
        Some(*self.idle_since.lock() + max_idle)
    }

    /// Resolves once the connection has had no active calls for `max_idle`.
    pub(crate) async fn idle_for(&self, max_idle: Duration) {
        loop {
            let changed = self.changed.notified();
            match self.idle_deadline(max_idle) {
                Some(deadline) if deadline <= Instant::now() => return,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    pub(crate) fn report_ping_violation(&self) {
        self.ping_violation.cancel();
    }

    pub(crate) async fn ping_violation(&self) {
        self.ping_violation.cancelled().await
    }
}

/// Marks a call active for as long as it is alive. Attached to the response
/// body so streaming calls count until their last frame.
pub(crate) struct ActiveCall {
    activity: std::sync::Arc<ConnectionActivity>,
}

impl ActiveCall {
    pub(crate) fn begin(activity: &std::sync::Arc<ConnectionActivity>) -> Self {
        activity.call_started();
        Self {
            activity: activity.clone(),
        }
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.activity.call_finished();
    }
}

impl BodyObserver for ActiveCall {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy(min_time: u64, permit_without_stream: bool) -> PingPolicy {
        PingPolicy::new(&EnforcementPolicy {
            min_time: Duration::from_millis(min_time),
            permit_without_stream,
        })
    }

    #[test]
    fn third_early_ping_while_active_is_too_many() {
        let mut policy = policy(1000, false);
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        assert_eq!(policy.on_ping(at(0), 1), PingVerdict::Allowed);
        assert_eq!(policy.on_ping(at(100), 1), PingVerdict::Strike(1));
        assert_eq!(policy.on_ping(at(200), 1), PingVerdict::Strike(2));
        assert_eq!(policy.on_ping(at(300), 1), PingVerdict::TooManyPings);
    }

    #[test]
    fn spaced_pings_are_allowed() {
        let mut policy = policy(1000, false);
        let start = Instant::now();

        for i in 0..5 {
            let now = start + Duration::from_millis(1000 * i);
            assert_eq!(policy.on_ping(now, 1), PingVerdict::Allowed);
        }
    }

    #[test]
    fn idle_pings_need_permission() {
        let start = Instant::now();
        let later = start + Duration::from_secs(60);

        let mut strict = policy(1000, false);
        strict.on_ping(start, 0);
        assert_eq!(strict.on_ping(later, 0), PingVerdict::Strike(1));

        let mut permissive = policy(1000, true);
        permissive.on_ping(start, 0);
        assert_eq!(permissive.on_ping(later, 0), PingVerdict::Allowed);
    }

    #[test]
    fn sending_data_resets_strikes() {
        let mut policy = policy(1000, false);
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        policy.on_ping(at(0), 1);
        policy.on_ping(at(10), 1);
        policy.on_ping(at(20), 1);
        policy.reset();
        assert_eq!(policy.on_ping(at(30), 1), PingVerdict::Allowed);
        assert_eq!(policy.on_ping(at(40), 1), PingVerdict::Strike(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_waits_for_calls_to_finish() {
        let activity = Arc::new(ConnectionActivity::new());
        let call = ActiveCall::begin(&activity);
        assert_eq!(activity.active_calls(), 1);

        let idle = tokio::spawn({
            let activity = activity.clone();
            async move { activity.idle_for(Duration::from_secs(15)).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!idle.is_finished());

        drop(call);
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(!idle.is_finished());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(idle.is_finished());
    }
}
