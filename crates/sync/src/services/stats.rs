//! Throttled progress statistics.
//!
//! Bursts of "content watched" signals are coalesced: the first request in a
//! window recomputes, the rest are skipped silently. This is a throttle, not
//! a debounce; the first call wins.

use std::num::NonZeroU32;
use std::ops::Add;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use tutorial_portal_core::{Identity, ProgressStats};

use crate::baas::{BackendError, DataApi};
use crate::error::ErrorKind;
use crate::events::{EventBus, PortalEvent};
use crate::util::lock;

/// A throttled call was skipped. A control-flow signal, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("skipped: within throttle window")]
pub struct ThrottleSkip;

/// Errors from the stats service.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to load progress statistics: {0}")]
    Backend(BackendError),
}

impl StatsError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(_) => ErrorKind::Stats,
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// A tokio instant as seen by `governor`. Follows paused time in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = Self;

    fn add(self, other: Nanos) -> Self {
        Self(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        self.0.saturating_duration_since(earlier.0).into()
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        self.0.checked_sub(duration.into()).map_or(*self, Self)
    }
}

/// `governor` clock backed by [`tokio::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> Self::Instant {
        TokioInstant(Instant::now())
    }
}

type WindowLimiter =
    RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

// =============================================================================
// Throttler
// =============================================================================

/// Admits at most one call per `window`.
///
/// A GCRA limiter with a burst of one: the first call in a window is
/// accepted, and rejected calls do not push the window out. A zero window
/// accepts everything.
pub struct Throttler {
    window: Duration,
    limiter: Option<WindowLimiter>,
}

impl Throttler {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let limiter = Quota::with_period(window).map(|quota| {
            RateLimiter::direct_with_clock(quota.allow_burst(NonZeroU32::MIN), TokioClock)
        });
        Self { window, limiter }
    }

    /// Accept the call, or skip it.
    ///
    /// # Errors
    ///
    /// Returns `ThrottleSkip` if the last accepted call was less than
    /// `window` ago.
    pub fn check(&self) -> Result<(), ThrottleSkip> {
        match &self.limiter {
            Some(limiter) => limiter.check().map_err(|_| ThrottleSkip),
            None => Ok(()),
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// What a refetch request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    Recomputed(ProgressStats),
    Skipped,
}

/// Recomputes watch progress for an identity, behind a [`Throttler`].
#[derive(Clone)]
pub struct ProgressStatsService {
    data: Arc<dyn DataApi>,
    throttler: Arc<Throttler>,
    latest: Arc<Mutex<Option<ProgressStats>>>,
    events: EventBus,
}

impl ProgressStatsService {
    #[must_use]
    pub fn new(data: Arc<dyn DataApi>, window: Duration, events: EventBus) -> Self {
        Self {
            data,
            throttler: Arc::new(Throttler::new(window)),
            latest: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Recompute progress for `identity` unless a recompute was accepted
    /// within the throttle window. Standard users are counted against their
    /// system scope only.
    ///
    /// # Errors
    ///
    /// Returns `StatsError::Backend` if the accepted recompute fails. The
    /// window still counts from the accepted call.
    #[instrument(skip(self, identity), fields(user_id = %identity.id))]
    pub async fn request_refetch(&self, identity: &Identity) -> Result<RefetchOutcome, StatsError> {
        if self.throttler.check().is_err() {
            debug!("stats refetch throttled");
            return Ok(RefetchOutcome::Skipped);
        }

        let stats = self
            .data
            .fetch_progress(identity.id, identity.system_scope.as_ref())
            .await
            .map_err(|err| {
                warn!(error = %err, "stats recompute failed");
                StatsError::Backend(err)
            })?;

        *lock(&self.latest) = Some(stats);
        debug!(
            completed = stats.completed_videos,
            total = stats.total_videos,
            "stats recomputed"
        );
        self.events.emit(PortalEvent::StatsUpdated(stats));
        Ok(RefetchOutcome::Recomputed(stats))
    }

    /// The most recently computed stats.
    #[must_use]
    pub fn latest(&self) -> Option<ProgressStats> {
        *lock(&self.latest)
    }

    /// Forget the cached stats, e.g. on sign-out.
    pub fn reset(&self) {
        lock(&self.latest).take();
    }
}

impl std::fmt::Debug for ProgressStatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStatsService")
            .field("window", &self.throttler.window())
            .field("latest", &self.latest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tutorial_portal_core::{Email, Role, SystemScope, UserId, VideoId, VideoRef};

    use super::*;
    use crate::baas::memory::InMemoryBackend;

    const WINDOW: Duration = Duration::from_secs(2);

    fn identity(scope: Option<&str>) -> Identity {
        Identity {
            id: UserId::random(),
            email: Email::parse("learner@portal.test").unwrap(),
            role: Role::Standard,
            system_scope: scope.and_then(SystemScope::new),
        }
    }

    fn video(system: &str) -> VideoRef {
        VideoRef {
            id: VideoId::random(),
            title: format!("Tour do {system}"),
            system: Some(system.into()),
        }
    }

    // =========================================================================
    // Throttler
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_throttler_accepts_first_call_in_each_window() {
        let throttler = Throttler::new(WINDOW);
        let start = Instant::now();
        let mut accepted = Vec::new();

        for offset_ms in [0_u64, 500, 1000, 3000] {
            let target = Duration::from_millis(offset_ms);
            tokio::time::advance(target.saturating_sub(start.elapsed())).await;
            accepted.push(throttler.check().is_ok());
        }

        assert_eq!(accepted, vec![true, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttler_skipped_calls_do_not_extend_window() {
        let throttler = Throttler::new(WINDOW);
        throttler.check().unwrap();

        tokio::time::advance(Duration::from_millis(1900)).await;
        assert_eq!(throttler.check(), Err(ThrottleSkip));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(throttler.check().is_ok());
        assert_eq!(throttler.check(), Err(ThrottleSkip));
    }

    #[tokio::test]
    async fn test_zero_window_accepts_every_call() {
        let throttler = Throttler::new(Duration::ZERO);
        assert!((0..5).all(|_| throttler.check().is_ok()));
    }

    // =========================================================================
    // Service
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_burst_triggers_two_recomputes() {
        let backend = Arc::new(InMemoryBackend::new());
        let service = ProgressStatsService::new(backend.clone(), WINDOW, EventBus::new());
        let learner = identity(None);

        let mut outcomes = Vec::new();
        outcomes.push(service.request_refetch(&learner).await.unwrap());
        for step in [500, 500, 2000] {
            tokio::time::advance(Duration::from_millis(step)).await;
            outcomes.push(service.request_refetch(&learner).await.unwrap());
        }

        let recomputed = outcomes
            .iter()
            .filter(|o| matches!(o, RefetchOutcome::Recomputed(_)))
            .count();
        assert_eq!(recomputed, 2);
        assert_eq!(outcomes[1], RefetchOutcome::Skipped);
        assert_eq!(outcomes[2], RefetchOutcome::Skipped);
        assert_eq!(backend.calls().fetch_progress, 2);
    }

    #[tokio::test]
    async fn test_recompute_counts_only_scoped_videos_and_emits() {
        let backend = Arc::new(InMemoryBackend::new());
        for system in ["Financeiro", "Financeiro", "Estoque"] {
            backend.put_video(video(system));
        }
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let service = ProgressStatsService::new(backend.clone(), WINDOW, bus);
        let learner = identity(Some("Financeiro"));
        backend.set_completed_videos(learner.id, 1);

        let outcome = service.request_refetch(&learner).await.unwrap();

        let expected = ProgressStats {
            total_videos: 2,
            completed_videos: 1,
        };
        assert_eq!(outcome, RefetchOutcome::Recomputed(expected));
        assert_eq!(service.latest(), Some(expected));
        assert_eq!(rx.try_recv().unwrap(), PortalEvent::StatsUpdated(expected));
    }

    #[tokio::test]
    async fn test_failed_recompute_still_consumes_window() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_progress(Some(BackendError::Network("reset".into())));
        let service = ProgressStatsService::new(backend.clone(), WINDOW, EventBus::new());
        let learner = identity(None);

        let err = service.request_refetch(&learner).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stats);

        backend.fail_progress(None);
        assert_eq!(
            service.request_refetch(&learner).await.unwrap(),
            RefetchOutcome::Skipped
        );
    }
}
