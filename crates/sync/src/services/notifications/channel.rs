//! Realtime notification channel.
//!
//! Exactly one channel is open per active identity. The slot holding it is an
//! async mutex kept locked across the close-then-open sequence, so two
//! channels never coexist even while a switch is suspended on the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tutorial_portal_core::{SubscriptionStatus, UserId};

use super::{NotificationStore, SubscriptionError};
use crate::baas::{ChannelEvent, ChannelHandle, ChannelSpec, ChannelStatus, RealtimeApi};
use crate::config::SyncSettings;

/// The current realtime subscription, as observed by UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel_name: String,
    pub owner: UserId,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone)]
struct Tracked {
    /// Distinguishes successive channels for the same owner.
    epoch: u64,
    subscription: Subscription,
}

struct ActiveChannel {
    owner: UserId,
    epoch: u64,
    handle: ChannelHandle,
    forwarder: CancellationToken,
}

struct ChannelInner {
    realtime: Arc<dyn RealtimeApi>,
    store: NotificationStore,
    schema: String,
    table: String,
    active: Mutex<Option<ActiveChannel>>,
    status: watch::Sender<Option<Tracked>>,
    epoch: AtomicU64,
}

impl ChannelInner {
    /// Update the status of channel `epoch`. Stale epochs are ignored, and
    /// `Closed` is final for an epoch.
    fn set_status(&self, epoch: u64, status: SubscriptionStatus) -> bool {
        self.status.send_if_modified(|current| match current {
            Some(tracked)
                if tracked.epoch == epoch
                    && tracked.subscription.status != status
                    && tracked.subscription.status != SubscriptionStatus::Closed =>
            {
                tracked.subscription.status = status;
                true
            }
            _ => false,
        })
    }

    fn on_status(&self, epoch: u64, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                if self.set_status(epoch, SubscriptionStatus::Open) {
                    info!("notification channel subscribed");
                }
            }
            ChannelStatus::ChannelError(reason) => {
                warn!(%reason, "notification channel error");
                self.set_status(epoch, SubscriptionStatus::Closed);
            }
            ChannelStatus::TimedOut => {
                warn!("notification channel join timed out");
                self.set_status(epoch, SubscriptionStatus::Closed);
            }
            ChannelStatus::Closed => {
                debug!("notification channel closed by server");
                self.set_status(epoch, SubscriptionStatus::Closed);
            }
        }
    }

    async fn release(&self, channel: ActiveChannel) -> Result<(), SubscriptionError> {
        channel.forwarder.cancel();
        self.set_status(channel.epoch, SubscriptionStatus::Closed);
        let name = channel.handle.name().to_owned();
        self.realtime
            .remove_channel(channel.handle)
            .await
            .map_err(SubscriptionError::Close)?;
        info!(channel = %name, "notification channel closed");
        Ok(())
    }
}

/// Owns the single realtime notification channel.
#[derive(Clone)]
pub struct NotificationChannelManager {
    inner: Arc<ChannelInner>,
}

impl NotificationChannelManager {
    #[must_use]
    pub fn new(
        realtime: Arc<dyn RealtimeApi>,
        store: NotificationStore,
        settings: &SyncSettings,
    ) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            inner: Arc::new(ChannelInner {
                realtime,
                store,
                schema: settings.notifications_schema.clone(),
                table: settings.notifications_table.clone(),
                active: Mutex::new(None),
                status,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Open the notification channel for `owner`.
    ///
    /// A no-op if a live (`Opening`/`Open`) channel for `owner` already
    /// exists. A channel for any other identity, or a dead one, is closed
    /// before the new one is opened. Concurrent calls are serialized, so a
    /// burst of calls opens at most one channel.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError::Open` if the backend rejects the channel.
    /// There is no retry; the next identity change calls this again.
    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn subscribe(&self, owner: UserId) -> Result<(), SubscriptionError> {
        let mut active = self.inner.active.lock().await;

        if active.as_ref().is_some_and(|channel| channel.owner == owner) && self.status().is_live()
        {
            debug!("notification channel already live");
            return Ok(());
        }

        if let Some(previous) = active.take()
            && let Err(err) = self.inner.release(previous).await
        {
            warn!(error = %err, "previous notification channel did not close cleanly");
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("notifications:{owner}");
        self.inner.status.send_replace(Some(Tracked {
            epoch,
            subscription: Subscription {
                channel_name: name.clone(),
                owner,
                status: SubscriptionStatus::Opening,
            },
        }));

        let spec = ChannelSpec {
            name: name.clone(),
            schema: self.inner.schema.clone(),
            table: self.inner.table.clone(),
            filter: format!("user_id=eq.{owner}"),
        };
        let (events, rx) = mpsc::unbounded_channel();
        let handle = match self.inner.realtime.open_channel(spec, events).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, channel = %name, "failed to open notification channel");
                self.inner.set_status(epoch, SubscriptionStatus::Closed);
                return Err(SubscriptionError::Open(err));
            }
        };

        let forwarder = CancellationToken::new();
        tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            rx,
            owner,
            epoch,
            forwarder.clone(),
        ));

        debug!(channel = %name, "notification channel requested");
        *active = Some(ActiveChannel {
            owner,
            epoch,
            handle,
            forwarder,
        });
        Ok(())
    }

    /// Close the current channel, if any. Safe to call repeatedly.
    ///
    /// The underlying channel is released exactly once; later calls find
    /// nothing to release and return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError::Close` if the backend fails to remove the
    /// channel. The subscription is `Closed` regardless.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        let mut active = self.inner.active.lock().await;
        match active.take() {
            Some(channel) => self.inner.release(channel).await,
            None => {
                debug!("no notification channel to close");
                Ok(())
            }
        }
    }

    /// The current subscription, if one was ever requested.
    #[must_use]
    pub fn subscription(&self) -> Option<Subscription> {
        self.inner
            .status
            .borrow()
            .as_ref()
            .map(|tracked| tracked.subscription.clone())
    }

    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.inner
            .status
            .borrow()
            .as_ref()
            .map_or(SubscriptionStatus::Idle, |tracked| tracked.subscription.status)
    }
}

impl std::fmt::Debug for NotificationChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannelManager")
            .field("subscription", &self.subscription())
            .finish_non_exhaustive()
    }
}

/// Pump channel events until the channel is released.
async fn forward(
    inner: Weak<ChannelInner>,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
    owner: UserId,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(inner) = inner.upgrade() else { break };

        match event {
            ChannelEvent::Status(status) => inner.on_status(epoch, status),
            ChannelEvent::Insert(payload) => {
                if inserted_for(&payload) != Some(owner) {
                    debug!("ignoring insert for another identity");
                    continue;
                }
                debug!("notification inserted; refetching");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    // Failures are logged and surfaced by the store.
                    _ = inner.store.refresh(owner) => {}
                }
            }
        }
    }
    debug!(epoch, "notification forwarder stopped");
}

fn inserted_for(payload: &serde_json::Value) -> Option<UserId> {
    payload
        .get("user_id")
        .and_then(serde_json::Value::as_str)
        .and_then(|raw| raw.parse().ok())
}
