//! In-memory notification cache.
//!
//! A read-through cache over the `notifications` table, bound to one identity
//! at a time. `unread_count` is never stored; it is derived from the cached
//! entries whenever a snapshot is taken.

use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use tutorial_portal_core::{
    Notification, NotificationId, NotificationRecord, NotificationSnapshot, UserId,
};

use super::NotificationError;
use crate::baas::{BackendError, DataApi};
use crate::events::{EventBus, PortalEvent, UserNotice};
use crate::util::lock;

#[derive(Debug, Default)]
struct StoreState {
    owner: Option<UserId>,
    notifications: Vec<Notification>,
    /// Bumped on every owner change or clear.
    generation: u64,
}

impl StoreState {
    fn snapshot(&self) -> NotificationSnapshot {
        NotificationSnapshot {
            unread_count: self.notifications.iter().filter(|n| !n.read).count(),
            notifications: self.notifications.clone(),
        }
    }

    /// Bind to `owner`, dropping the cache if it belonged to someone else.
    fn bind(&mut self, owner: UserId) -> bool {
        if self.owner == Some(owner) {
            return false;
        }
        self.owner = Some(owner);
        self.notifications.clear();
        self.generation += 1;
        true
    }
}

struct StoreInner {
    data: Arc<dyn DataApi>,
    limit: usize,
    state: Mutex<StoreState>,
    events: EventBus,
}

/// Notification cache with optimistic local mutations.
#[derive(Clone)]
pub struct NotificationStore {
    inner: Arc<StoreInner>,
}

impl NotificationStore {
    #[must_use]
    pub fn new(data: Arc<dyn DataApi>, limit: usize, events: EventBus) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data,
                limit,
                state: Mutex::new(StoreState::default()),
                events,
            }),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> NotificationSnapshot {
        lock(&self.inner.state).snapshot()
    }

    #[must_use]
    pub fn unread_count(&self) -> usize {
        lock(&self.inner.state)
            .notifications
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// The identity the cache currently belongs to.
    #[must_use]
    pub fn owner(&self) -> Option<UserId> {
        lock(&self.inner.state).owner
    }

    /// Replace the cache with the most recent notifications for `owner`.
    ///
    /// Video and user references are resolved one lookup per notification; a
    /// failed lookup leaves that reference empty. Entries already read locally
    /// stay read even if the backend has not caught up. A result that arrives
    /// after the store was cleared or rebound is discarded.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::Fetch` if the notification query fails.
    /// The cache is left untouched and a dismissible notice is emitted.
    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn fetch(&self, owner: UserId) -> Result<NotificationSnapshot, NotificationError> {
        self.load(owner, true).await
    }

    /// Refetch for `owner` only if the cache is still bound to it.
    ///
    /// Used for push-triggered refreshes, which must never rebind the cache.
    ///
    /// # Errors
    ///
    /// Same as [`fetch`](Self::fetch).
    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn refresh(&self, owner: UserId) -> Result<NotificationSnapshot, NotificationError> {
        self.load(owner, false).await
    }

    async fn load(
        &self,
        owner: UserId,
        rebind: bool,
    ) -> Result<NotificationSnapshot, NotificationError> {
        let generation = {
            let mut state = lock(&self.inner.state);
            if rebind {
                if state.bind(owner) {
                    debug!("notification cache bound to new identity");
                }
            } else if state.owner != Some(owner) {
                debug!("cache bound to another identity; skipping refresh");
                return Ok(state.snapshot());
            }
            state.generation
        };

        let records = match self
            .inner
            .data
            .fetch_notifications(owner, self.inner.limit)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "notification fetch failed");
                self.inner.events.notice(UserNotice::dismissible(
                    "Could not load your notifications. Please try again.",
                ));
                return Err(NotificationError::Fetch(err));
            }
        };

        let mut fetched = Vec::with_capacity(records.len());
        for record in records {
            fetched.push(self.resolve(record).await);
        }

        let snapshot = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation || state.owner != Some(owner) {
                debug!("discarding stale notification fetch");
                return Ok(state.snapshot());
            }
            for notification in &mut fetched {
                let read_locally = state
                    .notifications
                    .iter()
                    .any(|cached| cached.id == notification.id && cached.read);
                notification.read |= read_locally;
            }
            state.notifications = fetched;
            state.snapshot()
        };

        debug!(
            count = snapshot.notifications.len(),
            unread = snapshot.unread_count,
            "notifications refreshed"
        );
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Mark one notification read.
    ///
    /// Applied locally first, then sent to the backend. A remote failure does
    /// not roll back the local change. Marking an already-read or uncached
    /// notification is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::NoIdentity` when unbound, or
    /// `NotificationError::Mutation` if the remote update fails.
    #[instrument(skip(self), fields(notification_id = %id))]
    pub async fn mark_as_read(&self, id: NotificationId) -> Result<(), NotificationError> {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            if state.owner.is_none() {
                return Err(NotificationError::NoIdentity);
            }
            match state.notifications.iter_mut().find(|n| n.id == id) {
                Some(notification) if !notification.read => notification.read = true,
                _ => {
                    debug!("notification already read or not cached");
                    return Ok(());
                }
            }
            state.snapshot()
        };
        self.publish(snapshot);

        self.inner
            .data
            .mark_notification_read(id)
            .await
            .map_err(|err| self.mutation_failed(err))
    }

    /// Mark every unread notification of the bound identity read.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::NoIdentity` when unbound, or
    /// `NotificationError::Mutation` if the remote update fails, in which case
    /// the cache is unchanged.
    #[instrument(skip(self))]
    pub async fn mark_all_as_read(&self) -> Result<(), NotificationError> {
        let (owner, generation) = self.bound()?;
        self.inner
            .data
            .mark_all_notifications_read(owner)
            .await
            .map_err(|err| self.mutation_failed(err))?;

        let snapshot = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                return Ok(());
            }
            state.notifications.iter_mut().for_each(|n| n.read = true);
            state.snapshot()
        };
        self.publish(snapshot);
        Ok(())
    }

    /// Delete a notification remotely, then drop it from the cache.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::NoIdentity` when unbound, or
    /// `NotificationError::Mutation` if the remote delete fails, in which case
    /// the cache is unchanged.
    #[instrument(skip(self), fields(notification_id = %id))]
    pub async fn delete(&self, id: NotificationId) -> Result<(), NotificationError> {
        let (_, generation) = self.bound()?;
        self.inner
            .data
            .delete_notification(id)
            .await
            .map_err(|err| self.mutation_failed(err))?;

        let snapshot = {
            let mut state = lock(&self.inner.state);
            let before = state.notifications.len();
            state.notifications.retain(|n| n.id != id);
            if state.generation != generation || state.notifications.len() == before {
                return Ok(());
            }
            state.snapshot()
        };
        self.publish(snapshot);
        Ok(())
    }

    /// Drop the cache and unbind it from its identity.
    pub fn clear(&self) {
        let had_content = {
            let mut state = lock(&self.inner.state);
            let had_content = state.owner.is_some() || !state.notifications.is_empty();
            state.owner = None;
            state.notifications.clear();
            state.generation += 1;
            had_content
        };
        if had_content {
            debug!("notification cache cleared");
            self.publish(NotificationSnapshot::default());
        }
    }

    fn bound(&self) -> Result<(UserId, u64), NotificationError> {
        let state = lock(&self.inner.state);
        state
            .owner
            .map(|owner| (owner, state.generation))
            .ok_or(NotificationError::NoIdentity)
    }

    async fn resolve(&self, record: NotificationRecord) -> Notification {
        let video = match record.video_id {
            Some(video_id) => self
                .inner
                .data
                .fetch_video(video_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, %video_id, "video lookup failed");
                    None
                }),
            None => None,
        };
        let related_user = match record.related_user_id {
            Some(user_id) => self
                .inner
                .data
                .fetch_related_user(user_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, %user_id, "related user lookup failed");
                    None
                }),
            None => None,
        };
        Notification::from_record(record, video, related_user)
    }

    fn mutation_failed(&self, err: BackendError) -> NotificationError {
        warn!(error = %err, "notification mutation failed");
        self.inner.events.notice(UserNotice::dismissible(
            "Could not update your notifications. Please try again.",
        ));
        NotificationError::Mutation(err)
    }

    fn publish(&self, snapshot: NotificationSnapshot) {
        self.inner
            .events
            .emit(PortalEvent::NotificationsChanged(snapshot));
    }
}

impl std::fmt::Debug for NotificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("NotificationStore")
            .field("owner", &state.owner)
            .field("cached", &state.notifications.len())
            .finish_non_exhaustive()
    }
}
