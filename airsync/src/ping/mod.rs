//! # Ping coordinator
//!
//! Module dedicated to the long-poll heartbeat: a device names a set
//! of folders and suspends until one of them changes, the interval
//! elapses, or the request is cancelled.
//!
//! Waiters subscribe to the change feed broadcast and park on a
//! `select!` between the subscription, a timer and a cancellation
//! handle. No worker is occupied while a ping is pending, however
//! many devices are idle.

pub mod config;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{broadcast::error::RecvError, watch, Mutex};
use tracing::{debug, trace};

use crate::{device::DeviceId, feed::ChangeFeed, folder::FolderId};

#[doc(inline)]
pub use self::config::PingConfig;

/// The outcome of a heartbeat wait.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PingOutcome {
    /// At least one watched folder changed; the device should issue a
    /// content sync per listed folder.
    Changed(Vec<FolderId>),

    /// The interval elapsed without a change.
    NoChanges,

    /// The wait was cancelled, either by a newer ping from the same
    /// device or by the connection closing.
    Cancelled,
}

struct ActivePing {
    token: u64,
    cancel: watch::Sender<bool>,
}

/// The heartbeat coordinator.
///
/// At most one outstanding ping per device: a second ping for the
/// same device cancels the first, and a finished wait removes its
/// registration so nothing leaks.
pub struct PingCoordinator {
    feed: Arc<ChangeFeed>,
    active: Mutex<HashMap<DeviceId, ActivePing>>,
    next_token: AtomicU64,
}

impl PingCoordinator {
    pub fn new(feed: Arc<ChangeFeed>) -> Self {
        Self {
            feed,
            active: Mutex::new(HashMap::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Wait until one of the watched mailbox folders changes or the
    /// interval elapses.
    pub async fn wait(
        &self,
        device_id: &str,
        watched: HashSet<FolderId>,
        interval: Duration,
    ) -> PingOutcome {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.insert(
                device_id.to_owned(),
                ActivePing {
                    token,
                    cancel: cancel_tx,
                },
            ) {
                debug!(device = device_id, "cancelling previous ping");
                let _ = previous.cancel.send(true);
            }
        }

        // subscribe before parking so no event can slip between the
        // caller's pre-check and the wait
        let mut events = self.feed.subscribe();
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        let outcome = loop {
            tokio::select! {
                _ = &mut sleep => break PingOutcome::NoChanges,

                changed = cancel_rx.changed() => match changed {
                    Ok(()) if *cancel_rx.borrow() => break PingOutcome::Cancelled,
                    Ok(()) => continue,
                    Err(_) => break PingOutcome::Cancelled,
                },

                event = events.recv() => match event {
                    Ok(event) if watched.contains(&event.folder_id) => {
                        let mut folders = vec![event.folder_id];
                        // drain whatever already queued up so one wake
                        // reports every folder that changed together
                        while let Ok(event) = events.try_recv() {
                            if watched.contains(&event.folder_id)
                                && !folders.contains(&event.folder_id)
                            {
                                folders.push(event.folder_id);
                            }
                        }
                        break PingOutcome::Changed(folders);
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(device = device_id, skipped, "ping waiter lagged behind the feed");
                        continue;
                    }
                    Err(RecvError::Closed) => break PingOutcome::NoChanges,
                },
            }
        };

        // unregister, unless a newer ping already took the slot
        let mut active = self.active.lock().await;
        if active
            .get(device_id)
            .map(|ping| ping.token == token)
            .unwrap_or_default()
        {
            active.remove(device_id);
        }

        outcome
    }

    /// Cancel the outstanding ping of a device, if any. Called when
    /// the underlying connection closes.
    pub async fn cancel(&self, device_id: &str) {
        if let Some(ping) = self.active.lock().await.remove(device_id) {
            let _ = ping.cancel.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::{ChangeKind, ChangeOrigin};

    use super::*;

    fn watched(folders: &[&str]) -> HashSet<FolderId> {
        folders.iter().map(|folder| folder.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_on_a_watched_folder_change() {
        let feed = Arc::new(ChangeFeed::default());
        let coordinator = Arc::new(PingCoordinator::new(feed.clone()));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait("dev1", watched(&["a", "b"]), Duration::from_secs(300))
                    .await
            })
        };
        tokio::task::yield_now().await;

        feed.append("a", ChangeKind::Added, "i1", ChangeOrigin::Server)
            .await;

        assert_eq!(
            waiter.await.unwrap(),
            PingOutcome::Changed(vec!["a".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_no_changes() {
        let feed = Arc::new(ChangeFeed::default());
        let coordinator = PingCoordinator::new(feed);

        let outcome = coordinator
            .wait("dev1", watched(&["a"]), Duration::from_secs(60))
            .await;

        assert_eq!(outcome, PingOutcome::NoChanges);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_unwatched_folders() {
        let feed = Arc::new(ChangeFeed::default());
        let coordinator = Arc::new(PingCoordinator::new(feed.clone()));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait("dev1", watched(&["a", "b"]), Duration::from_secs(30))
                    .await
            })
        };
        tokio::task::yield_now().await;

        feed.append("c", ChangeKind::Added, "i1", ChangeOrigin::Server)
            .await;

        assert_eq!(waiter.await.unwrap(), PingOutcome::NoChanges);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_ping_cancels_the_first() {
        let feed = Arc::new(ChangeFeed::default());
        let coordinator = Arc::new(PingCoordinator::new(feed.clone()));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait("dev1", watched(&["a"]), Duration::from_secs(300))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait("dev1", watched(&["a"]), Duration::from_secs(300))
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(first.await.unwrap(), PingOutcome::Cancelled);

        feed.append("a", ChangeKind::Changed, "i1", ChangeOrigin::Server)
            .await;
        assert_eq!(
            second.await.unwrap(),
            PingOutcome::Changed(vec!["a".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancellation_releases_the_waiter() {
        let feed = Arc::new(ChangeFeed::default());
        let coordinator = Arc::new(PingCoordinator::new(feed));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait("dev1", watched(&["a"]), Duration::from_secs(300))
                    .await
            })
        };
        tokio::task::yield_now().await;

        coordinator.cancel("dev1").await;

        assert_eq!(waiter.await.unwrap(), PingOutcome::Cancelled);
    }
}
