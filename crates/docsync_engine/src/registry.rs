//! Application-owned registry of sync engines.
//!
//! A [`SyncRegistry`] maps app ids to engines, creating each at most once.
//! Authentication changes arrive as [`RebindEvent`]s through
//! [`SyncRegistry::publish`]; the registry rebinds the affected engine and
//! forwards the event to every live [`RebindSubscription`].

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use docsync_storage::LocalStore;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::synchronizer::DataSynchronizer;

/// Opens the local store for an instance key.
pub type StoreFactory = Arc<dyn Fn(&str) -> SyncResult<Arc<dyn LocalStore>> + Send + Sync>;

/// Instance key of `user_id` in `app_id`.
pub fn instance_key(app_id: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => format!("{app_id}/{user}"),
        None => app_id.to_string(),
    }
}

/// An authentication change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindEvent {
    /// Another user became active; `None` when nobody is logged in.
    ActiveUserChanged {
        /// The app.
        app_id: String,
        /// The new active user.
        user_id: Option<String>,
    },
    /// A user logged out.
    UserLoggedOut {
        /// The app.
        app_id: String,
        /// The user.
        user_id: String,
    },
    /// A user was removed from the device.
    UserRemoved {
        /// The app.
        app_id: String,
        /// The user.
        user_id: String,
    },
}

impl RebindEvent {
    /// The app the event belongs to.
    pub fn app_id(&self) -> &str {
        match self {
            Self::ActiveUserChanged { app_id, .. }
            | Self::UserLoggedOut { app_id, .. }
            | Self::UserRemoved { app_id, .. } => app_id,
        }
    }
}

/// Receiving end of the rebind events; dropping it unsubscribes.
#[derive(Debug)]
pub struct RebindSubscription {
    receiver: Receiver<RebindEvent>,
}

impl RebindSubscription {
    /// Next event, if one is queued.
    pub fn try_next(&self) -> Option<RebindEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every queued event.
    pub fn drain(&self) -> Vec<RebindEvent> {
        self.receiver.try_iter().collect()
    }
}

/// An engine and how to open stores for it.
pub struct AppRegistration {
    /// The engine.
    pub engine: DataSynchronizer,
    /// Used on `ActiveUserChanged`; without one the engine is only stopped.
    pub store_factory: Option<StoreFactory>,
}

impl AppRegistration {
    /// Registration without a store factory.
    pub fn new(engine: DataSynchronizer) -> Self {
        Self {
            engine,
            store_factory: None,
        }
    }

    /// Sets the store factory.
    pub fn with_store_factory(mut self, store_factory: StoreFactory) -> Self {
        self.store_factory = Some(store_factory);
        self
    }
}

/// Engines by app id.
#[derive(Default)]
pub struct SyncRegistry {
    apps: Mutex<HashMap<String, AppRegistration>>,
    subscribers: Mutex<Vec<Sender<RebindEvent>>>,
}

impl std::fmt::Debug for SyncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegistry")
            .field("apps", &self.app_ids())
            .finish()
    }
}

impl SyncRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine of `app_id`, created by `init` on first use.
    ///
    /// `init` runs at most once per app id; a failed `init` registers
    /// nothing.
    pub fn get_or_initialize<F>(&self, app_id: &str, init: F) -> SyncResult<DataSynchronizer>
    where
        F: FnOnce() -> SyncResult<AppRegistration>,
    {
        let mut apps = self.apps.lock();
        if let Some(registration) = apps.get(app_id) {
            return Ok(registration.engine.clone());
        }
        let registration = init()?;
        let engine = registration.engine.clone();
        apps.insert(app_id.to_string(), registration);
        info!(app_id, "sync engine registered");
        Ok(engine)
    }

    /// The engine of `app_id`, if initialized.
    pub fn get(&self, app_id: &str) -> Option<DataSynchronizer> {
        self.apps.lock().get(app_id).map(|r| r.engine.clone())
    }

    /// Registered app ids, sorted.
    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.apps.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unregisters `app_id` and closes its engine.
    pub fn remove(&self, app_id: &str) -> bool {
        let removed = self.apps.lock().remove(app_id);
        match removed {
            Some(registration) => {
                registration.engine.close();
                info!(app_id, "sync engine removed");
                true
            }
            None => false,
        }
    }

    /// New subscription to rebind events.
    pub fn subscribe(&self) -> RebindSubscription {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().push(sender);
        RebindSubscription { receiver }
    }

    /// Applies `event` to the affected engine, then forwards it to
    /// subscribers.
    ///
    /// - `ActiveUserChanged` reinitializes the engine on the new user's
    ///   store, or stops it when no factory is registered
    /// - `UserLoggedOut` and `UserRemoved` stop the engine when it belongs
    ///   to that user
    pub fn publish(&self, event: RebindEvent) -> SyncResult<()> {
        let target = {
            let apps = self.apps.lock();
            apps.get(event.app_id())
                .map(|r| (r.engine.clone(), r.store_factory.clone()))
        };
        if let Some((engine, store_factory)) = target {
            match &event {
                RebindEvent::ActiveUserChanged { app_id, user_id } => {
                    let key = instance_key(app_id, user_id.as_deref());
                    match store_factory {
                        Some(factory) if key != engine.instance_key() => {
                            engine.reinitialize(key.clone(), factory(&key)?)?;
                            info!(app_id = %app_id, instance_key = %key, "sync engine rebound");
                        }
                        Some(_) => {}
                        None => engine.stop(),
                    }
                }
                RebindEvent::UserLoggedOut { app_id, user_id } | RebindEvent::UserRemoved { app_id, user_id } => {
                    if engine.instance_key() == instance_key(app_id, Some(user_id)) {
                        engine.stop();
                        info!(app_id = %app_id, user_id = %user_id, "sync engine stopped for departed user");
                    }
                }
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.send(event.clone()).is_ok());
        debug!(subscribers = subscribers.len(), "rebind event delivered");
        Ok(())
    }
}
