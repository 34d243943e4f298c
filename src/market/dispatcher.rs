use crate::error::AppError;
use crate::market::collaborators::LaunchpadProvider;
use crate::market::types::{InboundMessage, MessageTag, PoolUpdate};
use crate::state::ViewHandle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub type Listener = dyn Fn(&ViewHandle, &InboundMessage) -> Result<(), AppError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    tags: Vec<MessageTag>,
    handler: Arc<Listener>,
}

pub struct EventDispatcher {
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
    launchpads: Arc<dyn LaunchpadProvider>,
}

fn filter_enabled_launchpads(updates: Vec<PoolUpdate>, enabled: &[String]) -> Vec<PoolUpdate> {
    updates
        .into_iter()
        .filter(|update| {
            update
                .pool()
                .base_asset
                .launchpad
                .as_ref()
                .is_some_and(|launchpad| enabled.contains(launchpad))
        })
        .collect()
}

impl EventDispatcher {
    pub fn new(launchpads: Arc<dyn LaunchpadProvider>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            launchpads,
        }
    }

    pub fn register<F>(&self, tags: &[MessageTag], handler: F) -> ListenerId
    where
        F: Fn(&ViewHandle, &InboundMessage) -> Result<(), AppError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(ListenerEntry {
            id,
            tags: tags.to_vec(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Delivers `message` and returns how many listeners received it.
    pub fn dispatch(&self, views: &ViewHandle, message: InboundMessage) -> usize {
        let message = match message {
            InboundMessage::Updates(updates) => {
                let updates = match self.launchpads.enabled_launchpads() {
                    Some(enabled) => filter_enabled_launchpads(updates, &enabled),
                    None => updates,
                };
                if updates.is_empty() {
                    debug!("no pool updates left after launchpad filter");
                    return 0;
                }
                InboundMessage::Updates(updates)
            }
            other => other,
        };

        let tag = message.tag();
        // Handlers run outside the lock so they may register or unregister.
        let handlers: Vec<(ListenerId, Arc<Listener>)> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.tags.contains(&tag))
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect();

        for (id, handler) in &handlers {
            if let Err(error) = handler(views, &message) {
                warn!(listener = id.0, tag = tag.as_str(), %error, "listener failed");
            }
        }
        handlers.len()
    }
}
