use crate::market::types::{OutboundMessage, RecentFilters};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecentChange {
    Subscribed,
    FilterChanged,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    pools: BTreeSet<String>,
    assets: BTreeSet<String>,
    recent: Option<RecentFilters>,
}

fn insert_all(target: &mut BTreeSet<String>, ids: &[String]) -> Vec<String> {
    ids.iter()
        .filter(|id| target.insert((*id).clone()))
        .cloned()
        .collect()
}

fn remove_all(target: &mut BTreeSet<String>, ids: &[String]) -> Vec<String> {
    ids.iter()
        .filter(|id| target.remove(id.as_str()))
        .cloned()
        .collect()
}

impl SubscriptionRegistry {
    /// Returns the ids that were not already subscribed.
    pub fn subscribe_pools(&mut self, ids: &[String]) -> Vec<String> {
        insert_all(&mut self.pools, ids)
    }

    /// Returns the ids that were subscribed before the call.
    pub fn unsubscribe_pools(&mut self, ids: &[String]) -> Vec<String> {
        remove_all(&mut self.pools, ids)
    }

    pub fn subscribe_assets(&mut self, ids: &[String]) -> Vec<String> {
        insert_all(&mut self.assets, ids)
    }

    pub fn unsubscribe_assets(&mut self, ids: &[String]) -> Vec<String> {
        remove_all(&mut self.assets, ids)
    }

    pub fn subscribe_recent(&mut self, filters: RecentFilters) -> RecentChange {
        match self.recent.replace(filters.clone()) {
            None => RecentChange::Subscribed,
            Some(previous) if previous == filters => RecentChange::Unchanged,
            Some(_) => RecentChange::FilterChanged,
        }
    }

    /// Returns whether the recent list was active.
    pub fn unsubscribe_recent(&mut self) -> bool {
        self.recent.take().is_some()
    }

    pub fn pools(&self) -> &BTreeSet<String> {
        &self.pools
    }

    pub fn assets(&self) -> &BTreeSet<String> {
        &self.assets
    }

    pub fn recent(&self) -> Option<&RecentFilters> {
        self.recent.as_ref()
    }

    pub fn replay_messages(&self) -> Vec<OutboundMessage> {
        let mut messages = Vec::with_capacity(3);
        if !self.pools.is_empty() {
            messages.push(OutboundMessage::SubscribePools {
                pools: self.pools.iter().cloned().collect(),
            });
        }
        if !self.assets.is_empty() {
            messages.push(OutboundMessage::SubscribeTxns {
                assets: self.assets.iter().cloned().collect(),
            });
        }
        if let Some(filters) = &self.recent {
            messages.push(recent_subscribe_message(filters));
        }
        messages
    }
}

pub fn recent_subscribe_message(filters: &RecentFilters) -> OutboundMessage {
    let filters = if filters.launchpads.is_some() {
        Some(filters.clone())
    } else {
        None
    };
    OutboundMessage::SubscribeRecent { filters }
}
