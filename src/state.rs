use crate::market::reconcile::{reconcile, CategoryLists};
use crate::market::types::{PoolUpdate, PriceTick, StreamStatusSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct StreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: tokio::task::JoinHandle<()>,
}

pub type StatusStore = Arc<tokio::sync::RwLock<StreamStatusSnapshot>>;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketViews {
    pub lists: CategoryLists,
    pub prices: HashMap<String, PriceTick>,
}

impl MarketViews {
    pub fn apply_pool_updates(&mut self, batch: &[PoolUpdate]) {
        let lists = std::mem::take(&mut self.lists);
        self.lists = reconcile(lists, batch);
    }

    /// Keeps the newest tick per asset; ticks from older blocks are ignored.
    pub fn apply_prices(&mut self, ticks: &[PriceTick]) {
        for tick in ticks {
            let is_stale = self
                .prices
                .get(&tick.asset_id)
                .is_some_and(|current| current.block_id > tick.block_id);
            if !is_stale {
                self.prices.insert(tick.asset_id.clone(), tick.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewHandle {
    inner: Arc<RwLock<MarketViews>>,
}

impl ViewHandle {
    pub fn snapshot(&self) -> MarketViews {
        self.inner.read().clone()
    }

    pub fn read<R>(&self, reader: impl FnOnce(&MarketViews) -> R) -> R {
        reader(&self.inner.read())
    }

    pub fn update<R>(&self, writer: impl FnOnce(&mut MarketViews) -> R) -> R {
        writer(&mut self.inner.write())
    }
}
