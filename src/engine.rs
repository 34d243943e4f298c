use crate::error::AppError;
use crate::market::candles::{BarFeed, BarFeeds, FeedId};
use crate::market::collaborators::Collaborators;
use crate::market::connection::{
    run_stream_connection, ConnectionContext, OutboundLink, StreamTelemetry,
};
use crate::market::dispatcher::{EventDispatcher, ListenerId};
use crate::market::marks::{filter_mark_trades, generate_marks, MarkContext};
use crate::market::reconcile::CategoryList;
use crate::market::subscriptions::{recent_subscribe_message, RecentChange, SubscriptionRegistry};
use crate::market::types::{
    Bar, Category, InboundMessage, Mark, MessageTag, OutboundMessage, Pool, PriceMode,
    RecentFilters, Resolution, SortSpec, StreamConfig, StreamStatusSnapshot, Trade,
};
use crate::state::{MarketViews, StatusStore, StreamHandle, ViewHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct StreamEngine {
    config: StreamConfig,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    dispatcher: Arc<EventDispatcher>,
    views: ViewHandle,
    bar_feeds: Arc<Mutex<BarFeeds>>,
    outbound: OutboundLink,
    collaborators: Collaborators,
    status_store: StatusStore,
    telemetry: Arc<StreamTelemetry>,
    stream: tokio::sync::Mutex<Option<StreamHandle>>,
    pending_resubscribe: Arc<Mutex<Option<CancellationToken>>>,
}

fn current_runtime() -> Result<Handle, AppError> {
    Handle::try_current().map_err(|_| AppError::NoRuntime)
}

impl StreamEngine {
    pub fn new(config: StreamConfig, collaborators: Collaborators) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(
            &collaborators.launchpads,
        )));
        let bar_feeds = Arc::new(Mutex::new(BarFeeds::default()));
        register_builtin_listeners(&dispatcher, &bar_feeds);

        let status_store = Arc::new(tokio::sync::RwLock::new(StreamStatusSnapshot::stopped(
            config.endpoint_url.clone(),
            None,
        )));

        Self {
            config,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::default())),
            dispatcher,
            views: ViewHandle::default(),
            bar_feeds,
            outbound: OutboundLink::default(),
            collaborators,
            status_store,
            telemetry: Arc::new(StreamTelemetry::default()),
            stream: tokio::sync::Mutex::new(None),
            pending_resubscribe: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<(), AppError> {
        let runtime = current_runtime()?;
        let existing_handle = {
            let mut stream_slot = self.stream.lock().await;
            stream_slot.take()
        };
        if let Some(handle) = existing_handle {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }

        let cancellation_token = CancellationToken::new();
        let context = ConnectionContext {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            views: self.views.clone(),
            outbound: self.outbound.clone(),
            cache: Arc::clone(&self.collaborators.cache),
            status_store: Arc::clone(&self.status_store),
            telemetry: Arc::clone(&self.telemetry),
        };
        let join_handle = runtime.spawn(run_stream_connection(
            context,
            cancellation_token.clone(),
        ));

        let mut stream_slot = self.stream.lock().await;
        *stream_slot = Some(StreamHandle {
            cancellation_token,
            join_handle,
        });
        info!(endpoint = %self.config.endpoint_url, "stream engine started");
        Ok(())
    }

    pub async fn shutdown(&self) -> bool {
        let existing_handle = {
            let mut stream_slot = self.stream.lock().await;
            stream_slot.take()
        };
        if let Some(token) = self.pending_resubscribe.lock().take() {
            token.cancel();
        }

        let Some(handle) = existing_handle else {
            return false;
        };
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        info!("stream engine shut down");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.join_handle.is_finished())
    }

    pub async fn status(&self) -> StreamStatusSnapshot {
        let mut snapshot = self.status_store.read().await.clone();
        snapshot.messages_received = self.telemetry.messages_received();
        snapshot.decode_failures = self.telemetry.decode_failures();
        snapshot.reconnects = self.telemetry.reconnects();
        snapshot.last_message_at_ms = self.telemetry.last_message_at_ms();
        snapshot
    }

    pub fn views(&self) -> ViewHandle {
        self.views.clone()
    }

    pub fn snapshot(&self) -> MarketViews {
        self.views.snapshot()
    }

    pub fn subscriptions(&self) -> SubscriptionRegistry {
        self.registry.lock().clone()
    }

    pub fn register_listener<F>(&self, tags: &[MessageTag], handler: F) -> ListenerId
    where
        F: Fn(&ViewHandle, &InboundMessage) -> Result<(), AppError> + Send + Sync + 'static,
    {
        self.dispatcher.register(tags, handler)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn subscribe_pools(&self, ids: &[String]) -> Vec<String> {
        let mut registry = self.registry.lock();
        let added = registry.subscribe_pools(ids);
        if !added.is_empty() {
            self.send_if_open(OutboundMessage::SubscribePools {
                pools: added.clone(),
            });
        }
        added
    }

    pub fn unsubscribe_pools(&self, ids: &[String]) -> Vec<String> {
        let mut registry = self.registry.lock();
        let removed = registry.unsubscribe_pools(ids);
        if !removed.is_empty() {
            self.send_if_open(OutboundMessage::UnsubscribePools {
                pools: removed.clone(),
            });
        }
        removed
    }

    pub fn subscribe_assets(&self, ids: &[String]) -> Vec<String> {
        let mut registry = self.registry.lock();
        let added = registry.subscribe_assets(ids);
        if !added.is_empty() {
            self.send_if_open(OutboundMessage::SubscribeTxns {
                assets: added.clone(),
            });
        }
        added
    }

    pub fn unsubscribe_assets(&self, ids: &[String]) -> Vec<String> {
        let mut registry = self.registry.lock();
        let removed = registry.unsubscribe_assets(ids);
        if !removed.is_empty() {
            self.send_if_open(OutboundMessage::UnsubscribeTxns {
                assets: removed.clone(),
            });
        }
        removed
    }

    /// Turns the recent list on, or changes its filter. A filter change on an
    /// open socket is an unsubscribe now and a resubscribe after the grace
    /// delay; the resubscribe carries whatever filter is current by then.
    pub fn subscribe_recent(&self, filters: RecentFilters) -> Result<RecentChange, AppError> {
        let runtime = current_runtime()?;
        let mut registry = self.registry.lock();
        let change = registry.subscribe_recent(filters);

        match change {
            RecentChange::Subscribed => {
                if let Some(filters) = registry.recent() {
                    self.send_if_open(recent_subscribe_message(filters));
                }
            }
            RecentChange::Unchanged => {}
            RecentChange::FilterChanged => {
                let mut pending = self.pending_resubscribe.lock();
                if pending.is_some() {
                    debug!("recent resubscribe already scheduled");
                } else if self.outbound.send(OutboundMessage::UnsubscribeRecent) {
                    *pending = Some(self.schedule_resubscribe(&runtime));
                }
            }
        }
        Ok(change)
    }

    pub fn subscribe_recent_enabled(&self) -> Result<RecentChange, AppError> {
        let filters = RecentFilters {
            launchpads: self.collaborators.launchpads.enabled_launchpads(),
        };
        self.subscribe_recent(filters)
    }

    pub fn unsubscribe_recent(&self) -> bool {
        let mut registry = self.registry.lock();
        let was_active = registry.unsubscribe_recent();
        let pending = self.pending_resubscribe.lock().take();
        match pending {
            // The unsubscribe already went out when the resubscribe was scheduled.
            Some(token) => token.cancel(),
            None if was_active => {
                self.send_if_open(OutboundMessage::UnsubscribeRecent);
            }
            None => {}
        }
        was_active
    }

    fn schedule_resubscribe(&self, runtime: &Handle) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let registry = Arc::clone(&self.registry);
        let pending = Arc::clone(&self.pending_resubscribe);
        let outbound = self.outbound.clone();
        let grace = Duration::from_millis(self.config.resubscribe_grace_ms);

        runtime.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let registry = registry.lock();
            let mut pending = pending.lock();
            if task_token.is_cancelled() {
                return;
            }
            pending.take();
            if let Some(filters) = registry.recent() {
                if outbound.send(recent_subscribe_message(filters)) {
                    debug!(?filters, "resubscribed recent list");
                }
            }
        });
        token
    }

    fn send_if_open(&self, message: OutboundMessage) {
        if !self.outbound.send(message) {
            debug!("socket closed; request kept for replay");
        }
    }

    pub fn load_list(&self, category: Category, pools: Vec<Pool>) {
        self.views.update(|views| {
            let slot = views.lists.slot_mut(category);
            let sort = slot.as_ref().and_then(|list| list.sort);
            *slot = Some(CategoryList::from_pools(category, pools, sort));
        });
    }

    /// `None` restores the category default.
    pub fn set_sort(&self, category: Category, sort: Option<SortSpec>) {
        self.views
            .update(|views| views.lists.set_sort(category, sort));
    }

    pub fn clear_list(&self, category: Category) {
        self.views.update(|views| {
            views.lists.slot_mut(category).take();
        });
    }

    /// Starts a live bar feed for `asset_id` and subscribes its trades. The
    /// feed stays idle until [`StreamEngine::seed_bar`] installs a bar.
    pub fn subscribe_bars<F>(
        &self,
        asset_id: &str,
        resolution: Resolution,
        price_mode: PriceMode,
        circ_supply: Option<f64>,
        on_bar: F,
    ) -> Result<FeedId, AppError>
    where
        F: Fn(&Bar) + Send + Sync + 'static,
    {
        let runtime = if resolution.is_live_refreshed() {
            Some(current_runtime()?)
        } else {
            None
        };

        let feed = BarFeed::new(
            asset_id.to_string(),
            resolution,
            price_mode,
            circ_supply,
            Arc::new(on_bar),
        );
        let id = {
            let mut feeds = self.bar_feeds.lock();
            let id = feeds.insert(feed);
            if let Some(runtime) = &runtime {
                feeds.set_refresh_token(id, self.spawn_live_refresh(runtime, id));
            }
            id
        };

        self.subscribe_assets(&[asset_id.to_string()]);
        debug!(asset_id, resolution = resolution.as_str(), "bar feed subscribed");
        Ok(id)
    }

    fn spawn_live_refresh(&self, runtime: &Handle, id: FeedId) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let feeds = Arc::clone(&self.bar_feeds);
        let period = Duration::from_millis(self.config.live_refresh_interval_ms);

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let refresh = feeds.lock().refresh(id);
                        match refresh {
                            Some((on_bar, Some(bar))) => on_bar(&bar),
                            Some((_, None)) => {}
                            None => break,
                        }
                    }
                }
            }
        });
        token
    }

    pub fn seed_bar(&self, id: FeedId, bar: Bar) -> bool {
        self.bar_feeds.lock().seed(id, bar)
    }

    pub fn current_bar(&self, id: FeedId) -> Option<Bar> {
        self.bar_feeds.lock().get(id).and_then(BarFeed::current)
    }

    pub fn unsubscribe_bars(&self, id: FeedId) -> bool {
        let (removed, still_used) = {
            let mut feeds = self.bar_feeds.lock();
            let removed = feeds.remove(id);
            let still_used = removed
                .as_ref()
                .is_some_and(|feed| feeds.uses_asset(&feed.asset_id));
            (removed, still_used)
        };

        let Some(feed) = removed else {
            return false;
        };
        if !still_used {
            self.unsubscribe_assets(&[feed.asset_id]);
        }
        true
    }

    pub fn build_marks(
        &self,
        trades: &[Trade],
        asset_id: &str,
        dev_address: Option<&str>,
        circ_supply: Option<f64>,
    ) -> Vec<Mark> {
        let filtered = filter_mark_trades(trades, asset_id, self.config.mark_min_usd_volume);
        let context = MarkContext {
            dev_address: dev_address.map(str::to_string),
            user_address: self.collaborators.wallet.current_address(),
            circ_supply,
        };
        generate_marks(&filtered, &context)
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.bar_feeds.lock().clear();
        if let Some(token) = self.pending_resubscribe.lock().take() {
            token.cancel();
        }
        if let Some(handle) = self.stream.get_mut().as_ref() {
            handle.cancellation_token.cancel();
        }
    }
}

fn register_builtin_listeners(dispatcher: &EventDispatcher, bar_feeds: &Arc<Mutex<BarFeeds>>) {
    dispatcher.register(&[MessageTag::Updates], |views, message| {
        if let InboundMessage::Updates(updates) = message {
            views.update(|state| state.apply_pool_updates(updates));
        }
        Ok(())
    });

    dispatcher.register(&[MessageTag::Prices], |views, message| {
        if let InboundMessage::Prices(ticks) = message {
            views.update(|state| state.apply_prices(ticks));
        }
        Ok(())
    });

    let feeds = Arc::clone(bar_feeds);
    dispatcher.register(&[MessageTag::Actions], move |_, message| {
        if let InboundMessage::Actions(trades) = message {
            // Callbacks run after the feed lock is released.
            let emitted = feeds.lock().apply_trades(trades);
            for (on_bar, bar) in emitted {
                on_bar(&bar);
            }
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::collaborators::{StaticLaunchpads, StaticWallet};
    use crate::market::types::{BaseAsset, PoolUpdate, PriceTick, StartStreamArgs, TradeSide};
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn engine_with(collaborators: Collaborators) -> StreamEngine {
        let config = StartStreamArgs {
            endpoint_url: Some("ws://127.0.0.1:9".to_string()),
            reconnect_delay_ms: Some(50),
            ..StartStreamArgs::default()
        }
        .normalize()
        .expect("test config should be valid");
        StreamEngine::new(config, collaborators)
    }

    fn engine() -> StreamEngine {
        engine_with(Collaborators::default())
    }

    fn open_socket(engine: &StreamEngine) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        engine.outbound.attach(sender);
        receiver
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn filters(launchpads: &[&str]) -> RecentFilters {
        RecentFilters {
            launchpads: Some(ids(launchpads)),
        }
    }

    fn trade(asset_id: &str, timestamp_ms: i64, price: f64, volume: f64) -> Trade {
        Trade {
            id: format!("t-{timestamp_ms}"),
            asset_id: asset_id.to_string(),
            trader_address: "wallet".to_string(),
            side: TradeSide::Buy,
            usd_price: price,
            usd_volume: volume,
            amount: volume / price,
            timestamp: Utc
                .timestamp_millis_opt(timestamp_ms)
                .single()
                .expect("valid timestamp"),
            is_valid: None,
            is_mev: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn filter_change_unsubscribes_then_resubscribes_after_grace() {
        let engine = engine();
        let mut sent = open_socket(&engine);

        engine
            .subscribe_recent(filters(&["pump.fun"]))
            .expect("subscribe should succeed");
        assert_eq!(
            drain(&mut sent),
            vec![OutboundMessage::SubscribeRecent {
                filters: Some(filters(&["pump.fun"]))
            }]
        );

        let change = engine
            .subscribe_recent(filters(&["pump.fun", "letsbonk.fun"]))
            .expect("filter change should succeed");
        assert_eq!(change, RecentChange::FilterChanged);
        assert_eq!(drain(&mut sent), vec![OutboundMessage::UnsubscribeRecent]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            drain(&mut sent),
            vec![OutboundMessage::SubscribeRecent {
                filters: Some(filters(&["pump.fun", "letsbonk.fun"]))
            }]
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(drain(&mut sent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_filter_changes_collapse_into_one_resubscribe() {
        let engine = engine();
        engine
            .subscribe_recent(filters(&["a"]))
            .expect("subscribe should succeed");
        let mut sent = open_socket(&engine);

        engine
            .subscribe_recent(filters(&["b"]))
            .expect("filter change should succeed");
        engine
            .subscribe_recent(filters(&["c"]))
            .expect("filter change should succeed");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            drain(&mut sent),
            vec![
                OutboundMessage::UnsubscribeRecent,
                OutboundMessage::SubscribeRecent {
                    filters: Some(filters(&["c"]))
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_grace_cancels_the_resubscribe() {
        let engine = engine();
        let mut sent = open_socket(&engine);
        engine
            .subscribe_recent(filters(&["a"]))
            .expect("subscribe should succeed");
        engine
            .subscribe_recent(filters(&["b"]))
            .expect("filter change should succeed");

        assert!(engine.unsubscribe_recent());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            drain(&mut sent),
            vec![
                OutboundMessage::SubscribeRecent {
                    filters: Some(filters(&["a"]))
                },
                OutboundMessage::UnsubscribeRecent,
            ]
        );
        assert!(engine.subscriptions().recent().is_none());
    }

    #[tokio::test]
    async fn filter_change_while_closed_only_updates_the_registry() {
        let engine = engine();
        engine
            .subscribe_recent(filters(&["a"]))
            .expect("subscribe should succeed");
        engine
            .subscribe_recent(filters(&["b"]))
            .expect("filter change should succeed");

        assert_eq!(engine.subscriptions().recent(), Some(&filters(&["b"])));
        assert!(engine.pending_resubscribe.lock().is_none());
    }

    #[test]
    fn subscribe_recent_requires_a_runtime() {
        let engine = engine();
        let result = engine.subscribe_recent(RecentFilters::default());
        assert!(matches!(result, Err(AppError::NoRuntime)));
    }

    #[tokio::test]
    async fn recent_filter_follows_enabled_launchpads() {
        let engine = engine_with(Collaborators {
            launchpads: Arc::new(StaticLaunchpads(Some(ids(&["pump.fun"])))),
            ..Collaborators::default()
        });
        engine
            .subscribe_recent_enabled()
            .expect("subscribe should succeed");
        assert_eq!(engine.subscriptions().recent(), Some(&filters(&["pump.fun"])));
    }

    #[test]
    fn pool_subscriptions_send_only_deltas_while_open() {
        let engine = engine();
        assert_eq!(engine.subscribe_pools(&ids(&["p1"])), ids(&["p1"]));

        let mut sent = open_socket(&engine);
        engine.subscribe_pools(&ids(&["p1", "p2"]));
        engine.unsubscribe_pools(&ids(&["p1", "p9"]));
        engine.unsubscribe_pools(&ids(&["p1"]));

        assert_eq!(
            drain(&mut sent),
            vec![
                OutboundMessage::SubscribePools {
                    pools: ids(&["p2"])
                },
                OutboundMessage::UnsubscribePools {
                    pools: ids(&["p1"])
                },
            ]
        );
        assert_eq!(engine.subscriptions().pools().len(), 1);
    }

    #[test]
    fn builtin_listeners_maintain_lists_and_prices() {
        let engine = engine();
        engine.load_list(Category::Recent, Vec::new());

        engine.dispatcher.dispatch(
            &engine.views,
            InboundMessage::Updates(vec![PoolUpdate::New(Pool {
                id: "p1".to_string(),
                base_asset: BaseAsset {
                    id: "a1".to_string(),
                    ..BaseAsset::default()
                },
                ..Pool::default()
            })]),
        );
        engine.dispatcher.dispatch(
            &engine.views,
            InboundMessage::Prices(vec![PriceTick {
                block_id: 7,
                asset_id: "a1".to_string(),
                price: 0.5,
            }]),
        );

        let snapshot = engine.snapshot();
        let recent = snapshot.lists.recent.expect("recent list should be loaded");
        assert_eq!(recent.pools.len(), 1);
        assert!(recent.pools[0].streamed);
        assert!(snapshot.lists.graduated.is_none());
        assert_eq!(snapshot.prices["a1"].price, 0.5);

        engine.clear_list(Category::Recent);
        assert!(engine.snapshot().lists.recent.is_none());
    }

    #[test]
    fn bar_feed_follows_trades_and_releases_its_asset() {
        let engine = engine();
        let bars = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&bars);
        let id = engine
            .subscribe_bars("a1", Resolution::M1, PriceMode::Price, None, move |bar: &Bar| {
                sink.lock().push(*bar)
            })
            .expect("minute feeds need no runtime");
        assert!(engine.subscriptions().assets().contains("a1"));

        let actions = InboundMessage::Actions(vec![trade("a1", 60_500, 1.8, 5.0)]);
        engine.dispatcher.dispatch(&engine.views, actions.clone());
        assert!(bars.lock().is_empty());

        assert!(engine.seed_bar(
            id,
            Bar {
                time: 60_000,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            }
        ));
        engine.dispatcher.dispatch(&engine.views, actions);

        let emitted = bars.lock().clone();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].close, 1.8);
        assert_eq!(emitted[0].volume, 15.0);
        assert_eq!(engine.current_bar(id), Some(emitted[0]));

        assert!(engine.unsubscribe_bars(id));
        assert!(!engine.unsubscribe_bars(id));
        assert!(engine.subscriptions().assets().is_empty());
    }

    #[test]
    fn shared_asset_stays_subscribed_until_last_feed_leaves() {
        let engine = engine();
        let first = engine
            .subscribe_bars("a1", Resolution::M1, PriceMode::Price, None, |_: &Bar| {})
            .expect("subscribe should succeed");
        let second = engine
            .subscribe_bars("a1", Resolution::M5, PriceMode::Price, None, |_: &Bar| {})
            .expect("subscribe should succeed");

        engine.unsubscribe_bars(first);
        assert!(engine.subscriptions().assets().contains("a1"));
        engine.unsubscribe_bars(second);
        assert!(engine.subscriptions().assets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn higher_resolutions_re_emit_the_current_bar() {
        let engine = engine();
        let count = Arc::new(Mutex::new(0_u32));
        let sink = Arc::clone(&count);
        let id = engine
            .subscribe_bars("a1", Resolution::H4, PriceMode::Price, None, move |_: &Bar| {
                *sink.lock() += 1
            })
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(*count.lock(), 0);

        engine.seed_bar(
            id,
            Bar {
                time: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            },
        );
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(*count.lock(), 2);

        engine.unsubscribe_bars(id);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn marks_use_the_wallet_address_and_volume_floor() {
        let engine = engine_with(Collaborators {
            wallet: Arc::new(StaticWallet(Some("me".to_string()))),
            ..Collaborators::default()
        });
        let mut mine = trade("a1", 1_000, 0.01, 50.0);
        mine.trader_address = "me".to_string();
        let mut dust = trade("a1", 2_000, 0.01, 1.0);
        dust.trader_address = "me".to_string();
        let mut dev = trade("a1", 3_000, 0.01, 50.0);
        dev.trader_address = "dev".to_string();

        let marks = engine.build_marks(&[mine, dust, dev], "a1", Some("dev"), None);

        let mark_ids: Vec<&str> = marks.iter().map(|mark| mark.id.as_str()).collect();
        assert_eq!(mark_ids, vec!["t-3000-dev", "t-1000-user"]);
    }

    #[tokio::test]
    async fn start_and_shutdown_publish_lifecycle_status() {
        let engine = engine();
        assert!(!engine.shutdown().await);

        engine.start().await.expect("start should succeed");
        assert!(engine.is_running().await);

        assert!(engine.shutdown().await);
        assert!(!engine.is_running().await);
        assert_eq!(engine.status().await.state, crate::market::types::ConnectionState::Stopped);
    }
}
