use crate::market::types::{Bar, PriceMode, Resolution, Trade};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type BarCallback = Arc<dyn Fn(&Bar) + Send + Sync>;

const MAX_CONSTRUCTED_BARS: usize = 10_000;

pub fn bucket_start(timestamp_ms: i64, bucket_width_ms: i64) -> i64 {
    if bucket_width_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(bucket_width_ms)
}

fn bar_from_price(time: i64, price: f64, volume: f64) -> Bar {
    Bar {
        time,
        open: price,
        high: price,
        low: price,
        close: price,
        volume,
    }
}

fn apply_price(bar: &mut Bar, price: f64, volume: f64) {
    bar.high = bar.high.max(price);
    bar.low = bar.low.min(price);
    bar.close = price;
    bar.volume += volume;
}

/// Trades must be time-ascending. Buckets without trades carry the previous
/// close flat; at most `MAX_CONSTRUCTED_BARS` buckets are built.
pub fn construct_bars(
    trades: &[Trade],
    bucket_width_ms: i64,
    price_multiplier: Option<f64>,
) -> Vec<Bar> {
    let (Some(first), Some(last)) = (trades.first(), trades.last()) else {
        return Vec::new();
    };
    let multiplier = price_multiplier.unwrap_or(1.0);
    let width = bucket_width_ms.max(1);
    let first_bucket = bucket_start(first.timestamp_ms(), width);
    let last_bucket = bucket_start(last.timestamp_ms(), width);
    let span = last_bucket.saturating_sub(first_bucket) / width;
    let bucket_count = usize::try_from(span)
        .map_or(1, |span| span.saturating_add(1))
        .min(MAX_CONSTRUCTED_BARS);

    let mut slots: Vec<Option<Bar>> = vec![None; bucket_count];
    let mut dropped = 0_usize;
    for trade in trades {
        let bucket = bucket_start(trade.timestamp_ms(), width);
        let offset = bucket.saturating_sub(first_bucket) / width;
        let index = usize::try_from(offset).unwrap_or(0);
        let Some(slot) = slots.get_mut(index) else {
            dropped += 1;
            continue;
        };
        let price = trade.usd_price * multiplier;
        match slot.as_mut() {
            Some(bar) => apply_price(bar, price, trade.usd_volume),
            None => *slot = Some(bar_from_price(bucket, price, trade.usd_volume)),
        }
    }
    if dropped > 0 {
        warn!(
            dropped,
            first_bucket,
            last_bucket,
            width,
            "trade span exceeds bar limit; dropping late trades"
        );
    }

    let mut bars: Vec<Bar> = Vec::with_capacity(bucket_count);
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(bar) => bars.push(bar),
            None => {
                if let Some(previous) = bars.last() {
                    let time = first_bucket + index as i64 * width;
                    bars.push(bar_from_price(time, previous.close, 0.0));
                }
            }
        }
    }
    bars
}

pub fn fold_into_bar(current: &Bar, bucket: &Bar) -> Bar {
    if bucket.time > current.time {
        Bar {
            time: bucket.time,
            open: current.close,
            high: current.close.max(bucket.high),
            low: current.close.min(bucket.low),
            close: bucket.close,
            volume: bucket.volume,
        }
    } else if bucket.time == current.time {
        Bar {
            time: current.time,
            open: current.open,
            high: current.high.max(bucket.high),
            low: current.low.min(bucket.low),
            close: bucket.close,
            volume: current.volume + bucket.volume,
        }
    } else {
        *current
    }
}

fn earliest_bucket(trades: &[Trade], bucket_width_ms: i64) -> Option<i64> {
    trades
        .iter()
        .map(Trade::timestamp_ms)
        .min()
        .map(|timestamp_ms| bucket_start(timestamp_ms, bucket_width_ms.max(1)))
}

fn earliest_bucket_bar(
    trades: &[Trade],
    bucket_width_ms: i64,
    price_multiplier: Option<f64>,
) -> Option<Bar> {
    let width = bucket_width_ms.max(1);
    let bucket = earliest_bucket(trades, width)?;
    let mut in_bucket: Vec<&Trade> = trades
        .iter()
        .filter(|trade| bucket_start(trade.timestamp_ms(), width) == bucket)
        .collect();
    in_bucket.sort_by_key(|trade| trade.timestamp_ms());

    let multiplier = price_multiplier.unwrap_or(1.0);
    let mut bar: Option<Bar> = None;
    for trade in in_bucket {
        let price = trade.usd_price * multiplier;
        match bar.as_mut() {
            Some(bar) => apply_price(bar, price, trade.usd_volume),
            None => bar = Some(bar_from_price(bucket, price, trade.usd_volume)),
        }
    }
    bar
}

pub fn next_bar(
    current: &Bar,
    trades: &[Trade],
    resolution: Resolution,
    price_multiplier: Option<f64>,
) -> Bar {
    match earliest_bucket_bar(trades, resolution.duration_ms(), price_multiplier) {
        Some(earliest) => fold_into_bar(current, &earliest),
        None => *current,
    }
}

pub fn get_next_bar(
    current: &Bar,
    trades: &[Trade],
    resolution: &str,
    price_multiplier: Option<f64>,
) -> Bar {
    match Resolution::parse_str(resolution) {
        Some(resolution) => next_bar(current, trades, resolution, price_multiplier),
        None => {
            debug!(resolution, "unrecognized resolution; bar unchanged");
            *current
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedId(u64);

pub struct BarFeed {
    pub asset_id: String,
    pub resolution: Resolution,
    pub price_mode: PriceMode,
    pub circ_supply: Option<f64>,
    current: Option<Bar>,
    on_bar: BarCallback,
    refresh_token: Option<CancellationToken>,
}

impl BarFeed {
    pub fn new(
        asset_id: String,
        resolution: Resolution,
        price_mode: PriceMode,
        circ_supply: Option<f64>,
        on_bar: BarCallback,
    ) -> Self {
        Self {
            asset_id,
            resolution,
            price_mode,
            circ_supply,
            current: None,
            on_bar,
            refresh_token: None,
        }
    }

    pub fn current(&self) -> Option<Bar> {
        self.current
    }

    fn price_multiplier(&self) -> Option<f64> {
        match self.price_mode {
            PriceMode::Price => None,
            PriceMode::MarketCap => self.circ_supply,
        }
    }

    pub fn apply_trades(&mut self, trades: &[Trade]) -> Option<Bar> {
        let relevant: Vec<Trade> = trades
            .iter()
            .filter(|trade| trade.asset_id == self.asset_id && trade.is_valid())
            .cloned()
            .collect();
        if relevant.is_empty() {
            return None;
        }
        let Some(current) = self.current else {
            debug!(asset_id = %self.asset_id, "no current bar yet; skipping trade batch");
            return None;
        };

        let multiplier = self.price_multiplier();
        let mut next = next_bar(&current, &relevant, self.resolution, multiplier);
        if earliest_bucket(&relevant, self.resolution.duration_ms()) == Some(current.time) {
            // Live movement inside the open bucket follows the newest trade.
            if let Some(latest) = relevant.iter().max_by_key(|trade| trade.timestamp_ms()) {
                let price = latest.usd_price * multiplier.unwrap_or(1.0);
                next.close = price;
                next.high = next.high.max(price);
                next.low = next.low.min(price);
            }
        }
        self.current = Some(next);
        Some(next)
    }
}

#[derive(Default)]
pub struct BarFeeds {
    feeds: HashMap<FeedId, BarFeed>,
    next_id: u64,
}

impl BarFeeds {
    pub fn insert(&mut self, feed: BarFeed) -> FeedId {
        self.next_id += 1;
        let id = FeedId(self.next_id);
        self.feeds.insert(id, feed);
        id
    }

    pub fn get(&self, id: FeedId) -> Option<&BarFeed> {
        self.feeds.get(&id)
    }

    pub fn set_refresh_token(&mut self, id: FeedId, token: CancellationToken) {
        if let Some(feed) = self.feeds.get_mut(&id) {
            feed.refresh_token = Some(token);
        }
    }

    pub fn remove(&mut self, id: FeedId) -> Option<BarFeed> {
        let feed = self.feeds.remove(&id)?;
        if let Some(token) = &feed.refresh_token {
            token.cancel();
        }
        Some(feed)
    }

    pub fn seed(&mut self, id: FeedId, bar: Bar) -> bool {
        match self.feeds.get_mut(&id) {
            Some(feed) => {
                feed.current = Some(bar);
                true
            }
            None => false,
        }
    }

    pub fn uses_asset(&self, asset_id: &str) -> bool {
        self.feeds.values().any(|feed| feed.asset_id == asset_id)
    }

    pub fn apply_trades(&mut self, trades: &[Trade]) -> Vec<(BarCallback, Bar)> {
        self.feeds
            .values_mut()
            .filter_map(|feed| {
                feed.apply_trades(trades)
                    .map(|bar| (Arc::clone(&feed.on_bar), bar))
            })
            .collect()
    }

    pub fn refresh(&self, id: FeedId) -> Option<(BarCallback, Option<Bar>)> {
        self.feeds
            .get(&id)
            .map(|feed| (Arc::clone(&feed.on_bar), feed.current))
    }

    pub fn clear(&mut self) {
        for (_, feed) in self.feeds.drain() {
            if let Some(token) = feed.refresh_token {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::TradeSide;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    fn trade(asset_id: &str, timestamp_ms: i64, price: f64, volume: f64) -> Trade {
        Trade {
            id: format!("t-{timestamp_ms}-{price}"),
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

    fn bar(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn same_bucket_merge_keeps_open_and_accumulates_volume() {
        let current = bar(100, 1.0, 2.0, 0.5, 1.5, 10.0);
        let bucket = construct_bars(&[trade("a1", 100, 1.8, 5.0)], 20, None);

        let next = fold_into_bar(&current, &bucket[0]);

        assert_eq!(next, bar(100, 1.0, 2.0, 0.5, 1.8, 15.0));
    }

    #[test]
    fn rollover_opens_at_previous_close() {
        let current = bar(100, 1.0, 2.0, 0.5, 1.5, 10.0);
        let bucket = construct_bars(&[trade("a1", 160, 2.0, 7.0)], 20, None);

        let next = fold_into_bar(&current, &bucket[0]);

        assert_eq!(next, bar(160, 1.5, 2.0, 1.5, 2.0, 7.0));
    }

    #[test]
    fn older_bucket_leaves_bar_unchanged() {
        let current = bar(120_000, 1.0, 1.0, 1.0, 1.0, 1.0);
        let next = next_bar(
            &current,
            &[trade("a1", 30_000, 9.0, 1.0)],
            Resolution::M1,
            None,
        );
        assert_eq!(next, current);
    }

    #[test]
    fn construct_bars_spans_every_bucket_between_trades() {
        let trades = vec![
            trade("a1", 60_000, 1.0, 1.0),
            trade("a1", 61_000, 3.0, 2.0),
            trade("a1", 62_000, 2.0, 3.0),
            trade("a1", 180_500, 4.0, 4.0),
        ];

        let bars = construct_bars(&trades, 60_000, Some(10.0));

        assert_eq!(
            bars,
            vec![
                bar(60_000, 10.0, 30.0, 10.0, 20.0, 6.0),
                bar(120_000, 20.0, 20.0, 20.0, 20.0, 0.0),
                bar(180_000, 40.0, 40.0, 40.0, 40.0, 4.0),
            ]
        );
    }

    #[test]
    fn no_trades_or_unknown_resolution_returns_input() {
        let current = bar(60_000, 1.0, 1.0, 1.0, 1.0, 1.0);

        assert_eq!(get_next_bar(&current, &[], "1", None), current);
        assert_eq!(
            get_next_bar(&current, &[trade("a1", 61_000, 5.0, 1.0)], "7", None),
            current
        );
        assert_eq!(
            get_next_bar(&current, &[trade("a1", 61_000, 5.0, 1.0)], "1", None).close,
            5.0
        );
    }

    #[test]
    fn get_next_bar_sorts_trades_and_folds_earliest_bucket() {
        let current = bar(60_000, 1.0, 1.0, 1.0, 1.0, 1.0);
        let trades = vec![
            trade("a1", 125_000, 9.0, 1.0),
            trade("a1", 121_000, 2.0, 1.0),
        ];

        let next = get_next_bar(&current, &trades, "1", None);

        assert_eq!(next, bar(120_000, 1.0, 9.0, 1.0, 9.0, 2.0));
    }

    #[test]
    fn feed_skips_batches_until_seeded() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::Price,
            None,
            Arc::new(|_: &Bar| {}),
        );
        assert_eq!(feed.apply_trades(&[trade("a1", 61_000, 2.0, 1.0)]), None);

        feed.current = Some(bar(60_000, 1.0, 1.0, 1.0, 1.0, 1.0));
        assert!(feed.apply_trades(&[trade("a1", 61_000, 2.0, 1.0)]).is_some());
    }

    #[test]
    fn feed_close_follows_latest_trade_inside_open_bucket() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::Price,
            None,
            Arc::new(|_: &Bar| {}),
        );
        feed.current = Some(bar(60_000, 1.0, 1.5, 1.0, 1.2, 1.0));

        let next = feed
            .apply_trades(&[
                trade("a1", 70_000, 1.4, 1.0),
                trade("a1", 130_000, 2.5, 1.0),
                trade("a2", 71_000, 99.0, 1.0),
            ])
            .expect("bar should update");

        assert_eq!(next.time, 60_000);
        assert_eq!(next.close, 2.5);
        assert_eq!(next.high, 2.5);
        assert_eq!(next.volume, 2.0);
    }

    #[test]
    fn feed_ignores_late_trade_from_an_older_bucket() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::Price,
            None,
            Arc::new(|_: &Bar| {}),
        );
        let seeded = bar(120_000, 1.0, 1.0, 1.0, 1.0, 1.0);
        feed.current = Some(seeded);

        let next = feed.apply_trades(&[trade("a1", 30_000, 9.0, 1.0)]);

        assert_eq!(next, Some(seeded));
        assert_eq!(feed.current(), Some(seeded));
    }

    #[test]
    fn construct_bars_caps_the_bucket_span() {
        let trades = vec![
            trade("a1", 0, 1.0, 1.0),
            trade("a1", 1_735_689_600_000, 2.0, 1.0),
        ];

        let bars = construct_bars(&trades, 1_000, None);

        assert_eq!(bars.len(), MAX_CONSTRUCTED_BARS);
        assert_eq!(bars[0], bar(0, 1.0, 1.0, 1.0, 1.0, 1.0));
        assert!(bars[1..].iter().all(|bar| bar.volume == 0.0 && bar.close == 1.0));
    }

    #[test]
    fn feed_survives_trades_spanning_decades() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::S1,
            PriceMode::Price,
            None,
            Arc::new(|_: &Bar| {}),
        );
        feed.current = Some(bar(1_735_689_600_000, 1.0, 1.0, 1.0, 1.0, 1.0));

        let next = feed
            .apply_trades(&[
                trade("a1", 1, 7.0, 1.0),
                trade("a1", 1_735_689_600_500, 2.0, 1.0),
            ])
            .expect("bar should be reported");

        assert_eq!(next, bar(1_735_689_600_000, 1.0, 1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn feed_uses_circulating_supply_in_market_cap_mode() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::MarketCap,
            Some(1_000.0),
            Arc::new(|_: &Bar| {}),
        );
        feed.current = Some(bar(60_000, 1_000.0, 1_000.0, 1_000.0, 1_000.0, 0.0));

        let next = feed
            .apply_trades(&[trade("a1", 65_000, 2.0, 1.0)])
            .expect("bar should update");

        assert_eq!(next.close, 2_000.0);
    }

    #[test]
    fn feed_ignores_invalid_trades() {
        let mut feed = BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::Price,
            None,
            Arc::new(|_: &Bar| {}),
        );
        feed.current = Some(bar(60_000, 1.0, 1.0, 1.0, 1.0, 1.0));
        let mut invalid = trade("a1", 61_000, 50.0, 1.0);
        invalid.is_valid = Some(false);

        assert_eq!(feed.apply_trades(&[invalid]), None);
    }

    #[test]
    fn feeds_return_callbacks_for_updated_bars() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let mut feeds = BarFeeds::default();
        let id = feeds.insert(BarFeed::new(
            "a1".to_string(),
            Resolution::M1,
            PriceMode::Price,
            None,
            Arc::new(move |bar: &Bar| sink.lock().push(*bar)),
        ));
        assert!(feeds.seed(id, bar(60_000, 1.0, 1.0, 1.0, 1.0, 0.0)));

        for (callback, bar) in feeds.apply_trades(&[trade("a1", 61_000, 3.0, 1.0)]) {
            callback(&bar);
        }

        assert_eq!(emitted.lock().len(), 1);
        assert!(feeds.uses_asset("a1"));
        let token = CancellationToken::new();
        feeds.set_refresh_token(id, token.clone());
        assert!(feeds.remove(id).is_some());
        assert!(token.is_cancelled());
        assert!(!feeds.uses_asset("a1"));
    }
}
